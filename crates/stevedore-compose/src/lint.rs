//! Policy linting for compose documents, merged or standalone.
//!
//! The rule set is fixed and rule-identified; linting never mutates its
//! input and has no side effects. Strict mode upgrades unpinned image
//! references from warnings to errors.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::document::ComposeDocument;

/// `build:` directives are forbidden.
pub const RULE_NO_BUILD: &str = "STV001";
/// `depends_on` references must resolve within the document.
pub const RULE_DEPENDS_ON: &str = "STV002";
/// Service `networks` references must resolve within the document.
pub const RULE_NETWORKS: &str = "STV003";
/// Named volume references must resolve within the document.
pub const RULE_VOLUMES: &str = "STV004";
/// Every service must declare an `image` with a repository.
pub const RULE_IMAGE_REQUIRED: &str = "STV005";
/// Image references should be pinned to a tag or digest.
pub const RULE_IMAGE_PINNED: &str = "STV006";

/// One lint finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Stable rule identifier.
    pub rule: String,
    /// Human-readable description.
    pub message: String,
    /// 1-based source line, when the source text was provided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

/// The result of linting one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LintOutcome {
    /// True when no errors were found (warnings do not affect validity).
    pub valid: bool,
    /// Findings that make the document unacceptable.
    pub errors: Vec<Issue>,
    /// Findings worth reviewing.
    pub warnings: Vec<Issue>,
}

/// Lints a compose document against the fixed policy rule set.
///
/// `source` is the original YAML text, used only to annotate findings with
/// line numbers; pass `None` when unavailable.
#[must_use]
pub fn lint(doc: &ComposeDocument, source: Option<&str>, strict: bool) -> LintOutcome {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let locate = |needle: &str| source.and_then(|text| find_line(text, needle));

    let services: HashSet<&str> = doc.services.iter().map(|(n, _)| n.as_str()).collect();
    let networks: HashSet<&str> = doc.networks.iter().map(|(n, _)| n.as_str()).collect();
    let volumes: HashSet<&str> = doc.volumes.iter().map(|(n, _)| n.as_str()).collect();

    for (service, definition) in &doc.services {
        if definition.build.is_some() {
            errors.push(Issue {
                rule: RULE_NO_BUILD.to_string(),
                message: format!("service \"{service}\" declares a build directive"),
                line: locate("build:"),
            });
        }

        if let Some(depends_on) = &definition.depends_on {
            for name in depends_on.names() {
                if !services.contains(name) {
                    errors.push(Issue {
                        rule: RULE_DEPENDS_ON.to_string(),
                        message: format!(
                            "service \"{service}\" depends on undeclared service \"{name}\""
                        ),
                        line: locate(name),
                    });
                }
            }
        }

        if let Some(nets) = &definition.networks {
            for name in nets.names() {
                if !networks.contains(name) {
                    errors.push(Issue {
                        rule: RULE_NETWORKS.to_string(),
                        message: format!(
                            "service \"{service}\" attaches to undeclared network \"{name}\""
                        ),
                        line: locate(name),
                    });
                }
            }
        }

        for mount in &definition.volumes {
            if let Some(name) = mount.named_source() {
                if !volumes.contains(name) {
                    errors.push(Issue {
                        rule: RULE_VOLUMES.to_string(),
                        message: format!(
                            "service \"{service}\" mounts undeclared volume \"{name}\""
                        ),
                        line: locate(name),
                    });
                }
            }
        }

        match definition.image.as_deref() {
            None | Some("") => errors.push(Issue {
                rule: RULE_IMAGE_REQUIRED.to_string(),
                message: format!("service \"{service}\" declares no image"),
                line: locate(&format!("{service}:")),
            }),
            Some(image) => {
                if !is_pinned(image) {
                    let issue = Issue {
                        rule: RULE_IMAGE_PINNED.to_string(),
                        message: format!(
                            "service \"{service}\" image \"{image}\" is not pinned to a tag or digest"
                        ),
                        line: locate(image),
                    };
                    if strict {
                        errors.push(issue);
                    } else {
                        warnings.push(issue);
                    }
                }
            }
        }
    }

    LintOutcome {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Returns whether an image reference carries a digest or a non-`latest` tag.
fn is_pinned(image: &str) -> bool {
    if image.contains('@') {
        return true;
    }
    // A colon after the last slash separates the tag; earlier colons belong
    // to a registry host:port.
    let after_host = image.rsplit('/').next().unwrap_or(image);
    match after_host.split_once(':') {
        Some((_, tag)) => !tag.is_empty() && tag != "latest",
        None => false,
    }
}

fn find_line(source: &str, needle: &str) -> Option<usize> {
    source
        .lines()
        .position(|line| line.contains(needle))
        .map(|i| i + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> ComposeDocument {
        ComposeDocument::parse("lint", text).expect("parse failed")
    }

    #[test]
    fn clean_document_is_valid() {
        let text = "services:\n  web:\n    image: nginx:1.25\n";
        let outcome = lint(&parse(text), Some(text), false);
        assert!(outcome.valid);
        assert!(outcome.errors.is_empty());
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn build_directive_is_an_error() {
        let text = "services:\n  app:\n    build: .\n    image: app:1\n";
        let outcome = lint(&parse(text), Some(text), false);
        assert!(!outcome.valid);
        assert_eq!(outcome.errors[0].rule, RULE_NO_BUILD);
        assert_eq!(outcome.errors[0].line, Some(3));
    }

    #[test]
    fn dangling_depends_on_is_an_error() {
        let text = "services:\n  web:\n    image: nginx:1\n    depends_on:\n      - ghost\n";
        let outcome = lint(&parse(text), Some(text), false);
        assert_eq!(outcome.errors[0].rule, RULE_DEPENDS_ON);
        assert!(outcome.errors[0].message.contains("ghost"));
    }

    #[test]
    fn dangling_network_is_an_error() {
        let text = "services:\n  web:\n    image: nginx:1\n    networks:\n      - backend\n";
        let outcome = lint(&parse(text), Some(text), false);
        assert_eq!(outcome.errors[0].rule, RULE_NETWORKS);
    }

    #[test]
    fn dangling_named_volume_is_an_error() {
        let text = "services:\n  web:\n    image: nginx:1\n    volumes:\n      - data:/var/lib\n";
        let outcome = lint(&parse(text), Some(text), false);
        assert_eq!(outcome.errors[0].rule, RULE_VOLUMES);
    }

    #[test]
    fn bind_mounts_need_no_declaration() {
        let text = "services:\n  web:\n    image: nginx:1\n    volumes:\n      - ./conf:/etc/nginx\n";
        assert!(lint(&parse(text), Some(text), false).valid);
    }

    #[test]
    fn missing_image_is_an_error() {
        let text = "services:\n  web:\n    restart: always\n";
        let outcome = lint(&parse(text), Some(text), false);
        assert_eq!(outcome.errors[0].rule, RULE_IMAGE_REQUIRED);
    }

    #[test]
    fn unpinned_image_warns_by_default() {
        let text = "services:\n  web:\n    image: nginx\n";
        let outcome = lint(&parse(text), Some(text), false);
        assert!(outcome.valid);
        assert_eq!(outcome.warnings[0].rule, RULE_IMAGE_PINNED);
    }

    #[test]
    fn unpinned_image_errors_in_strict_mode() {
        let text = "services:\n  web:\n    image: nginx:latest\n";
        let outcome = lint(&parse(text), Some(text), true);
        assert!(!outcome.valid);
        assert_eq!(outcome.errors[0].rule, RULE_IMAGE_PINNED);
    }

    #[test]
    fn digest_pinned_image_is_accepted_in_strict_mode() {
        let text = "services:\n  web:\n    image: nginx@sha256:6b06964cdbbc517102ce5e0cef95152f3c6a7ef703e4057cb574539de91f72e6\n";
        assert!(lint(&parse(text), Some(text), true).valid);
    }

    #[test]
    fn registry_port_is_not_mistaken_for_a_tag() {
        assert!(!is_pinned("registry.example.com:5000/team/app"));
        assert!(is_pinned("registry.example.com:5000/team/app:1.2"));
    }

    #[test]
    fn lint_does_not_mutate_the_document() {
        let text = "services:\n  web:\n    image: nginx\n";
        let doc = parse(text);
        let before = doc.clone();
        let _ = lint(&doc, Some(text), true);
        assert_eq!(doc, before);
    }
}

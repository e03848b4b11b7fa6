//! Merging N module compose documents into one namespaced document.
//!
//! Every resource name is prefixed with a token derived from its module's
//! name, every internal reference is rewritten through the resulting rename
//! table, variables are interpolated with project overrides taking
//! precedence, and host-port collisions across the merged set are collected
//! into a conflict report. The merge is a pure function of its inputs:
//! identical modules in identical order produce byte-identical output.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use stevedore_common::constants::NAMESPACE_SEPARATOR;
use stevedore_common::error::{Result, StevedoreError};

use crate::document::{ComposeDocument, ResourceKind, Service};
use crate::node::Node;
use crate::ports::{self, PortConflict};
use crate::vars::{self, Resolution};

/// One unit of merge input: a named module with its compose text and
/// declared variable defaults. Immutable during merge.
#[derive(Debug, Clone)]
pub struct ModuleSource {
    /// Module name; the namespace token is derived from it.
    pub name: String,
    /// Raw compose YAML text.
    pub compose: String,
    /// Variable name to default value.
    pub variable_defaults: BTreeMap<String, String>,
}

impl ModuleSource {
    /// Creates a module source without variable defaults.
    #[must_use]
    pub fn new(name: impl Into<String>, compose: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            compose: compose.into(),
            variable_defaults: BTreeMap::new(),
        }
    }
}

/// Severity of a report entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational; nothing to act on.
    Info,
    /// Worth reviewing but not fatal.
    Warning,
}

/// One structured warning or note produced during a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    /// Entry severity.
    pub severity: Severity,
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

/// The rename and conflict report accompanying a merged document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeReport {
    /// `module -> resource kind -> original name -> namespaced name`.
    pub renames: BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>,
    /// Host-port collisions across the merged set. Advisory, never fatal.
    pub conflicts: Vec<PortConflict>,
    /// Variable collisions and default resolutions.
    pub warnings: Vec<ReportEntry>,
}

/// The merged compose document plus its report. Immutable once produced.
#[derive(Debug, Clone)]
pub struct MergedDocument {
    /// The rewritten, unioned compose document.
    pub document: ComposeDocument,
    /// Rename table, conflicts, and warnings.
    pub report: MergeReport,
}

impl MergedDocument {
    /// Renders the merged document as compose YAML text.
    ///
    /// # Errors
    ///
    /// Returns an error if YAML serialization fails.
    pub fn to_yaml_string(&self) -> Result<String> {
        self.document.to_yaml_string()
    }
}

/// Derives an identifier-safe namespace token from a module name.
#[must_use]
pub fn namespace_token(name: &str) -> String {
    let mut token: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if token.is_empty() {
        token = "module".to_string();
    }
    if token.starts_with(|c: char| c.is_ascii_digit()) {
        token.insert(0, 'm');
    }
    token
}

/// In-progress merge state, alive for one `merge` call.
#[derive(Debug, Default)]
struct MergeContext {
    /// `(module, kind, original) -> namespaced`.
    renames: BTreeMap<(String, ResourceKind, String), String>,
    /// Merged variable table, last writer wins. Used only to detect
    /// cross-module default collisions.
    variables: BTreeMap<String, String>,
    entries: Vec<ReportEntry>,
}

impl MergeContext {
    fn lookup(&self, module: &str, kind: ResourceKind, name: &str) -> Option<&String> {
        self.renames
            .get(&(module.to_string(), kind, name.to_string()))
    }

    fn warn(&mut self, code: &str, message: String) {
        self.entries.push(ReportEntry {
            severity: Severity::Warning,
            code: code.to_string(),
            message,
        });
    }

    fn note(&mut self, code: &str, message: String) {
        self.entries.push(ReportEntry {
            severity: Severity::Info,
            code: code.to_string(),
            message,
        });
    }
}

/// Merges module compose documents into one namespaced document.
///
/// Output ordering follows module input order, then declaration order
/// within each module.
///
/// # Errors
///
/// Returns [`StevedoreError::Parse`] if any module fails to parse (no
/// partial output), [`StevedoreError::Reference`] for dangling references,
/// [`StevedoreError::BuildForbidden`] for `build:` keys,
/// [`StevedoreError::Variable`] for unresolvable variables, and
/// [`StevedoreError::Config`] for duplicate module names.
pub fn merge(
    modules: &[ModuleSource],
    project_variables: &BTreeMap<String, String>,
) -> Result<MergedDocument> {
    tracing::info!(modules = modules.len(), "merging compose modules");
    let mut ctx = MergeContext::default();

    check_namespace_uniqueness(modules)?;
    collect_variable_collisions(modules, &mut ctx);

    // Parse and interpolate every module before any rewriting, so a parse
    // failure in the last module produces no partial output.
    let mut docs: Vec<(String, ComposeDocument)> = Vec::with_capacity(modules.len());
    for module in modules {
        let mut root = crate::document::parse_node(&module.name, &module.compose)?;
        let usages = vars::substitute_node(
            &module.name,
            &mut root,
            project_variables,
            &module.variable_defaults,
        )?;
        record_variable_usages(&module.name, &usages, &mut ctx);
        let doc = ComposeDocument::from_node(&module.name, &root)?;
        reject_build_directives(&module.name, &doc)?;
        docs.push((module.name.clone(), doc));
    }

    // Two passes: the full rename table exists before any reference is
    // rewritten.
    for (name, doc) in &docs {
        build_rename_table(name, doc, &mut ctx);
    }
    for (name, doc) in &mut docs {
        rewrite_module(name, doc, &ctx)?;
    }

    let document = union_documents(docs)?;
    assert_reference_integrity(&document)?;

    let conflicts = scan_port_conflicts(&document);
    let report = MergeReport {
        renames: rename_report(&ctx),
        conflicts,
        warnings: ctx.entries,
    };
    tracing::info!(
        services = document.services.len(),
        conflicts = report.conflicts.len(),
        "merge complete"
    );
    Ok(MergedDocument { document, report })
}

fn check_namespace_uniqueness(modules: &[ModuleSource]) -> Result<()> {
    let mut seen: BTreeMap<String, &str> = BTreeMap::new();
    for module in modules {
        let token = namespace_token(&module.name);
        if let Some(previous) = seen.insert(token.clone(), module.name.as_str()) {
            return Err(StevedoreError::Config {
                message: format!(
                    "modules \"{previous}\" and \"{}\" produce the same namespace token \"{token}\"",
                    module.name
                ),
            });
        }
    }
    Ok(())
}

fn collect_variable_collisions(modules: &[ModuleSource], ctx: &mut MergeContext) {
    for module in modules {
        for (name, value) in &module.variable_defaults {
            if let Some(previous) = ctx.variables.get(name) {
                if previous != value {
                    ctx.warn(
                        "variable-collision",
                        format!(
                            "variable \"{name}\" default redefined by module \"{}\" \
                             (\"{previous}\" -> \"{value}\", last writer wins)",
                            module.name
                        ),
                    );
                }
            }
            let _ = ctx.variables.insert(name.clone(), value.clone());
        }
    }
}

fn record_variable_usages(module: &str, usages: &[vars::VarUsage], ctx: &mut MergeContext) {
    let mut seen = HashSet::new();
    for usage in usages {
        if !seen.insert((usage.name.clone(), usage.resolution)) {
            continue;
        }
        match usage.resolution {
            Resolution::Override => {}
            Resolution::ModuleDefault => ctx.note(
                "variable-default",
                format!(
                    "module \"{module}\": variable \"{}\" resolved from module default",
                    usage.name
                ),
            ),
            Resolution::InlineDefault => ctx.note(
                "variable-default",
                format!(
                    "module \"{module}\": variable \"{}\" resolved from inline default",
                    usage.name
                ),
            ),
        }
    }
}

fn reject_build_directives(module: &str, doc: &ComposeDocument) -> Result<()> {
    for (service, definition) in &doc.services {
        if definition.build.is_some() {
            return Err(StevedoreError::BuildForbidden {
                module: module.to_string(),
                service: service.clone(),
            });
        }
    }
    Ok(())
}

fn build_rename_table(module: &str, doc: &ComposeDocument, ctx: &mut MergeContext) {
    let token = namespace_token(module);
    for kind in [
        ResourceKind::Service,
        ResourceKind::Network,
        ResourceKind::Volume,
        ResourceKind::Config,
        ResourceKind::Secret,
    ] {
        for name in doc.declared_names(kind) {
            let namespaced = format!("{token}{NAMESPACE_SEPARATOR}{name}");
            let _ = ctx.renames.insert(
                (module.to_string(), kind, name.to_string()),
                namespaced,
            );
        }
    }
}

fn rewrite_module(module: &str, doc: &mut ComposeDocument, ctx: &MergeContext) -> Result<()> {
    let rename_sections = |section: &mut Vec<(String, Node)>, kind: ResourceKind| {
        for (name, _) in section {
            if let Some(namespaced) = ctx.lookup(module, kind, name) {
                *name = namespaced.clone();
            }
        }
    };
    rename_sections(&mut doc.networks, ResourceKind::Network);
    rename_sections(&mut doc.volumes, ResourceKind::Volume);
    rename_sections(&mut doc.configs, ResourceKind::Config);
    rename_sections(&mut doc.secrets, ResourceKind::Secret);

    for (service, definition) in &mut doc.services {
        let original = service.clone();
        rewrite_service(module, &original, definition, ctx)?;
        if let Some(namespaced) = ctx.lookup(module, ResourceKind::Service, &original) {
            *service = namespaced.clone();
        }
    }
    Ok(())
}

fn rewrite_service(
    module: &str,
    service: &str,
    definition: &mut Service,
    ctx: &MergeContext,
) -> Result<()> {
    let resolve = |kind: ResourceKind, reference: &str| -> Result<String> {
        ctx.lookup(module, kind, reference).cloned().ok_or_else(|| {
            StevedoreError::Reference {
                module: module.to_string(),
                service: service.to_string(),
                reference: reference.to_string(),
            }
        })
    };

    if let Some(depends_on) = &mut definition.depends_on {
        depends_on.rewrite_names(|name| resolve(ResourceKind::Service, name))?;
    }
    if let Some(networks) = &mut definition.networks {
        networks.rewrite_names(|name| resolve(ResourceKind::Network, name))?;
    }
    for mount in &mut definition.volumes {
        if let Some(source) = mount.named_source() {
            let namespaced = resolve(ResourceKind::Volume, source)?;
            mount.rename_source(&namespaced);
        }
    }
    for link in &mut definition.links {
        // Links carry an optional alias: `service` or `service:alias`.
        let (target, alias) = link
            .split_once(':')
            .map_or((link.as_str(), None), |(t, a)| (t, Some(a)));
        let namespaced = resolve(ResourceKind::Service, target)?;
        *link = alias.map_or_else(|| namespaced.clone(), |a| format!("{namespaced}:{a}"));
    }
    for source in &mut definition.volumes_from {
        // `container:<name>` escapes compose scoping; passed through as-is.
        if source.starts_with("container:") {
            continue;
        }
        let (target, mode) = source
            .split_once(':')
            .map_or((source.as_str(), None), |(t, m)| (t, Some(m)));
        let namespaced = resolve(ResourceKind::Service, target)?;
        *source = mode.map_or_else(|| namespaced.clone(), |m| format!("{namespaced}:{m}"));
    }
    for file_ref in &mut definition.configs {
        if let Some(source) = file_ref.source() {
            let namespaced = resolve(ResourceKind::Config, source)?;
            file_ref.rename_source(&namespaced);
        }
    }
    for file_ref in &mut definition.secrets {
        if let Some(source) = file_ref.source() {
            let namespaced = resolve(ResourceKind::Secret, source)?;
            file_ref.rename_source(&namespaced);
        }
    }
    Ok(())
}

fn union_documents(docs: Vec<(String, ComposeDocument)>) -> Result<ComposeDocument> {
    let mut merged = ComposeDocument::default();
    let mut seen: HashSet<(ResourceKind, String)> = HashSet::new();

    // Namespacing makes cross-module collisions structurally impossible;
    // tripping this check means the rename pass has a bug.
    let mut claim = |kind: ResourceKind, name: &str| -> Result<()> {
        if !seen.insert((kind, name.to_string())) {
            return Err(StevedoreError::Internal {
                message: format!(
                    "namespaced {} \"{name}\" collided during union",
                    kind.as_str()
                ),
            });
        }
        Ok(())
    };

    for (_, doc) in docs {
        if merged.version.is_none() {
            merged.version = doc.version;
        }
        for (name, service) in doc.services {
            claim(ResourceKind::Service, &name)?;
            merged.services.push((name, service));
        }
        for (kind, source, target) in [
            (ResourceKind::Network, doc.networks, &mut merged.networks),
            (ResourceKind::Volume, doc.volumes, &mut merged.volumes),
            (ResourceKind::Config, doc.configs, &mut merged.configs),
            (ResourceKind::Secret, doc.secrets, &mut merged.secrets),
        ] {
            for (name, node) in source {
                claim(kind, &name)?;
                target.push((name, node));
            }
        }
        merged.extra.extend(doc.extra);
    }
    Ok(merged)
}

/// Verifies that every reference in the merged document resolves to a
/// declared resource. The per-module rewrite already guarantees this; a
/// failure here is an internal bug, not bad input.
fn assert_reference_integrity(doc: &ComposeDocument) -> Result<()> {
    let names = |kind: ResourceKind| -> HashSet<&str> {
        doc.declared_names(kind).into_iter().collect()
    };
    let services = names(ResourceKind::Service);
    let networks = names(ResourceKind::Network);
    let volumes = names(ResourceKind::Volume);
    let configs = names(ResourceKind::Config);
    let secrets = names(ResourceKind::Secret);

    let missing = |kind: &str, reference: &str, service: &str| StevedoreError::Internal {
        message: format!(
            "merged document references undeclared {kind} \"{reference}\" from service \"{service}\""
        ),
    };

    for (service, definition) in &doc.services {
        if let Some(depends_on) = &definition.depends_on {
            for name in depends_on.names() {
                if !services.contains(name) {
                    return Err(missing("service", name, service));
                }
            }
        }
        if let Some(nets) = &definition.networks {
            for name in nets.names() {
                if !networks.contains(name) {
                    return Err(missing("network", name, service));
                }
            }
        }
        for mount in &definition.volumes {
            if let Some(source) = mount.named_source() {
                if !volumes.contains(source) {
                    return Err(missing("volume", source, service));
                }
            }
        }
        for link in &definition.links {
            let target = link.split(':').next().unwrap_or(link);
            if !services.contains(target) {
                return Err(missing("service", target, service));
            }
        }
        for source in &definition.volumes_from {
            if source.starts_with("container:") {
                continue;
            }
            let target = source.split(':').next().unwrap_or(source);
            if !services.contains(target) {
                return Err(missing("service", target, service));
            }
        }
        for file_ref in &definition.configs {
            if let Some(source) = file_ref.source() {
                if !configs.contains(source) {
                    return Err(missing("config", source, service));
                }
            }
        }
        for file_ref in &definition.secrets {
            if let Some(source) = file_ref.source() {
                if !secrets.contains(source) {
                    return Err(missing("secret", source, service));
                }
            }
        }
        if definition.build.is_some() {
            return Err(StevedoreError::Internal {
                message: format!("merged document carries a build key on service \"{service}\""),
            });
        }
    }
    Ok(())
}

fn scan_port_conflicts(doc: &ComposeDocument) -> Vec<PortConflict> {
    let mut claims = Vec::new();
    for (service, definition) in &doc.services {
        for entry in &definition.ports {
            if let Some(binding) = ports::binding_from_node(entry) {
                claims.push((service.clone(), binding));
            }
        }
    }
    ports::find_conflicts(&claims)
}

fn rename_report(
    ctx: &MergeContext,
) -> BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>> {
    let mut report: BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>> = BTreeMap::new();
    for ((module, kind, original), namespaced) in &ctx.renames {
        let _ = report
            .entry(module.clone())
            .or_default()
            .entry(kind.as_str().to_string())
            .or_default()
            .insert(original.clone(), namespaced.clone());
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(name: &str, compose: &str) -> ModuleSource {
        ModuleSource::new(name, compose)
    }

    fn no_vars() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn namespace_token_sanitizes() {
        assert_eq!(namespace_token("My App-1.2"), "my_app_1_2");
        assert_eq!(namespace_token("3scale"), "m3scale");
        assert_eq!(namespace_token(""), "module");
    }

    #[test]
    fn merge_namespaces_overlapping_service_names() {
        let modules = vec![
            module("api", "services:\n  web:\n    image: nginx:1.25\n"),
            module("worker", "services:\n  web:\n    image: redis:7\n"),
        ];
        let merged = merge(&modules, &no_vars()).expect("merge failed");
        let names: Vec<&str> = merged
            .document
            .services
            .iter()
            .map(|(n, _)| n.as_str())
            .collect();
        assert_eq!(names, ["api__web", "worker__web"]);
        assert!(merged.document.service("web").is_none());
    }

    #[test]
    fn merge_is_deterministic() {
        let modules = vec![
            module(
                "api",
                "services:\n  web:\n    image: nginx:1.25\n    depends_on:\n      - db\n  db:\n    image: postgres:15\n",
            ),
            module("worker", "services:\n  jobs:\n    image: redis:7\n"),
        ];
        let a = merge(&modules, &no_vars())
            .expect("merge failed")
            .to_yaml_string()
            .expect("render failed");
        let b = merge(&modules, &no_vars())
            .expect("merge failed")
            .to_yaml_string()
            .expect("render failed");
        assert_eq!(a, b);
    }

    #[test]
    fn depends_on_rewritten_through_rename_table() {
        let modules = vec![module(
            "api",
            "services:\n  web:\n    image: nginx\n    depends_on:\n      - db\n  db:\n    image: postgres:15\n",
        )];
        let merged = merge(&modules, &no_vars()).expect("merge failed");
        let web = merged.document.service("api__web").expect("web missing");
        assert_eq!(
            web.depends_on,
            Some(crate::document::Refs::List(vec!["api__db".into()]))
        );
    }

    #[test]
    fn dangling_depends_on_is_fatal() {
        let modules = vec![module(
            "api",
            "services:\n  web:\n    image: nginx\n    depends_on:\n      - ghost\n",
        )];
        let err = merge(&modules, &no_vars()).unwrap_err();
        assert!(
            matches!(err, StevedoreError::Reference { ref reference, .. } if reference == "ghost"),
            "got: {err}"
        );
    }

    #[test]
    fn cross_module_depends_on_is_dangling() {
        let modules = vec![
            module("api", "services:\n  web:\n    image: nginx\n    depends_on:\n      - jobs\n"),
            module("worker", "services:\n  jobs:\n    image: redis:7\n"),
        ];
        assert!(merge(&modules, &no_vars()).is_err());
    }

    #[test]
    fn build_directive_is_fatal_and_names_the_service() {
        let modules = vec![module("app", "services:\n  app:\n    build: .\n")];
        let err = merge(&modules, &no_vars()).unwrap_err();
        match err {
            StevedoreError::BuildForbidden { module, service } => {
                assert_eq!(module, "app");
                assert_eq!(service, "app");
            }
            other => panic!("expected BuildForbidden, got {other}"),
        }
    }

    #[test]
    fn build_fails_even_with_other_valid_services() {
        let modules = vec![module(
            "app",
            "services:\n  good:\n    image: nginx\n  bad:\n    build: .\n",
        )];
        assert!(merge(&modules, &no_vars()).is_err());
    }

    #[test]
    fn parse_failure_in_any_module_fails_whole_merge() {
        let modules = vec![
            module("ok", "services:\n  web:\n    image: nginx\n"),
            module("broken", "services: [not: valid"),
        ];
        let err = merge(&modules, &no_vars()).unwrap_err();
        assert!(matches!(err, StevedoreError::Parse { ref module, .. } if module == "broken"));
    }

    #[test]
    fn port_conflict_reported_but_merge_succeeds() {
        let modules = vec![
            module(
                "api",
                "services:\n  web:\n    image: nginx:1.25\n    ports:\n      - \"8080:80\"\n",
            ),
            module(
                "worker",
                "services:\n  web:\n    image: redis:7\n    ports:\n      - \"8080:6379\"\n",
            ),
        ];
        let merged = merge(&modules, &no_vars()).expect("merge failed");
        assert_eq!(merged.report.conflicts.len(), 1);
        let conflict = &merged.report.conflicts[0];
        assert_eq!(conflict.port, 8080);
        assert_eq!(conflict.proto, "tcp");
        assert_eq!(conflict.services, ["api__web", "worker__web"]);
    }

    #[test]
    fn project_override_beats_module_default() {
        let mut m = module(
            "api",
            "services:\n  web:\n    image: nginx\n    environment:\n      - DB=${DB_HOST}\n",
        );
        let _ = m
            .variable_defaults
            .insert("DB_HOST".to_string(), "localhost".to_string());

        let mut overrides = BTreeMap::new();
        let _ = overrides.insert("DB_HOST".to_string(), "db.prod.internal".to_string());
        let merged = merge(&[m.clone()], &overrides).expect("merge failed");
        let rendered = merged.to_yaml_string().expect("render failed");
        assert!(rendered.contains("db.prod.internal"), "got: {rendered}");

        // Without the override the module default applies.
        let merged = merge(&[m], &no_vars()).expect("merge failed");
        let rendered = merged.to_yaml_string().expect("render failed");
        assert!(rendered.contains("localhost"), "got: {rendered}");
        assert!(
            merged
                .report
                .warnings
                .iter()
                .any(|e| e.code == "variable-default" && e.severity == Severity::Info),
            "expected an info entry for the default resolution"
        );
    }

    #[test]
    fn missing_required_variable_is_fatal() {
        let modules = vec![module(
            "api",
            "services:\n  web:\n    image: nginx\n    environment:\n      - DB=${DB_HOST}\n",
        )];
        let err = merge(&modules, &no_vars()).unwrap_err();
        assert!(matches!(err, StevedoreError::Variable { ref name, .. } if name == "DB_HOST"));
    }

    #[test]
    fn cross_module_default_collision_warns() {
        let mut a = module("api", "services:\n  web:\n    image: nginx\n");
        let _ = a
            .variable_defaults
            .insert("LOG_LEVEL".to_string(), "info".to_string());
        let mut b = module("worker", "services:\n  jobs:\n    image: redis\n");
        let _ = b
            .variable_defaults
            .insert("LOG_LEVEL".to_string(), "debug".to_string());

        let merged = merge(&[a, b], &no_vars()).expect("merge failed");
        assert!(
            merged
                .report
                .warnings
                .iter()
                .any(|e| e.code == "variable-collision" && e.severity == Severity::Warning)
        );
    }

    #[test]
    fn duplicate_module_names_rejected() {
        let modules = vec![
            module("api", "services:\n  a:\n    image: x\n"),
            module("api", "services:\n  b:\n    image: y\n"),
        ];
        assert!(merge(&modules, &no_vars()).is_err());
    }

    #[test]
    fn volumes_and_networks_namespaced_and_rewritten() {
        let modules = vec![module(
            "api",
            "services:\n  web:\n    image: nginx\n    networks:\n      - backend\n    volumes:\n      - data:/var/lib\nnetworks:\n  backend:\nvolumes:\n  data:\n",
        )];
        let merged = merge(&modules, &no_vars()).expect("merge failed");
        let doc = &merged.document;
        assert_eq!(doc.declared_names(ResourceKind::Network), ["api__backend"]);
        assert_eq!(doc.declared_names(ResourceKind::Volume), ["api__data"]);
        let web = doc.service("api__web").expect("web missing");
        assert_eq!(web.volumes[0].named_source(), Some("api__data"));
    }

    #[test]
    fn rename_report_lists_every_mapping() {
        let modules = vec![
            module("api", "services:\n  web:\n    image: nginx\nvolumes:\n  data:\n"),
            module("worker", "services:\n  web:\n    image: redis\n"),
        ];
        let merged = merge(&modules, &no_vars()).expect("merge failed");
        assert_eq!(
            merged.report.renames["api"]["service"]["web"],
            "api__web"
        );
        assert_eq!(merged.report.renames["api"]["volume"]["data"], "api__data");
        assert_eq!(
            merged.report.renames["worker"]["service"]["web"],
            "worker__web"
        );
    }

    #[test]
    fn report_serializes_to_json() {
        let modules = vec![module("api", "services:\n  web:\n    image: nginx\n")];
        let merged = merge(&modules, &no_vars()).expect("merge failed");
        let json = serde_json::to_string(&merged.report).expect("serialize failed");
        assert!(json.contains("\"renames\""), "got: {json}");
        assert!(json.contains("api__web"), "got: {json}");
    }

    #[test]
    fn two_modules_both_named_web_merge_cleanly_with_conflict_noted() {
        let modules = vec![
            module(
                "api",
                "services:\n  web:\n    image: nginx:1.25\n    ports:\n      - \"8080:80\"\n",
            ),
            module(
                "worker",
                "services:\n  web:\n    image: redis:7\n    ports:\n      - \"8080:6379\"\n",
            ),
        ];
        let merged = merge(&modules, &no_vars()).expect("merge failed");
        assert!(merged.document.service("api__web").is_some());
        assert!(merged.document.service("worker__web").is_some());
        assert_eq!(merged.report.conflicts.len(), 1);
        assert_eq!(merged.report.conflicts[0].port, 8080);
    }
}

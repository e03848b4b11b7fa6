//! `${VAR}` / `${VAR:-default}` interpolation over compose documents.
//!
//! Resolution order per module: project override, then the module's own
//! declared default, then the inline `:-` default. A variable with none of
//! the three is a fatal error. `$$` escapes a literal dollar sign.

use std::collections::BTreeMap;

use stevedore_common::error::{Result, StevedoreError};

use crate::node::Node;

/// Where a variable's value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// Supplied in the project-level variable map.
    Override,
    /// Taken from the module's declared defaults.
    ModuleDefault,
    /// Taken from the `${VAR:-default}` inline fallback.
    InlineDefault,
}

/// One observed variable resolution, reported back to the merge context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarUsage {
    /// Variable name.
    pub name: String,
    /// How it was resolved.
    pub resolution: Resolution,
}

/// Substitutes variable references in a single string.
///
/// # Errors
///
/// Returns [`StevedoreError::Variable`] for a reference with no override,
/// no module default, and no inline default, and
/// [`StevedoreError::Parse`] for an unterminated `${`.
pub fn substitute(
    module: &str,
    input: &str,
    overrides: &BTreeMap<String, String>,
    defaults: &BTreeMap<String, String>,
    usages: &mut Vec<VarUsage>,
) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '$')) => {
                let _ = chars.next();
                out.push('$');
            }
            Some(&(start, '{')) => {
                let _ = chars.next();
                let end = input[start..].find('}').map(|i| start + i).ok_or_else(|| {
                    StevedoreError::Parse {
                        module: module.to_string(),
                        message: format!("unterminated variable reference in \"{input}\""),
                    }
                })?;
                let body = &input[start + 1..end];
                while chars.peek().is_some_and(|&(i, _)| i <= end) {
                    let _ = chars.next();
                }
                let (name, inline_default) = split_reference(body);
                let (value, resolution) = resolve(module, name, inline_default, overrides, defaults)?;
                usages.push(VarUsage {
                    name: name.to_string(),
                    resolution,
                });
                out.push_str(&value);
            }
            _ => out.push('$'),
        }
    }
    Ok(out)
}

fn split_reference(body: &str) -> (&str, Option<&str>) {
    body.split_once(":-")
        .map_or((body, None), |(name, default)| (name, Some(default)))
}

fn resolve(
    module: &str,
    name: &str,
    inline_default: Option<&str>,
    overrides: &BTreeMap<String, String>,
    defaults: &BTreeMap<String, String>,
) -> Result<(String, Resolution)> {
    if let Some(value) = overrides.get(name) {
        return Ok((value.clone(), Resolution::Override));
    }
    if let Some(value) = defaults.get(name) {
        return Ok((value.clone(), Resolution::ModuleDefault));
    }
    if let Some(value) = inline_default {
        return Ok((value.to_string(), Resolution::InlineDefault));
    }
    Err(StevedoreError::Variable {
        module: module.to_string(),
        name: name.to_string(),
    })
}

/// Substitutes variable references in every string scalar of a tree.
///
/// # Errors
///
/// Propagates the same errors as [`substitute`].
pub fn substitute_node(
    module: &str,
    node: &mut Node,
    overrides: &BTreeMap<String, String>,
    defaults: &BTreeMap<String, String>,
) -> Result<Vec<VarUsage>> {
    let mut usages = Vec::new();
    node.visit_strings_mut(&mut |s: &mut String| {
        if s.contains('$') {
            *s = substitute(module, s, overrides, defaults, &mut usages)?;
        }
        Ok(())
    })?;
    Ok(usages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn override_beats_module_default() {
        let mut usages = Vec::new();
        let out = substitute(
            "m",
            "host=${DB_HOST}",
            &map(&[("DB_HOST", "db.prod")]),
            &map(&[("DB_HOST", "localhost")]),
            &mut usages,
        )
        .expect("substitute failed");
        assert_eq!(out, "host=db.prod");
        assert_eq!(usages[0].resolution, Resolution::Override);
    }

    #[test]
    fn module_default_used_without_override() {
        let mut usages = Vec::new();
        let out = substitute(
            "m",
            "host=${DB_HOST}",
            &BTreeMap::new(),
            &map(&[("DB_HOST", "localhost")]),
            &mut usages,
        )
        .expect("substitute failed");
        assert_eq!(out, "host=localhost");
        assert_eq!(usages[0].resolution, Resolution::ModuleDefault);
    }

    #[test]
    fn inline_default_is_last_resort() {
        let mut usages = Vec::new();
        let out = substitute(
            "m",
            "${PORT:-5432}",
            &BTreeMap::new(),
            &BTreeMap::new(),
            &mut usages,
        )
        .expect("substitute failed");
        assert_eq!(out, "5432");
        assert_eq!(usages[0].resolution, Resolution::InlineDefault);
    }

    #[test]
    fn missing_required_variable_is_fatal() {
        let mut usages = Vec::new();
        let err = substitute("m", "${MISSING}", &BTreeMap::new(), &BTreeMap::new(), &mut usages)
            .unwrap_err();
        assert!(matches!(err, StevedoreError::Variable { ref name, .. } if name == "MISSING"));
    }

    #[test]
    fn double_dollar_escapes() {
        let mut usages = Vec::new();
        let out = substitute("m", "cost: $$5", &BTreeMap::new(), &BTreeMap::new(), &mut usages)
            .expect("substitute failed");
        assert_eq!(out, "cost: $5");
        assert!(usages.is_empty());
    }

    #[test]
    fn unterminated_reference_is_parse_error() {
        let mut usages = Vec::new();
        let err = substitute("m", "${OOPS", &BTreeMap::new(), &BTreeMap::new(), &mut usages)
            .unwrap_err();
        assert!(matches!(err, StevedoreError::Parse { .. }));
    }

    #[test]
    fn multiple_references_in_one_string() {
        let mut usages = Vec::new();
        let out = substitute(
            "m",
            "${A}-${B:-two}",
            &map(&[("A", "one")]),
            &BTreeMap::new(),
            &mut usages,
        )
        .expect("substitute failed");
        assert_eq!(out, "one-two");
        assert_eq!(usages.len(), 2);
    }

    #[test]
    fn substitute_node_reaches_nested_scalars() {
        let mut node = Node::Mapping(vec![(
            "environment".into(),
            Node::Sequence(vec![Node::Str("DB=${DB_HOST:-localhost}".into())]),
        )]);
        let usages = substitute_node("m", &mut node, &BTreeMap::new(), &BTreeMap::new())
            .expect("substitute failed");
        assert_eq!(usages.len(), 1);
        assert_eq!(
            node.get("environment")
                .and_then(Node::as_sequence)
                .and_then(|s| s[0].as_str()),
            Some("DB=localhost")
        );
    }
}

//! Tagged-variant YAML tree with typed accessors.
//!
//! The compose schema subset Stevedore manipulates is small; instead of
//! threading `serde_yaml::Value` through the merger, documents are lifted
//! into this tree once at the parse boundary. Mapping entries keep their
//! declaration order so rendering is deterministic.

use stevedore_common::error::{Result, StevedoreError};

/// One node of a compose document tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// YAML null.
    Null,
    /// Boolean scalar.
    Bool(bool),
    /// Integer scalar.
    Int(i64),
    /// Floating-point scalar.
    Float(f64),
    /// String scalar.
    Str(String),
    /// Ordered sequence of nodes.
    Sequence(Vec<Node>),
    /// Ordered mapping with string keys.
    Mapping(Vec<(String, Node)>),
}

impl Node {
    /// Lifts a parsed YAML value into the tree.
    ///
    /// # Errors
    ///
    /// Returns an error for YAML constructs outside the compose subset:
    /// tagged values and non-scalar mapping keys.
    pub fn from_yaml(value: serde_yaml::Value) -> Result<Self> {
        match value {
            serde_yaml::Value::Null => Ok(Self::Null),
            serde_yaml::Value::Bool(b) => Ok(Self::Bool(b)),
            serde_yaml::Value::Number(n) => n.as_i64().map_or_else(
                || {
                    n.as_f64().map(Self::Float).ok_or_else(|| {
                        StevedoreError::Internal {
                            message: format!("unrepresentable YAML number: {n}"),
                        }
                    })
                },
                |i| Ok(Self::Int(i)),
            ),
            serde_yaml::Value::String(s) => Ok(Self::Str(s)),
            serde_yaml::Value::Sequence(seq) => Ok(Self::Sequence(
                seq.into_iter()
                    .map(Self::from_yaml)
                    .collect::<Result<_>>()?,
            )),
            serde_yaml::Value::Mapping(map) => {
                let mut entries = Vec::with_capacity(map.len());
                for (key, value) in map {
                    let key = yaml_key_to_string(&key)?;
                    entries.push((key, Self::from_yaml(value)?));
                }
                Ok(Self::Mapping(entries))
            }
            serde_yaml::Value::Tagged(tagged) => Err(StevedoreError::Config {
                message: format!("unsupported YAML tag: {}", tagged.tag),
            }),
        }
    }

    /// Lowers the tree back into a YAML value, preserving entry order.
    #[must_use]
    pub fn to_yaml(&self) -> serde_yaml::Value {
        match self {
            Self::Null => serde_yaml::Value::Null,
            Self::Bool(b) => serde_yaml::Value::Bool(*b),
            Self::Int(i) => serde_yaml::Value::Number((*i).into()),
            Self::Float(f) => serde_yaml::Value::Number((*f).into()),
            Self::Str(s) => serde_yaml::Value::String(s.clone()),
            Self::Sequence(seq) => {
                serde_yaml::Value::Sequence(seq.iter().map(Self::to_yaml).collect())
            }
            Self::Mapping(entries) => {
                let mut map = serde_yaml::Mapping::with_capacity(entries.len());
                for (key, value) in entries {
                    let _ = map.insert(serde_yaml::Value::String(key.clone()), value.to_yaml());
                }
                serde_yaml::Value::Mapping(map)
            }
        }
    }

    /// Returns the string value if this node is a string scalar.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Renders any scalar as a string (`8080` and `"8080"` are equivalent
    /// in compose port lists).
    #[must_use]
    pub fn scalar_string(&self) -> Option<String> {
        match self {
            Self::Str(s) => Some(s.clone()),
            Self::Int(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Returns the mapping entries if this node is a mapping.
    #[must_use]
    pub fn as_mapping(&self) -> Option<&[(String, Node)]> {
        match self {
            Self::Mapping(entries) => Some(entries),
            _ => None,
        }
    }

    /// Returns the sequence items if this node is a sequence.
    #[must_use]
    pub fn as_sequence(&self) -> Option<&[Node]> {
        match self {
            Self::Sequence(items) => Some(items),
            _ => None,
        }
    }

    /// Looks up a mapping entry by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Node> {
        self.as_mapping()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Applies `f` to every string scalar in the tree, in place.
    pub fn visit_strings_mut<F>(&mut self, f: &mut F) -> Result<()>
    where
        F: FnMut(&mut String) -> Result<()>,
    {
        match self {
            Self::Str(s) => f(s),
            Self::Sequence(items) => {
                for item in items {
                    item.visit_strings_mut(f)?;
                }
                Ok(())
            }
            Self::Mapping(entries) => {
                for (_, value) in entries {
                    value.visit_strings_mut(f)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn yaml_key_to_string(key: &serde_yaml::Value) -> Result<String> {
    match key {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        other => Err(StevedoreError::Config {
            message: format!("unsupported mapping key: {other:?}"),
        }),
    }
}

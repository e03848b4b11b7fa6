//! Typed view of the compose schema subset Stevedore manipulates.
//!
//! Only the fields the merger and linter rewrite or inspect are lifted into
//! typed form; everything else is carried through untouched as [`Node`]
//! subtrees so unknown keys survive a merge byte-for-byte.

use stevedore_common::error::{Result, StevedoreError};

use crate::node::Node;

/// Resource kinds that receive namespaced names during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    /// A service definition.
    Service,
    /// A top-level network.
    Network,
    /// A top-level named volume.
    Volume,
    /// A top-level config.
    Config,
    /// A top-level secret.
    Secret,
}

impl ResourceKind {
    /// Returns the report key for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Network => "network",
            Self::Volume => "volume",
            Self::Config => "config",
            Self::Secret => "secret",
        }
    }
}

/// A `depends_on` or service-level `networks` block, which compose accepts
/// either as a plain list of names or as a mapping with per-entry options.
#[derive(Debug, Clone, PartialEq)]
pub enum Refs {
    /// `- name` list form.
    List(Vec<String>),
    /// `name: {options}` mapping form. Options pass through unrewritten.
    Map(Vec<(String, Node)>),
}

impl Refs {
    /// Iterates the referenced names regardless of form.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        let items: Vec<&str> = match self {
            Self::List(names) => names.iter().map(String::as_str).collect(),
            Self::Map(entries) => entries.iter().map(|(name, _)| name.as_str()).collect(),
        };
        items.into_iter()
    }

    /// Rewrites every referenced name through `f`.
    pub fn rewrite_names<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&str) -> Result<String>,
    {
        match self {
            Self::List(names) => {
                for name in names {
                    *name = f(name)?;
                }
            }
            Self::Map(entries) => {
                for (name, _) in entries {
                    *name = f(name)?;
                }
            }
        }
        Ok(())
    }

    fn to_node(&self) -> Node {
        match self {
            Self::List(names) => {
                Node::Sequence(names.iter().map(|n| Node::Str(n.clone())).collect())
            }
            Self::Map(entries) => Node::Mapping(entries.clone()),
        }
    }
}

/// One entry of a service's `volumes` list.
#[derive(Debug, Clone, PartialEq)]
pub enum VolumeMount {
    /// Short `source:target[:mode]` (or bare target) string syntax.
    Short(String),
    /// Long mapping syntax with `type` / `source` / `target` keys.
    Long(Vec<(String, Node)>),
}

impl VolumeMount {
    /// Returns the named-volume source of this mount, if it has one.
    ///
    /// Bind mounts (absolute or relative host paths) and anonymous volumes
    /// have no named source and are never rewritten.
    #[must_use]
    pub fn named_source(&self) -> Option<&str> {
        match self {
            Self::Short(spec) => {
                let source = spec.split(':').next()?;
                if spec.split(':').count() < 2 || !is_named_volume(source) {
                    return None;
                }
                Some(source)
            }
            Self::Long(entries) => {
                let ty = entries
                    .iter()
                    .find(|(k, _)| k == "type")
                    .and_then(|(_, v)| v.as_str())
                    .unwrap_or("volume");
                if ty != "volume" {
                    return None;
                }
                entries
                    .iter()
                    .find(|(k, _)| k == "source")
                    .and_then(|(_, v)| v.as_str())
            }
        }
    }

    /// Replaces the named-volume source with `new`. No-op for bind mounts.
    pub fn rename_source(&mut self, new: &str) {
        match self {
            Self::Short(spec) => {
                if let Some((_, rest)) = spec.split_once(':') {
                    *spec = format!("{new}:{rest}");
                }
            }
            Self::Long(entries) => {
                if let Some((_, value)) = entries.iter_mut().find(|(k, _)| k == "source") {
                    *value = Node::Str(new.to_string());
                }
            }
        }
    }

    fn to_node(&self) -> Node {
        match self {
            Self::Short(spec) => Node::Str(spec.clone()),
            Self::Long(entries) => Node::Mapping(entries.clone()),
        }
    }
}

/// A service-level `configs` or `secrets` entry, referencing a top-level
/// declaration by name.
#[derive(Debug, Clone, PartialEq)]
pub enum FileRef {
    /// Bare name form.
    Short(String),
    /// Long mapping form with a `source` key.
    Long(Vec<(String, Node)>),
}

impl FileRef {
    /// Returns the referenced top-level name, if present.
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        match self {
            Self::Short(name) => Some(name),
            Self::Long(entries) => entries
                .iter()
                .find(|(k, _)| k == "source")
                .and_then(|(_, v)| v.as_str()),
        }
    }

    /// Replaces the referenced name with `new`.
    pub fn rename_source(&mut self, new: &str) {
        match self {
            Self::Short(name) => *name = new.to_string(),
            Self::Long(entries) => {
                if let Some((_, value)) = entries.iter_mut().find(|(k, _)| k == "source") {
                    *value = Node::Str(new.to_string());
                }
            }
        }
    }

    fn to_node(&self) -> Node {
        match self {
            Self::Short(name) => Node::Str(name.clone()),
            Self::Long(entries) => Node::Mapping(entries.clone()),
        }
    }
}

/// Returns whether a short-syntax volume source is a named volume rather
/// than a host path.
fn is_named_volume(source: &str) -> bool {
    !(source.is_empty()
        || source.starts_with('/')
        || source.starts_with('.')
        || source.starts_with('~')
        || source.starts_with('$'))
}

/// One service definition. Fields the pipeline rewrites are typed; all
/// other keys ride along in `extra` in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Service {
    /// The declared `image` reference, if any.
    pub image: Option<String>,
    /// The `build` subtree, if present. Forbidden in merged output.
    pub build: Option<Node>,
    /// Service dependencies.
    pub depends_on: Option<Refs>,
    /// Networks this service attaches to.
    pub networks: Option<Refs>,
    /// Published ports, kept as raw nodes (string, number, or long form).
    pub ports: Vec<Node>,
    /// Volume mounts.
    pub volumes: Vec<VolumeMount>,
    /// Legacy service links (`service` or `service:alias`).
    pub links: Vec<String>,
    /// Services whose volumes are inherited.
    pub volumes_from: Vec<String>,
    /// References to top-level configs.
    pub configs: Vec<FileRef>,
    /// References to top-level secrets.
    pub secrets: Vec<FileRef>,
    /// All remaining keys, passed through untouched.
    pub extra: Vec<(String, Node)>,
}

impl Service {
    fn from_node(module: &str, name: &str, node: &Node) -> Result<Self> {
        let Some(entries) = node.as_mapping() else {
            return Err(StevedoreError::Parse {
                module: module.to_string(),
                message: format!("service \"{name}\" must be a mapping"),
            });
        };

        let mut service = Self::default();
        for (key, value) in entries {
            match key.as_str() {
                "image" => {
                    service.image = Some(value.scalar_string().ok_or_else(|| {
                        StevedoreError::Parse {
                            module: module.to_string(),
                            message: format!("service \"{name}\": image must be a scalar"),
                        }
                    })?);
                }
                "build" => service.build = Some(value.clone()),
                "depends_on" => service.depends_on = Some(parse_refs(module, name, key, value)?),
                "networks" => service.networks = Some(parse_refs(module, name, key, value)?),
                "ports" => {
                    service.ports = value
                        .as_sequence()
                        .ok_or_else(|| StevedoreError::Parse {
                            module: module.to_string(),
                            message: format!("service \"{name}\": ports must be a list"),
                        })?
                        .to_vec();
                }
                "volumes" => service.volumes = parse_volumes(module, name, value)?,
                "links" => service.links = parse_string_list(module, name, key, value)?,
                "volumes_from" => {
                    service.volumes_from = parse_string_list(module, name, key, value)?;
                }
                "configs" => service.configs = parse_file_refs(module, name, key, value)?,
                "secrets" => service.secrets = parse_file_refs(module, name, key, value)?,
                _ => service.extra.push((key.clone(), value.clone())),
            }
        }
        Ok(service)
    }

    fn to_node(&self) -> Node {
        let mut entries = Vec::new();
        if let Some(image) = &self.image {
            entries.push(("image".to_string(), Node::Str(image.clone())));
        }
        if let Some(build) = &self.build {
            entries.push(("build".to_string(), build.clone()));
        }
        if let Some(depends_on) = &self.depends_on {
            entries.push(("depends_on".to_string(), depends_on.to_node()));
        }
        if let Some(networks) = &self.networks {
            entries.push(("networks".to_string(), networks.to_node()));
        }
        if !self.ports.is_empty() {
            entries.push(("ports".to_string(), Node::Sequence(self.ports.clone())));
        }
        if !self.volumes.is_empty() {
            entries.push((
                "volumes".to_string(),
                Node::Sequence(self.volumes.iter().map(VolumeMount::to_node).collect()),
            ));
        }
        if !self.links.is_empty() {
            entries.push((
                "links".to_string(),
                Node::Sequence(self.links.iter().map(|l| Node::Str(l.clone())).collect()),
            ));
        }
        if !self.volumes_from.is_empty() {
            entries.push((
                "volumes_from".to_string(),
                Node::Sequence(
                    self.volumes_from
                        .iter()
                        .map(|v| Node::Str(v.clone()))
                        .collect(),
                ),
            ));
        }
        for (key, refs) in [("configs", &self.configs), ("secrets", &self.secrets)] {
            if !refs.is_empty() {
                entries.push((
                    key.to_string(),
                    Node::Sequence(refs.iter().map(FileRef::to_node).collect()),
                ));
            }
        }
        entries.extend(self.extra.iter().cloned());
        Node::Mapping(entries)
    }
}

fn parse_file_refs(module: &str, service: &str, key: &str, node: &Node) -> Result<Vec<FileRef>> {
    let items = node.as_sequence().ok_or_else(|| StevedoreError::Parse {
        module: module.to_string(),
        message: format!("service \"{service}\": {key} must be a list"),
    })?;
    let mut refs = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Node::Str(name) => refs.push(FileRef::Short(name.clone())),
            Node::Mapping(entries) => refs.push(FileRef::Long(entries.clone())),
            _ => {
                return Err(StevedoreError::Parse {
                    module: module.to_string(),
                    message: format!("service \"{service}\": invalid {key} entry"),
                });
            }
        }
    }
    Ok(refs)
}

fn parse_refs(module: &str, service: &str, key: &str, node: &Node) -> Result<Refs> {
    match node {
        Node::Sequence(items) => {
            let mut names = Vec::with_capacity(items.len());
            for item in items {
                names.push(item.scalar_string().ok_or_else(|| StevedoreError::Parse {
                    module: module.to_string(),
                    message: format!("service \"{service}\": {key} entries must be names"),
                })?);
            }
            Ok(Refs::List(names))
        }
        Node::Mapping(entries) => Ok(Refs::Map(entries.clone())),
        _ => Err(StevedoreError::Parse {
            module: module.to_string(),
            message: format!("service \"{service}\": {key} must be a list or mapping"),
        }),
    }
}

fn parse_volumes(module: &str, service: &str, node: &Node) -> Result<Vec<VolumeMount>> {
    let items = node.as_sequence().ok_or_else(|| StevedoreError::Parse {
        module: module.to_string(),
        message: format!("service \"{service}\": volumes must be a list"),
    })?;
    let mut mounts = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Node::Str(spec) => mounts.push(VolumeMount::Short(spec.clone())),
            Node::Mapping(entries) => mounts.push(VolumeMount::Long(entries.clone())),
            _ => {
                return Err(StevedoreError::Parse {
                    module: module.to_string(),
                    message: format!("service \"{service}\": invalid volume entry"),
                });
            }
        }
    }
    Ok(mounts)
}

fn parse_string_list(module: &str, service: &str, key: &str, node: &Node) -> Result<Vec<String>> {
    let items = node.as_sequence().ok_or_else(|| StevedoreError::Parse {
        module: module.to_string(),
        message: format!("service \"{service}\": {key} must be a list"),
    })?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(item.scalar_string().ok_or_else(|| StevedoreError::Parse {
            module: module.to_string(),
            message: format!("service \"{service}\": {key} entries must be strings"),
        })?);
    }
    Ok(out)
}

/// A parsed compose document: the typed schema subset plus untouched extras.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComposeDocument {
    /// The legacy `version` key, if declared.
    pub version: Option<String>,
    /// Services in declaration order.
    pub services: Vec<(String, Service)>,
    /// Top-level networks in declaration order.
    pub networks: Vec<(String, Node)>,
    /// Top-level named volumes in declaration order.
    pub volumes: Vec<(String, Node)>,
    /// Top-level configs in declaration order.
    pub configs: Vec<(String, Node)>,
    /// Top-level secrets in declaration order.
    pub secrets: Vec<(String, Node)>,
    /// Unknown top-level keys (`x-*` extensions and the like).
    pub extra: Vec<(String, Node)>,
}

impl ComposeDocument {
    /// Parses compose YAML text. `module` names the source in diagnostics.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::Parse`] if the text is not valid YAML or
    /// does not follow the compose structure for the keys Stevedore reads.
    pub fn parse(module: &str, source: &str) -> Result<Self> {
        let root = parse_node(module, source)?;
        Self::from_node(module, &root)
    }

    /// Builds a typed document from an already lifted tree.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::Parse`] if the tree does not follow the
    /// compose structure.
    pub fn from_node(module: &str, root: &Node) -> Result<Self> {
        if matches!(root, Node::Null) {
            return Ok(Self::default());
        }
        let Some(entries) = root.as_mapping() else {
            return Err(StevedoreError::Parse {
                module: module.to_string(),
                message: "compose document root must be a mapping".into(),
            });
        };

        let mut doc = Self::default();
        for (key, value) in entries {
            match key.as_str() {
                "version" => doc.version = value.scalar_string(),
                "services" => {
                    for (name, node) in named_section(module, key, value)? {
                        let service = Service::from_node(module, &name, &node)?;
                        doc.services.push((name, service));
                    }
                }
                "networks" => doc.networks = named_section(module, key, value)?,
                "volumes" => doc.volumes = named_section(module, key, value)?,
                "configs" => doc.configs = named_section(module, key, value)?,
                "secrets" => doc.secrets = named_section(module, key, value)?,
                _ => doc.extra.push((key.clone(), value.clone())),
            }
        }
        Ok(doc)
    }

    /// Lowers the document back into a tree for rendering.
    #[must_use]
    pub fn to_node(&self) -> Node {
        let mut entries = Vec::new();
        if let Some(version) = &self.version {
            entries.push(("version".to_string(), Node::Str(version.clone())));
        }
        if !self.services.is_empty() {
            entries.push((
                "services".to_string(),
                Node::Mapping(
                    self.services
                        .iter()
                        .map(|(name, service)| (name.clone(), service.to_node()))
                        .collect(),
                ),
            ));
        }
        for (key, section) in [
            ("networks", &self.networks),
            ("volumes", &self.volumes),
            ("configs", &self.configs),
            ("secrets", &self.secrets),
        ] {
            if !section.is_empty() {
                entries.push((key.to_string(), Node::Mapping(section.clone())));
            }
        }
        entries.extend(self.extra.iter().cloned());
        Node::Mapping(entries)
    }

    /// Renders the document as compose YAML text.
    ///
    /// # Errors
    ///
    /// Returns an error if YAML serialization fails.
    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(&self.to_node().to_yaml()).map_err(|e| StevedoreError::Internal {
            message: format!("failed to render compose document: {e}"),
        })
    }

    /// Looks up a service by name.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }

    /// Names declared under the given top-level resource kind.
    #[must_use]
    pub fn declared_names(&self, kind: ResourceKind) -> Vec<&str> {
        match kind {
            ResourceKind::Service => self.services.iter().map(|(n, _)| n.as_str()).collect(),
            ResourceKind::Network => self.networks.iter().map(|(n, _)| n.as_str()).collect(),
            ResourceKind::Volume => self.volumes.iter().map(|(n, _)| n.as_str()).collect(),
            ResourceKind::Config => self.configs.iter().map(|(n, _)| n.as_str()).collect(),
            ResourceKind::Secret => self.secrets.iter().map(|(n, _)| n.as_str()).collect(),
        }
    }
}

/// Parses compose YAML text into the tagged tree without typing it.
///
/// The merger interpolates variables over the raw tree before lifting it
/// into [`ComposeDocument`] form.
///
/// # Errors
///
/// Returns [`StevedoreError::Parse`] if the text is not valid YAML within
/// the supported subset.
pub fn parse_node(module: &str, source: &str) -> Result<Node> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(source).map_err(|e| StevedoreError::Parse {
            module: module.to_string(),
            message: e.to_string(),
        })?;
    Node::from_yaml(value).map_err(|e| StevedoreError::Parse {
        module: module.to_string(),
        message: e.to_string(),
    })
}

fn named_section(module: &str, key: &str, node: &Node) -> Result<Vec<(String, Node)>> {
    match node {
        Node::Null => Ok(Vec::new()),
        Node::Mapping(entries) => Ok(entries.clone()),
        _ => Err(StevedoreError::Parse {
            module: module.to_string(),
            message: format!("top-level \"{key}\" must be a mapping"),
        }),
    }
}

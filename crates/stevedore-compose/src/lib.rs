//! # stevedore-compose
//!
//! Compose document handling for the Stevedore packaging pipeline.
//!
//! Handles:
//! - **Node**: a small tagged-variant YAML tree with typed accessors.
//! - **Document**: the typed compose schema subset (services, networks,
//!   volumes, configs, secrets) over that tree.
//! - **Merge**: combining N module documents into one namespaced document
//!   with a rename table and conflict report.
//! - **Lint**: the fixed policy rule set applied to any compose document.
//! - **Vars**: `${VAR}` / `${VAR:-default}` interpolation.
//! - **Ports**: host-port binding parsing and cross-module conflict scan.

pub mod document;
pub mod lint;
pub mod merge;
pub mod node;
pub mod ports;
pub mod vars;

pub use document::{ComposeDocument, Service};
pub use lint::{Issue, LintOutcome, lint};
pub use merge::{MergeReport, MergedDocument, ModuleSource, Severity, merge};
pub use ports::PortConflict;

//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Default base directory for Stevedore data on Linux with root access.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/stevedore";

/// Returns the data directory, preferring `$HOME/.stevedore` for non-root
/// or non-Linux environments, falling back to `/var/lib/stevedore`.
fn resolve_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        let user_dir = PathBuf::from(home).join(".stevedore");
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    PathBuf::from(SYSTEM_DATA_DIR)
}

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved data directory for this session.
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(resolve_data_dir)
}

/// Returns the default content-addressed image store path.
pub fn default_image_store() -> PathBuf {
    data_dir().join("store")
}

/// Separator inserted between a module's namespace token and a resource name.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Registry queried for image references that carry no explicit host.
pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// Tag assumed for image references that carry neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

/// SHA-256 digest length in hex characters.
pub const SHA256_HEX_LENGTH: usize = 64;

/// Minimum container runtime version the generated verify script requires.
pub const MIN_RUNTIME_VERSION: &str = "20.10.0";

/// File name of the merged compose document inside a bundle.
pub const BUNDLE_COMPOSE_FILE: &str = "docker-compose.yml";

/// File name of the environment template inside a bundle.
pub const BUNDLE_ENV_FILE: &str = ".env.template";

/// File name of the top-level manifest inside a bundle.
pub const BUNDLE_MANIFEST_FILE: &str = "manifest.json";

/// Application name used in CLI output and manifests.
pub const APP_NAME: &str = "stevedore";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "stvd";

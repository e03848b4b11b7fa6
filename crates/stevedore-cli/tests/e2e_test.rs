//! End-to-end pipeline tests: merge -> lint -> package -> assemble.
//!
//! The registry is stubbed so the whole pipeline runs against local
//! fixtures; everything else (store, dedupe, bundle layout, checksums) is
//! the real implementation.

use std::collections::BTreeMap;
use std::path::Path;

use stevedore_common::config::PackagerConfig;
use stevedore_common::types::Digest;
use stevedore_compose::ModuleSource;
use stevedore_image::registry::RegistryError;
use stevedore_image::{
    CancelToken, ContentStore as _, FsContentStore, ImageReference, Packager, Registry,
};

const MONITORING: &str = r"
services:
  web:
    image: grafana/grafana:10.2.0
    ports:
      - '3000:3000'
    depends_on:
      - db
    networks:
      - backend
  db:
    image: postgres:16.1
    volumes:
      - data:/var/lib/postgresql/data
    networks:
      - backend
networks:
  backend: {}
volumes:
  data: {}
";

const LOGGING: &str = r"
services:
  web:
    image: nginx:1.25.3
    ports:
      - '8080:80'
    networks:
      - mesh
networks:
  mesh: {}
";

/// Serves a fixed digest per repository and writes tiny archives.
struct StubRegistry {
    digests: BTreeMap<String, Digest>,
}

impl StubRegistry {
    fn new(entries: &[(&str, u8)]) -> Self {
        let digests = entries
            .iter()
            .map(|(reference, n)| {
                let digest =
                    Digest::from_hex(format!("{n:02x}").repeat(32)).expect("digest");
                ((*reference).to_string(), digest)
            })
            .collect();
        Self { digests }
    }
}

impl Registry for StubRegistry {
    async fn resolve_digest(
        &self,
        reference: &ImageReference,
    ) -> Result<Digest, RegistryError> {
        self.digests
            .get(reference.as_str())
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                reference: reference.to_string(),
            })
    }

    async fn fetch_image(
        &self,
        _reference: &ImageReference,
        digest: &Digest,
        dest: &Path,
    ) -> Result<u64, RegistryError> {
        let content = format!("oci layout for {digest}");
        std::fs::write(dest, &content).map_err(|e| RegistryError::Io {
            message: e.to_string(),
        })?;
        Ok(content.len() as u64)
    }
}

fn modules() -> Vec<ModuleSource> {
    vec![
        ModuleSource::new("monitoring", MONITORING),
        ModuleSource::new("logging", LOGGING),
    ]
}

#[tokio::test]
async fn pipeline_merges_packages_and_assembles() {
    let dir = tempfile::tempdir().expect("tempdir");

    // Merge: both modules declare `web`; the merged document must keep
    // them apart under namespaced names.
    let merged =
        stevedore_compose::merge(&modules(), &BTreeMap::new()).expect("merge failed");
    assert!(merged.document.services.iter().any(|(n, _)| n == "monitoring__web"));
    assert!(merged.document.services.iter().any(|(n, _)| n == "logging__web"));
    let compose = merged.to_yaml_string().expect("render failed");

    // Lint: pinned images and resolved references pass strict mode.
    let outcome = stevedore_compose::lint(&merged.document, Some(&compose), true);
    assert!(outcome.valid, "errors: {:?}", outcome.errors);

    // Package against the stubbed registry.
    let registry = StubRegistry::new(&[
        ("grafana/grafana:10.2.0", 1),
        ("postgres:16.1", 2),
        ("nginx:1.25.3", 3),
    ]);
    let store = FsContentStore::open(dir.path().join("store")).expect("open store");
    let packager =
        Packager::new(registry, store, PackagerConfig::default()).expect("packager");
    let images = packager
        .package(&merged.document, &CancelToken::new())
        .await
        .expect("package failed");
    assert_eq!(images.images.len(), 3);
    assert_eq!(images.distinct_digests().len(), 3);
    for digest in images.distinct_digests() {
        assert!(packager.store().has(digest));
    }

    // Assemble and verify the finished bundle.
    let opts = stevedore_bundle::AssembleOptions {
        out_dir: dir.path().join("bundle"),
        archive: true,
    };
    let bundle = stevedore_bundle::assemble(&compose, &images, &[], b"GRAFANA_PASSWORD=\n", &opts)
        .expect("assemble failed");
    assert_eq!(bundle.manifest.images.len(), 3);
    bundle.manifest.verify(&bundle.root).expect("bundle verify failed");
    assert!(bundle.archive.expect("no archive").exists());

    let shipped =
        std::fs::read_to_string(bundle.root.join("docker-compose.yml")).expect("read");
    assert!(shipped.contains("monitoring__web"));
    assert!(shipped.contains("logging__mesh"));
}

#[tokio::test]
async fn pipeline_shares_archives_between_modules_using_one_image() {
    let dir = tempfile::tempdir().expect("tempdir");
    let modules = vec![
        ModuleSource::new("a", "services:\n  app:\n    image: nginx:1.25.3\n"),
        ModuleSource::new("b", "services:\n  app:\n    image: nginx:1.25.3\n"),
    ];
    let merged = stevedore_compose::merge(&modules, &BTreeMap::new()).expect("merge failed");

    let registry = StubRegistry::new(&[("nginx:1.25.3", 7)]);
    let store = FsContentStore::open(dir.path().join("store")).expect("open store");
    let packager =
        Packager::new(registry, store, PackagerConfig::default()).expect("packager");
    let images = packager
        .package(&merged.document, &CancelToken::new())
        .await
        .expect("package failed");

    // One reference literal, one archive, even though two services use it.
    assert_eq!(images.images.len(), 1);
    assert_eq!(images.distinct_digests().len(), 1);

    let opts = stevedore_bundle::AssembleOptions {
        out_dir: dir.path().join("bundle"),
        archive: false,
    };
    let compose = merged.to_yaml_string().expect("render failed");
    let bundle = stevedore_bundle::assemble(&compose, &images, &[], b"", &opts)
        .expect("assemble failed");
    assert_eq!(bundle.manifest.images.len(), 1);
}

#[test]
fn pipeline_rejects_unmergeable_input_before_any_output() {
    let modules = vec![
        ModuleSource::new("app", "services:\n  web:\n    image: nginx:1.25\n"),
        ModuleSource::new("bad", "services:\n  api:\n    image: x:1\n    depends_on:\n      - ghost\n"),
    ];
    let err = stevedore_compose::merge(&modules, &BTreeMap::new()).unwrap_err();
    assert!(err.to_string().contains("ghost"));
}

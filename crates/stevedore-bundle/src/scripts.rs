//! Generated installer and verification scripts.
//!
//! Both scripts are rendered from embedded templates with the bundle's
//! totals substituted, so they run on the target host with nothing but a
//! POSIX shell, coreutils, and the container runtime.

use stevedore_common::constants::MIN_RUNTIME_VERSION;

const INSTALL_TEMPLATE: &str = r#"#!/bin/sh
# Loads the bundled images and prepares the compose project for launch.
# Run verify.sh first on any bundle that crossed an untrusted transport.
set -eu

cd "$(dirname "$0")"

RUNTIME="${CONTAINER_RUNTIME:-docker}"
if ! command -v "$RUNTIME" >/dev/null 2>&1; then
    echo "error: container runtime \"$RUNTIME\" not found" >&2
    exit 1
fi

if [ ! -f .env ] && [ -f .env.template ]; then
    cp .env.template .env
    echo "created .env from template; review it before starting the stack"
fi

count=0
for archive in images/*.tar; do
    [ -e "$archive" ] || break
    echo "loading $archive"
    "$RUNTIME" load -i "$archive"
    count=$((count + 1))
done

echo "loaded $count of @IMAGE_COUNT@ image archive(s)"
echo "start the stack with: $RUNTIME compose up -d"
"#;

const VERIFY_TEMPLATE: &str = r#"#!/bin/sh
# Verifies bundle integrity, free disk space, and the runtime version.
# Exits non-zero on the first failure.
set -eu

cd "$(dirname "$0")"

REQUIRED_BYTES=@TOTAL_ARCHIVE_BYTES@
MIN_RUNTIME="@MIN_RUNTIME_VERSION@"
RUNTIME="${CONTAINER_RUNTIME:-docker}"

fail() {
    echo "verify: $1" >&2
    exit 1
}

# Checksums: every file listed in manifest.json must hash to its recorded
# sha256.
command -v sha256sum >/dev/null 2>&1 || fail "sha256sum not found"
status=0
while IFS=' ' read -r expected path; do
    [ -n "$path" ] || continue
    actual=$(sha256sum "$path" | cut -d' ' -f1) || fail "cannot read $path"
    if [ "$actual" != "$expected" ]; then
        echo "verify: checksum mismatch for $path" >&2
        status=1
    fi
done <<EOF
@CHECKSUM_LINES@
EOF
[ "$status" -eq 0 ] || fail "bundle is corrupt"

# Disk space: loading archives needs at least their byte sum free.
available_kb=$(df -Pk . | awk 'NR==2 {print $4}')
required_kb=$(( (REQUIRED_BYTES + 1023) / 1024 ))
if [ "$available_kb" -lt "$required_kb" ]; then
    fail "insufficient disk space: need ${required_kb}K, have ${available_kb}K"
fi

# Runtime version: numeric semver comparison against the minimum.
command -v "$RUNTIME" >/dev/null 2>&1 || fail "container runtime \"$RUNTIME\" not found"
version=$("$RUNTIME" version --format '{{.Server.Version}}' 2>/dev/null \
    || "$RUNTIME" --version | sed 's/[^0-9.]*\([0-9.]*\).*/\1/')
newest=$(printf '%s\n%s\n' "$MIN_RUNTIME" "$version" | sort -V | tail -n1)
if [ "$newest" != "$version" ]; then
    fail "runtime version $version is older than required $MIN_RUNTIME"
fi

echo "verify: ok ($version >= $MIN_RUNTIME, ${available_kb}K free)"
"#;

/// Renders `install.sh` for a bundle with `image_count` archives.
#[must_use]
pub fn render_install(image_count: usize) -> String {
    INSTALL_TEMPLATE.replace("@IMAGE_COUNT@", &image_count.to_string())
}

/// Renders `verify.sh`.
///
/// `checksums` holds `(relative_path, sha256)` pairs for every file the
/// script must re-hash; `archive_bytes` is the free-space requirement.
#[must_use]
pub fn render_verify(checksums: &[(String, String)], archive_bytes: u64) -> String {
    let lines: Vec<String> = checksums
        .iter()
        .map(|(path, sha256)| format!("{sha256} {path}"))
        .collect();
    VERIFY_TEMPLATE
        .replace("@TOTAL_ARCHIVE_BYTES@", &archive_bytes.to_string())
        .replace("@MIN_RUNTIME_VERSION@", MIN_RUNTIME_VERSION)
        .replace("@CHECKSUM_LINES@", &lines.join("\n"))
}

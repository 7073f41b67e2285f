use std::path::{Path, PathBuf};

/// LDIF file shipped with the tests
pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

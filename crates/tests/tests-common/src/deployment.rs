//! Locating the configuration fixtures checked into the repository.

use std::path::PathBuf;

use query_engine_metadata::metadata::Metadata;

/// Find the project root via the crate root provided by `cargo test`,
/// and get the fixture at `path` below it.
/// This depends on the convention that all our crates live in `/crates/<group>/<name>`.
pub fn get_fixture_path(path: &str) -> PathBuf {
    let mut d = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    d.push("../../../");
    d.push(path);
    d
}

/// The configuration directory of the sample sales database.
pub fn sales_configuration_dir() -> PathBuf {
    get_fixture_path("static/sales")
}

/// Read the metadata of a configuration file without going through the
/// configuration crate.
pub fn read_metadata(path: &str) -> anyhow::Result<Metadata> {
    let text = std::fs::read_to_string(get_fixture_path(path))?;
    let json: serde_json::Value = serde_json::from_str(&text)?;
    let metadata = json
        .get("metadata")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("{path} has no metadata"))?;
    Ok(serde_json::from_value(metadata)?)
}

//! Configuration loading utilities.
//!
//! Reading and parsing the YAML configuration document from disk.

use std::path::Path;

use eyre::WrapErr as _;
use tokio::fs;

use crate::config::Document;

/// Reads and parses the monitor config from a YAML file.
///
/// # Arguments
///
/// * `path` - File path to the YAML configuration file.
///
/// # Errors
///
/// Returns an error if the config file cannot be read or parsed.
pub(crate) async fn load<P: AsRef<Path>>(path: P) -> eyre::Result<Document> {
    let path_ref = path.as_ref();
    let content = fs::read_to_string(&path).await.wrap_err(format!(
        "Failed to read config file at: {}",
        path_ref.display()
    ))?;
    let document: Document = serde_yaml::from_str(&content).wrap_err(format!(
        "Failed to parse config as YAML at: {}",
        path_ref.display()
    ))?;
    Ok(document)
}

//! Shim configuration.

use gvshim_shared::errors::{ShimError, ShimResult};
use std::collections::HashMap;
use std::path::PathBuf;

/// Configuration of one shim instance.
///
/// Built once from the command line and shared by the task service and the
/// runsc process factory.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Bundle path of the container this shim was started for
    pub path: PathBuf,
    /// containerd namespace
    pub namespace: String,
    /// Shim working directory (pid files, exec specs, console sockets)
    pub work_dir: PathBuf,
    /// runsc state root
    pub runtime_root: PathBuf,
    /// runsc binary used when a Create request names none
    pub runtime: String,
    /// Extra runsc flags, passed as `--key=value`
    pub runsc_config: HashMap<String, String>,
}

impl Config {
    /// Check the configuration before a service is built from it.
    pub fn validate(&self) -> ShimResult<()> {
        if self.namespace.is_empty() {
            return Err(ShimError::InvalidArgument(
                "shim namespace cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Parse one `KEY=VALUE` runsc config entry.
pub fn parse_key_value(entry: &str) -> Result<(String, String), String> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("invalid runsc config '{}': expected KEY=VALUE", entry)),
    }
}

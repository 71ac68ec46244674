//! Builds runsc init processes for Create.

use super::init::{ContainerContext, RunscInit};
use super::{format_log_path, ExitMonitor, Runsc, DEFAULT_BINARY};
use crate::config::Config;
use crate::console::ConsolePlatform;
use crate::mount::Mounter;
use crate::process::{CreateConfig, InitProcess, ProcessFactory};
use gvshim_shared::constants::annotations::{CONTAINER_TYPE, CONTAINER_TYPE_SANDBOX};
use gvshim_shared::constants::bundle::CONFIG_FILE;
use gvshim_shared::errors::{ShimError, ShimResult};
use oci_spec::runtime::Spec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Runtime options carried in the Create request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateOptions {
    /// Owner of the stdio pipes handed to the container
    pub io_uid: u32,
    pub io_gid: u32,
}

impl CreateOptions {
    pub fn decode(options: Option<&serde_json::Value>) -> ShimResult<Self> {
        match options {
            None | Some(serde_json::Value::Null) => Ok(Self::default()),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                ShimError::InvalidArgument(format!("failed to decode runtime options: {}", e))
            }),
        }
    }
}

/// [`ProcessFactory`] backed by runsc.
pub struct RunscFactory {
    config: Config,
    monitor: ExitMonitor,
    mounter: Arc<dyn Mounter>,
    platform: Arc<ConsolePlatform>,
}

impl RunscFactory {
    pub fn new(config: Config, monitor: ExitMonitor, mounter: Arc<dyn Mounter>) -> Self {
        Self {
            config,
            monitor,
            mounter,
            platform: Arc::new(ConsolePlatform::new()),
        }
    }
}

impl ProcessFactory for RunscFactory {
    fn new_init(&self, config: &CreateConfig) -> ShimResult<Arc<dyn InitProcess>> {
        let options = CreateOptions::decode(config.options.as_ref())?;

        let spec = Spec::load(config.bundle.join(CONFIG_FILE))
            .map_err(|e| ShimError::Spec(format!("read oci spec: {}", e)))?;
        let sandbox = spec
            .annotations()
            .as_ref()
            .and_then(|a| a.get(CONTAINER_TYPE))
            .is_some_and(|t| t == CONTAINER_TYPE_SANDBOX);

        let binary = [config.runtime.as_str(), self.config.runtime.as_str()]
            .into_iter()
            .find(|b| !b.is_empty())
            .unwrap_or(DEFAULT_BINARY);
        let runtime = Runsc::new(
            binary,
            self.config.runtime_root.join(&self.config.namespace),
            config.bundle.join("log.json"),
            &config.id,
            &self.config.runsc_config,
        );

        let ctx = ContainerContext {
            id: config.id.clone(),
            work_dir: self.config.work_dir.clone(),
            runtime: Arc::new(runtime),
            platform: self.platform.clone(),
            monitor: self.monitor.clone(),
            io_uid: options.io_uid,
            io_gid: options.io_gid,
        };

        Ok(Arc::new(RunscInit::new(
            ctx,
            config.bundle.clone(),
            config.stdio.clone(),
            sandbox,
            format_log_path(&config.id, &self.config.runsc_config),
            self.mounter.clone(),
        )))
    }

    fn close(&self) {
        self.platform.close();
    }
}

//! Entry point for the gvshim runtime shim.

use clap::Parser;
use gvshim::config::{parse_key_value, Config};
use gvshim::runsc::{ExitMonitor, RunscFactory};
use gvshim::{logging, Mounter, RemotePublisher, ShimServer, SystemMounter, TaskService};
use gvshim_shared::errors::{ShimError, ShimResult};
use gvshim_shared::Transport;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// gvshim - containerd v1 shim for gVisor (runsc) containers
#[derive(Parser, Debug)]
#[command(author, version, about = "containerd v1 shim for gVisor (runsc) containers")]
struct ShimArgs {
    /// containerd namespace of the container
    #[arg(long, env = "GVSHIM_NAMESPACE", default_value = "")]
    namespace: String,

    /// containerd address events are published to
    #[arg(long, default_value = "/run/containerd/containerd.sock")]
    address: String,

    /// Binary used to publish events
    #[arg(long, default_value = "containerd")]
    publish_binary: PathBuf,

    /// Control socket listen address
    ///
    /// Examples:
    ///   --socket unix:///run/containerd/s/abc
    ///   --socket /run/containerd/s/abc
    ///   --socket tcp://127.0.0.1:9000
    #[arg(long)]
    socket: String,

    /// Working directory for pid files, exec specs and console sockets
    #[arg(long, default_value = ".")]
    workdir: PathBuf,

    /// Root directory of runsc state
    #[arg(long, default_value = "/run/containerd/runsc")]
    runtime_root: PathBuf,

    /// runsc binary used when Create names none
    #[arg(long, default_value = gvshim::runsc::DEFAULT_BINARY)]
    runtime: String,

    /// Extra runsc flag as KEY=VALUE (repeatable)
    #[arg(long = "runsc-config", value_parser = parse_key_value)]
    runsc_config: Vec<(String, String)>,

    /// Write logs to a daily rolling file in this directory instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long)]
    debug: bool,
}

impl ShimArgs {
    fn config(&self) -> ShimResult<Config> {
        Ok(Config {
            path: std::env::current_dir()?,
            namespace: self.namespace.clone(),
            work_dir: self.workdir.clone(),
            runtime_root: self.runtime_root.clone(),
            runtime: self.runtime.clone(),
            runsc_config: self.runsc_config.iter().cloned().collect(),
        })
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => info!("SIGTERM received"),
                _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[tokio::main]
async fn main() -> ShimResult<()> {
    let args = ShimArgs::parse();
    let _guard = logging::init(args.log_dir.as_deref(), args.debug)?;

    let config = args.config()?;
    let transport = Transport::from_uri(&args.socket).map_err(ShimError::InvalidArgument)?;
    info!(
        namespace = %config.namespace,
        bundle = %config.path.display(),
        socket = %transport,
        "gvshim starting"
    );

    let (monitor, exits) = ExitMonitor::channel();
    let mounter: Arc<dyn Mounter> = Arc::new(SystemMounter);
    let factory = Arc::new(RunscFactory::new(config.clone(), monitor, mounter.clone()));
    let publisher = Arc::new(RemotePublisher::new(
        args.publish_binary,
        args.address,
        config.namespace.clone(),
    ));

    let service = Arc::new(TaskService::new(&config, publisher, exits, factory, mounter)?);
    ShimServer::new(service)
        .run(transport, shutdown_signal())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = ShimArgs::try_parse_from([
            "gvshim",
            "--namespace",
            "k8s.io",
            "--socket",
            "/run/containerd/s/abc",
            "--runsc-config",
            "platform=ptrace",
            "--runsc-config",
            "debug-log=/var/log/runsc/%ID%/",
        ])
        .unwrap();
        let config = args.config().unwrap();
        assert_eq!(config.namespace, "k8s.io");
        assert_eq!(config.runtime, "runsc");
        assert_eq!(config.runsc_config.len(), 2);
        assert_eq!(config.runsc_config["platform"], "ptrace");
    }

    #[test]
    fn test_bad_runsc_config_is_rejected() {
        let err = ShimArgs::try_parse_from([
            "gvshim",
            "--socket",
            "/run/s",
            "--runsc-config",
            "platform",
        ]);
        assert!(err.is_err());
    }
}

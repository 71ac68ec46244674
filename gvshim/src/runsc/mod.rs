//! runsc driver.
//!
//! Processes of the container are created, signalled and reaped by the
//! runsc binary. This module wraps its command line and implements the
//! process traits on top of it:
//! - `factory`: builds the init process for Create
//! - `init` / `exec`: the two process variants
//! - `io`: stdio pipes and fifo copies
//! - `monitor`: waits for exits and feeds the exit channel

mod exec;
mod factory;
mod init;
pub(crate) mod io;
mod monitor;

pub use factory::{CreateOptions, RunscFactory};
pub use monitor::ExitMonitor;

use gvshim_shared::errors::{ShimError, ShimResult};
use io::ChildStdio;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Default runsc binary when the request names no runtime.
pub const DEFAULT_BINARY: &str = "runsc";

/// runsc config key whose value (with `%ID%` substituted) is the per-container user log.
const DEBUG_LOG_KEY: &str = "debug-log";

/// Options of `runsc create`.
#[derive(Debug, Clone, Default)]
pub struct CreateOpts {
    pub pid_file: PathBuf,
    pub console_socket: Option<PathBuf>,
    pub user_log: Option<String>,
}

/// Options of `runsc exec`.
#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
    pub pid_file: PathBuf,
    pub console_socket: Option<PathBuf>,
}

/// Container state as printed by `runsc state`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeState {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub pid: i64,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct WaitResult {
    #[serde(rename = "exitStatus")]
    exit_status: u32,
}

/// Command-line wrapper around one runsc binary and state root.
#[derive(Debug, Clone)]
pub struct Runsc {
    binary: PathBuf,
    root: PathBuf,
    log: PathBuf,
    config: BTreeMap<String, String>,
}

impl Runsc {
    /// `root` is the state root for this namespace, `log` the runsc log file.
    ///
    /// `%ID%` in config values is replaced with `id`.
    pub fn new(
        binary: impl Into<PathBuf>,
        root: impl Into<PathBuf>,
        log: impl Into<PathBuf>,
        id: &str,
        config: &HashMap<String, String>,
    ) -> Self {
        Self {
            binary: binary.into(),
            root: root.into(),
            log: log.into(),
            config: config
                .iter()
                .map(|(k, v)| (k.clone(), v.replace("%ID%", id)))
                .collect(),
        }
    }

    fn global_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--root={}", self.root.display()),
            format!("--log={}", self.log.display()),
            "--log-format=json".to_string(),
        ];
        args.extend(self.config.iter().map(|(k, v)| format!("--{}={}", k, v)));
        args
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.global_args()).args(args);
        cmd
    }

    /// Run a command that prints its result on stdout.
    async fn output(&self, args: Vec<String>) -> ShimResult<Vec<u8>> {
        let output = self
            .command(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            return Err(ShimError::Runtime(format!(
                "runsc {} failed ({}): {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    /// Run a command whose children outlive it (create, start, exec --detach).
    ///
    /// Output is not captured: detached children would hold the pipes open.
    /// Failures are reported with the last line of the runsc log.
    async fn detached(&self, args: Vec<String>, stdio: ChildStdio) -> ShimResult<()> {
        let mut cmd = self.command(&args);
        cmd.stdin(stdio.stdin.map(Stdio::from).unwrap_or_else(Stdio::null))
            .stdout(stdio.stdout.map(Stdio::from).unwrap_or_else(Stdio::null))
            .stderr(stdio.stderr.map(Stdio::from).unwrap_or_else(Stdio::null));

        let status = cmd.status().await.map_err(|e| self.spawn_error(e))?;
        if !status.success() {
            return Err(ShimError::Runtime(format!(
                "runsc {} failed ({}): {}",
                args.first().map(String::as_str).unwrap_or_default(),
                status,
                self.last_log_line().await
            )));
        }
        Ok(())
    }

    fn spawn_error(&self, e: std::io::Error) -> ShimError {
        ShimError::Runtime(format!("failed to run {}: {}", self.binary.display(), e))
    }

    async fn last_log_line(&self) -> String {
        tokio::fs::read_to_string(&self.log)
            .await
            .ok()
            .and_then(|log| log.lines().last().map(str::to_string))
            .unwrap_or_else(|| "see runsc log".to_string())
    }

    pub(crate) async fn create(
        &self,
        id: &str,
        bundle: &Path,
        opts: &CreateOpts,
        stdio: ChildStdio,
    ) -> ShimResult<()> {
        self.detached(create_args(id, bundle, opts), stdio).await
    }

    pub async fn start(&self, id: &str) -> ShimResult<()> {
        self.detached(vec!["start".to_string(), id.to_string()], ChildStdio::none())
            .await
    }

    pub(crate) async fn exec(
        &self,
        id: &str,
        process_spec: &Path,
        opts: &ExecOpts,
        stdio: ChildStdio,
    ) -> ShimResult<()> {
        self.detached(exec_args(id, process_spec, opts), stdio).await
    }

    /// Signal the container (`pid` unset) or one process in it.
    pub async fn kill(&self, id: &str, signal: u32, all: bool, pid: Option<u32>) -> ShimResult<()> {
        self.output(kill_args(id, signal, all, pid))
            .await
            .map(drop)
            .map_err(kill_error)
    }

    /// Pids of every process in the container.
    pub async fn ps(&self, id: &str) -> ShimResult<Vec<u32>> {
        let out = self
            .output(vec![
                "ps".to_string(),
                "--format=json".to_string(),
                id.to_string(),
            ])
            .await?;
        serde_json::from_slice::<Option<Vec<u32>>>(&out)
            .map(Option::unwrap_or_default)
            .map_err(|e| ShimError::Runtime(format!("decode runsc ps output: {}", e)))
    }

    pub async fn state(&self, id: &str) -> ShimResult<RuntimeState> {
        let out = self
            .output(vec!["state".to_string(), id.to_string()])
            .await?;
        serde_json::from_slice(&out)
            .map_err(|e| ShimError::Runtime(format!("decode runsc state output: {}", e)))
    }

    /// Wait for the container (`pid` unset) or one process in it, returning its exit status.
    pub async fn wait(&self, id: &str, pid: Option<u32>) -> ShimResult<i32> {
        let out = self.output(wait_args(id, pid)).await?;
        let result: WaitResult = serde_json::from_slice(&out)
            .map_err(|e| ShimError::Runtime(format!("decode runsc wait output: {}", e)))?;
        Ok(exit_code(result.exit_status))
    }

    pub async fn delete(&self, id: &str, force: bool) -> ShimResult<()> {
        let mut args = vec!["delete".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(id.to_string());
        match self.output(args).await {
            Err(ShimError::Runtime(msg)) if msg.contains("does not exist") => Ok(()),
            other => other.map(drop),
        }
    }
}

impl ChildStdio {
    pub(crate) fn none() -> Self {
        Self {
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }
}

fn create_args(id: &str, bundle: &Path, opts: &CreateOpts) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        format!("--bundle={}", bundle.display()),
        format!("--pid-file={}", opts.pid_file.display()),
    ];
    if let Some(socket) = &opts.console_socket {
        args.push(format!("--console-socket={}", socket.display()));
    }
    if let Some(user_log) = &opts.user_log {
        args.push(format!("--user-log={}", user_log));
    }
    args.push(id.to_string());
    args
}

fn exec_args(id: &str, process_spec: &Path, opts: &ExecOpts) -> Vec<String> {
    let mut args = vec![
        "exec".to_string(),
        format!("--process={}", process_spec.display()),
        "--detach".to_string(),
        format!("--pid-file={}", opts.pid_file.display()),
    ];
    if let Some(socket) = &opts.console_socket {
        args.push(format!("--console-socket={}", socket.display()));
    }
    args.push(id.to_string());
    args
}

fn kill_args(id: &str, signal: u32, all: bool, pid: Option<u32>) -> Vec<String> {
    let mut args = vec!["kill".to_string()];
    if all {
        args.push("--all".to_string());
    }
    if let Some(pid) = pid {
        args.push(format!("--pid={}", pid));
    }
    args.push(id.to_string());
    args.push(signal.to_string());
    args
}

fn wait_args(id: &str, pid: Option<u32>) -> Vec<String> {
    let mut args = vec!["wait".to_string()];
    if let Some(pid) = pid {
        args.push(format!("--pid={}", pid));
    }
    args.push(id.to_string());
    args
}

/// Errors meaning the target is already gone become `NotFound`.
fn kill_error(err: ShimError) -> ShimError {
    match err {
        ShimError::Runtime(msg)
            if ["process already finished", "not running", "no such process"]
                .iter()
                .any(|s| msg.contains(s)) =>
        {
            ShimError::NotFound(format!("process already finished: {}", msg))
        }
        other => other,
    }
}

/// Exit code from a raw wait(2) status: 128+signal for signalled processes.
fn exit_code(raw: u32) -> i32 {
    let signal = raw & 0x7f;
    if signal == 0 {
        ((raw >> 8) & 0xff) as i32
    } else {
        128 + signal as i32
    }
}

/// `debug-log` with `%ID%` replaced, used as the container's user log.
pub fn format_log_path(id: &str, config: &HashMap<String, String>) -> Option<String> {
    config
        .get(DEBUG_LOG_KEY)
        .map(|path| path.replace("%ID%", id))
}

/// Read a pid written by runsc.
pub(crate) async fn read_pid_file(path: &Path) -> ShimResult<u32> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ShimError::Io(e).context(format!("read pid file {}", path.display())))?;
    content.trim().parse().map_err(|e| {
        ShimError::Runtime(format!(
            "invalid pid file {} ({:?}): {}",
            path.display(),
            content.trim(),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runsc() -> Runsc {
        let mut config = HashMap::new();
        config.insert("platform".to_string(), "ptrace".to_string());
        config.insert("debug-log".to_string(), "/var/log/runsc/%ID%/".to_string());
        Runsc::new(
            "runsc",
            "/run/containerd/runsc/k8s.io",
            "/b/log.json",
            "c1",
            &config,
        )
    }

    #[test]
    fn test_global_args_are_sorted_and_substituted() {
        assert_eq!(
            runsc().global_args(),
            vec![
                "--root=/run/containerd/runsc/k8s.io",
                "--log=/b/log.json",
                "--log-format=json",
                "--debug-log=/var/log/runsc/c1/",
                "--platform=ptrace",
            ]
        );
    }

    #[test]
    fn test_create_args() {
        let opts = CreateOpts {
            pid_file: PathBuf::from("/b/init.pid"),
            console_socket: Some(PathBuf::from("/w/console-c1.sock")),
            user_log: Some("/var/log/runsc/c1/".to_string()),
        };
        assert_eq!(
            create_args("c1", Path::new("/b"), &opts),
            vec![
                "create",
                "--bundle=/b",
                "--pid-file=/b/init.pid",
                "--console-socket=/w/console-c1.sock",
                "--user-log=/var/log/runsc/c1/",
                "c1",
            ]
        );
    }

    #[test]
    fn test_exec_args_are_detached() {
        let opts = ExecOpts {
            pid_file: PathBuf::from("/w/e1.pid"),
            console_socket: None,
        };
        assert_eq!(
            exec_args("c1", Path::new("/w/e1.json"), &opts),
            vec![
                "exec",
                "--process=/w/e1.json",
                "--detach",
                "--pid-file=/w/e1.pid",
                "c1"
            ]
        );
    }

    #[test]
    fn test_kill_and_wait_args() {
        assert_eq!(kill_args("c1", 9, true, None), vec!["kill", "--all", "c1", "9"]);
        assert_eq!(
            kill_args("c1", 15, false, Some(42)),
            vec!["kill", "--pid=42", "c1", "15"]
        );
        assert_eq!(wait_args("c1", Some(42)), vec!["wait", "--pid=42", "c1"]);
        assert_eq!(wait_args("c1", None), vec!["wait", "c1"]);
    }

    #[test]
    fn test_exit_code_from_wait_status() {
        assert_eq!(exit_code(0), 0);
        assert_eq!(exit_code(3 << 8), 3);
        // SIGKILL
        assert_eq!(exit_code(9), 137);
    }

    #[test]
    fn test_gone_process_kill_is_not_found() {
        let err = kill_error(ShimError::Runtime(
            "runsc kill failed: container is not running".into(),
        ));
        assert!(matches!(err, ShimError::NotFound(_)));

        let err = kill_error(ShimError::Runtime("permission denied".into()));
        assert!(matches!(err, ShimError::Runtime(_)));
    }

    #[test]
    fn test_format_log_path() {
        let mut config = HashMap::new();
        assert_eq!(format_log_path("c1", &config), None);
        config.insert("debug-log".to_string(), "/logs/%ID%.txt".to_string());
        assert_eq!(format_log_path("c1", &config).as_deref(), Some("/logs/c1.txt"));
    }

    #[tokio::test]
    async fn test_read_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("init.pid");
        tokio::fs::write(&path, "4242").await.unwrap();
        assert_eq!(read_pid_file(&path).await.unwrap(), 4242);

        tokio::fs::write(&path, "garbage").await.unwrap();
        assert!(matches!(
            read_pid_file(&path).await.unwrap_err(),
            ShimError::Runtime(_)
        ));
    }
}

//! Event delivery to the orchestrating daemon.

use async_trait::async_trait;
use gvshim_shared::errors::{ShimError, ShimResult};
use gvshim_shared::TaskEvent;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Sink for task events.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, event: &TaskEvent) -> ShimResult<()>;
}

/// Publishes through the daemon's own CLI:
/// `<binary> --address <address> publish --topic <topic> --namespace <ns>`,
/// with the JSON-encoded event on stdin.
#[derive(Debug, Clone)]
pub struct RemotePublisher {
    binary: PathBuf,
    address: String,
    namespace: String,
}

impl RemotePublisher {
    pub fn new(binary: impl Into<PathBuf>, address: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            address: address.into(),
            namespace: namespace.into(),
        }
    }

    fn args(&self, topic: &str) -> Vec<String> {
        vec![
            "--address".to_string(),
            self.address.clone(),
            "publish".to_string(),
            "--topic".to_string(),
            topic.to_string(),
            "--namespace".to_string(),
            self.namespace.clone(),
        ]
    }
}

#[async_trait]
impl Publisher for RemotePublisher {
    async fn publish(&self, topic: &str, event: &TaskEvent) -> ShimResult<()> {
        let payload = serde_json::to_vec(event)?;

        let mut child = Command::new(&self.binary)
            .args(self.args(topic))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ShimError::Internal(format!("failed to spawn {}: {}", self.binary.display(), e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A publisher that exits early surfaces through its exit status below.
            if let Err(e) = stdin.write_all(&payload).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ShimError::Internal(format!(
                "publish {} failed ({}): {}",
                topic,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_command_line() {
        let publisher = RemotePublisher::new(
            "/usr/bin/containerd",
            "/run/containerd/containerd.sock",
            "k8s.io",
        );
        assert_eq!(
            publisher.args("/tasks/exit"),
            vec![
                "--address",
                "/run/containerd/containerd.sock",
                "publish",
                "--topic",
                "/tasks/exit",
                "--namespace",
                "k8s.io"
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_binary_is_reported() {
        let publisher = RemotePublisher::new("/bin/false", "addr", "default");
        let err = publisher
            .publish("/tasks/oom", &TaskEvent::Unknown)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("/tasks/oom"));
    }
}

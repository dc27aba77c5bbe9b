use std::path::PathBuf;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::process::Command;

use common::{WorkloadSnapshot, WorkloadState};

use crate::recovery::WorkloadManager;

/// Workload manager backed by an external CLI:
/// `list --json`, `inspect ID --json` and `resume ID`.
#[derive(Debug, Clone)]
pub struct CommandWorkloads {
    program: PathBuf,
    host: Option<String>,
}

impl CommandWorkloads {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        CommandWorkloads {
            program: program.into(),
            host: None,
        }
    }

    /// Passes `--host ADDR` ahead of every subcommand.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    async fn run(&self, args: &[&str]) -> anyhow::Result<Vec<u8>> {
        let mut command = Command::new(&self.program);
        if let Some(host) = &self.host {
            command.arg("--host").arg(host);
        }
        let output = command
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.program.display()))?;
        if !output.status.success() {
            bail!(
                "`{} {}` failed with {}: {}",
                self.program.display(),
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl WorkloadManager for CommandWorkloads {
    async fn list_workloads(&self) -> anyhow::Result<Vec<WorkloadSnapshot>> {
        let stdout = self.run(&["list", "--json"]).await?;
        if stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&stdout).context("failed to decode workload list")
    }

    async fn resume(&self, id: &str) -> anyhow::Result<()> {
        self.run(&["resume", id]).await.map(|_| ())
    }

    async fn inspect(&self, id: &str) -> anyhow::Result<WorkloadState> {
        let stdout = self.run(&["inspect", id, "--json"]).await?;
        serde_json::from_slice(&stdout).with_context(|| format!("failed to decode state of {id}"))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use common::{DesiredState, WorkloadStatus};
    use tempfile::tempdir;

    use super::*;

    fn write_tool(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("workloads");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_command_contract() {
        let dir = tempdir().unwrap();
        let tool = write_tool(
            dir.path(),
            r#"case "$1" in
  list) echo '[{"id":"c1","desiredState":"running","restartPolicy":"always"}]' ;;
  inspect) echo '{"status":"running"}' ;;
  resume) [ "$2" = "c1" ] || exit 3 ;;
esac"#,
        );
        let manager = CommandWorkloads::new(tool);

        let workloads = manager.list_workloads().await.unwrap();
        assert_eq!(workloads.len(), 1);
        assert_eq!(workloads[0].desired, DesiredState::Running);

        manager.resume("c1").await.unwrap();
        assert!(manager.resume("c2").await.is_err());
        assert_eq!(
            manager.inspect("c1").await.unwrap().status,
            WorkloadStatus::Running
        );
    }

    #[tokio::test]
    async fn test_empty_list_and_failures() {
        let dir = tempdir().unwrap();
        let tool = write_tool(
            dir.path(),
            r#"[ "$1" = "--host" ] && shift 2
[ "$1" = "list" ] && exit 0
echo "daemon not ready" >&2; exit 1"#,
        );
        let manager = CommandWorkloads::new(tool).with_host("unix:///tmp/rkd.sock");

        assert!(manager.list_workloads().await.unwrap().is_empty());
        let err = manager.inspect("c1").await.unwrap_err();
        assert!(format!("{err:#}").contains("daemon not ready"));
    }
}

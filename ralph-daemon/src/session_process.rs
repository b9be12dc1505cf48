use async_trait::async_trait;
use ralph_core::session::{BuildResult, PlanResult, SessionExit, SessionRunner};
use tokio::process::Command;

/// Drives the configured coding-agent binary as a subprocess, one
/// invocation per lifecycle step. The agent binary is expected to
/// maintain its own session state keyed by the session id it returns
/// from `open`.
pub struct ProcessSessionRunner {
    agent_bin: String,
}

impl ProcessSessionRunner {
    pub fn new(agent_bin: impl Into<String>) -> Self {
        Self { agent_bin: agent_bin.into() }
    }

    async fn run(&self, args: &[&str], cwd: &str) -> anyhow::Result<String> {
        let output = Command::new(&self.agent_bin)
            .args(args)
            .current_dir(cwd)
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "agent exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SessionRunner for ProcessSessionRunner {
    async fn open(&self, worktree: &str, task_path: &str) -> anyhow::Result<String> {
        let stdout = self.run(&["open", task_path], worktree).await?;
        Ok(stdout.trim().to_string())
    }

    async fn resume(&self, session_id: &str, worktree: &str) -> anyhow::Result<()> {
        self.run(&["resume", session_id], worktree).await?;
        Ok(())
    }

    async fn plan(&self, session_id: &str) -> anyhow::Result<Option<PlanResult>> {
        let stdout = self.run(&["plan", session_id], ".").await?;
        Ok(ralph_core::session::parse_plan_marker(&stdout))
    }

    async fn build(&self, session_id: &str) -> anyhow::Result<BuildResult> {
        let stdout = self.run(&["build", session_id], ".").await?;
        Ok(serde_json::from_str(stdout.trim()).unwrap_or(BuildResult { pr_url: None, hard_error: None }))
    }

    async fn survey(&self, session_id: &str) -> anyhow::Result<String> {
        self.run(&["survey", session_id], ".").await
    }

    async fn close(&self, session_id: &str) -> anyhow::Result<SessionExit> {
        let stdout = self.run(&["close", session_id], ".").await?;
        Ok(serde_json::from_str(stdout.trim()).unwrap_or(SessionExit { ok: true, summary: stdout }))
    }
}

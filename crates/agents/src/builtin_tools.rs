use std::{path::PathBuf, time::Duration};

use {
    anyhow::{Result, bail},
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tokio::process::Command,
    tracing::{debug, warn},
};

use crate::tool_registry::{AgentTool, ToolContext};

// ── current_time ─────────────────────────────────────────────────────────────

pub struct CurrentTimeTool;

#[async_trait]
impl AgentTool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Returns the current date and time in UTC and as a Unix timestamp."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _params: serde_json::Value, _ctx: &ToolContext) -> Result<serde_json::Value> {
        let now = chrono::Utc::now();
        Ok(serde_json::json!({
            "iso": now.to_rfc3339(),
            "unix": now.timestamp(),
        }))
    }
}

// ── exec ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone)]
pub struct ExecOpts {
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub working_dir: Option<PathBuf>,
}

impl Default for ExecOpts {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_output_bytes: 64 * 1024,
            working_dir: None,
        }
    }
}

fn truncate_output(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n... [output truncated]");
    }
    text
}

/// Run `command` under `sh -c`. The child is killed when the timeout fires.
pub async fn exec_command(command: &str, opts: &ExecOpts) -> Result<ExecResult> {
    let timeout_ms = u64::try_from(opts.timeout.as_millis()).unwrap_or(u64::MAX);
    debug!(command, timeout_ms, "exec_command");

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    if let Some(ref dir) = opts.working_dir {
        cmd.current_dir(dir);
    }

    let child = cmd.spawn()?;
    match tokio::time::timeout(opts.timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let result = ExecResult {
                stdout: truncate_output(
                    String::from_utf8_lossy(&output.stdout).into_owned(),
                    opts.max_output_bytes,
                ),
                stderr: truncate_output(
                    String::from_utf8_lossy(&output.stderr).into_owned(),
                    opts.max_output_bytes,
                ),
                exit_code: output.status.code().unwrap_or(-1),
            };
            debug!(exit_code = result.exit_code, stdout_len = result.stdout.len(), "exec done");
            Ok(result)
        },
        Ok(Err(e)) => bail!("failed to run command: {e}"),
        Err(_) => {
            warn!(command, "exec timeout");
            bail!("command timed out after {}ms", opts.timeout.as_millis())
        },
    }
}

/// Shell access for the agent. Gated behind approval unless configured otherwise.
pub struct ExecTool {
    pub default_timeout: Duration,
    pub max_output_bytes: usize,
    pub working_dir: Option<PathBuf>,
    pub require_approval: bool,
}

impl Default for ExecTool {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_output_bytes: 64 * 1024,
            working_dir: None,
            require_approval: true,
        }
    }
}

#[async_trait]
impl AgentTool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command on the host. Returns stdout, stderr, and exit code."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (max 600)"
                }
            },
            "required": ["command"]
        })
    }

    fn requires_approval(&self) -> bool {
        self.require_approval
    }

    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<serde_json::Value> {
        let command = params
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing 'command' parameter"))?;

        let timeout = params
            .get("timeout")
            .and_then(|v| v.as_u64())
            .map(|secs| Duration::from_secs(secs.min(600)))
            .unwrap_or(self.default_timeout);

        debug!(agent_id = %ctx.agent_id, command, "exec tool invoked");
        let opts = ExecOpts {
            timeout,
            max_output_bytes: self.max_output_bytes,
            working_dir: self.working_dir.clone(),
        };
        let result = exec_command(command, &opts).await?;
        Ok(serde_json::to_value(&result)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exec_echo() {
        let result = exec_command("echo hello", &ExecOpts::default()).await.unwrap();
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_exec_exit_code() {
        let result = exec_command("exit 42", &ExecOpts::default()).await.unwrap();
        assert_eq!(result.exit_code, 42);
    }

    #[tokio::test]
    async fn test_exec_timeout() {
        let opts = ExecOpts {
            timeout: Duration::from_millis(100),
            ..Default::default()
        };
        assert!(exec_command("sleep 10", &opts).await.is_err());
    }

    #[tokio::test]
    async fn test_output_cap() {
        let opts = ExecOpts {
            max_output_bytes: 16,
            ..Default::default()
        };
        let result = exec_command("printf 'x%.0s' $(seq 1 100)", &opts).await.unwrap();
        assert!(result.stdout.starts_with("xxxxxxxxxxxxxxxx\n"));
        assert!(result.stdout.ends_with("[output truncated]"));
    }

    #[tokio::test]
    async fn exec_tool_is_gated_by_default() {
        assert!(ExecTool::default().requires_approval());
        assert!(!CurrentTimeTool.requires_approval());
    }

    #[tokio::test]
    async fn test_exec_tool_when_ungated() {
        let tool = ExecTool {
            require_approval: false,
            ..Default::default()
        };
        let result = tool
            .execute(serde_json::json!({"command": "echo hi"}), &ToolContext::default())
            .await
            .unwrap();
        assert_eq!(result["stdout"].as_str().unwrap().trim(), "hi");
    }

    #[tokio::test]
    async fn current_time_reports_unix() {
        let out = CurrentTimeTool
            .execute(serde_json::json!({}), &ToolContext::default())
            .await
            .unwrap();
        assert!(out["unix"].as_i64().unwrap() > 1_600_000_000);
    }
}

//! Command execution tool for a fixed external binary (kubectl by default).
//!
//! The argument string is split on whitespace and passed as argv, so no
//! shell is involved. Process failures never escape as errors: a non-zero
//! exit or a spawn failure comes back as an in-band `"Error: ..."` output.

use std::process::Stdio;
use std::time::Instant;

use tokio::process::Command;

use crate::error::ToolError;
use crate::tools::tool::{ToolOutput, require_str};

/// Maximum output size before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Runs `binary <args>` and captures its output.
#[derive(Debug, Clone)]
pub struct CommandTool {
    binary: String,
}

impl CommandTool {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Arguments for the binary (e.g. 'apply -f file.yaml')"
                }
            },
            "required": ["command"]
        })
    }

    /// Run the binary, returning `(stdout_or_error, exit_code)`.
    ///
    /// The child is killed if this future is dropped (timeout or cancellation).
    async fn execute(&self, argv: &[&str]) -> (String, i32) {
        let output = Command::new(&self.binary)
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => (
                truncate_output(&String::from_utf8_lossy(&out.stdout)),
                0,
            ),
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                (
                    truncate_output(&format!("Error: {}", stderr.trim_end())),
                    out.status.code().unwrap_or(-1),
                )
            }
            Err(e) => (format!("Error: failed to run {}: {e}", self.binary), -1),
        }
    }

    pub async fn run(&self, name: &str, params: &serde_json::Value) -> Result<ToolOutput, ToolError> {
        let args = require_str(name, params, "command")?;

        let mut argv: Vec<&str> = args.split_whitespace().collect();
        // Tolerate callers that repeat the binary name.
        if argv.first() == Some(&self.binary.as_str()) {
            argv.remove(0);
        }

        let start = Instant::now();
        let (output, exit_code) = self.execute(&argv).await;
        let duration = start.elapsed();

        if exit_code != 0 {
            tracing::warn!(
                tool = name,
                exit_code,
                "Command exited unsuccessfully"
            );
        }

        let result = serde_json::json!({
            "output": output,
            "exit_code": exit_code,
            "success": exit_code == 0,
        });

        Ok(if exit_code == 0 {
            ToolOutput::success(result, duration)
        } else {
            ToolOutput::failure(result, duration)
        })
    }
}

/// Truncate output to fit within limits (UTF-8 safe).
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        s.to_string()
    } else {
        let half = MAX_OUTPUT_SIZE / 2;
        let head_end = floor_char_boundary(s, half);
        let tail_start = floor_char_boundary(s, s.len() - half);
        format!(
            "{}\n\n... [truncated {} bytes] ...\n\n{}",
            &s[..head_end],
            s.len() - MAX_OUTPUT_SIZE,
            &s[tail_start..]
        )
    }
}

/// Largest byte index <= `i` that is a char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

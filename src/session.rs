//! Agent session hosting.
//!
//! Agents run inside detached tmux sessions so they survive scheduler
//! restarts and can be inspected with plain `tmux attach`. `SessionHost`
//! is the seam; `TmuxSessions` shells out to the tmux binary the same way
//! an operator would.

use async_trait::async_trait;
use std::path::Path;
use std::process::Command;

use crate::error::{Error, Result};
use crate::{hlog_debug, hlog_trace, hlog_warn};

const SESSION_PREFIX: &str = "hive_";

/// Canonical session name for a task: `hive_<slug>_<short-id>`.
pub fn session_name(task_name: &str, short_id: &str) -> String {
    format!("{SESSION_PREFIX}{}_{short_id}", sanitize_session_name(task_name))
}

/// Seam for starting, feeding, and inspecting agent sessions.
#[async_trait]
pub trait SessionHost: Send + Sync {
    /// Start a detached session running `command` in `cwd`.
    async fn start(&self, name: &str, cwd: &Path, command: &[String]) -> Result<()>;

    /// Type a line of text into the session and press enter.
    async fn send_text(&self, name: &str, text: &str) -> Result<()>;

    /// Kill the session. Killing an already-dead session is not an error.
    async fn kill(&self, name: &str) -> Result<()>;

    async fn is_running(&self, name: &str) -> bool;

    /// Last `lines` lines of session output.
    async fn capture_tail(&self, name: &str, lines: u16) -> Result<String>;

    /// Names of live sessions this host created.
    async fn list_active(&self) -> Result<Vec<String>>;

    /// Unix timestamp of the session's most recent output activity.
    async fn last_activity(&self, name: &str) -> Result<u64>;
}

/// tmux-backed session host.
#[derive(Debug, Default)]
pub struct TmuxSessions;

impl TmuxSessions {
    pub fn new() -> Self {
        Self
    }

    pub fn is_available() -> bool {
        Command::new("tmux")
            .arg("-V")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl SessionHost for TmuxSessions {
    async fn start(&self, name: &str, cwd: &Path, command: &[String]) -> Result<()> {
        if command.is_empty() {
            return Err(Error::Validation("Command cannot be empty".to_string()));
        }

        let cmd_str = command
            .iter()
            .map(|s| shell_escape(s))
            .collect::<Vec<_>>()
            .join(" ");
        hlog_debug!(
            "TmuxSessions::start name={} cwd={} cmd={}",
            name,
            cwd.display(),
            cmd_str
        );
        let output = Command::new("tmux")
            .args([
                "new-session",
                "-d",
                "-s",
                name,
                "-c",
                &cwd.display().to_string(),
                &cmd_str,
            ])
            .output()?;

        if !output.status.success() {
            let err = format!(
                "Failed to create session '{}': {}",
                name,
                String::from_utf8_lossy(&output.stderr)
            );
            hlog_warn!("tmux new-session failed: {}", err);
            return Err(Error::Tmux(err));
        }

        // Keep the pane around when the command exits so output can still
        // be captured during teardown.
        let _ = Command::new("tmux")
            .args(["set-option", "-t", name, "remain-on-exit", "on"])
            .output();

        hlog_debug!("Session created: {}", name);
        Ok(())
    }

    async fn send_text(&self, name: &str, text: &str) -> Result<()> {
        hlog_debug!("TmuxSessions::send_text name={} bytes={}", name, text.len());
        let output = Command::new("tmux")
            .args(["send-keys", "-t", name, text, "Enter"])
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            hlog_warn!("Failed to send text to '{}': {}", name, stderr);
            return Err(Error::Tmux(format!(
                "Failed to send text to '{}': {}",
                name, stderr
            )));
        }
        Ok(())
    }

    async fn kill(&self, name: &str) -> Result<()> {
        hlog_debug!("TmuxSessions::kill name={}", name);
        let output = Command::new("tmux")
            .args(["kill-session", "-t", name])
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("session not found") {
                hlog_warn!("Failed to kill session '{}': {}", name, stderr);
                return Err(Error::Tmux(format!(
                    "Failed to kill session '{}': {}",
                    name, stderr
                )));
            }
            hlog_debug!("Session '{}' not found (already dead?)", name);
        } else {
            hlog_debug!("Session killed: {}", name);
        }
        Ok(())
    }

    async fn is_running(&self, name: &str) -> bool {
        Command::new("tmux")
            .args(["has-session", "-t", name])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn capture_tail(&self, name: &str, lines: u16) -> Result<String> {
        // -S with a negative value starts the capture that many lines from
        // the end of the scrollback.
        let start = format!("-{}", lines);
        let output = Command::new("tmux")
            .args(["capture-pane", "-t", name, "-p", "-S", &start])
            .output()?;
        if !output.status.success() {
            return Err(Error::Tmux(format!(
                "Failed to capture pane '{}': {}",
                name,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let content = String::from_utf8_lossy(&output.stdout).to_string();
        hlog_trace!("capture_tail({}): {} bytes", name, content.len());
        Ok(content)
    }

    async fn list_active(&self) -> Result<Vec<String>> {
        let output = Command::new("tmux")
            .args(["list-sessions", "-F", "#{session_name}"])
            .output()?;
        if !output.status.success() {
            // tmux exits nonzero when no server is running at all.
            return Ok(Vec::new());
        }
        let sessions: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|s| s.starts_with(SESSION_PREFIX))
            .map(String::from)
            .collect();
        hlog_trace!("list_active: {} sessions", sessions.len());
        Ok(sessions)
    }

    async fn last_activity(&self, name: &str) -> Result<u64> {
        let output = Command::new("tmux")
            .args(["display-message", "-t", name, "-p", "#{window_activity}"])
            .output()?;
        if !output.status.success() {
            return Err(Error::Tmux(format!(
                "Failed to get window activity for '{}': {}",
                name,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let timestamp_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
        timestamp_str.parse::<u64>().map_err(|_| {
            Error::Tmux(format!(
                "Invalid window activity timestamp: {}",
                timestamp_str
            ))
        })
    }
}

fn shell_escape(s: &str) -> String {
    if s.chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

fn sanitize_session_name(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

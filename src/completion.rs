//! Completion service client.
//!
//! The `CompletionClient` trait is the seam the orchestrator uses for every
//! natural-language request (critique verdicts, failure diagnosis, helper
//! payloads). `HeadlessCompletion` drives a CLI binary in non-interactive
//! mode (`-p` flag) with JSON output parsing and keeps a cumulative token
//! count that the budget gate reads.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::{hlog_debug, hlog_warn};

/// Default timeout for a completion execution (10 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Cumulative or per-call token counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// One request to the completion service.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Working directory for the execution, when it matters.
    pub working_dir: Option<PathBuf>,
}

impl CompletionRequest {
    pub fn new(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            working_dir: None,
        }
    }

    pub fn in_dir(prompt: &str, dir: &Path) -> Self {
        Self {
            prompt: prompt.to_string(),
            working_dir: Some(dir.to_path_buf()),
        }
    }
}

/// A successful completion.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub duration_ms: Option<u64>,
}

/// Static configuration reported by the service.
#[derive(Debug, Clone, Default)]
pub struct CompletionConfig {
    /// Token budget for a run; `None` means unlimited.
    pub budget_limit: Option<u64>,
    pub model: Option<String>,
}

/// The completion-service seam.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Send one prompt and wait for the structured response.
    async fn send(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Cumulative usage across every call so far.
    fn token_usage(&self) -> TokenUsage;

    /// Service configuration, including the budget limit if it has one.
    fn configuration(&self) -> CompletionConfig;
}

/// Internal struct for deserializing the CLI JSON response.
#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    response_type: Option<String>,
    subtype: Option<String>,
    result: Option<String>,
    duration_ms: Option<u64>,
    #[serde(default)]
    usage: Option<RawUsage>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Headless CLI-backed completion client.
///
/// Executes the configured binary in non-interactive mode using the `-p`
/// flag with JSON output format, parses the response, and accumulates token
/// usage for budget accounting.
#[derive(Debug)]
pub struct HeadlessCompletion {
    binary: PathBuf,
    output_format: String,
    timeout: Duration,
    budget_limit: Option<u64>,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl HeadlessCompletion {
    /// Create a new executor, locating the binary with `which`.
    ///
    /// # Errors
    /// Returns an error if the binary cannot be found.
    pub fn new(command: &str) -> Result<Self> {
        let binary = which::which(command).map_err(|_| Error::CompletionBinaryNotFound)?;
        Ok(Self::with_binary(binary))
    }

    /// Create an executor with an explicit binary path.
    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            output_format: "json".to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            budget_limit: None,
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_budget_limit(mut self, limit: Option<u64>) -> Self {
        self.budget_limit = limit;
        self
    }

    fn record_usage(&self, usage: TokenUsage) {
        self.input_tokens
            .fetch_add(usage.input_tokens, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(usage.output_tokens, Ordering::Relaxed);
    }

    /// Parse the CLI's JSON output into a response.
    fn parse_response(raw: &str) -> Result<CompletionResponse> {
        let parsed: RawResponse = serde_json::from_str(raw)?;

        if let Some(error) = parsed.error {
            return Err(Error::Completion(error));
        }
        if parsed.subtype.as_deref() == Some("error") {
            return Err(Error::Completion(
                parsed.result.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        let usage = parsed.usage.unwrap_or_default();
        Ok(CompletionResponse {
            content: parsed.result.unwrap_or_default(),
            usage: TokenUsage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            },
            duration_ms: parsed.duration_ms,
        })
    }
}

#[async_trait]
impl CompletionClient for HeadlessCompletion {
    async fn send(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        hlog_debug!(
            "HeadlessCompletion::send prompt_len={} dir={:?}",
            request.prompt.len(),
            request.working_dir
        );

        let mut command = Command::new(&self.binary);
        command
            .arg("-p")
            .arg(&request.prompt)
            .arg("--output-format")
            .arg(&self.output_format);
        if let Some(dir) = &request.working_dir {
            command.current_dir(dir);
        }

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            hlog_warn!("Completion process failed: {}", stderr);
            return Err(Error::Completion(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let response = Self::parse_response(&stdout)?;
        self.record_usage(response.usage);
        hlog_debug!(
            "Completion ok: {} content bytes, {} tokens",
            response.content.len(),
            response.usage.total()
        );
        Ok(response)
    }

    fn token_usage(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
        }
    }

    fn configuration(&self) -> CompletionConfig {
        CompletionConfig {
            budget_limit: self.budget_limit,
            model: None,
        }
    }
}

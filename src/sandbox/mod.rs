//! Snippet executor.
//!
//! A call goes through four gates before anything touches the disk:
//!
//! 1. per-requester rate limit
//! 2. length ceiling
//! 3. denylist scan (textual, see [`crate::security::denylist`])
//! 4. the wrapped script is written to a temp file and run as a child
//!    process under a wall-clock timeout
//!
//! The child is an ordinary interpreter process with the caller's
//! privileges. Nothing here confines filesystem, network or memory access;
//! the timeout is the only hard limit.
//!
//! [`Executor::execute`] never fails: every outcome, including rejections and
//! crashes, comes back as display text. [`Executor::try_execute`] exposes the
//! same pipeline with a typed error for callers that want to branch on it.

pub mod harness;

use std::fmt;
use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::SandboxConfig;
use crate::security::rate_limit::RateLimit;
use crate::security::{Denylist, RateLimiter};

/// Rate-limiter action name for snippet runs.
pub const EXECUTION_ACTION: &str = "code_execution";

/// Bytes kept per character of output budget. Covers 4-byte UTF-8 plus
/// leading whitespace that trimming removes.
const CAPTURE_BYTES_PER_CHAR: u64 = 8;

/// Ways a run can end without a normal result.
#[derive(Debug, Error, PartialEq)]
pub enum ExecError {
    #[error("🔒 Rate limit exceeded")]
    RateLimited,
    #[error("🔒 Code too long")]
    TooLong { len: usize, max: usize },
    #[error("🔒 Security: Restricted operation detected")]
    Blocked { pattern: String },
    #[error("⏱️ Execution timed out")]
    TimedOut(Duration),
    #[error("⚠️ Error: {0}")]
    Crashed(String),
}

/// One snippet submitted by one requester.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,
    pub requester: String,
}

impl ExecutionRequest {
    pub fn new(code: &str, requester: &str) -> Self {
        Self {
            code: code.to_string(),
            requester: requester.to_string(),
        }
    }
}

/// Captured output of a completed run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Merged stdout/stderr, already cut to the output budget.
    pub output: String,
    pub elapsed: Duration,
    /// Interpreter exit code; `None` if it was killed by a signal.
    pub exit_code: Option<i32>,
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n⏱️ Time: {:.2}s", self.output, self.elapsed.as_secs_f64())
    }
}

/// Cuts `text` to at most `max` characters (not bytes).
fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Reads at most `cap` bytes from `pipe`, then discards the rest so the child
/// never blocks on a full pipe.
async fn read_bounded<R: AsyncRead + Unpin>(pipe: Option<R>, cap: u64) -> std::io::Result<Vec<u8>> {
    let mut kept = Vec::new();
    if let Some(mut pipe) = pipe {
        (&mut pipe).take(cap).read_to_end(&mut kept).await?;
        tokio::io::copy(&mut pipe, &mut tokio::io::sink()).await?;
    }
    Ok(kept)
}

/// Builds the caller-facing text from the child's raw streams.
fn assemble_output(stdout: &[u8], stderr: &[u8], max_chars: usize) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);

    let mut text = match stdout.trim() {
        "" => "Execution completed".to_string(),
        out => out.to_string(),
    };
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        text.push_str("\nWarnings: ");
        text.push_str(stderr);
    }

    truncate_chars(&text, max_chars)
}

pub struct Executor {
    config: SandboxConfig,
    denylist: Denylist,
    limiter: Arc<RateLimiter>,
}

impl Executor {
    /// Fails only if a configured denylist pattern does not compile.
    pub fn new(config: SandboxConfig, limiter: Arc<RateLimiter>) -> anyhow::Result<Self> {
        let denylist = Denylist::new(&config.denylist)?;
        Ok(Self {
            config,
            denylist,
            limiter,
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn denylist(&self) -> &Denylist {
        &self.denylist
    }

    /// Runs `code` for `requester` and returns display text for every outcome.
    pub async fn execute(&self, code: &str, requester: &str) -> String {
        match self.try_execute(&ExecutionRequest::new(code, requester)).await {
            Ok(result) => result.to_string(),
            Err(e) => e.to_string(),
        }
    }

    pub async fn try_execute(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ExecError> {
        let budget = RateLimit::from(self.config.rate_limit);
        if !self
            .limiter
            .check(&request.requester, EXECUTION_ACTION, budget)
        {
            warn!(requester = %request.requester, "Execution rate limited");
            return Err(ExecError::RateLimited);
        }

        let len = request.code.chars().count();
        if len > self.config.max_code_length {
            warn!(requester = %request.requester, len, "Snippet too long");
            return Err(ExecError::TooLong {
                len,
                max: self.config.max_code_length,
            });
        }

        if let Err(pattern) = self.denylist.scan(&request.code) {
            warn!(requester = %request.requester, pattern, "Snippet blocked by denylist");
            return Err(ExecError::Blocked {
                pattern: pattern.to_string(),
            });
        }

        let result = self.run(&request.code).await;
        match &result {
            Ok(done) => info!(
                requester = %request.requester,
                elapsed_ms = done.elapsed.as_millis() as u64,
                exit_code = ?done.exit_code,
                "Snippet executed"
            ),
            Err(e) => warn!(requester = %request.requester, "Snippet failed: {e}"),
        }
        result
    }

    /// Writes the wrapped script and runs it. The temp file is removed when
    /// `script` drops, on every return path.
    async fn run(&self, code: &str) -> Result<ExecutionResult, ExecError> {
        let crashed = |e: std::io::Error| ExecError::Crashed(e.to_string());

        let mut builder = tempfile::Builder::new();
        builder.prefix("runbox-").suffix(".py");
        let mut script = match &self.config.scratch_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(crashed)?;

        script
            .write_all(harness::wrap(code).as_bytes())
            .and_then(|_| script.flush())
            .map_err(crashed)?;

        let started = Instant::now();
        let mut child = Command::new(&self.config.interpreter)
            .arg(script.path())
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecError::Crashed(format!("failed to start {}: {e}", self.config.interpreter))
            })?;

        let cap = (self.config.max_output_chars as u64).saturating_mul(CAPTURE_BYTES_PER_CHAR);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let collect = async {
            let (status, stdout, stderr) = tokio::join!(
                child.wait(),
                read_bounded(stdout, cap),
                read_bounded(stderr, cap),
            );
            Ok::<_, std::io::Error>((status?, stdout?, stderr?))
        };

        let limit = self.config.timeout();
        let outcome = tokio::time::timeout(limit, collect).await;
        let (status, stdout, stderr) = match outcome {
            Ok(done) => done.map_err(crashed)?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed-out snippet: {e}");
                }
                return Err(ExecError::TimedOut(limit));
            }
        };
        let elapsed = started.elapsed();

        Ok(ExecutionResult {
            output: assemble_output(&stdout, &stderr, self.config.max_output_chars),
            elapsed,
            exit_code: status.code(),
        })
    }
}

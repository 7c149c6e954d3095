use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::info;

use crate::config::Config;
use crate::sandbox::{Executor, EXECUTION_ACTION};
use crate::security::sanitize_input;
use crate::store::Store;

/// Characters of a snippet kept in the analytics row.
const ANALYTICS_DETAIL_CHARS: usize = 100;

/// A line holding only this separates snippets in [`Runtime::serve`] input
/// and results in its output.
pub const SNIPPET_DELIMITER: &str = "---";

/// Snapshot of the session and the limits in force.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub session_id: String,
    pub user_id: String,
    pub storage: String,
    pub interpreter: String,
    pub timeout_secs: u64,
    pub max_code_length: usize,
    pub max_output_chars: usize,
    pub rate_limit: usize,
    pub rate_window_secs: u64,
    pub denylist_patterns: usize,
    pub uptime_secs: u64,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "runbox v{}", self.version)?;
        writeln!(f, "Session: {}", self.session_id)?;
        writeln!(f, "User: {}", self.user_id)?;
        writeln!(f, "Storage: {}", self.storage)?;
        writeln!(f, "Interpreter: {} (timeout {}s)", self.interpreter, self.timeout_secs)?;
        writeln!(
            f,
            "Limits: {} chars in, {} chars out, {} runs per {}s",
            self.max_code_length, self.max_output_chars, self.rate_limit, self.rate_window_secs
        )?;
        writeln!(f, "Denylist: {} patterns", self.denylist_patterns)?;
        write!(f, "Uptime: {}s", self.uptime_secs)
    }
}

/// Sequences calls into the store and the executor for one user session.
///
/// Every operation here inherits the "never fails" contract of the two
/// components: results are plain strings or options.
pub struct Runtime {
    config: Config,
    store: Arc<Store>,
    executor: Executor,
    user_id: String,
    session_id: String,
    start_time: Instant,
}

impl Runtime {
    /// Opens a session for `user_id` and records it in the analytics log.
    pub async fn start(config: Config, store: Arc<Store>, executor: Executor, user_id: &str) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        store.log(user_id, "session_start", &session_id).await;
        info!("Session {session_id} started for {user_id} (storage: {})", store.backend_name());

        Self {
            config,
            store,
            executor,
            user_id: user_id.to_string(),
            session_id,
            start_time: Instant::now(),
        }
    }

    /// Runs a snippet through the sandbox and logs the attempt.
    pub async fn run_code(&self, code: &str) -> String {
        let details: String = code.chars().take(ANALYTICS_DETAIL_CHARS).collect();
        self.store.log(&self.user_id, EXECUTION_ACTION, &details).await;
        self.executor.execute(code, &self.user_id).await
    }

    pub async fn cache_get(&self, key: &str) -> Option<String> {
        self.store.get(key).await
    }

    /// Stores `value`; `ttl_minutes` defaults to the configured TTL.
    pub async fn cache_set(&self, key: &str, value: &str, ttl_minutes: Option<i64>) {
        let ttl = ttl_minutes.unwrap_or(self.config.storage.default_ttl_minutes);
        self.store.set(key, value, ttl).await
    }

    pub async fn cache_purge(&self) -> u64 {
        self.store.purge_expired().await
    }

    /// Cleans free text with the executor's denylist.
    pub fn sanitize(&self, text: &str, max_len: usize) -> String {
        sanitize_input(self.executor.denylist(), text, max_len)
    }

    pub fn status(&self) -> StatusReport {
        let sandbox = self.executor.config();
        StatusReport {
            version: env!("CARGO_PKG_VERSION"),
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            storage: self.store.backend_name().to_string(),
            interpreter: sandbox.interpreter.clone(),
            timeout_secs: sandbox.timeout_secs,
            max_code_length: sandbox.max_code_length,
            max_output_chars: sandbox.max_output_chars,
            rate_limit: sandbox.rate_limit.limit,
            rate_window_secs: sandbox.rate_limit.window_secs,
            denylist_patterns: self.executor.denylist().pattern_count(),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    /// Runs snippets from `input` one after another in this session, so they
    /// share one rate-limit window. Snippets are separated by
    /// [`SNIPPET_DELIMITER`] lines; each result is written to `output`
    /// followed by the same delimiter. Blank snippets are skipped.
    ///
    /// Returns the number of snippets run.
    pub async fn serve<R, W>(&self, input: R, mut output: W) -> std::io::Result<usize>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        let mut snippet = String::new();
        let mut served = 0;

        loop {
            let line = lines.next_line().await?;
            if let Some(text) = &line {
                if text.trim_end() != SNIPPET_DELIMITER {
                    snippet.push_str(text);
                    snippet.push('\n');
                    continue;
                }
            }

            if !snippet.trim().is_empty() {
                let result = self.run_code(&snippet).await;
                output
                    .write_all(format!("{result}\n{SNIPPET_DELIMITER}\n").as_bytes())
                    .await?;
                output.flush().await?;
                served += 1;
            }
            snippet.clear();

            if line.is_none() {
                break;
            }
        }

        info!("Served {served} snippets for {}", self.user_id);
        Ok(served)
    }
}

//! Claude CLI provider adapter.
//!
//! Spawns `claude -p --output-format stream-json` with the prompt piped
//! on stdin, a per-invocation isolated home, and a sanitized environment.
//! Output is captured with a hard cap per stream; a single resettable
//! timer kills the child when no output byte arrives within the timeout.

use std::io::Write;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Instant;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::home::IsolatedHome;
use super::template::{TemplateVars, build_argv};
use super::types::{ActivityEvent, FailureClass, InvocationResult, InvokeOptions, TokenUsage};
use super::{Provider, sanitized_env};

/// Hard cap on captured bytes per stream. Further output is dropped from
/// the buffers but still streamed to the activity channel.
const OUTPUT_CAP: usize = 2 * 1024 * 1024;

/// Grace between SIGTERM and SIGKILL, and between SIGKILL and giving up
/// on `wait()`.
const KILL_GRACE_SECS: u64 = 5;

/// Claude CLI adapter.
#[derive(Debug, Clone)]
pub struct ClaudeProvider {
    /// Path to the `claude` binary. Defaults to `"claude"` on `$PATH`.
    binary: String,
    /// Prepare an isolated home per invocation. Disabled only in tests.
    isolate_home: bool,
}

impl ClaudeProvider {
    pub fn new() -> Self {
        Self {
            binary: "claude".to_string(),
            isolate_home: true,
        }
    }

    /// Use a custom binary path (tests point this at fake CLIs).
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary: path.into(),
            isolate_home: true,
        }
    }

    /// Skip isolated-home preparation (tests on hosts without a home).
    pub fn without_home_isolation(mut self) -> Self {
        self.isolate_home = false;
        self
    }

    fn default_argv(&self, prompt_file: &str, opts: &InvokeOptions<'_>) -> Vec<String> {
        let _ = prompt_file; // default path feeds the prompt via stdin
        let mut argv = vec![
            self.binary.clone(),
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--model".to_string(),
            opts.model.to_string(),
        ];
        if let Some(session_id) = opts.resume_session_id {
            argv.push("--resume".to_string());
            argv.push(session_id.to_string());
        }
        argv
    }
}

impl Default for ClaudeProvider {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Stream-json parsing
// ---------------------------------------------------------------------------

/// Metadata extracted from the streaming protocol.
#[derive(Debug, Default)]
struct StreamMeta {
    session_id: Option<String>,
    token_usage: Option<TokenUsage>,
}

/// Parse one JSONL line, updating `meta` and emitting activity events.
/// Malformed lines are ignored.
fn parse_stream_line(
    line: &str,
    meta: &mut StreamMeta,
    activity: Option<&UnboundedSender<ActivityEvent>>,
) {
    let Ok(v) = serde_json::from_str::<serde_json::Value>(line) else {
        debug!(line, "ignoring malformed stream-json line");
        return;
    };

    // Any event may carry the session id.
    if let Some(session_id) = v.get("session_id").and_then(|s| s.as_str()) {
        meta.session_id = Some(session_id.to_string());
    }

    let read_usage = |usage: &serde_json::Value| -> Option<TokenUsage> {
        let input_tokens = usage.get("input_tokens").and_then(|t| t.as_u64())?;
        let output_tokens = usage.get("output_tokens").and_then(|t| t.as_u64()).unwrap_or(0);
        Some(TokenUsage {
            input_tokens,
            output_tokens,
        })
    };

    match v.get("type").and_then(|t| t.as_str()).unwrap_or("") {
        "assistant" => {
            let blocks = v
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array());
            if let (Some(blocks), Some(tx)) = (blocks, activity) {
                for block in blocks {
                    match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                        "text" => {
                            if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                                let _ = tx.send(ActivityEvent::AssistantText(text.to_string()));
                            }
                        }
                        "tool_use" => {
                            let name = block
                                .get("name")
                                .and_then(|n| n.as_str())
                                .unwrap_or("unknown")
                                .to_string();
                            let _ = tx.send(ActivityEvent::ToolUse { name });
                        }
                        _ => {}
                    }
                }
            }
            if let Some(usage) = v.get("message").and_then(|m| m.get("usage")) {
                if let Some(parsed) = read_usage(usage) {
                    meta.token_usage = Some(parsed);
                }
            }
        }
        "result" => {
            if let Some(usage) = v.get("usage") {
                if let Some(parsed) = read_usage(usage) {
                    meta.token_usage = Some(parsed);
                }
            }
            if let Some(tx) = activity {
                let _ = tx.send(ActivityEvent::Result {
                    session_id: meta.session_id.clone(),
                    usage: meta.token_usage,
                });
            }
        }
        _ => {}
    }
}

/// Append a chunk to a capped buffer; bytes past the cap are dropped.
fn append_capped(buf: &mut Vec<u8>, chunk: &[u8], cap: usize) {
    if buf.len() >= cap {
        return;
    }
    let remaining = cap - buf.len();
    buf.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
}

// ---------------------------------------------------------------------------
// Kill path
// ---------------------------------------------------------------------------

/// SIGTERM, wait up to the grace period, SIGKILL, wait again. Returns the
/// exit code if the child ever reported one.
async fn kill_child(child: &mut Child) -> Option<i64> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we spawned.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }

    let grace = std::time::Duration::from_secs(KILL_GRACE_SECS);
    if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
        return status.code().map(i64::from);
    }

    let _ = child.kill().await;
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => status.code().map(i64::from),
        // Hard-resolve: the child refused to die; report no exit code.
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Provider impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Provider for ClaudeProvider {
    fn name(&self) -> &str {
        "claude"
    }

    async fn invoke(&self, prompt: &str, opts: InvokeOptions<'_>) -> InvocationResult {
        let started = Instant::now();

        // Materialize the prompt into a 0600 temp file unless the caller
        // supplied one. The guard removes it on every exit path.
        let mut prompt_guard = None;
        let prompt_path = match opts.prompt_file {
            Some(path) => path.to_path_buf(),
            None => {
                let file = match tempfile::Builder::new()
                    .prefix("steroids-prompt-")
                    .suffix(".md")
                    .tempfile()
                {
                    Ok(file) => file,
                    Err(e) => {
                        return InvocationResult::spawn_failure(format!(
                            "failed to create prompt file: {e}"
                        ));
                    }
                };
                if let Err(e) = file.as_file().write_all(prompt.as_bytes()) {
                    return InvocationResult::spawn_failure(format!(
                        "failed to write prompt file: {e}"
                    ));
                }
                let path = file.path().to_path_buf();
                prompt_guard = Some(file);
                path
            }
        };

        // Isolated home, removed on drop.
        let home = if self.isolate_home {
            match IsolatedHome::prepare_default() {
                Ok(home) => Some(home),
                Err(e) => {
                    return InvocationResult::spawn_failure(format!(
                        "failed to prepare isolated home: {e}"
                    ));
                }
            }
        } else {
            None
        };

        let prompt_path_str = prompt_path.to_string_lossy().into_owned();
        let argv = match opts.invocation_template {
            Some(template) => {
                let vars = TemplateVars {
                    cli: &self.binary,
                    prompt_file: &prompt_path_str,
                    model: opts.model,
                    session_id: opts.resume_session_id,
                };
                match build_argv(template, &vars) {
                    Ok(argv) => argv,
                    Err(e) => {
                        return InvocationResult::spawn_failure(format!(
                            "invalid invocation template: {e}"
                        ));
                    }
                }
            }
            None => self.default_argv(&prompt_path_str, &opts),
        };

        let mut overrides = vec![
            ("STEROIDS_ACTIVE_MODEL".to_string(), opts.model.to_string()),
            (
                "STEROIDS_MODEL_LIST".to_string(),
                self.list_models().join(","),
            ),
        ];
        if let Some(home) = &home {
            overrides.push(("HOME".to_string(), home.path().display().to_string()));
        }

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(opts.cwd)
            .env_clear()
            .envs(sanitized_env(&overrides))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return InvocationResult::spawn_failure(format!(
                    "failed to spawn {} -- is it installed and on PATH? ({e})",
                    argv[0]
                ));
            }
        };

        // Feed the prompt and close stdin so the actor starts.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                warn!(error = %e, "failed to write prompt to actor stdin");
            }
        }

        let mut stdout = child.stdout.take().expect("stdout was piped");
        let mut stderr = child.stderr.take().expect("stderr was piped");

        let mut out_buf: Vec<u8> = Vec::new();
        let mut err_buf: Vec<u8> = Vec::new();
        let mut out_done = false;
        let mut err_done = false;
        let mut line_buf = String::new();
        let mut meta = StreamMeta::default();
        let mut timed_out = false;

        let activity = opts.activity.as_ref();

        // Activity-reset timer: every output byte pushes the deadline out.
        let sleep = tokio::time::sleep(opts.timeout);
        tokio::pin!(sleep);

        let mut out_chunk = [0u8; 8192];
        let mut err_chunk = [0u8; 8192];

        while !(out_done && err_done) {
            tokio::select! {
                read = stdout.read(&mut out_chunk), if !out_done => {
                    match read {
                        Ok(0) | Err(_) => out_done = true,
                        Ok(n) => {
                            sleep.as_mut().reset(tokio::time::Instant::now() + opts.timeout);
                            let chunk = &out_chunk[..n];
                            append_capped(&mut out_buf, chunk, OUTPUT_CAP);
                            let text = String::from_utf8_lossy(chunk).into_owned();
                            if let Some(tx) = activity {
                                let _ = tx.send(ActivityEvent::Stdout(text.clone()));
                            }
                            line_buf.push_str(&text);
                            while let Some(pos) = line_buf.find('\n') {
                                let line: String = line_buf.drain(..=pos).collect();
                                let line = line.trim();
                                if !line.is_empty() {
                                    parse_stream_line(line, &mut meta, activity);
                                }
                            }
                        }
                    }
                }
                read = stderr.read(&mut err_chunk), if !err_done => {
                    match read {
                        Ok(0) | Err(_) => err_done = true,
                        Ok(n) => {
                            sleep.as_mut().reset(tokio::time::Instant::now() + opts.timeout);
                            let chunk = &err_chunk[..n];
                            append_capped(&mut err_buf, chunk, OUTPUT_CAP);
                            if let Some(tx) = activity {
                                let _ = tx.send(ActivityEvent::Stderr(
                                    String::from_utf8_lossy(chunk).into_owned(),
                                ));
                            }
                        }
                    }
                }
                _ = &mut sleep => {
                    timed_out = true;
                    break;
                }
            }
        }

        // A final line without a trailing newline still counts.
        let tail = line_buf.trim();
        if !tail.is_empty() {
            parse_stream_line(tail, &mut meta, activity);
        }

        let exit_code = if timed_out {
            warn!(timeout_ms = opts.timeout.as_millis() as u64, "actor went silent, killing");
            kill_child(&mut child).await
        } else {
            // Streams closed; the child should exit promptly.
            match tokio::time::timeout(opts.timeout, child.wait()).await {
                Ok(Ok(status)) => status.code().map(i64::from),
                Ok(Err(e)) => {
                    warn!(error = %e, "failed to reap actor process");
                    None
                }
                Err(_) => {
                    timed_out = true;
                    kill_child(&mut child).await
                }
            }
        };

        drop(prompt_guard);
        drop(home);

        let success = !timed_out && exit_code == Some(0);
        InvocationResult {
            success,
            exit_code,
            stdout: String::from_utf8_lossy(&out_buf).into_owned(),
            stderr: String::from_utf8_lossy(&err_buf).into_owned(),
            duration_ms: started.elapsed().as_millis() as i64,
            timed_out,
            session_id: meta.session_id,
            token_usage: meta.token_usage,
        }
    }

    async fn is_available(&self) -> bool {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        matches!(
            tokio::time::timeout(std::time::Duration::from_secs(10), cmd.status()).await,
            Ok(Ok(status)) if status.success()
        )
    }

    fn classify_result(&self, result: &InvocationResult) -> Option<FailureClass> {
        if result.success {
            return None;
        }

        static CREDIT: OnceLock<Regex> = OnceLock::new();
        static RATE: OnceLock<Regex> = OnceLock::new();
        static RETRY_AFTER: OnceLock<Regex> = OnceLock::new();
        static AUTH: OnceLock<Regex> = OnceLock::new();
        static MODEL: OnceLock<Regex> = OnceLock::new();

        let credit = CREDIT.get_or_init(|| {
            Regex::new(r"(?i)credit balance is too low|insufficient credits|out of credits|usage limit reached").unwrap()
        });
        let rate = RATE.get_or_init(|| {
            Regex::new(r"(?i)rate limit|too many requests|overloaded|\b429\b").unwrap()
        });
        let retry_after = RETRY_AFTER
            .get_or_init(|| Regex::new(r"(?i)retry[\s-]*after\D{0,5}(\d+)").unwrap());
        let auth = AUTH.get_or_init(|| {
            Regex::new(r"(?i)invalid api key|authentication|unauthorized|not logged in|\b401\b")
                .unwrap()
        });
        let model = MODEL
            .get_or_init(|| Regex::new(r"(?i)model not found|unknown model|no such model").unwrap());

        let haystack = format!("{}\n{}", result.stderr, result.stdout);
        let first_matching_line = |re: &Regex| -> String {
            haystack
                .lines()
                .find(|line| re.is_match(line))
                .unwrap_or("")
                .trim()
                .to_string()
        };

        if credit.is_match(&haystack) {
            return Some(FailureClass::CreditExhaustion {
                message: first_matching_line(credit),
            });
        }
        if rate.is_match(&haystack) {
            let retry_after_ms = retry_after
                .captures(&haystack)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<u64>().ok())
                .map(|secs| secs * 1000);
            return Some(FailureClass::RateLimit {
                message: first_matching_line(rate),
                retry_after_ms,
            });
        }
        if auth.is_match(&haystack) {
            return Some(FailureClass::AuthError {
                message: first_matching_line(auth),
            });
        }
        if model.is_match(&haystack) {
            return Some(FailureClass::ModelNotFound {
                message: first_matching_line(model),
            });
        }

        None
    }

    fn list_models(&self) -> Vec<String> {
        vec![
            "claude-opus-4-1".to_string(),
            "claude-sonnet-4-5".to_string(),
            "claude-haiku-4-5".to_string(),
        ]
    }

    fn default_invocation_template(&self) -> String {
        "{cli} -p --output-format stream-json --verbose --model {model} {prompt_file}".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

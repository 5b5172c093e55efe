//! Execution of one external command under sandbox supervision.
//!
//! The runner is the only place a pipeline step touches a real process: spawn
//! in a fresh process group with piped output, apply the spec's isolation,
//! wait under timeout/cancellation, and hand back a structured result. The
//! child sees nothing of the orchestrator beyond its working directory and the
//! environment the step explicitly passes.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use conveyor_core::{Error, Result, OUTPUT_TAIL_BYTES};

use crate::guard::{CancelFlag, ProcessGuard, WaitOutcome};
use crate::isolation;
use crate::spec::SandboxSpec;

/// Structured result of one sandboxed command execution.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    /// None when the child was killed by a signal (timeout, cancellation)
    pub exit_code: Option<i32>,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub duration: Duration,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl ProcessResult {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }
}

/// Runs external commands inside the sandbox boundary.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Execute one command to completion under the given spec.
    ///
    /// Fails with a sandbox error before spawning if the spec requests
    /// isolation this host cannot provide.
    pub async fn run(
        &self,
        program: &str,
        args: &[String],
        env: &HashMap<String, String>,
        spec: &SandboxSpec,
        cancel: CancelFlag,
    ) -> Result<ProcessResult> {
        isolation::probe(spec)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&spec.working_dir)
            .env_clear()
            .envs(env)
            .env("PATH", std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Fresh process group so timeout/cancel can reap all descendants
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        isolation::apply(&mut cmd, spec)?;

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            Error::command_execution(
                program,
                args.to_vec(),
                format!("failed to spawn: {e}"),
                None,
            )
        })?;

        let stdout_buf = Arc::new(Mutex::new(TailBuffer::new(OUTPUT_TAIL_BYTES)));
        let stderr_buf = Arc::new(Mutex::new(TailBuffer::new(OUTPUT_TAIL_BYTES)));
        let stdout_handle = child.stdout.take().map(|s| capture_stream(s, Arc::clone(&stdout_buf)));
        let stderr_handle = child.stderr.take().map(|s| capture_stream(s, Arc::clone(&stderr_buf)));

        let mut guard = ProcessGuard::new(child, spec.timeout);
        let outcome = guard.wait(cancel).await?;

        if let Some(handle) = stdout_handle {
            let _ = handle.join();
        }
        if let Some(handle) = stderr_handle {
            let _ = handle.join();
        }

        let duration = started.elapsed();
        let stdout_tail = stdout_buf.lock().map(|b| b.contents()).unwrap_or_default();
        let stderr_tail = stderr_buf.lock().map(|b| b.contents()).unwrap_or_default();

        let result = match outcome {
            WaitOutcome::Exited(status) => ProcessResult {
                exit_code: status.code(),
                stdout_tail,
                stderr_tail,
                duration,
                timed_out: false,
                cancelled: false,
            },
            WaitOutcome::TimedOut => ProcessResult {
                exit_code: None,
                stdout_tail,
                stderr_tail,
                duration,
                timed_out: true,
                cancelled: false,
            },
            WaitOutcome::Cancelled => ProcessResult {
                exit_code: None,
                stdout_tail,
                stderr_tail,
                duration,
                timed_out: false,
                cancelled: true,
            },
        };

        tracing::debug!(
            program,
            exit_code = ?result.exit_code,
            timed_out = result.timed_out,
            cancelled = result.cancelled,
            duration_ms = duration.as_millis() as u64,
            "command finished"
        );
        Ok(result)
    }
}

/// Keeps the last `limit` bytes of a stream. Bounded no matter what the
/// child writes; a single unterminated line cannot grow it.
struct TailBuffer {
    data: VecDeque<u8>,
    limit: usize,
}

impl TailBuffer {
    fn new(limit: usize) -> Self {
        Self {
            data: VecDeque::new(),
            limit,
        }
    }

    fn push_chunk(&mut self, chunk: &[u8]) {
        self.data.extend(chunk);
        if self.data.len() > self.limit {
            let excess = self.data.len() - self.limit;
            self.data.drain(..excess);
        }
    }

    fn contents(&self) -> String {
        let bytes: Vec<u8> = self.data.iter().copied().collect();
        String::from_utf8_lossy(&bytes)
            .trim_end_matches('\n')
            .to_string()
    }
}

fn capture_stream<R: Read + Send + 'static>(
    mut stream: R,
    buffer: Arc<Mutex<TailBuffer>>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut buf) = buffer.lock() {
                        buf.push_chunk(&chunk[..n]);
                    }
                }
            }
        }
    })
}

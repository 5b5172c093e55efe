//! RAII supervision of one spawned child process group.
//!
//! The guard owns the child, polls it off the async runtime, and guarantees
//! the whole process group is reaped on timeout, cancellation or drop. The
//! kill path escalates: SIGTERM to the group, a short grace period, SIGKILL.

use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use conveyor_core::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const TERM_GRACE: Duration = Duration::from_millis(200);

/// Shared cancellation flag observed between steps and inside a running step.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a supervised wait ended.
#[derive(Debug)]
pub enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// RAII guard for one child process group.
pub struct ProcessGuard {
    child: Option<Child>,
    pgid: i32,
    timeout: Duration,
    started_at: Instant,
}

impl ProcessGuard {
    /// Take ownership of a child that was spawned into its own process group.
    #[must_use]
    pub fn new(child: Child, timeout: Duration) -> Self {
        let pgid = child.id() as i32;
        Self {
            child: Some(child),
            pgid,
            timeout,
            started_at: Instant::now(),
        }
    }

    /// Wait for the child with timeout and cancellation, without blocking the
    /// async runtime. Exactly one of the three outcomes is returned; in the
    /// timeout and cancellation cases the group has already been killed.
    pub async fn wait(&mut self, cancel: CancelFlag) -> Result<WaitOutcome> {
        let Some(mut child) = self.child.take() else {
            return Err(Error::configuration("process already waited on"));
        };

        let remaining = self.timeout.saturating_sub(self.started_at.elapsed());
        let pgid = self.pgid;

        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = tokio::task::spawn_blocking(move || {
            let deadline = Instant::now() + remaining;

            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        // Reap any stragglers the child left in its group
                        kill_group(pgid);
                        let _ = tx.send(Ok(WaitOutcome::Exited(status)));
                        return;
                    }
                    Ok(None) => {
                        if cancel.is_cancelled() {
                            kill_group(pgid);
                            let _ = child.wait();
                            let _ = tx.send(Ok(WaitOutcome::Cancelled));
                            return;
                        }
                        if Instant::now() >= deadline {
                            kill_group(pgid);
                            let _ = child.wait();
                            let _ = tx.send(Ok(WaitOutcome::TimedOut));
                            return;
                        }
                        std::thread::sleep(POLL_INTERVAL);
                    }
                    Err(e) => {
                        let _ = tx.send(Err(Error::configuration(format!(
                            "failed to wait for process: {e}"
                        ))));
                        return;
                    }
                }
            }
        });

        match rx.await {
            Ok(result) => result,
            Err(_) => {
                handle.abort();
                Err(Error::configuration("wait task dropped its result"))
            }
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(_)) => {}
                _ => {
                    kill_group(self.pgid);
                    let _ = child.wait();
                }
            }
        }
    }
}

/// SIGTERM the group, give it a moment, then SIGKILL whatever is left.
fn kill_group(pgid: i32) {
    #[cfg(unix)]
    {
        // SAFETY: signalling a process group we created; -pgid addresses the group
        unsafe {
            if libc::kill(-pgid, libc::SIGTERM) == 0 {
                std::thread::sleep(TERM_GRACE);
            }
            let _ = libc::kill(-pgid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pgid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    fn spawn_in_group(program: &str, args: &[&str]) -> Child {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd.process_group(0);
        cmd.spawn().unwrap()
    }

    #[tokio::test]
    async fn fast_child_exits_normally() {
        let child = spawn_in_group("true", &[]);
        let mut guard = ProcessGuard::new(child, Duration::from_secs(5));
        match guard.wait(CancelFlag::new()).await.unwrap() {
            WaitOutcome::Exited(status) => assert!(status.success()),
            other => panic!("expected normal exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_child_is_killed_on_timeout() {
        let child = spawn_in_group("sleep", &["30"]);
        let started = Instant::now();
        let mut guard = ProcessGuard::new(child, Duration::from_millis(100));
        match guard.wait(CancelFlag::new()).await.unwrap() {
            WaitOutcome::TimedOut => {}
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let child = spawn_in_group("sleep", &["30"]);
        let mut guard = ProcessGuard::new(child, Duration::from_secs(30));
        let cancel = CancelFlag::new();
        let flag = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.cancel();
        });
        match guard.wait(cancel).await.unwrap() {
            WaitOutcome::Cancelled => {}
            other => panic!("expected cancellation, got {other:?}"),
        }
    }
}

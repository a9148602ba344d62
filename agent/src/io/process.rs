//! Blocking child-process runner with a timeout and bounded output.
//!
//! Channels call [`run_command_with_timeout`] from tokio's blocking pool.

use std::io::{ErrorKind, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Stdout followed by stderr, lossily decoded, with truncation notices.
    pub fn merged(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            text.push_str(&format!(
                "\n[stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        if self.stderr_truncated > 0 {
            text.push_str(&format!(
                "\n[stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        text
    }
}

/// How long to keep draining pipes once the child itself has exited or been killed.
///
/// Descendants that inherited stdout/stderr (`a; b`, `cmd &`, an ssh mux
/// master) can hold the pipes open long after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

enum Chunk {
    Data {
        stream: Stream,
        kept: Vec<u8>,
        dropped: usize,
    },
    Closed(Stream),
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr kept in memory; bytes beyond it are discarded while still draining the pipe.
/// On unix the child leads its own process group, and on timeout the whole group is killed.
/// Whatever was printed so far is returned with `timed_out` set. Pipes still held open by
/// stray descendants are abandoned after [`DRAIN_GRACE`].
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, rx) = mpsc::channel();
    let stdout_tx = tx.clone();
    thread::spawn(move || {
        read_stream_limited(stdout, Stream::Stdout, output_limit_bytes, stdout_tx)
    });
    thread::spawn(move || read_stream_limited(stderr, Stream::Stderr, output_limit_bytes, tx));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_process_group(child.id());
            if let Err(err) = child.kill() {
                debug!(err = %err, "child already gone");
            }
            child.wait().context("wait command after kill")?
        }
    };

    let captured = drain(&rx, DRAIN_GRACE);
    if captured.open > 0 {
        warn!(open = captured.open, "output pipes still held by descendants, abandoning");
    }
    if captured.stdout_truncated > 0 || captured.stderr_truncated > 0 {
        warn!(
            stdout_truncated = captured.stdout_truncated,
            stderr_truncated = captured.stderr_truncated,
            "output truncated"
        );
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout: captured.stdout,
        stderr: captured.stderr,
        stdout_truncated: captured.stdout_truncated,
        stderr_truncated: captured.stderr_truncated,
        timed_out,
    })
}

#[derive(Default)]
struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_truncated: usize,
    stderr_truncated: usize,
    /// Streams that had not reached end-of-file when draining stopped.
    open: usize,
}

/// Collect reader output until both streams close or `grace` elapses.
fn drain(rx: &mpsc::Receiver<Chunk>, grace: Duration) -> Captured {
    let deadline = Instant::now() + grace;
    let mut captured = Captured {
        open: 2,
        ..Captured::default()
    };
    while captured.open > 0 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(Chunk::Data {
                stream,
                kept,
                dropped,
            }) => {
                let (buf, truncated) = match stream {
                    Stream::Stdout => (&mut captured.stdout, &mut captured.stdout_truncated),
                    Stream::Stderr => (&mut captured.stderr, &mut captured.stderr_truncated),
                };
                buf.extend_from_slice(&kept);
                *truncated += dropped;
            }
            Ok(Chunk::Closed(_)) => captured.open -= 1,
            Err(mpsc::RecvTimeoutError::Timeout) => break,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                captured.open = 0;
            }
        }
    }
    captured
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let result = Command::new("kill")
        .args(["-KILL", "--", &format!("-{pgid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(err) = result {
        warn!(err = %err, pgid, "failed to kill process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

fn read_stream_limited<R: Read>(mut reader: R, stream: Stream, limit: usize, tx: Sender<Chunk>) {
    let mut kept_total = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(err = %err, ?stream, "read output failed");
                break;
            }
        };
        let keep = n.min(limit.saturating_sub(kept_total));
        kept_total += keep;
        let sent = tx.send(Chunk::Data {
            stream,
            kept: chunk[..keep].to_vec(),
            dropped: n - keep,
        });
        if sent.is_err() {
            return;
        }
    }
    let _ = tx.send(Chunk::Closed(stream));
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_both_streams() {
        let output =
            run_command_with_timeout(sh("echo out; echo err >&2"), Duration::from_secs(5), 1024)
                .expect("run");
        assert!(output.status.success());
        assert!(!output.timed_out);
        assert_eq!(output.merged(), "out\nerr\n");
    }

    #[test]
    fn truncates_beyond_limit() {
        let output = run_command_with_timeout(sh("printf 0123456789"), Duration::from_secs(5), 4)
            .expect("run");
        assert_eq!(output.stdout, b"0123");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.merged().contains("[stdout truncated 6 bytes]"));
    }

    #[test]
    fn timeout_keeps_partial_output() {
        let output = run_command_with_timeout(
            sh("echo early; exec sleep 5"),
            Duration::from_millis(300),
            1024,
        )
        .expect("run");
        assert!(output.timed_out);
        assert_eq!(String::from_utf8_lossy(&output.stdout), "early\n");
    }

    /// A forked descendant holding the pipes must not stretch the timeout.
    #[test]
    fn timeout_holds_when_shell_forks() {
        let started = Instant::now();
        let output =
            run_command_with_timeout(sh("echo started; sleep 5"), Duration::from_millis(300), 1024)
                .expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "started\n");
    }

    /// Background jobs that outlive the shell are abandoned after the grace period.
    #[test]
    fn exited_shell_with_background_job_returns_promptly() {
        let started = Instant::now();
        let output =
            run_command_with_timeout(sh("echo done; sleep 5 &"), Duration::from_secs(5), 1024)
                .expect("run");
        assert!(!output.timed_out);
        assert!(output.status.success());
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "done\n");
    }
}

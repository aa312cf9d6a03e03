//! Classifier process handle.
//!
//! Owns one child process and turns its pipes into a line-framed channel:
//! requests go in through [`WorkerProcess::send`], everything the process
//! does comes back as [`ProcessEvent`]s. Stdout is split on `\n` only; a
//! partial line is held until its terminator arrives. Stderr is logged and
//! never interpreted.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::WorkerId;
use crate::config::ClassifierCommand;
use crate::error::PoolError;

/// Environment applied to every classifier so restarts behave identically:
/// unbuffered stdout, fixed hash seed, no bytecode writes, capped malloc arenas.
const WORKER_ENV: &[(&str, &str)] = &[
    ("PYTHONUNBUFFERED", "1"),
    ("PYTHONHASHSEED", "0"),
    ("PYTHONDONTWRITEBYTECODE", "1"),
    ("MALLOC_ARENA_MAX", "2"),
    ("OMP_NUM_THREADS", "1"),
];

/// Grace period used when a handle is dropped without an explicit terminate.
const DROP_GRACE: Duration = Duration::from_secs(5);

/// Upper bound on the wait between SIGTERM and SIGKILL.
const SIGTERM_GRACE: Duration = Duration::from_secs(1);

/// How long to wait for buffered stdout after the process has exited.
const STDOUT_DRAIN: Duration = Duration::from_secs(1);

/// Something the process did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One complete stdout line, without its terminator.
    Line(String),
    /// Reading or writing a pipe failed.
    IoError(String),
    /// The process exited. Always the last event.
    Exited(Option<i32>),
}

/// Handle to a running classifier process.
pub struct WorkerProcess {
    worker_id: WorkerId,
    pid: Option<u32>,
    stdin_tx: Option<mpsc::UnboundedSender<String>>,
    terminate_tx: Option<oneshot::Sender<Duration>>,
    supervisor: Option<JoinHandle<Option<i32>>>,
}

impl WorkerProcess {
    /// Spawn a classifier in worker mode.
    ///
    /// Returns the handle and the receiving end of its event stream.
    pub fn spawn(
        worker_id: WorkerId,
        command: &ClassifierCommand,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ProcessEvent>), PoolError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);
        if let Some(flag) = &command.worker_flag {
            cmd.arg(flag);
        }
        for (key, value) in WORKER_ENV {
            cmd.env(key, value);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            if let Some(gid) = command.gid {
                cmd.gid(gid);
            }
            if let Some(uid) = command.uid {
                cmd.uid(uid);
            }
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| PoolError::Spawn {
            worker_id,
            reason: format!("{}: {}", command.display(), e),
        })?;
        let pid = child.id();

        let missing = |pipe: &str| PoolError::Spawn {
            worker_id,
            reason: format!("child {pipe} not captured"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (terminate_tx, terminate_rx) = oneshot::channel();

        let reader = tokio::spawn(read_lines(worker_id, stdout, event_tx.clone()));
        tokio::spawn(log_stderr(worker_id, stderr));
        tokio::spawn(write_lines(worker_id, stdin, stdin_rx, event_tx.clone()));
        let supervisor = tokio::spawn(supervise(worker_id, child, terminate_rx, reader, event_tx));

        debug!(worker_id, pid = ?pid, command = %command.display(), "Classifier process spawned");

        Ok((
            Self {
                worker_id,
                pid,
                stdin_tx: Some(stdin_tx),
                terminate_tx: Some(terminate_tx),
                supervisor: Some(supervisor),
            },
            event_rx,
        ))
    }

    /// OS process id, if the process was still running at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue one line for the process's stdin.
    ///
    /// Fails with `BrokenPipe` once stdin is closed. Errors hit while
    /// actually writing arrive later as [`ProcessEvent::IoError`].
    pub fn send(&self, line: String) -> io::Result<()> {
        let closed = || io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin is closed");
        let tx = self.stdin_tx.as_ref().ok_or_else(closed)?;
        tx.send(line).map_err(|_| closed())
    }

    /// Stop the process: close stdin and wait up to `grace`, then SIGTERM and
    /// wait again (at most `grace`, capped at one second), then kill.
    ///
    /// Returns the exit code if the process exited normally.
    pub async fn terminate(mut self, grace: Duration) -> Option<i32> {
        debug!(worker_id = self.worker_id, grace_ms = grace.as_millis(), "Terminating classifier process");
        self.stdin_tx.take();
        if let Some(tx) = self.terminate_tx.take() {
            let _ = tx.send(grace);
        }
        match self.supervisor.take() {
            Some(handle) => handle.await.ok().flatten(),
            None => None,
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.stdin_tx.take();
        if let Some(tx) = self.terminate_tx.take() {
            let _ = tx.send(DROP_GRACE);
        }
    }
}

/// Forward complete stdout lines as events until EOF.
async fn read_lines<R>(worker_id: WorkerId, stream: R, events: mpsc::UnboundedSender<ProcessEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(4096);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() != Some(&b'\n') {
                    debug!(worker_id, bytes = buf.len(), "Discarding unterminated output at EOF");
                    break;
                }
                buf.pop();
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if events.send(ProcessEvent::Line(line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = events.send(ProcessEvent::IoError(format!("stdout read failed: {e}")));
                break;
            }
        }
    }
}

/// Log stderr line by line until EOF. Returns the number of lines seen.
///
/// Bytes are decoded lossily and a read error switches to discarding the
/// rest, so the pipe is drained for the life of the process either way.
async fn log_stderr<R>(worker_id: WorkerId, stream: R) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(1024);
    let mut count = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                count += 1;
                let line = String::from_utf8_lossy(&buf);
                debug!(worker_id, "[classifier] {}", line.trim_end());
            }
            Err(e) => {
                debug!(worker_id, error = %e, "Classifier stderr unreadable, discarding the rest");
                let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                break;
            }
        }
    }
    count
}

/// Drain queued lines into stdin. Dropping every sender closes stdin.
async fn write_lines<W>(
    worker_id: WorkerId,
    mut stdin: W,
    mut lines: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        if let Err(e) = write_line(&mut stdin, &line).await {
            warn!(worker_id, error = %e, "Failed to write to classifier stdin");
            let _ = events.send(ProcessEvent::IoError(format!("stdin write failed: {e}")));
            return;
        }
    }
}

async fn write_line<W>(stdin: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stdin.write_all(line.as_bytes()).await?;
    if !line.ends_with('\n') {
        stdin.write_all(b"\n").await?;
    }
    stdin.flush().await
}

enum Wake {
    Exited(io::Result<ExitStatus>),
    Terminate(Duration),
}

/// Ask the process to stop after it ignored a closed stdin.
#[cfg(unix)]
fn send_sigterm(worker_id: WorkerId, child: &Child) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    // `id()` is None once the child has been reaped, so the pid is still ours.
    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(worker_id, error = %e, "Failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_worker_id: WorkerId, _child: &Child) {}

/// Wait for the process to exit (or be told to stop), then report it.
async fn supervise(
    worker_id: WorkerId,
    mut child: Child,
    mut terminate_rx: oneshot::Receiver<Duration>,
    reader: JoinHandle<()>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> Option<i32> {
    let wake = tokio::select! {
        status = child.wait() => Wake::Exited(status),
        Ok(grace) = &mut terminate_rx => Wake::Terminate(grace),
    };

    let status = match wake {
        Wake::Exited(status) => status,
        Wake::Terminate(grace) => match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                debug!(worker_id, grace_ms = grace.as_millis(), "Classifier ignored closed stdin, sending SIGTERM");
                send_sigterm(worker_id, &child);
                match tokio::time::timeout(grace.min(SIGTERM_GRACE), child.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        warn!(worker_id, "Classifier did not exit after SIGTERM, killing");
                        if let Err(e) = child.start_kill() {
                            warn!(worker_id, error = %e, "Failed to kill classifier");
                        }
                        child.wait().await
                    }
                }
            }
        },
    };

    // Let buffered output reach the event stream before the exit does.
    if tokio::time::timeout(STDOUT_DRAIN, reader).await.is_err() {
        debug!(worker_id, "Classifier stdout still open after exit");
    }

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            let _ = events.send(ProcessEvent::IoError(format!("wait failed: {e}")));
            None
        }
    };
    debug!(worker_id, code = ?code, "Classifier process exited");
    let _ = events.send(ProcessEvent::Exited(code));
    code
}

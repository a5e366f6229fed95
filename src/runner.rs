//! Process execution and supervision for runnable services.
//!
//! This module contains the `ProcessSupervisor`, which spawns a persistent shell for a
//! runnable service, feeds it the service's commands, captures stdout and stderr into the
//! service's log buffer, and reports how the shell exited.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{OrchestraError, Result};
use crate::output::StreamKind;
use crate::runnable::RunnableConfig;
use crate::service::{ServiceCore, ServiceState};

/// Lines buffered between the stream readers and the log buffer.
const LINE_CHANNEL_CAPACITY: usize = 1000;

/// How long stream readers may keep draining after the shell exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Owns the running shell of one runnable service.
#[derive(Debug)]
pub struct ProcessSupervisor {
    label: String,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    kill_tx: Option<oneshot::Sender<()>>,
    kill_requested: Arc<AtomicBool>,
    exited: watch::Receiver<bool>,
}

struct ExitWatch {
    label: String,
    core: Arc<ServiceCore>,
    child: Child,
    kill_rx: oneshot::Receiver<()>,
    kill_requested: Arc<AtomicBool>,
    readers: Vec<JoinHandle<()>>,
    ingest: JoinHandle<()>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    exited: watch::Sender<bool>,
}

impl ProcessSupervisor {
    /// Spawns the shell and writes the service's commands into it.
    ///
    /// The shell is sent a directory change, each configured command, then `exit`.
    /// Output and exit are handled by background tasks; the caller must already have
    /// moved the service into `Running`.
    pub async fn spawn(core: Arc<ServiceCore>, config: &RunnableConfig) -> Result<Self> {
        let label = config.label().to_string();
        let working_dir = match config.working_dir.as_deref().filter(|dir| !dir.is_empty()) {
            Some(dir) => dir.into(),
            None => core.settings().default_working_dir()?,
        };

        let mut command = core.settings().shell.command();
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|err| OrchestraError::io(format!("failed to spawn shell for {label}"), err))?;
        let pid = child.id();
        let stdin = take_pipe(child.stdin.take(), "stdin", &label)?;
        let stdout = take_pipe(child.stdout.take(), "stdout", &label)?;
        let stderr = take_pipe(child.stderr.take(), "stderr", &label)?;
        debug!(service = %label, pid = ?pid, "spawned shell");

        let (line_tx, line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let ingest = tokio::spawn(ingest_lines(core.clone(), line_rx));
        let readers = vec![
            tokio::spawn(read_stream(
                label.clone(),
                StreamKind::Stdout,
                stdout,
                line_tx.clone(),
            )),
            tokio::spawn(read_stream(label.clone(), StreamKind::Stderr, stderr, line_tx)),
        ];

        let stdin = Arc::new(Mutex::new(Some(stdin)));
        let kill_requested = Arc::new(AtomicBool::new(false));
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        tokio::spawn(watch_exit(ExitWatch {
            label: label.clone(),
            core,
            child,
            kill_rx,
            kill_requested: kill_requested.clone(),
            readers,
            ingest,
            stdin: stdin.clone(),
            exited: exited_tx,
        }));

        let supervisor = Self {
            label,
            stdin,
            kill_tx: Some(kill_tx),
            kill_requested,
            exited: exited_rx,
        };

        supervisor
            .write_line(&change_dir_command(&working_dir))
            .await;
        for line in &config.commands {
            supervisor.write_line(line).await;
        }
        // Make sure the shell quits once the commands finish (unless one blocks).
        supervisor.write_line("exit").await;

        Ok(supervisor)
    }

    /// Writes one line to the shell's stdin.
    ///
    /// Returns `false` if the shell is gone or the write failed; the write is not retried.
    pub async fn write_line(&self, line: &str) -> bool {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return false;
        };
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        let result: std::io::Result<()> = async {
            stdin.write_all(&data).await?;
            stdin.flush().await
        }
        .await;
        match result {
            Ok(()) => true,
            Err(err) => {
                warn!(service = %self.label, "failed to write to shell: {err}");
                false
            }
        }
    }

    /// Force-kills the shell's whole process group.
    ///
    /// Returns `false` if a kill was already requested or the shell already exited.
    pub fn kill(&mut self) -> bool {
        if self.kill_requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!(service = %self.label, "kill requested");
        match self.kill_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Waits until the exit watcher has recorded the final state.
    pub async fn wait(&self) {
        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|done| *done).await;
    }
}

fn take_pipe<T>(pipe: Option<T>, name: &str, label: &str) -> Result<T> {
    pipe.ok_or_else(|| {
        OrchestraError::io(
            format!("failed to open {name} pipe for {label}"),
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe unavailable"),
        )
    })
}

#[cfg(unix)]
fn change_dir_command(dir: &Path) -> String {
    format!("cd {}", shell_words::quote(&dir.to_string_lossy()))
}

#[cfg(not(unix))]
fn change_dir_command(dir: &Path) -> String {
    format!("cd /d \"{}\"", dir.display())
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: signalling a process group we created; no memory is touched.
        let result = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
        if result == 0 {
            return;
        }
    }
    if let Err(err) = child.start_kill() {
        warn!("failed to kill process: {err}");
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        warn!("failed to kill process: {err}");
    }
}

async fn watch_exit(mut watch: ExitWatch) {
    debug!(service = %watch.label, "waiting for process exit");
    let exited_first = tokio::select! {
        status = watch.child.wait() => Some(status),
        Ok(()) = &mut watch.kill_rx => None,
    };
    let status = match exited_first {
        Some(status) => status,
        None => {
            kill_process_group(&mut watch.child);
            watch.child.wait().await
        }
    };

    drain_readers(std::mem::take(&mut watch.readers)).await;
    // Every sender is gone once the readers finish, so ingestion ends on its own.
    let _ = (&mut watch.ingest).await;

    let killed = watch.kill_requested.load(Ordering::SeqCst);
    let next = classify_exit(&watch.label, &status, killed);
    close_stdin(&watch.label, &watch.stdin).await;

    info!(service = %watch.label, state = ?next, "process exited");
    watch.core.finish_run(next).await;
    watch.exited.send_replace(true);
}

/// Our own kill and a clean exit both count as stopped; anything else is dead.
fn classify_exit(label: &str, status: &std::io::Result<ExitStatus>, killed: bool) -> ServiceState {
    match status {
        _ if killed => ServiceState::Stopped,
        Ok(status) if status.success() => ServiceState::Stopped,
        Ok(status) => {
            error!(service = %label, "process exited abnormally: {status}");
            ServiceState::Dead
        }
        Err(err) => {
            error!(service = %label, "failed to wait for process: {err}");
            ServiceState::Dead
        }
    }
}

// Readers still blocked after the grace period hold pipes an orphan kept open; abort
// them so the pipes close.
async fn drain_readers(readers: Vec<JoinHandle<()>>) {
    for mut reader in readers {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            reader.abort();
        }
    }
}

async fn close_stdin(label: &str, stdin: &Mutex<Option<ChildStdin>>) {
    let Some(mut stdin) = stdin.lock().await.take() else {
        return;
    };
    if let Err(err) = stdin.shutdown().await {
        debug!(service = %label, "stdin already closed: {err}");
    }
}

async fn ingest_lines(core: Arc<ServiceCore>, mut lines: mpsc::Receiver<String>) {
    while let Some(line) = lines.recv().await {
        core.append_log(line).await;
    }
}

async fn read_stream<R>(label: String, stream: StreamKind, reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    debug!(service = %label, ?stream, "starting output reader");
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(service = %label, ?stream, "output reader failed: {err}");
                break;
            }
        }
    }
    debug!(service = %label, ?stream, "exiting output reader");
}

//! Supervision of the external block matcher.
//!
//! The matcher is the only process whose lifetime spans the whole session, so
//! it is the only one that must never outlive the orchestrator. A waiter thread
//! owns the child: it is the only thread that reaps it and the only one that
//! signals it, so a kill can never reach a recycled pid. Everyone else sees the
//! matcher through a [`ProcessHandle`], which asks the waiter for the kill.

use crate::cancel::CancelHandle;
use crate::error::Error;
use crate::session::{Session, SessionState};

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io;
use std::path::MAIN_SEPARATOR_STR;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, never, select, Receiver, RecvTimeoutError, Sender};

pub const MATCHER: &str = "block matcher";
pub const MATCHER_LOG: &str = "dandere2x_cpp_output.txt";

const REAP_TIMEOUT: Duration = Duration::from_secs(2);
const EXIT_POLL: Duration = Duration::from_millis(25);

/// Shared view of whether a supervised process is still running.
#[derive(Clone, Debug)]
pub struct ProcessLiveness {
    alive: Arc<AtomicBool>,
}

impl ProcessLiveness {
    pub fn running() -> Self {
        Self { alive: Arc::new(AtomicBool::new(true)) }
    }

    pub fn exited() -> Self {
        Self { alive: Arc::new(AtomicBool::new(false)) }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn mark_exited(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug)]
pub struct ProcessHandle {
    pid: u32,
    liveness: ProcessLiveness,
    kill_requests: Sender<()>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn liveness(&self) -> ProcessLiveness {
        self.liveness.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.liveness.is_alive()
    }

    /// Asks the waiter to force-kill the process if it has not exited yet.
    /// Returns whether a kill was requested.
    pub fn terminate_if_alive(&self) -> bool {
        if !self.is_alive() {
            return false;
        }
        tracing::warn!(
            pid = self.pid,
            "Unexpected shutdown before the block matcher finished, forcing it to close"
        );
        // A full queue already holds a pending request; a disconnected one means it was reaped.
        let _ = self.kill_requests.try_send(());
        true
    }

    /// Polls the liveness flag until the waiter has reaped the process.
    pub fn wait_exited(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_alive() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }
}

pub struct MatcherProcess {
    handle: ProcessHandle,
    exit: Receiver<io::Result<ExitStatus>>,
    status: Option<ExitStatus>,
}

impl MatcherProcess {
    /// Starts the matcher without waiting for it. A non-zero exit cancels the session.
    pub fn launch(session: &Session, state: SessionState, cancel: CancelHandle) -> Result<Self, Error> {
        tracing::info!(
            mode = state.mode.flag(),
            resume_frame_index = state.resume_frame_index,
            "Launching block matcher"
        );
        let output = OpenOptions::new()
            .create(true)
            .append(true)
            .open(session.workspace.logs().join(MATCHER_LOG))?;
        let child = matcher_command(session, state)
            .stdin(Stdio::null())
            .stdout(Stdio::from(output.try_clone()?))
            .stderr(Stdio::from(output))
            .spawn()
            .map_err(|source| Error::Launch { tool: MATCHER, source })?;
        Self::supervise(child, cancel)
    }

    fn supervise(mut child: Child, cancel: CancelHandle) -> Result<Self, Error> {
        let pid = child.id();
        let liveness = ProcessLiveness::running();
        let (sender, exit) = bounded(1);
        let (kill_requests, kill_receiver) = bounded(1);
        let waiter_liveness = liveness.clone();

        let spawned = thread::Builder::new()
            .name("matcher-waiter".to_string())
            .spawn(move || {
                let result = wait_or_kill(&mut child, kill_receiver);
                waiter_liveness.mark_exited();
                match &result {
                    Ok(status) if status.success() => tracing::info!(pid, "Block matcher finished"),
                    Ok(status) => {
                        tracing::error!(pid, %status, "Block matcher failed");
                        cancel.cancel();
                    }
                    Err(e) => {
                        tracing::error!(pid, "Lost track of the block matcher: {}", e);
                        cancel.cancel();
                    }
                }
                let _ = sender.send(result);
            });

        if let Err(e) = spawned {
            // The child went down with the closure unreaped, so its pid cannot have been reused.
            tracing::error!(pid, "Failed to start the matcher waiter: {}", e);
            if let Err(kill_error) = kill(pid) {
                tracing::error!(pid, "Failed to kill the block matcher: {}", kill_error);
            }
            return Err(e.into());
        }

        tracing::info!(pid, "Block matcher started");
        Ok(Self { handle: ProcessHandle { pid, liveness, kill_requests }, exit, status: None })
    }

    pub fn handle(&self) -> ProcessHandle {
        self.handle.clone()
    }

    pub fn liveness(&self) -> ProcessLiveness {
        self.handle.liveness()
    }

    pub fn is_alive(&self) -> bool {
        self.handle.is_alive()
    }

    /// Blocks until the matcher exits, at most `timeout`. `Ok(None)` means it is still running.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ExitStatus>, Error> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        match self.exit.recv_timeout(timeout) {
            Ok(result) => {
                let status = result?;
                self.status = Some(status);
                Ok(Some(status))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "block matcher waiter is gone",
            ))),
        }
    }

    /// Kills the matcher if it is still running and gives the waiter a moment to reap it.
    pub fn terminate_if_alive(&mut self) -> bool {
        let killed = self.handle.terminate_if_alive();
        if killed {
            let _ = self.wait_timeout(REAP_TIMEOUT);
        }
        killed
    }
}

impl Drop for MatcherProcess {
    fn drop(&mut self) {
        self.terminate_if_alive();
    }
}

/// Arguments in the order the matcher expects them. The workspace carries a
/// trailing separator because the matcher appends file names to it directly.
pub fn matcher_arguments(session: &Session, state: SessionState) -> Vec<OsString> {
    let mut root = session.workspace.root().as_os_str().to_owned();
    if !root.to_string_lossy().ends_with(MAIN_SEPARATOR_STR) {
        root.push(MAIN_SEPARATOR_STR);
    }
    vec![
        root,
        session.frame_count.to_string().into(),
        session.block_size.to_string().into(),
        session.tolerance.to_string().into(),
        session.step_size.to_string().into(),
        state.mode.flag().into(),
        state.resume_frame_index.to_string().into(),
    ]
}

fn matcher_command(session: &Session, state: SessionState) -> Command {
    let arguments = matcher_arguments(session, state);
    if cfg!(windows) {
        tracing::info!("using windows...");
        let mut command = Command::new("cmd.exe");
        command.args(["/C", "start"]).arg(&session.matcher).args(arguments);
        command
    } else {
        tracing::info!("using linux...");
        let mut command = Command::new(&session.matcher);
        command.args(arguments);
        command
    }
}

/// Runs on the waiter thread. Between `try_wait` calls the child is at worst a
/// zombie, so its pid is still ours to signal.
fn wait_or_kill(child: &mut Child, kill_requests: Receiver<()>) -> io::Result<ExitStatus> {
    let mut kill_requests = kill_requests;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        let mut request = None;
        select! {
            recv(kill_requests) -> message => request = Some(message.is_ok()),
            default(EXIT_POLL) => {}
        }
        match request {
            Some(true) => {
                if let Err(e) = kill(child.id()) {
                    tracing::error!(pid = child.id(), "Failed to kill the block matcher: {}", e);
                }
            }
            Some(false) => kill_requests = never(),
            None => {}
        }
    }
}

#[cfg(unix)]
fn kill(pid: u32) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    match signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn kill(pid: u32) -> io::Result<()> {
    Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|_| ())
}

/// Kills the watched matcher when the orchestrator itself is told to stop.
///
/// On unix the termination signals are blocked for the whole process and a
/// dedicated thread waits for them, so this must be installed before any other
/// thread is spawned. Elsewhere cleanup relies on [`MatcherProcess`]'s `Drop`.
#[derive(Clone, Default)]
pub struct ShutdownHook {
    watched: Arc<Mutex<Option<ProcessHandle>>>,
}

impl ShutdownHook {
    pub fn install() -> Result<Self, Error> {
        let hook = Self::default();
        hook.listen()?;
        Ok(hook)
    }

    /// Starts the matcher with the hook's lock held, so a signal that arrives
    /// mid-launch waits for the new handle instead of missing it.
    pub fn launch_watched<F>(&self, launch: F) -> Result<MatcherProcess, Error>
    where
        F: FnOnce() -> Result<MatcherProcess, Error>,
    {
        let mut watched = self.watched.lock().unwrap_or_else(PoisonError::into_inner);
        let matcher = launch()?;
        *watched = Some(matcher.handle());
        Ok(matcher)
    }

    /// What the hook does once a termination request arrives, minus exiting.
    pub fn shutdown(&self) -> bool {
        let watched = self.watched.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match watched {
            Some(handle) => {
                let killed = handle.terminate_if_alive();
                if killed && !handle.wait_exited(REAP_TIMEOUT) {
                    tracing::warn!(pid = handle.pid(), "Block matcher was not reaped in time");
                }
                killed
            }
            None => false,
        }
    }

    #[cfg(unix)]
    fn listen(&self) -> Result<(), Error> {
        use nix::sys::signal::{SigSet, Signal};

        let mut signals = SigSet::empty();
        signals.add(Signal::SIGINT);
        signals.add(Signal::SIGTERM);
        signals.add(Signal::SIGHUP);
        signals.thread_block().map_err(io::Error::from)?;

        let hook = self.clone();
        thread::Builder::new()
            .name("shutdown-hook".to_string())
            .spawn(move || match signals.wait() {
                Ok(signal) => {
                    tracing::warn!(signal = signal.as_str(), "Termination requested");
                    if hook.shutdown() {
                        tracing::warn!("Block matcher was force-killed during shutdown");
                    }
                    tracing::warn!("Exiting..");
                    std::process::exit(1);
                }
                Err(e) => tracing::error!("Shutdown hook stopped listening: {}", e),
            })?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn listen(&self) -> Result<(), Error> {
        Ok(())
    }
}

//! One upscale session from start to finish.
//!
//! The orchestrator owns the block matcher and the stage workers. Everything
//! the workers need to resume lives in the workspace, so an aborted session is
//! picked up again simply by running it a second time on the same workspace.

use crate::args::Args;
use crate::cancel::CancelHandle;
use crate::error::Error;
use crate::session::{Session, SessionMode, SessionState};
use crate::stages::{
    wake_channel, Difference, Extract, Merge, PollConfig, Progress, StageCounter, Upscale,
    UpscaleStrategy, Worker,
};
use crate::supervisor::{MatcherProcess, ShutdownHook, MATCHER};
use crate::workspace::{Workspace, FRAME_LIST, WAIFU2X_SCRIPT};

use std::fmt;
use std::thread::JoinHandle;
use std::time::Duration;

const MATCHER_EXIT_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    New,
    Resuming,
    Running,
    Complete,
    Aborted,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::New => "new",
            SessionStatus::Resuming => "resuming",
            SessionStatus::Running => "running",
            SessionStatus::Complete => "complete",
            SessionStatus::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionReport {
    pub status: SessionStatus,
    pub mode: SessionMode,
    pub resume_frame_index: usize,
    pub differences: usize,
    pub merged: usize,
}

type WorkerHandle = JoinHandle<Result<StageCounter, Error>>;

pub struct Orchestrator {
    args: Args,
    workspace: Workspace,
    install_hook: bool,
    status: SessionStatus,
}

impl Orchestrator {
    pub fn new(args: Args, workspace: Workspace) -> Self {
        Self { args, workspace, install_hook: false, status: SessionStatus::New }
    }

    /// Forward SIGINT, SIGTERM and SIGHUP to the matcher cleanup. Only for
    /// the binary; it blocks those signals for the whole process.
    pub fn with_shutdown_hook(mut self, install: bool) -> Self {
        self.install_hook = install;
        self
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    fn transition(&mut self, status: SessionStatus) {
        tracing::info!(from = %self.status, to = %status, "Session state changed");
        self.status = status;
    }

    pub fn run(&mut self) -> Result<SessionReport, Error> {
        match self.execute() {
            Ok(report) => {
                self.transition(SessionStatus::Complete);
                Ok(SessionReport { status: self.status, ..report })
            }
            Err(e) => {
                self.transition(SessionStatus::Aborted);
                Err(e)
            }
        }
    }

    fn execute(&mut self) -> Result<SessionReport, Error> {
        self.args.validate()?;
        self.args.validate_tools()?;
        let hook = if self.install_hook { Some(ShutdownHook::install()?) } else { None };

        if self.workspace.input_frames()? == 0 {
            Extract::execute(&self.args, &self.workspace)?;
        } else {
            self.transition(SessionStatus::Resuming);
            tracing::info!(
                differences = self.workspace.differences()?,
                merged = self.workspace.merged_frames()?,
                "Frames already extracted, skipping extraction"
            );
        }

        self.args.print_options();
        self.workspace.write_frame_list(self.args.frame_count())?;
        self.workspace.write_commands(self.args.frame_rate)?;

        let session = Session::new(&self.args, self.workspace.clone());
        let strategy = UpscaleStrategy::probe(&self.args);
        let state = SessionState::determine(&self.workspace)?;

        let cancel = CancelHandle::new();
        let launch = || MatcherProcess::launch(&session, state, cancel.clone());
        let mut matcher = match &hook {
            Some(hook) => hook.launch_watched(launch)?,
            None => launch()?,
        };
        self.transition(SessionStatus::Running);

        match run_workers(&session, &strategy, &mut matcher, &cancel) {
            Ok(()) => Ok(SessionReport {
                status: self.status,
                mode: state.mode,
                resume_frame_index: state.resume_frame_index,
                differences: self.workspace.differences()?,
                merged: self.workspace.merged_frames()?,
            }),
            Err(e) => {
                cancel.cancel();
                matcher.terminate_if_alive();
                Err(e)
            }
        }
    }
}

/// Starts every stage, waits for them and for the matcher, and reports the
/// first real failure. Failures after the first show up as `Cancelled`.
fn run_workers(
    session: &Session,
    strategy: &UpscaleStrategy,
    matcher: &mut MatcherProcess,
    cancel: &CancelHandle,
) -> Result<(), Error> {
    let config = PollConfig::from(session);
    let (differences_sender, differences_receiver) = wake_channel();
    let (upscaled_sender, upscaled_receiver) = wake_channel();
    let (merged_sender, merged_receiver) = wake_channel();

    let progress = Worker::new(Progress::new(session), config, cancel.clone())
        .woken_by(merged_receiver)
        .start()?;
    let merge = Worker::new(Merge::new(session), config, cancel.clone())
        .woken_by(upscaled_receiver)
        .notifying(merged_sender)
        .start();
    let difference = Worker::new(Difference::new(session, matcher.liveness()), config, cancel.clone())
        .notifying(differences_sender)
        .start();

    let mut failure = None;
    let mut handles = Vec::new();
    for (name, started) in [("merge", merge), ("difference", difference)] {
        match started {
            Ok(handle) => handles.push((name, handle)),
            Err(e) => {
                cancel.cancel();
                keep_first(&mut failure, e);
            }
        }
    }

    match strategy {
        UpscaleStrategy::Automated(upscaler) if failure.is_none() => {
            let upscale = upscaler.upscale_first_frame(&session.workspace).and_then(|()| {
                Worker::new(Upscale::new(session, upscaler.clone()), config, cancel.clone())
                    .woken_by(differences_receiver)
                    .notifying(upscaled_sender)
                    .start()
            });
            match upscale {
                Ok(handle) => {
                    if let Err(e) = join("upscale", handle) {
                        keep_first(&mut failure, e);
                    }
                }
                Err(e) => {
                    cancel.cancel();
                    keep_first(&mut failure, e);
                }
            }
        }
        UpscaleStrategy::Automated(_) => {}
        UpscaleStrategy::ManualHandoff { model_script } => {
            drop(upscaled_sender);
            let written = session.workspace.write_waifu2x_script(
                model_script,
                &session.process_type,
                session.noise_level,
            );
            match written {
                Ok(script) => {
                    tracing::warn!(
                        "No headless upscaler available. Run {} from {} to upscale the images in {}; merging resumes as soon as they appear",
                        WAIFU2X_SCRIPT,
                        session.workspace.root().display(),
                        FRAME_LIST,
                    );
                    tracing::info!("Upscaling script written to {}", script.display());
                }
                Err(e) => {
                    cancel.cancel();
                    keep_first(&mut failure, e);
                }
            }
        }
    }

    for (name, handle) in handles {
        if let Err(e) = join(name, handle) {
            keep_first(&mut failure, e);
        }
    }

    if failure.is_none() {
        match matcher.wait_timeout(session.stall_timeout)? {
            Some(status) if status.success() => {}
            Some(status) => keep_first(&mut failure, Error::MatcherFailed(status)),
            None => keep_first(
                &mut failure,
                Error::Stalled {
                    stage: MATCHER,
                    produced: session.workspace.pframes()?,
                    consumed: session.workspace.differences()?,
                    waited: session.stall_timeout,
                },
            ),
        }
    }
    if failure.is_some() {
        cancel.cancel();
    }

    if let Err(e) = join("progress", progress) {
        keep_first(&mut failure, e);
    }

    match failure {
        None => Ok(()),
        Some(Error::Cancelled) => match matcher.wait_timeout(MATCHER_EXIT_GRACE)? {
            Some(status) if !status.success() => Err(Error::MatcherFailed(status)),
            _ => Err(Error::Cancelled),
        },
        Some(e) => Err(e),
    }
}

fn join(name: &'static str, handle: WorkerHandle) -> Result<StageCounter, Error> {
    handle.join().unwrap_or(Err(Error::WorkerPanicked(name)))
}

fn keep_first(failure: &mut Option<Error>, error: Error) {
    let replace = match failure {
        None => true,
        Some(existing) => existing.is_cancelled() && !error.is_cancelled(),
    };
    if replace {
        *failure = Some(error);
    }
}

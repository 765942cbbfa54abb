//! The poll loop shared by every pipeline stage.
//!
//! Stages never talk to each other directly. Each one rescans its upstream
//! directory for new artifacts, processes them in ascending order and wakes
//! its downstream neighbour through a coalescing channel. Polling with a
//! bounded backoff remains the fallback for producers outside the process.

use crate::cancel::CancelHandle;
use crate::error::Error;
use crate::session::Session;

use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, never, select, Receiver, Sender};
use image::error::ImageError;

/// An upstream artifact that exists but does not decode.
#[derive(Debug)]
pub struct Corrupt {
    pub path: PathBuf,
    pub source: ImageError,
}

#[derive(Debug)]
pub enum Outcome {
    Done,
    /// The inputs for this index are not usable yet; retry on the next poll.
    Pending(Option<Corrupt>),
}

pub trait Stage: Send {
    fn name(&self) -> &'static str;

    /// Units this stage has to process before it is finished.
    fn target(&self) -> usize;

    /// Upstream artifacts available right now.
    fn produced(&mut self) -> Result<usize, Error>;

    /// Units already processed, recovered from this stage's own output.
    fn consumed(&mut self) -> Result<usize, Error>;

    /// Frame index of the first unit.
    fn first_index(&self) -> usize {
        1
    }

    fn process(&mut self, index: usize) -> Result<Outcome, Error>;

    fn finish(&mut self, _completed: bool) {}
}

/// Produced and consumed counts of one stage. Produced only grows and
/// consumed only advances while it is below produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageCounter {
    produced: usize,
    consumed: usize,
}

impl StageCounter {
    pub fn new(produced: usize, consumed: usize) -> Self {
        Self { produced: produced.max(consumed), consumed }
    }

    pub fn produced(&self) -> usize {
        self.produced
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn observe(&mut self, produced: usize) {
        self.produced = self.produced.max(produced);
    }

    pub fn available(&self) -> bool {
        self.consumed < self.produced
    }

    pub fn advance(&mut self) -> bool {
        if self.available() {
            self.consumed += 1;
            true
        } else {
            false
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_interval: Duration,
    pub stall_timeout: Duration,
}

impl From<&Session> for PollConfig {
    fn from(session: &Session) -> Self {
        Self {
            interval: session.poll_interval,
            max_interval: session.max_poll_interval,
            stall_timeout: session.stall_timeout,
        }
    }
}

/// Wake-up channel between neighbouring stages; one pending signal is enough.
pub fn wake_channel() -> (Sender<()>, Receiver<()>) {
    bounded(1)
}

pub struct Worker<S: Stage> {
    stage: S,
    config: PollConfig,
    cancel: CancelHandle,
    wake: Receiver<()>,
    downstream: Option<Sender<()>>,
}

impl<S: Stage + 'static> Worker<S> {
    pub fn new(stage: S, config: PollConfig, cancel: CancelHandle) -> Self {
        Self { stage, config, cancel, wake: never(), downstream: None }
    }

    pub fn woken_by(mut self, wake: Receiver<()>) -> Self {
        self.wake = wake;
        self
    }

    pub fn notifying(mut self, downstream: Sender<()>) -> Self {
        self.downstream = Some(downstream);
        self
    }

    pub fn start(self) -> Result<JoinHandle<Result<StageCounter, Error>>, Error> {
        let name = self.stage.name();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || self.run())?;
        Ok(handle)
    }

    /// Runs to completion on the calling thread. Any failure other than
    /// cancellation cancels the rest of the session.
    pub fn run(mut self) -> Result<StageCounter, Error> {
        let result = self.poll();
        match &result {
            Ok(counter) => tracing::info!(
                stage = self.stage.name(),
                consumed = counter.consumed(),
                "stage finished"
            ),
            Err(Error::Cancelled) => tracing::info!(stage = self.stage.name(), "stage cancelled"),
            Err(e) => {
                tracing::error!(stage = self.stage.name(), "stage failed: {}", e);
                self.cancel.cancel();
            }
        }
        self.stage.finish(result.is_ok());
        result
    }

    fn poll(&mut self) -> Result<StageCounter, Error> {
        let name = self.stage.name();
        let target = self.stage.target();
        let token = self.cancel.token();

        let consumed = self.stage.consumed()?.min(target);
        let mut counter = StageCounter::new(self.stage.produced()?.min(target), consumed);
        tracing::info!(stage = name, produced = counter.produced(), consumed, target, "stage started");

        let mut backoff = self.config.interval;
        let mut last_progress = Instant::now();
        let mut corrupt: Option<Corrupt> = None;

        while counter.consumed() < target {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }

            counter.observe(self.stage.produced()?.min(target));
            let mut progressed = false;
            while counter.available() {
                let index = self.stage.first_index() + counter.consumed();
                match self.stage.process(index)? {
                    Outcome::Done => {
                        counter.advance();
                        progressed = true;
                        corrupt = None;
                        self.notify_downstream();
                        tracing::debug!(stage = name, index, "processed");
                    }
                    Outcome::Pending(found) => {
                        if found.is_some() {
                            corrupt = found;
                        }
                        break;
                    }
                }
                if token.is_cancelled() {
                    return Err(Error::Cancelled);
                }
            }

            if progressed {
                backoff = self.config.interval;
                last_progress = Instant::now();
                continue;
            }

            let waited = last_progress.elapsed();
            if waited >= self.config.stall_timeout {
                return Err(match corrupt.take() {
                    Some(Corrupt { path, source }) => Error::CorruptArtifact { stage: name, path, source },
                    None => Error::Stalled {
                        stage: name,
                        produced: counter.produced(),
                        consumed: counter.consumed(),
                        waited,
                    },
                });
            }

            let wait = backoff.min(self.config.stall_timeout - waited);
            let mut upstream_gone = false;
            select! {
                recv(token.receiver()) -> _ => return Err(Error::Cancelled),
                recv(self.wake) -> message => upstream_gone = message.is_err(),
                default(wait) => backoff = (backoff * 2).min(self.config.max_interval),
            }
            if upstream_gone {
                self.wake = never();
            }
        }

        Ok(counter)
    }

    fn notify_downstream(&self) {
        if let Some(downstream) = &self.downstream {
            let _ = downstream.try_send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::{self, Workspace};

    use std::sync::{Arc, Mutex};

    fn config(stall_timeout: Duration) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(10),
            stall_timeout,
        }
    }

    /// Copies `pframe_data/pframe_i.txt` into `outputs/` and records what it saw.
    struct CopyStage {
        workspace: Workspace,
        target: usize,
        seen: Arc<Mutex<Vec<(usize, usize)>>>,
    }

    impl Stage for CopyStage {
        fn name(&self) -> &'static str {
            "copy"
        }

        fn target(&self) -> usize {
            self.target
        }

        fn produced(&mut self) -> Result<usize, Error> {
            self.workspace.pframes()
        }

        fn consumed(&mut self) -> Result<usize, Error> {
            workspace::count(&self.workspace.outputs(), "txt")
        }

        fn process(&mut self, index: usize) -> Result<Outcome, Error> {
            let source = self.workspace.pframe(index);
            assert!(source.exists(), "processed {} before it was produced", index);
            let produced = self.workspace.pframes()?;
            let consumed = workspace::count(&self.workspace.outputs(), "txt")?;
            self.seen.lock().unwrap().push((produced, consumed));
            let out = self.workspace.outputs().join(format!("copy_{}.txt", index));
            workspace::write_atomic(&out, &std::fs::read(source)?)?;
            Ok(Outcome::Done)
        }
    }

    #[test]
    fn consumer_never_overtakes_producer() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(dir.path()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stage = CopyStage { workspace: workspace.clone(), target: 40, seen: seen.clone() };
        let handle = Worker::new(stage, config(Duration::from_secs(10)), CancelHandle::new())
            .start()
            .unwrap();

        for index in 1..=40 {
            workspace::write_atomic(&workspace.pframe(index), index.to_string().as_bytes()).unwrap();
            if index % 7 == 0 {
                thread::sleep(Duration::from_millis(3));
            }
        }

        let counter = handle.join().unwrap().unwrap();
        assert_eq!(counter.consumed(), 40);
        assert!(counter.consumed() <= counter.produced());
        for (produced, consumed) in seen.lock().unwrap().iter() {
            assert!(consumed < produced);
        }
        assert_eq!(workspace::count(&workspace.outputs(), "txt").unwrap(), 40);
    }

    #[test]
    fn resumes_from_own_output() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(dir.path()).unwrap();
        for index in 1..=5 {
            std::fs::write(workspace.pframe(index), b"x").unwrap();
        }
        for index in 1..=3 {
            std::fs::write(workspace.outputs().join(format!("copy_{}.txt", index)), b"x").unwrap();
        }
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stage = CopyStage { workspace: workspace.clone(), target: 5, seen: seen.clone() };

        let counter = Worker::new(stage, config(Duration::from_secs(5)), CancelHandle::new())
            .run()
            .unwrap();

        assert_eq!(counter, StageCounter::new(5, 5));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn stall_is_reported_with_last_counts() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(dir.path()).unwrap();
        std::fs::write(workspace.pframe(1), b"x").unwrap();
        let stage = CopyStage { workspace, target: 3, seen: Arc::new(Mutex::new(Vec::new())) };
        let cancel = CancelHandle::new();

        let result = Worker::new(stage, config(Duration::from_millis(50)), cancel.clone()).run();

        match result {
            Err(Error::Stalled { stage, produced, consumed, .. }) => {
                assert_eq!((stage, produced, consumed), ("copy", 1, 1));
            }
            other => panic!("expected a stall, got {:?}", other),
        }
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn cancellation_stops_an_idle_worker() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(dir.path()).unwrap();
        let stage = CopyStage { workspace, target: 3, seen: Arc::new(Mutex::new(Vec::new())) };
        let cancel = CancelHandle::new();
        let handle = Worker::new(stage, config(Duration::from_secs(60)), cancel.clone())
            .start()
            .unwrap();

        thread::sleep(Duration::from_millis(20));
        cancel.cancel();

        assert!(matches!(handle.join().unwrap(), Err(Error::Cancelled)));
    }

    struct CorruptStage;

    impl Stage for CorruptStage {
        fn name(&self) -> &'static str {
            "merge"
        }

        fn target(&self) -> usize {
            1
        }

        fn produced(&mut self) -> Result<usize, Error> {
            Ok(1)
        }

        fn consumed(&mut self) -> Result<usize, Error> {
            Ok(0)
        }

        fn process(&mut self, _index: usize) -> Result<Outcome, Error> {
            let source = ImageError::IoError(std::io::Error::new(std::io::ErrorKind::InvalidData, "truncated"));
            Ok(Outcome::Pending(Some(Corrupt { path: PathBuf::from("upscaled/output_000001.png"), source })))
        }
    }

    #[test]
    fn undecodable_artifact_becomes_a_corrupt_error() {
        let result = Worker::new(CorruptStage, config(Duration::from_millis(30)), CancelHandle::new()).run();
        assert!(matches!(result, Err(Error::CorruptArtifact { stage: "merge", .. })));
    }

    #[test]
    fn counter_never_advances_past_produced() {
        let mut counter = StageCounter::new(2, 0);
        assert!(counter.advance());
        assert!(counter.advance());
        assert!(!counter.advance());
        counter.observe(1);
        assert_eq!(counter.produced(), 2);
        counter.observe(3);
        assert!(counter.advance());
        assert_eq!(counter, StageCounter::new(3, 3));
        assert_eq!(StageCounter::new(1, 4).produced(), 4);
    }
}

use crate::error::Error;
use crate::session::Session;
use crate::stages::worker::{Outcome, Stage};
use crate::workspace::Workspace;

use std::collections::VecDeque;
use std::{fmt::Write, time::Instant};
use indicatif::{ProgressBar, ProgressState, ProgressStyle};

const WINDOW: usize = 10;

/// Follows `merged/` and reports how fast frames are completed.
pub struct Progress {
    workspace: Workspace,
    frame_count: usize,
    progress_bar: ProgressBar,
    recent: VecDeque<Instant>,
}

impl Progress {
    pub fn new(session: &Session) -> Self {
        let progress_bar = ProgressBar::new(session.frame_count as u64);
        let progress_style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{eta_precise}] [{wide_bar:.white/green}] {pos}/{len} {percent} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░-")
            .with_key("eta", |state: &ProgressState, w: &mut dyn Write| {
                let _ = write!(w, "{:.1}s", state.eta().as_secs_f64());
            })
            .with_key("percent", |state: &ProgressState, w: &mut dyn Write| {
                let _ = write!(w, "({:.0}%)", state.fraction() * 100.0);
            });
        progress_bar.set_style(progress_style);

        Self {
            workspace: session.workspace.clone(),
            frame_count: session.frame_count,
            progress_bar,
            recent: VecDeque::with_capacity(WINDOW + 1),
        }
    }

    /// Average seconds per frame over the last few completions.
    fn seconds_per_frame(&self) -> Option<f64> {
        let first = self.recent.front()?;
        let last = self.recent.back()?;
        let frames = self.recent.len().checked_sub(1).filter(|n| *n > 0)?;
        Some(last.duration_since(*first).as_secs_f64() / frames as f64)
    }

    fn update_progress(&mut self, index: usize) {
        self.recent.push_back(Instant::now());
        if self.recent.len() > WINDOW + 1 {
            self.recent.pop_front();
        }
        self.progress_bar.set_position(index as u64);

        match self.seconds_per_frame() {
            Some(average) => {
                self.progress_bar.set_message(format!("[{:.2} s/frame]", average));
                tracing::debug!(frame = index, total = self.frame_count, average, "frame merged");
            }
            None => tracing::debug!(frame = index, total = self.frame_count, "frame merged"),
        }
    }
}

impl Stage for Progress {
    fn name(&self) -> &'static str {
        "progress"
    }

    fn target(&self) -> usize {
        self.frame_count
    }

    fn produced(&mut self) -> Result<usize, Error> {
        self.workspace.merged_frames()
    }

    /// Frames merged by an earlier run count as done from the start.
    fn consumed(&mut self) -> Result<usize, Error> {
        let done = self.workspace.merged_frames()?;
        self.progress_bar.set_position(done.min(self.frame_count) as u64);
        Ok(done)
    }

    fn process(&mut self, index: usize) -> Result<Outcome, Error> {
        self.update_progress(index);
        Ok(Outcome::Done)
    }

    fn finish(&mut self, completed: bool) {
        if completed {
            self.progress_bar.finish();
        } else {
            self.progress_bar.abandon();
        }
    }
}

use crate::error::Error;
use crate::frame;
use crate::session::Session;
use crate::stages::worker::{Corrupt, Outcome, Stage};
use crate::supervisor::ProcessLiveness;
use crate::tool;
use crate::workspace::{self, Workspace};

use std::path::PathBuf;
use std::process::Command;

pub const DIFFERENCE_TOOL: &str = "difference tool";

/// Turns matching metadata into difference images: the blocks of frame i+1
/// that could not be matched against frame i, packed into one small image.
pub struct Difference {
    workspace: Workspace,
    tool: PathBuf,
    block_size: u32,
    bleed: u32,
    target: usize,
    matcher: ProcessLiveness,
}

impl Difference {
    pub fn new(session: &Session, matcher: ProcessLiveness) -> Self {
        Self {
            workspace: session.workspace.clone(),
            tool: session.difference_tool.clone(),
            block_size: session.block_size,
            bleed: session.bleed,
            target: session.frame_count - 1,
            matcher,
        }
    }

    fn command(&self, index: usize, output: &std::path::Path) -> Command {
        let mut command = Command::new(&self.tool);
        command
            .arg("--frame")
            .arg(self.workspace.input_frame(index + 1))
            .arg("--pframe")
            .arg(self.workspace.pframe(index))
            .arg("--inversion")
            .arg(self.workspace.inversion(index))
            .arg("--block-size")
            .arg(self.block_size.to_string())
            .arg("--bleed")
            .arg(self.bleed.to_string())
            .arg("--output")
            .arg(output);
        command
    }
}

impl Stage for Difference {
    fn name(&self) -> &'static str {
        "difference"
    }

    fn target(&self) -> usize {
        self.target
    }

    /// The matcher writes its files in place, so the newest one only counts
    /// once a successor exists or the matcher has exited.
    fn produced(&mut self) -> Result<usize, Error> {
        let count = self.workspace.pframes()?;
        if self.matcher.is_alive() {
            Ok(count.saturating_sub(1))
        } else {
            Ok(count)
        }
    }

    fn consumed(&mut self) -> Result<usize, Error> {
        self.workspace.differences()
    }

    fn process(&mut self, index: usize) -> Result<Outcome, Error> {
        if !self.workspace.pframe(index).is_file() || !self.workspace.inversion(index).is_file() {
            return Ok(Outcome::Pending(None));
        }
        let frame_path = self.workspace.input_frame(index + 1);
        if !frame_path.is_file() {
            return Ok(Outcome::Pending(None));
        }
        if let Err(source) = frame::verify(&frame_path) {
            return Ok(Outcome::Pending(Some(Corrupt { path: frame_path, source })));
        }

        let output = self.workspace.difference(index);
        let partial = workspace::prepare_partial(&output)?;
        tool::run(DIFFERENCE_TOOL, &mut self.command(index, &partial), Some(index))?;
        workspace::commit_partial(&output)?;
        Ok(Outcome::Done)
    }
}

use crate::error::Error;
use crate::frame;
use crate::session::Session;
use crate::stages::worker::{Corrupt, Outcome, Stage};
use crate::tool;
use crate::workspace::{self, Workspace};

use std::path::{Path, PathBuf};
use std::process::Command;

pub const MERGE_TOOL: &str = "merge tool";

/// Rebuilds frame i+1 at full resolution from merged frame i, the matching
/// metadata and the upscaled difference image.
pub struct Merge {
    workspace: Workspace,
    tool: PathBuf,
    block_size: u32,
    bleed: u32,
    scale_factor: u32,
    target: usize,
}

impl Merge {
    pub fn new(session: &Session) -> Self {
        Self {
            workspace: session.workspace.clone(),
            tool: session.merge_tool.clone(),
            block_size: session.block_size,
            bleed: session.bleed,
            scale_factor: session.scale_factor,
            target: session.frame_count - 1,
        }
    }

    fn command(&self, index: usize, output: &Path) -> Command {
        let mut command = Command::new(&self.tool);
        command
            .arg("--base")
            .arg(self.workspace.merged_frame(index))
            .arg("--upscaled")
            .arg(self.workspace.upscaled_difference(index))
            .arg("--pframe")
            .arg(self.workspace.pframe(index))
            .arg("--inversion")
            .arg(self.workspace.inversion(index))
            .arg("--block-size")
            .arg(self.block_size.to_string())
            .arg("--bleed")
            .arg(self.bleed.to_string())
            .arg("--scale")
            .arg(self.scale_factor.to_string())
            .arg("--output")
            .arg(output);
        command
    }
}

impl Stage for Merge {
    fn name(&self) -> &'static str {
        "merge"
    }

    fn target(&self) -> usize {
        self.target
    }

    fn produced(&mut self) -> Result<usize, Error> {
        self.workspace.upscaled_differences()
    }

    /// `merged_1` is the seed from the upscaler, not a merge result.
    fn consumed(&mut self) -> Result<usize, Error> {
        Ok(self.workspace.merged_frames()?.saturating_sub(1))
    }

    fn process(&mut self, index: usize) -> Result<Outcome, Error> {
        for path in [self.workspace.pframe(index), self.workspace.inversion(index)] {
            if !path.is_file() {
                return Ok(Outcome::Pending(None));
            }
        }
        for path in [self.workspace.merged_frame(index), self.workspace.upscaled_difference(index)] {
            if !path.is_file() {
                return Ok(Outcome::Pending(None));
            }
            if let Err(source) = frame::verify(&path) {
                return Ok(Outcome::Pending(Some(Corrupt { path, source })));
            }
        }

        let output = self.workspace.merged_frame(index + 1);
        let partial = workspace::prepare_partial(&output)?;
        tool::run(MERGE_TOOL, &mut self.command(index, &partial), Some(index))?;
        workspace::commit_partial(&output)?;
        Ok(Outcome::Done)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cancel::CancelHandle;
    use crate::stages::worker::{PollConfig, Worker};

    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn session(dir: &Path, frame_count: usize) -> Session {
        let tool = dir.join("merge.sh");
        std::fs::write(
            &tool,
            "#!/bin/sh\n\
             while [ $# -gt 0 ]; do\n\
               case \"$1\" in --base) base=$2;; --output) out=$2;; esac\n\
               shift 2\n\
             done\n\
             cp \"$base\" \"$out\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut session = Session::for_tests(Workspace::create(dir.join("ws")).unwrap(), frame_count);
        session.merge_tool = tool;
        session.stall_timeout = Duration::from_millis(300);
        session
    }

    fn seed(workspace: &Workspace, pairs: usize) {
        image::RgbImage::new(8, 8).save(workspace.merged_frame(1)).unwrap();
        for index in 1..=pairs {
            std::fs::write(workspace.pframe(index), b"").unwrap();
            std::fs::write(workspace.inversion(index), b"").unwrap();
            image::RgbImage::new(4, 4).save(workspace.upscaled_difference(index)).unwrap();
        }
    }

    #[test]
    fn produces_every_frame_after_the_seed() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path(), 6);
        seed(&session.workspace, 5);

        let counter = Worker::new(Merge::new(&session), PollConfig::from(&session), CancelHandle::new())
            .run()
            .unwrap();

        assert_eq!(counter.consumed(), 5);
        assert_eq!(session.workspace.merged_frames().unwrap(), 6);
        frame::verify(&session.workspace.merged_frame(6)).unwrap();
    }

    #[test]
    fn resume_starts_after_the_newest_merged_frame() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path(), 6);
        seed(&session.workspace, 5);
        for index in 2..=4 {
            std::fs::copy(session.workspace.merged_frame(1), session.workspace.merged_frame(index)).unwrap();
        }

        let mut stage = Merge::new(&session);
        assert_eq!(stage.consumed().unwrap(), 3);
        let counter = Worker::new(stage, PollConfig::from(&session), CancelHandle::new())
            .run()
            .unwrap();
        assert_eq!(counter.consumed(), 5);
        assert_eq!(session.workspace.merged_frames().unwrap(), 6);
    }

    #[test]
    fn missing_seed_stalls() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path(), 3);
        seed(&session.workspace, 2);
        std::fs::remove_file(session.workspace.merged_frame(1)).unwrap();

        let result = Worker::new(Merge::new(&session), PollConfig::from(&session), CancelHandle::new()).run();
        assert!(matches!(result, Err(Error::Stalled { stage: "merge", produced: 2, consumed: 0, .. })));
    }
}

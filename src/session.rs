use crate::args::Args;
use crate::error::Error;
use crate::workspace::{self, Workspace};

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    New,
    Resumed,
}

impl SessionMode {
    /// Mode flag understood by the block matcher.
    pub fn flag(&self) -> &'static str {
        match self {
            SessionMode::New => "n",
            SessionMode::Resumed => "r",
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::New => write!(f, "new"),
            SessionMode::Resumed => write!(f, "resumed"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionState {
    pub mode: SessionMode,
    pub resume_frame_index: usize,
}

impl SessionState {
    /// Counts matching metadata already on disk. The newest one may have been cut
    /// short by a crash, so it and its inversion data are removed and re-requested.
    pub fn determine(workspace: &Workspace) -> Result<Self, Error> {
        let count = workspace.pframes()?;
        if count == 0 {
            tracing::info!("New Dandere2x session");
            return Ok(Self { mode: SessionMode::New, resume_frame_index: 0 });
        }

        workspace::remove_if_present(&workspace.pframe(count))?;
        workspace::remove_if_present(&workspace.inversion(count))?;
        tracing::info!(resume_frame_index = count, "Resuming Dandere2x session");

        Ok(Self { mode: SessionMode::Resumed, resume_frame_index: count })
    }
}

/// Everything fixed for the lifetime of one upscale job.
#[derive(Clone, Debug)]
pub struct Session {
    pub workspace: Workspace,
    pub frame_count: usize,
    pub frame_rate: u32,
    pub block_size: u32,
    pub step_size: u32,
    pub bleed: u32,
    pub tolerance: f64,
    pub noise_level: u32,
    pub process_type: String,
    pub scale_factor: u32,
    pub matcher: PathBuf,
    pub difference_tool: PathBuf,
    pub merge_tool: PathBuf,
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub stall_timeout: Duration,
}

impl Session {
    pub fn new(args: &Args, workspace: Workspace) -> Self {
        Self {
            workspace,
            frame_count: args.frame_count(),
            frame_rate: args.frame_rate,
            block_size: args.block_size,
            step_size: args.step_size,
            bleed: args.bleed,
            tolerance: args.tolerance,
            noise_level: args.noise_level,
            process_type: args.process_type.clone(),
            scale_factor: args.scale_factor,
            matcher: args.matcher.clone(),
            difference_tool: args.difference_tool.clone(),
            merge_tool: args.merge_tool.clone(),
            poll_interval: args.poll_interval(),
            max_poll_interval: args.max_poll_interval(),
            stall_timeout: args.stall_timeout(),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(workspace: Workspace, frame_count: usize) -> Self {
        Self {
            workspace,
            frame_count,
            frame_rate: 24,
            block_size: 16,
            step_size: 4,
            bleed: 2,
            tolerance: 15.5,
            noise_level: 3,
            process_type: "noise_scale".to_string(),
            scale_factor: 2,
            matcher: PathBuf::from("dandere2x_cpp"),
            difference_tool: PathBuf::from("difference"),
            merge_tool: PathBuf::from("merge"),
            poll_interval: Duration::from_millis(2),
            max_poll_interval: Duration::from_millis(20),
            stall_timeout: Duration::from_secs(5),
        }
    }
}

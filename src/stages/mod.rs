pub mod worker;
mod extract;
mod difference;
mod upscale;
mod merge;
mod progress;

pub use extract::{Extract, FFMPEG};
pub use difference::{Difference, DIFFERENCE_TOOL};
pub use upscale::{Upscale, UpscaleStrategy, Upscaler, UPSCALER};
pub use merge::{Merge, MERGE_TOOL};
pub use progress::Progress;
pub use worker::{wake_channel, PollConfig, Stage, StageCounter, Worker};

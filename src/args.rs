use crate::error::Error;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

/// A wall-clock offset or length accepted as `HH:MM:SS`, `MM:SS` or whole seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockTime(u64);

impl ClockTime {
    pub fn from_seconds(seconds: u64) -> Self {
        Self(seconds)
    }

    pub fn seconds(&self) -> u64 {
        self.0
    }
}

impl FromStr for ClockTime {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.trim().split(':').collect();
        if parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(format!("expected HH:MM:SS, MM:SS or seconds, got '{}'", value));
        }
        let mut seconds = 0u64;
        for part in parts {
            let unit = part
                .parse::<u64>()
                .map_err(|_| format!("'{}' is not a whole number in '{}'", part, value))?;
            seconds = seconds * 60 + unit;
        }
        Ok(Self(seconds))
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}:{:02}", self.0 / 3600, (self.0 / 60) % 60, self.0 % 60)
    }
}

#[derive(Clone, Debug, Parser)]
#[command(
    name = "dandere2x",
    version,
    about = "Crash-resumable block-matching video upscaler orchestrator"
)]
pub struct Args {
    /// Source video
    #[arg(short, long, env = "DANDERE2X_INPUT")]
    pub input: PathBuf,

    /// Session workspace; resuming reuses everything already in it
    #[arg(short, long, env = "DANDERE2X_WORKSPACE")]
    pub workspace: PathBuf,

    /// Length of video to process (HH:MM:SS or seconds)
    #[arg(long, env = "DANDERE2X_DURATION")]
    pub duration: ClockTime,

    /// Start offset inside the source video
    #[arg(long, env = "DANDERE2X_TIME_FRAME", default_value = "00:00:00")]
    pub time_frame: ClockTime,

    #[arg(long, env = "DANDERE2X_FRAME_RATE")]
    pub frame_rate: u32,

    /// Audio stream index to extract
    #[arg(long, env = "DANDERE2X_AUDIO_LAYER", default_value_t = 0)]
    pub audio_layer: u32,

    #[arg(long, env = "DANDERE2X_BLOCK_SIZE", default_value_t = 16)]
    pub block_size: u32,

    #[arg(long, env = "DANDERE2X_STEP_SIZE", default_value_t = 4)]
    pub step_size: u32,

    #[arg(long, env = "DANDERE2X_BLEED", default_value_t = 2)]
    pub bleed: u32,

    /// Block similarity tolerance for the matcher
    #[arg(long, env = "DANDERE2X_TOLERANCE", default_value_t = 15.0)]
    pub tolerance: f64,

    #[arg(long, env = "DANDERE2X_NOISE_LEVEL", default_value_t = 3)]
    pub noise_level: u32,

    #[arg(long, env = "DANDERE2X_PROCESS_TYPE", default_value = "noise_scale")]
    pub process_type: String,

    #[arg(long, env = "DANDERE2X_SCALE_FACTOR", default_value_t = 2)]
    pub scale_factor: u32,

    #[arg(long, env = "DANDERE2X_FFMPEG", default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    /// Block-matching executable
    #[arg(long, env = "DANDERE2X_MATCHER")]
    pub matcher: PathBuf,

    #[arg(long, env = "DANDERE2X_DIFFERENCE_TOOL")]
    pub difference_tool: PathBuf,

    #[arg(long, env = "DANDERE2X_MERGE_TOOL")]
    pub merge_tool: PathBuf,

    /// Headless upscaler; without it a script is written for manual upscaling
    #[arg(long, env = "DANDERE2X_UPSCALER")]
    pub upscaler: Option<PathBuf>,

    /// Model script referenced by the manual upscaling script
    #[arg(long, env = "DANDERE2X_WAIFU2X_SCRIPT", default_value = "waifu2x.lua")]
    pub waifu2x_script: PathBuf,

    #[arg(long, env = "DANDERE2X_POLL_INTERVAL", default_value = "10ms")]
    pub poll_interval: humantime::Duration,

    #[arg(long, env = "DANDERE2X_MAX_POLL_INTERVAL", default_value = "500ms")]
    pub max_poll_interval: humantime::Duration,

    /// How long a stage may go without progress before the session aborts
    #[arg(long, env = "DANDERE2X_STALL_TIMEOUT", default_value = "10m")]
    pub stall_timeout: humantime::Duration,
}

impl Args {
    pub fn parse() -> Result<Self, Error> {
        let args = <Self as Parser>::parse();
        args.validate()?;
        Ok(args)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !self.input.is_file() {
            return Err(Error::InvalidConfig(format!(
                "input {} is not a file",
                self.input.display()
            )));
        }
        if self.workspace.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("workspace cannot be empty".to_string()));
        }
        if self.duration.seconds() == 0 {
            return Err(Error::InvalidConfig("duration must be at least one second".to_string()));
        }
        if self.frame_rate == 0 {
            return Err(Error::InvalidConfig("frame rate must be positive".to_string()));
        }
        if self.frame_count() < 2 {
            return Err(Error::InvalidConfig(format!(
                "at least two frames are required, got {}",
                self.frame_count()
            )));
        }
        if self.block_size == 0 || self.step_size == 0 {
            return Err(Error::InvalidConfig("block size and step size must be positive".to_string()));
        }
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(Error::InvalidConfig(format!("invalid tolerance {}", self.tolerance)));
        }
        if self.noise_level > 3 {
            return Err(Error::InvalidConfig(format!(
                "noise level must be 0, 1, 2 or 3, got {}",
                self.noise_level
            )));
        }
        if self.scale_factor == 0 {
            return Err(Error::InvalidConfig("scale factor must be positive".to_string()));
        }
        if self.process_type.trim().is_empty() {
            return Err(Error::InvalidConfig("process type cannot be empty".to_string()));
        }
        if self.poll_interval().is_zero() || self.max_poll_interval() < self.poll_interval() {
            return Err(Error::InvalidConfig(
                "poll interval must be positive and not above the max poll interval".to_string(),
            ));
        }
        Ok(())
    }

    /// The matcher and the per-frame tools must exist before anything is launched.
    pub fn validate_tools(&self) -> Result<(), Error> {
        for (tool, path) in [
            ("block matcher", &self.matcher),
            ("difference tool", &self.difference_tool),
            ("merge tool", &self.merge_tool),
        ] {
            if resolve_executable(path).is_none() {
                return Err(Error::ToolNotFound { tool, path: path.clone() });
            }
        }
        Ok(())
    }

    /// Whole seconds of duration times the frame rate; fixed for the session.
    pub fn frame_count(&self) -> usize {
        self.duration.seconds() as usize * self.frame_rate as usize
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval.into()
    }

    pub fn max_poll_interval(&self) -> Duration {
        self.max_poll_interval.into()
    }

    pub fn stall_timeout(&self) -> Duration {
        self.stall_timeout.into()
    }

    pub fn print_options(&self) {
        tracing::info!("Dandere2x session properties");
        tracing::info!("input:          {}", self.input.display());
        tracing::info!("workspace:      {}", self.workspace.display());
        tracing::info!("time frame:     {}", self.time_frame);
        tracing::info!("duration:       {}", self.duration);
        tracing::info!("frame rate:     {}", self.frame_rate);
        tracing::info!("frame count:    {}", self.frame_count());
        tracing::info!("audio layer:    {}", self.audio_layer);
        tracing::info!("block size:     {}", self.block_size);
        tracing::info!("step size:      {}", self.step_size);
        tracing::info!("bleed:          {}", self.bleed);
        tracing::info!("tolerance:      {}", self.tolerance);
        tracing::info!("noise level:    {}", self.noise_level);
        tracing::info!("process type:   {}", self.process_type);
        tracing::info!("scale factor:   {}", self.scale_factor);
        tracing::info!("matcher:        {}", self.matcher.display());
        tracing::info!("difference:     {}", self.difference_tool.display());
        tracing::info!("merge:          {}", self.merge_tool.display());
        match &self.upscaler {
            Some(upscaler) => tracing::info!("upscaler:       {}", upscaler.display()),
            None => tracing::info!("upscaler:       manual"),
        }
        tracing::info!("stall timeout:  {}", self.stall_timeout);
    }
}

/// Finds an executable either at an explicit path or on `PATH` for bare names.
pub fn resolve_executable(path: &Path) -> Option<PathBuf> {
    if path.components().count() > 1 || path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(path))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_for(input: &Path, extra: &[&str]) -> Args {
        let mut argv = vec![
            "dandere2x".to_string(),
            "--input".to_string(),
            input.display().to_string(),
            "--workspace".to_string(),
            "ws".to_string(),
            "--matcher".to_string(),
            "dandere2x_cpp".to_string(),
            "--difference-tool".to_string(),
            "difference".to_string(),
            "--merge-tool".to_string(),
            "merge".to_string(),
        ];
        argv.extend(extra.iter().map(|s| s.to_string()));
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn clock_time_accepts_all_forms() {
        assert_eq!("10".parse::<ClockTime>().unwrap().seconds(), 10);
        assert_eq!("01:30".parse::<ClockTime>().unwrap().seconds(), 90);
        assert_eq!("01:00:05".parse::<ClockTime>().unwrap().seconds(), 3605);
        assert!("1:2:3:4".parse::<ClockTime>().is_err());
        assert!("ab".parse::<ClockTime>().is_err());
        assert!("10:".parse::<ClockTime>().is_err());
        assert_eq!(ClockTime::from_seconds(3725).to_string(), "01:02:05");
    }

    #[test]
    fn frame_count_is_duration_times_rate() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("video.mkv");
        std::fs::write(&input, b"").unwrap();
        let args = args_for(&input, &["--duration", "10", "--frame-rate", "24"]);
        assert_eq!(args.frame_count(), 240);
        args.validate().unwrap();
    }

    #[test]
    fn invalid_settings_are_rejected_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("video.mkv");
        std::fs::write(&input, b"").unwrap();

        let zero_rate = args_for(&input, &["--duration", "10", "--frame-rate", "0"]);
        assert!(matches!(zero_rate.validate(), Err(Error::InvalidConfig(_))));

        let noisy = args_for(&input, &["--duration", "10", "--frame-rate", "24", "--noise-level", "4"]);
        assert!(matches!(noisy.validate(), Err(Error::InvalidConfig(_))));

        let missing = args_for(&dir.path().join("absent.mkv"), &["--duration", "10", "--frame-rate", "24"]);
        assert!(matches!(missing.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn missing_matcher_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("video.mkv");
        std::fs::write(&input, b"").unwrap();
        let mut args = args_for(&input, &["--duration", "10", "--frame-rate", "24"]);
        args.matcher = dir.path().join("missing").join("dandere2x_cpp");
        assert!(matches!(
            args.validate_tools(),
            Err(Error::ToolNotFound { tool: "block matcher", .. })
        ));
    }
}

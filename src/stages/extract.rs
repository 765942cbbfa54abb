use crate::args::Args;
use crate::error::Error;
use crate::frame::IMAGE_EXTENSION;
use crate::tool;
use crate::workspace::{self, Workspace, INPUTS, PARTIAL_DIR};

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const FFMPEG: &str = "ffmpeg";

/// Splits the requested slice of the source video into audio and numbered frames.
pub struct Extract {
    ffmpeg: PathBuf,
    input_file: PathBuf,
    time_frame: String,
    duration: String,
    frame_rate: u32,
    audio_layer: u32,
    frame_count: usize,
}

impl Extract {
    fn new(args: &Args) -> Self {
        Self {
            ffmpeg: args.ffmpeg.clone(),
            input_file: args.input.clone(),
            time_frame: args.time_frame.to_string(),
            duration: args.duration.to_string(),
            frame_rate: args.frame_rate,
            audio_layer: args.audio_layer,
            frame_count: args.frame_count(),
        }
    }

    fn ffmpeg_command(&self) -> Command {
        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-hide_banner")
            .arg("-y")
            .arg("-ss")
            .arg(&self.time_frame)
            .arg("-i")
            .arg(&self.input_file)
            .arg("-t")
            .arg(&self.duration);
        command
    }

    /// Missing audio is not fatal; the merged frames are still usable on their own.
    fn extract_audio(&self, output: &Path) {
        let result = workspace::prepare_partial(output)
            .map_err(Error::from)
            .and_then(|partial| {
                let mut command = self.ffmpeg_command();
                command
                    .arg("-map")
                    .arg(format!("0:a:{}?", self.audio_layer))
                    .arg("-vn")
                    .arg(&partial);
                tool::run(FFMPEG, &mut command, None)?;
                workspace::commit_partial(output)?;
                Ok(())
            });
        match result {
            Ok(()) => tracing::info!("Audio extracted to {}", output.display()),
            Err(e) => tracing::warn!("Could not extract audio: {}", e),
        }
    }

    /// Frames land in a staging directory that replaces `inputs` in one
    /// rename, so `inputs` is either empty or complete.
    fn extract_frames(&self, workspace: &Workspace) -> Result<usize, Error> {
        let staging = workspace.root().join(PARTIAL_DIR).join(INPUTS);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let mut command = self.ffmpeg_command();
        command
            .arg("-r")
            .arg(self.frame_rate.to_string())
            .arg("-qscale:v")
            .arg("2")
            .arg(staging.join(format!("frame%d.{}", IMAGE_EXTENSION)));
        tool::run(FFMPEG, &mut command, None)?;

        let inputs = workspace.inputs();
        if inputs.exists() {
            fs::remove_dir(&inputs)?;
        }
        fs::rename(&staging, &inputs)?;

        let extracted = workspace.input_frames()?;
        if extracted < self.frame_count {
            tracing::warn!(
                extracted,
                expected = self.frame_count,
                "Video is shorter than the requested duration"
            );
        }
        Ok(extracted)
    }

    fn start(&self, workspace: &Workspace) -> Result<usize, Error> {
        tracing::info!("Extracting audio and frames from {}", self.input_file.display());
        self.extract_audio(&workspace.audio());
        let extracted = self.extract_frames(workspace)?;
        tracing::info!(extracted, "Frames extracted");
        Ok(extracted)
    }

    pub fn execute(args: &Args, workspace: &Workspace) -> Result<usize, Error> {
        Self::new(args).start(workspace)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use clap::Parser;
    use std::os::unix::fs::PermissionsExt;

    /// Writes `count` frames when asked for frames, nothing for audio.
    fn fake_ffmpeg(dir: &Path, count: usize, audio_fails: bool) -> PathBuf {
        let path = dir.join("ffmpeg.sh");
        let audio = if audio_fails { "exit 1" } else { "echo audio > \"$last\"" };
        std::fs::write(
            &path,
            format!(
                "#!/bin/sh\n\
                 for last; do :; done\n\
                 case \"$last\" in\n\
                   *frame%d.jpg) i=1; while [ $i -le {count} ]; do echo jpg > \"$(dirname \"$last\")/frame$i.jpg\"; i=$((i+1)); done;;\n\
                   *) {audio};;\n\
                 esac\n",
                count = count,
                audio = audio,
            ),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn args(dir: &Path, ffmpeg: &Path) -> Args {
        let input = dir.join("video.mkv");
        std::fs::write(&input, b"").unwrap();
        Args::try_parse_from([
            "dandere2x",
            "--input",
            input.to_str().unwrap(),
            "--workspace",
            dir.join("ws").to_str().unwrap(),
            "--duration",
            "1",
            "--frame-rate",
            "6",
            "--matcher",
            "dandere2x_cpp",
            "--difference-tool",
            "difference",
            "--merge-tool",
            "merge",
            "--ffmpeg",
            ffmpeg.to_str().unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn frames_and_audio_land_in_the_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(dir.path().join("ws")).unwrap();
        let args = args(dir.path(), &fake_ffmpeg(dir.path(), 6, false));

        assert_eq!(Extract::execute(&args, &workspace).unwrap(), 6);
        assert!(workspace.input_frame(6).is_file());
        assert!(workspace.audio().is_file());
        assert!(!workspace.root().join(PARTIAL_DIR).join(INPUTS).exists());
    }

    #[test]
    fn audio_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(dir.path().join("ws")).unwrap();
        let args = args(dir.path(), &fake_ffmpeg(dir.path(), 6, true));

        assert_eq!(Extract::execute(&args, &workspace).unwrap(), 6);
        assert!(!workspace.audio().exists());
    }
}

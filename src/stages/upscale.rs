use crate::args::Args;
use crate::error::Error;
use crate::frame;
use crate::session::Session;
use crate::stages::worker::{Corrupt, Outcome, Stage};
use crate::tool;
use crate::workspace::{self, Workspace};

use std::path::{Path, PathBuf};
use std::process::Command;

pub const UPSCALER: &str = "upscaler";

/// How difference images reach `upscaled/`.
#[derive(Clone, Debug)]
pub enum UpscaleStrategy {
    /// A headless upscaler is driven one image at a time.
    Automated(Upscaler),
    /// A script is written and the operator runs the upscaler themselves.
    ManualHandoff { model_script: PathBuf },
}

impl UpscaleStrategy {
    pub fn probe(args: &Args) -> Self {
        match &args.upscaler {
            Some(path) if path.is_file() => UpscaleStrategy::Automated(Upscaler {
                path: path.clone(),
                process_type: args.process_type.clone(),
                noise_level: args.noise_level,
                scale_factor: args.scale_factor,
            }),
            Some(path) => {
                tracing::warn!(
                    "Upscaler {} not found, falling back to manual upscaling",
                    path.display()
                );
                UpscaleStrategy::ManualHandoff { model_script: args.waifu2x_script.clone() }
            }
            None => UpscaleStrategy::ManualHandoff { model_script: args.waifu2x_script.clone() },
        }
    }

    pub fn is_automated(&self) -> bool {
        matches!(self, UpscaleStrategy::Automated(_))
    }
}

#[derive(Clone, Debug)]
pub struct Upscaler {
    pub path: PathBuf,
    pub process_type: String,
    pub noise_level: u32,
    pub scale_factor: u32,
}

impl Upscaler {
    pub fn upscale_file(&self, input: &Path, output: &Path, index: Option<usize>) -> Result<(), Error> {
        let partial = workspace::prepare_partial(output)?;
        let mut command = Command::new(&self.path);
        command
            .arg("-i")
            .arg(input)
            .arg("-o")
            .arg(&partial)
            .arg("-m")
            .arg(&self.process_type)
            .arg("-n")
            .arg(self.noise_level.to_string())
            .arg("-s")
            .arg(self.scale_factor.to_string());
        tool::run(UPSCALER, &mut command, index)?;
        workspace::commit_partial(output)?;
        Ok(())
    }

    /// The first frame has no predecessor to borrow blocks from, so it is
    /// upscaled whole and becomes the seed every merge builds on.
    pub fn upscale_first_frame(&self, workspace: &Workspace) -> Result<(), Error> {
        let seed = workspace.merged_frame(1);
        if seed.is_file() {
            tracing::info!("First frame already upscaled");
            return Ok(());
        }
        tracing::info!("Upscaling first frame");
        self.upscale_file(&workspace.input_frame(1), &seed, Some(1))
    }
}

pub struct Upscale {
    workspace: Workspace,
    upscaler: Upscaler,
    target: usize,
}

impl Upscale {
    pub fn new(session: &Session, upscaler: Upscaler) -> Self {
        Self {
            workspace: session.workspace.clone(),
            upscaler,
            target: session.frame_count - 1,
        }
    }
}

impl Stage for Upscale {
    fn name(&self) -> &'static str {
        "upscale"
    }

    fn target(&self) -> usize {
        self.target
    }

    fn produced(&mut self) -> Result<usize, Error> {
        self.workspace.differences()
    }

    fn consumed(&mut self) -> Result<usize, Error> {
        self.workspace.upscaled_differences()
    }

    fn process(&mut self, index: usize) -> Result<Outcome, Error> {
        let input = self.workspace.difference(index);
        if !input.is_file() {
            return Ok(Outcome::Pending(None));
        }
        if let Err(source) = frame::verify(&input) {
            return Ok(Outcome::Pending(Some(Corrupt { path: input, source })));
        }
        self.upscaler
            .upscale_file(&input, &self.workspace.upscaled_difference(index), Some(index))?;
        Ok(Outcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(dir: &Path, upscaler: Option<&Path>) -> Args {
        let input = dir.join("video.mkv");
        std::fs::write(&input, b"").unwrap();
        let mut argv = vec![
            "dandere2x".to_string(),
            "--input".to_string(),
            input.display().to_string(),
            "--workspace".to_string(),
            dir.join("ws").display().to_string(),
            "--duration".to_string(),
            "1".to_string(),
            "--frame-rate".to_string(),
            "24".to_string(),
            "--matcher".to_string(),
            "dandere2x_cpp".to_string(),
            "--difference-tool".to_string(),
            "difference".to_string(),
            "--merge-tool".to_string(),
            "merge".to_string(),
        ];
        if let Some(upscaler) = upscaler {
            argv.push("--upscaler".to_string());
            argv.push(upscaler.display().to_string());
        }
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn probe_picks_automated_only_for_existing_upscaler() {
        let dir = tempfile::tempdir().unwrap();
        let upscaler = dir.path().join("waifu2x-caffe-cui");
        std::fs::write(&upscaler, b"").unwrap();

        assert!(UpscaleStrategy::probe(&args(dir.path(), Some(&upscaler))).is_automated());
        assert!(!UpscaleStrategy::probe(&args(dir.path(), Some(&dir.path().join("absent")))).is_automated());
        match UpscaleStrategy::probe(&args(dir.path(), None)) {
            UpscaleStrategy::ManualHandoff { model_script } => {
                assert_eq!(model_script, PathBuf::from("waifu2x.lua"))
            }
            other => panic!("expected manual handoff, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn upscaler_output_is_committed_and_seed_is_not_redone() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(dir.path().join("ws")).unwrap();
        let script = dir.path().join("upscaler.sh");
        let calls = dir.path().join("calls");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$@\" >> {}\ncp \"$2\" \"$4\"\n",
                calls.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        image::RgbImage::new(2, 2).save(workspace.input_frame(1)).unwrap();

        let upscaler = Upscaler {
            path: script,
            process_type: "noise_scale".to_string(),
            noise_level: 3,
            scale_factor: 2,
        };
        upscaler.upscale_first_frame(&workspace).unwrap();
        upscaler.upscale_first_frame(&workspace).unwrap();

        assert!(workspace.merged_frame(1).is_file());
        assert!(!workspace::partial_path(&workspace.merged_frame(1)).exists());
        let calls = std::fs::read_to_string(calls).unwrap();
        assert_eq!(calls.lines().count(), 1);
        assert!(calls.contains("-m noise_scale -n 3 -s 2"));
    }
}

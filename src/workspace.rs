//! Workspace layout.
//!
//! The subdirectories double as the progress record of a session: the number
//! of artifacts of a given extension in each of them is the checkpoint every
//! stage resumes from.

use crate::error::Error;
use crate::frame::{self, DATA_EXTENSION, IMAGE_EXTENSION, UPSCALED_EXTENSION};

use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const INPUTS: &str = "inputs";
pub const OUTPUTS: &str = "outputs";
pub const UPSCALED: &str = "upscaled";
pub const MERGED: &str = "merged";
pub const INVERSION_DATA: &str = "inversion_data";
pub const PFRAME_DATA: &str = "pframe_data";
pub const DEBUG: &str = "debug";
pub const LOGS: &str = "logs";

pub const SUBDIRECTORIES: [&str; 8] = [
    INPUTS,
    OUTPUTS,
    UPSCALED,
    MERGED,
    INVERSION_DATA,
    PFRAME_DATA,
    DEBUG,
    LOGS,
];

pub const FRAME_LIST: &str = "frames.txt";
pub const COMMANDS: &str = "commands.txt";
pub const WAIFU2X_SCRIPT: &str = "waifu2x_script.sh";
pub const AUDIO: &str = "audio.mp3";

const LEXICON_WIDTH: usize = 6;
pub const PARTIAL_DIR: &str = ".partial";

#[derive(Clone, Debug)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the root and every subdirectory; existing ones are kept as they are.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let workspace = Self::new(root);
        fs::create_dir_all(&workspace.root)?;
        for name in SUBDIRECTORIES {
            fs::create_dir_all(workspace.root.join(name))?;
        }
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn inputs(&self) -> PathBuf {
        self.dir(INPUTS)
    }

    pub fn outputs(&self) -> PathBuf {
        self.dir(OUTPUTS)
    }

    pub fn upscaled(&self) -> PathBuf {
        self.dir(UPSCALED)
    }

    pub fn merged(&self) -> PathBuf {
        self.dir(MERGED)
    }

    pub fn inversion_data(&self) -> PathBuf {
        self.dir(INVERSION_DATA)
    }

    pub fn pframe_data(&self) -> PathBuf {
        self.dir(PFRAME_DATA)
    }

    pub fn logs(&self) -> PathBuf {
        self.dir(LOGS)
    }

    pub fn audio(&self) -> PathBuf {
        self.root.join(AUDIO)
    }

    pub fn input_frame(&self, index: usize) -> PathBuf {
        self.inputs().join(format!("frame{}.{}", index, IMAGE_EXTENSION))
    }

    pub fn pframe(&self, index: usize) -> PathBuf {
        self.pframe_data().join(format!("pframe_{}.{}", index, DATA_EXTENSION))
    }

    pub fn inversion(&self, index: usize) -> PathBuf {
        self.inversion_data().join(format!("inversion_{}.{}", index, DATA_EXTENSION))
    }

    pub fn difference(&self, index: usize) -> PathBuf {
        self.outputs().join(format!(
            "output_{}.{}",
            frame::lexicon_value(LEXICON_WIDTH, index),
            IMAGE_EXTENSION
        ))
    }

    pub fn upscaled_difference(&self, index: usize) -> PathBuf {
        self.upscaled().join(format!(
            "output_{}.{}",
            frame::lexicon_value(LEXICON_WIDTH, index),
            UPSCALED_EXTENSION
        ))
    }

    pub fn merged_frame(&self, index: usize) -> PathBuf {
        self.merged().join(format!("merged_{}.{}", index, IMAGE_EXTENSION))
    }

    pub fn input_frames(&self) -> Result<usize, Error> {
        count(&self.inputs(), IMAGE_EXTENSION)
    }

    pub fn differences(&self) -> Result<usize, Error> {
        count(&self.outputs(), IMAGE_EXTENSION)
    }

    pub fn upscaled_differences(&self) -> Result<usize, Error> {
        count(&self.upscaled(), UPSCALED_EXTENSION)
    }

    pub fn merged_frames(&self) -> Result<usize, Error> {
        count(&self.merged(), IMAGE_EXTENSION)
    }

    pub fn pframes(&self) -> Result<usize, Error> {
        count(&self.pframe_data(), DATA_EXTENSION)
    }

    /// One expected difference image per line, frames `1..frame_count`.
    pub fn write_frame_list(&self, frame_count: usize) -> Result<PathBuf, Error> {
        let mut frames = String::new();
        for index in 1..frame_count {
            frames.push_str(&self.difference(index).to_string_lossy());
            frames.push('\n');
        }
        let path = self.root.join(FRAME_LIST);
        write_atomic(&path, frames.as_bytes())?;
        Ok(path)
    }

    /// Remux commands for the operator to run once the session is complete.
    pub fn write_commands(&self, frame_rate: u32) -> Result<PathBuf, Error> {
        let no_sound = self.root.join("nosound.mp4");
        let sound = self.root.join("sound.mp4");
        let commands = format!(
            "Run these commands after runtime to remerge the videos at your own leisure.\n\
             ffmpeg -f image2 -framerate {rate} -i {merged} -r {rate} {no_sound}\n\
             ffmpeg -i {no_sound} -i {audio} -c copy {sound}\n",
            rate = frame_rate,
            merged = self.merged().join(format!("merged_%d.{}", IMAGE_EXTENSION)).display(),
            no_sound = no_sound.display(),
            audio = self.audio().display(),
            sound = sound.display(),
        );
        let path = self.root.join(COMMANDS);
        write_atomic(&path, commands.as_bytes())?;
        Ok(path)
    }

    /// Script for platforms where the upscaler cannot be driven headlessly.
    pub fn write_waifu2x_script(
        &self,
        model_script: &Path,
        process_type: &str,
        noise_level: u32,
    ) -> Result<PathBuf, Error> {
        let script = format!(
            "#!/bin/sh\n\
             th {model} -m {process_type} -noise_level {noise} -i {first} -o {merged}\n\
             th {model} -m {process_type} -noise_level {noise} -resume 1 -l {list} -o {upscaled}\n",
            model = model_script.display(),
            process_type = process_type,
            noise = noise_level,
            first = self.input_frame(1).display(),
            merged = self.merged_frame(1).display(),
            list = self.root.join(FRAME_LIST).display(),
            upscaled = self
                .upscaled()
                .join(format!("output_%0{}d.{}", LEXICON_WIDTH, UPSCALED_EXTENSION))
                .display(),
        );
        let path = self.root.join(WAIFU2X_SCRIPT);
        let partial = prepare_partial(&path)?;
        write_file(&partial, script.as_bytes())?;
        make_executable(&partial)?;
        fs::rename(&partial, &path)?;
        Ok(path)
    }
}

/// Regular files in `dir` with exactly `extension`; a missing directory counts as empty.
pub fn count(dir: &Path, extension: &str) -> Result<usize, Error> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut total = 0;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(extension) && entry.file_type()?.is_file() {
            total += 1;
        }
    }
    Ok(total)
}

/// Temp location for `path`: same file name inside a hidden sibling directory,
/// so tools still see the real extension and directory counts never include it.
pub fn partial_path(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path.file_name().map(OsString::from).unwrap_or_default();
    parent.join(PARTIAL_DIR).join(name)
}

/// Returns the temp location for `path` with its directory created.
pub fn prepare_partial(path: &Path) -> io::Result<PathBuf> {
    let partial = partial_path(path);
    if let Some(dir) = partial.parent() {
        fs::create_dir_all(dir)?;
    }
    Ok(partial)
}

/// Writes to a temp name and renames into place so readers never see a partial file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let partial = prepare_partial(path)?;
    write_file(&partial, contents)?;
    fs::rename(&partial, path)
}

/// Moves a finished temp artifact into its final name.
pub fn commit_partial(path: &Path) -> io::Result<()> {
    fs::rename(partial_path(path), path)
}

/// Removes a file, treating an already absent one as removed.
pub fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn write_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o775))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

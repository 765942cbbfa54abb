use crate::error::Error;

use std::io::{self, Read};
use std::process::{Command, Stdio};

const STDERR_TAIL: usize = 2048;

/// Runs one unit of work in an external tool and waits for it to finish.
/// Stdout is discarded and only the end of stderr is kept for the log.
pub fn run(tool: &'static str, command: &mut Command, index: Option<usize>) -> Result<(), Error> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| Error::Launch { tool, source })?;

    let tail = match child.stderr.take() {
        Some(stderr) => read_tail(stderr, STDERR_TAIL),
        None => Ok(Vec::new()),
    };
    let tail = match tail {
        Ok(tail) => tail,
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e.into());
        }
    };
    let status = child.wait()?;

    if status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&tail);
    tracing::warn!(tool, index, %status, stderr = %stderr.trim(), "external tool failed");

    Err(Error::ToolFailed { tool, index, status })
}

/// Drains `reader` to the end, keeping only its last `limit` bytes.
fn read_tail(mut reader: impl Read, limit: usize) -> io::Result<Vec<u8>> {
    let mut tail = Vec::with_capacity(limit * 2);
    let mut chunk = [0u8; 4096];
    loop {
        let read = match reader.read(&mut chunk) {
            Ok(0) => return Ok(tail),
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        tail.extend_from_slice(&chunk[..read]);
        if tail.len() > limit {
            let excess = tail.len() - limit;
            tail.drain(..excess);
        }
    }
}

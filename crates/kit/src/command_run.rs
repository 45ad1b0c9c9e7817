use std::io::{Read, Seek};
use std::process::Command;

use color_eyre::eyre::{eyre, Context, Result};

/// Helpers intended for [`std::process::Command`].
pub(crate) trait CommandRun {
    /// Execute the child process, returning an error carrying the tail of
    /// its stderr if it exits abnormally.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process and capture its stdout as raw bytes.
    fn run_get_bytes(&mut self) -> Result<Vec<u8>>;
}

fn last_utf8_content_from_file(mut f: std::fs::File) -> String {
    // Keep only the tail; tar can be chatty about every member.
    const MAX_STDERR_BYTES: u16 = 1024;
    let size = f
        .metadata()
        .map_err(|e| {
            tracing::warn!("failed to fstat: {e}");
        })
        .map(|m| m.len().try_into().unwrap_or(u16::MAX))
        .unwrap_or(0);
    let size = size.min(MAX_STDERR_BYTES);
    let mut buf = Vec::with_capacity(size.into());
    match f
        .seek(std::io::SeekFrom::End(-i64::from(size)))
        .and_then(|_| f.read_to_end(&mut buf))
    {
        Ok(_) => String::from_utf8_lossy(&buf).into_owned(),
        Err(e) => {
            tracing::warn!("failed seek+read: {e}");
            "<failed to read stderr>".into()
        }
    }
}

impl CommandRun for Command {
    fn run(&mut self) -> Result<()> {
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        tracing::trace!("exec: {self:?}");
        let program = self.get_program().to_string_lossy().into_owned();
        let status = self
            .status()
            .with_context(|| format!("Failed to execute {program}"))?;
        if status.success() {
            return Ok(());
        }
        let tail = last_utf8_content_from_file(stderr);
        Err(eyre!("{program} failed: {status:?}\n{tail}"))
    }

    fn run_get_bytes(&mut self) -> Result<Vec<u8>> {
        let mut stdout = tempfile::tempfile()?;
        self.stdout(stdout.try_clone()?);
        self.run()?;
        stdout.seek(std::io::SeekFrom::Start(0)).context("seek")?;
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

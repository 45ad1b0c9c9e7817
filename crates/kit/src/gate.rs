//! Run-once gate backed by a persistent completion marker.
//!
//! The marker is written only after a confirmed remote success, and only
//! ever atomically, so a crash mid-write can never leave a half-initialized
//! record. Nothing in this tool removes it; deleting the file by hand is the
//! way to force another configuration run.

use std::io::Read;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use serde::{Deserialize, Serialize};

/// Default location of the completion marker.
pub(crate) const DEFAULT_STATE_FILE: &str = "/var/lib/vmseed/initialized";

const RECORD_VERSION: u32 = 1;

/// Contents of the completion marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CompletionRecord {
    pub(crate) version: u32,
    /// Seconds since the Unix epoch.
    pub(crate) created_at: u64,
    /// VM-side units that ran, in order.
    #[serde(default)]
    pub(crate) units: Vec<String>,
}

impl CompletionRecord {
    pub(crate) fn new(units: Vec<String>) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            version: RECORD_VERSION,
            created_at,
            units,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InitState {
    Uninitialized,
    /// The record is `None` when the marker exists but cannot be parsed;
    /// presence alone closes the gate.
    Initialized(Option<CompletionRecord>),
}

#[derive(Debug, Clone)]
pub(crate) struct RunOnceGate {
    path: Utf8PathBuf,
}

impl RunOnceGate {
    pub(crate) fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn split(&self) -> Result<(&Utf8Path, &str)> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."));
        let name = self
            .path
            .file_name()
            .ok_or_else(|| eyre!("State file path has no file name: {}", self.path))?;
        Ok((parent, name))
    }

    pub(crate) fn state(&self) -> Result<InitState> {
        let (parent, name) = self.split()?;
        let dir = match Dir::open_ambient_dir(parent, cap_std::ambient_authority()) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(InitState::Uninitialized)
            }
            Err(e) => return Err(e).with_context(|| format!("Opening {parent}")),
        };
        let Some(mut f) = dir
            .open_optional(name)
            .with_context(|| format!("Opening {}", self.path))?
        else {
            return Ok(InitState::Uninitialized);
        };
        let mut buf = String::new();
        f.read_to_string(&mut buf)
            .with_context(|| format!("Reading {}", self.path))?;
        match serde_json::from_str::<CompletionRecord>(&buf) {
            Ok(record) => Ok(InitState::Initialized(Some(record))),
            Err(e) => {
                tracing::warn!("Unparseable completion marker {}: {e}", self.path);
                Ok(InitState::Initialized(None))
            }
        }
    }

    pub(crate) fn is_initialized(&self) -> Result<bool> {
        Ok(matches!(self.state()?, InitState::Initialized(_)))
    }

    /// Persist the marker atomically, creating parent directories.
    pub(crate) fn mark_initialized(&self, record: &CompletionRecord) -> Result<()> {
        let (parent, name) = self.split()?;
        std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
        let dir = Dir::open_ambient_dir(parent, cap_std::ambient_authority())
            .with_context(|| format!("Opening {parent}"))?;
        let mut content = serde_json::to_vec_pretty(record)?;
        content.push(b'\n');
        dir.atomic_write(name, content)
            .with_context(|| format!("Writing {}", self.path))?;
        tracing::info!("Marked VM initialized at {}", self.path);
        Ok(())
    }
}

//! Common CLI options shared across commands

use std::fmt;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::boot::DEFAULT_BOOT_PROMPT;
use crate::bundle::BundleSources;
use crate::gate::{RunOnceGate, DEFAULT_STATE_FILE};
use crate::remote::{RemoteCapability, RemoteContract, DEFAULT_WORKDIR};
use crate::script::{validate_hostname, EnvFile};

pub const DEFAULT_MEMORY_USER_STR: &str = "512M";

/// Memory size options
#[derive(Parser, Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryOpts {
    #[clap(
        long,
        default_value = DEFAULT_MEMORY_USER_STR,
        env = "VMSEED_MEMORY",
        help = "Memory size (e.g. 1G, 512M, or plain number for MB)"
    )]
    pub memory: String,
}

impl MemoryOpts {
    pub fn memory_mb(&self) -> color_eyre::Result<u32> {
        crate::utils::parse_memory_to_mb(&self.memory)
    }
}

impl fmt::Display for MemoryOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.memory)
    }
}

/// Hypervisor options, passed through without interpretation.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct VmOpts {
    #[clap(flatten)]
    pub memory: MemoryOpts,

    /// Number of virtual CPUs
    #[clap(long, default_value_t = 1, env = "VMSEED_VCPUS")]
    pub vcpus: u32,

    /// QEMU system emulator to run
    #[clap(long, default_value = "qemu-system-x86_64", env = "VMSEED_QEMU")]
    pub qemu_binary: String,

    /// Disk image format (raw, qcow2, ...)
    #[clap(long, default_value = "raw")]
    pub image_format: String,
}

/// What goes into the configuration bundle and how the guest decodes it.
#[derive(Parser, Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleOpts {
    /// Directory of container-side units
    #[clap(long)]
    pub container_scripts: Option<Utf8PathBuf>,

    /// Directory of additional VM-side units
    #[clap(long)]
    pub vm_scripts: Option<Utf8PathBuf>,

    /// Directory of VM-side units replacing same-named defaults
    #[clap(long)]
    pub overrides: Option<Utf8PathBuf>,

    /// Do not include the built-in VM-side units
    #[clap(long, env = "VMSEED_NO_DEFAULT_SCRIPTS")]
    pub no_default_scripts: bool,

    /// Hostname applied by the built-in units
    #[clap(long, env = "VMSEED_HOSTNAME")]
    pub hostname: Option<String>,

    /// Root password applied by the built-in units
    #[clap(long, env = "VMSEED_ROOT_PASSWORD", hide_env_values = true)]
    #[serde(skip_serializing)]
    pub root_password: Option<String>,

    /// How the guest decodes the payload
    #[clap(long, value_enum, default_value_t)]
    pub decoder: RemoteCapability,

    /// Guest directory used to receive and unpack the bundle
    #[clap(long, default_value = DEFAULT_WORKDIR)]
    pub workdir: String,
}

impl BundleOpts {
    pub(crate) fn sources(&self) -> Result<BundleSources> {
        let mut env = EnvFile::new();
        if let Some(hostname) = &self.hostname {
            validate_hostname(hostname)?;
            env.set("VMSEED_HOSTNAME", hostname)?;
        }
        if let Some(password) = &self.root_password {
            env.set("VMSEED_ROOT_PASSWORD", password)?;
        }
        Ok(BundleSources {
            container_scripts: self.container_scripts.clone(),
            vm_scripts: self.vm_scripts.clone(),
            overrides: self.overrides.clone(),
            include_defaults: !self.no_default_scripts,
            env,
        })
    }

    pub(crate) fn contract(&self) -> RemoteContract {
        RemoteContract::new(self.workdir.as_str(), self.decoder)
    }
}

/// Location of the completion marker
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct StateOpts {
    /// Completion marker; while it exists the bootstrap is skipped
    #[clap(long, default_value = DEFAULT_STATE_FILE, env = "VMSEED_STATE_FILE")]
    pub state_file: Utf8PathBuf,
}

impl StateOpts {
    pub(crate) fn gate(&self) -> RunOnceGate {
        RunOnceGate::new(self.state_file.clone())
    }
}

/// Options of one bootstrap protocol run
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolOpts {
    #[clap(flatten)]
    pub bundle: BundleOpts,

    #[clap(flatten)]
    pub state: StateOpts,

    /// Overall deadline for the bootstrap, in seconds
    #[clap(
        long,
        default_value_t = 300,
        env = "VMSEED_TIMEOUT",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub timeout: u64,

    /// Console line signalling that the guest is interactive
    #[clap(long, default_value = DEFAULT_BOOT_PROMPT)]
    pub boot_prompt: String,

    /// Record the raw console transcript to this file
    #[clap(long)]
    pub console_log: Option<Utf8PathBuf>,
}

impl ProtocolOpts {
    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

//! QEMU process configuration and spawning.
//!
//! Two boots share one configuration: the bootstrap boot wires the serial
//! console to our UNIX socket and refuses to reboot, so `poweroff` ends the
//! process; the steady-state boot hands the console to our own stdio.

use std::process::Stdio;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Context;
use color_eyre::Result;
use tokio::process::{Child, Command};

use crate::common_opts::VmOpts;

/// chardev id of the bootstrap console.
pub(crate) const CONSOLE_CHARDEV_ID: &str = "vmseed0";

/// Where the guest's first serial port goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConsoleWiring {
    /// Connect as a client to our listening socket.
    Socket(Utf8PathBuf),
    /// Multiplex console and monitor on our stdio.
    Stdio,
}

#[derive(Debug, Clone)]
pub(crate) struct QemuConfig {
    binary: String,
    memory_mb: u32,
    vcpus: u32,
    image: Utf8PathBuf,
    image_format: String,
    console: ConsoleWiring,
    no_reboot: bool,
    extra_args: Vec<String>,
}

impl QemuConfig {
    pub(crate) fn new(opts: &VmOpts, image: &Utf8Path) -> Result<Self> {
        Ok(Self {
            binary: opts.qemu_binary.clone(),
            memory_mb: opts.memory.memory_mb()?,
            vcpus: opts.vcpus,
            image: image.to_owned(),
            image_format: opts.image_format.clone(),
            console: ConsoleWiring::Stdio,
            no_reboot: false,
            extra_args: Vec::new(),
        })
    }

    /// Configure for the one-shot bootstrap boot over `socket`.
    pub(crate) fn bootstrap(mut self, socket: &Utf8Path) -> Self {
        self.console = ConsoleWiring::Socket(socket.to_owned());
        self.no_reboot = true;
        self
    }

    /// Configure for the long-running boot.
    pub(crate) fn steady_state(mut self) -> Self {
        self.console = ConsoleWiring::Stdio;
        self.no_reboot = false;
        self
    }

    /// Arguments passed through verbatim after ours.
    pub(crate) fn extra_args(mut self, args: &[String]) -> Self {
        self.extra_args = args.to_vec();
        self
    }

    pub(crate) fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-m".to_owned(),
            self.memory_mb.to_string(),
            "-smp".to_owned(),
            self.vcpus.to_string(),
            "-display".to_owned(),
            "none".to_owned(),
            "-drive".to_owned(),
            format!(
                "file={},format={},if=virtio",
                escape_option_value(self.image.as_str()),
                self.image_format
            ),
        ];
        match &self.console {
            ConsoleWiring::Socket(path) => {
                args.push("-chardev".to_owned());
                args.push(format!(
                    "socket,id={CONSOLE_CHARDEV_ID},path={}",
                    escape_option_value(path.as_str())
                ));
                args.push("-serial".to_owned());
                args.push(format!("chardev:{CONSOLE_CHARDEV_ID}"));
                args.push("-monitor".to_owned());
                args.push("none".to_owned());
            }
            ConsoleWiring::Stdio => {
                args.push("-serial".to_owned());
                args.push("mon:stdio".to_owned());
            }
        }
        if self.no_reboot {
            args.push("-no-reboot".to_owned());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    pub(crate) fn spawn(&self) -> Result<Child> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args()).kill_on_drop(true);
        if matches!(self.console, ConsoleWiring::Socket(_)) {
            // The guest console is ours; keep the terminal out of it.
            cmd.stdin(Stdio::null());
        }
        tracing::debug!("exec: {cmd:?}");
        cmd.spawn()
            .with_context(|| format!("Failed to spawn {}", self.binary))
    }
}

/// QEMU option values use `,` as separator; a literal comma is doubled.
fn escape_option_value(v: &str) -> String {
    v.replace(',', ",,")
}

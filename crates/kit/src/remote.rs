//! The guest-side half of the protocol.
//!
//! The guest runs this logic, but its shape is fixed here: the marker
//! grammar, the decode capability the guest must provide, and the scripts
//! that merge and run the manifest.
//!
//! On receipt the guest must:
//!
//! 1. decode the payload using the declared [`RemoteCapability`],
//! 2. unpack it and merge `defaults` then `overrides` for each subset, so an
//!    override replaces a default of the same name,
//! 3. run every unit of the `vm` subset in byte-wise sorted order, stopping
//!    at the first failure,
//! 4. print exactly one [`RESULT_PREFIX`] line, then power off.
//!
//! The scripts build both marker prefixes from fragments at runtime, so
//! command text echoed by the console can never be mistaken for a marker.

use clap::ValueEnum;
use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::script::{quote, ShellScript};

/// Prefix of the single terminating line reporting aggregate status.
pub(crate) const RESULT_PREFIX: &str = "VMSEED-RESULT:";
/// Prefix of the per-unit progress lines.
pub(crate) const PROGRESS_PREFIX: &str = "VMSEED-UNIT:";
pub(crate) const SUCCESS_TOKEN: &str = "OK";
pub(crate) const FAILURE_TOKEN: &str = "FAILED";

/// Guest directory where the payload is received and unpacked.
pub(crate) const DEFAULT_WORKDIR: &str = "/tmp/vmseed";

const DECODER_LUA: &str = include_str!("../scripts/b64.lua");
const APPLY_TEMPLATE: &str = include_str!("../scripts/apply.sh");

/// How the guest turns base64 text back into bytes.
///
/// Minimal images frequently lack a `base64` applet; `lua` is the
/// general-purpose interpreter assumed present on those.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteCapability {
    /// Decode with a Lua program shipped in the preamble
    #[default]
    Lua,
    /// Decode with `base64 -d`
    Base64Util,
}

impl RemoteCapability {
    /// Binary probed with `command -v` before decoding.
    pub(crate) fn probe_binary(&self) -> &'static str {
        match self {
            RemoteCapability::Lua => "lua",
            RemoteCapability::Base64Util => "base64",
        }
    }

    /// Decoder program that must be installed in the workdir, if any.
    fn decoder_program(&self) -> Option<(&'static str, &'static str)> {
        match self {
            RemoteCapability::Lua => Some(("b64.lua", DECODER_LUA)),
            RemoteCapability::Base64Util => None,
        }
    }

    /// Shell fragment reading base64 on stdin and writing bytes on stdout.
    /// `$W` is the workdir variable of the apply script.
    fn decode_command(&self) -> &'static str {
        match self {
            RemoteCapability::Lua => "lua \"$W/b64.lua\"",
            RemoteCapability::Base64Util => "base64 -d",
        }
    }
}

/// Guest-side layout and decode capability for one run.
#[derive(Debug, Clone)]
pub(crate) struct RemoteContract {
    pub(crate) workdir: String,
    pub(crate) capability: RemoteCapability,
}

impl RemoteContract {
    pub(crate) fn new(workdir: impl Into<String>, capability: RemoteCapability) -> Self {
        Self {
            workdir: workdir.into(),
            capability,
        }
    }

    fn path(&self, name: &str) -> String {
        format!("{}/{}", self.workdir.trim_end_matches('/'), name)
    }

    /// The apply script with workdir and decoder substituted.
    pub(crate) fn apply_script(&self) -> Result<String> {
        Ok(APPLY_TEMPLATE
            .replace("{WORKDIR}", &quote(&self.workdir)?)
            .replace("{DECODER_BIN}", self.capability.probe_binary())
            .replace("{DECODE_CMD}", self.capability.decode_command()))
    }

    /// Segment 1: install the decoder, then read exactly `payload_len` raw
    /// bytes from the console into `bundle.b64`.
    pub(crate) fn preamble(&self, payload_len: usize) -> Result<ShellScript> {
        let mut s = ShellScript::new();
        s.raw("stty -echo 2>/dev/null");
        s.cmd(["mkdir", "-p", &self.workdir])?;
        if let Some((name, program)) = self.capability.decoder_program() {
            s.write_file(&self.path(name), program)?;
        }
        // Raw mode lifts the canonical line-length limit only for bytes that
        // reach the tty after this line has run. The body travels in the same
        // write, so body bytes queued while the tty is still canonical are
        // capped at the line limit (4095 on Linux) and the excess is dropped;
        // dd then stalls until the deadline. dd reads bytewise so nothing
        // past the payload is swallowed.
        s.raw("stty raw -echo 2>/dev/null");
        let of = format!("of={}", self.path("bundle.b64"));
        let count = format!("count={payload_len}");
        s.cmd(["dd", &of, "bs=1", &count])?;
        Ok(s)
    }

    /// Segment 3: restore the tty, install and run the apply script, power off.
    pub(crate) fn trailer(&self) -> Result<ShellScript> {
        let mut s = ShellScript::new();
        s.raw("stty sane -echo 2>/dev/null");
        let apply = self.path("apply.sh");
        s.write_file(&apply, &self.apply_script()?)?;
        s.raw(format!("sh {}; sync; poweroff", quote(&apply)?));
        Ok(s)
    }
}

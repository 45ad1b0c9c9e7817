//! Payload packaging.
//!
//! Configuration units from several host directories are staged into one
//! tree, archived with `tar -z`, and encoded as a single unwrapped base64
//! line. The result is the three console segments: decoder preamble,
//! payload body, and the trailer that applies the bundle.
//!
//! Staged layout:
//!
//! ```text
//! env
//! container/defaults/   --container-scripts
//! container/overrides/
//! vm/defaults/          built-in units, then --vm-scripts
//! vm/overrides/         --overrides
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::debug;

use crate::command_run::CommandRun;
use crate::error::BootstrapError;
use crate::remote::RemoteContract;
use crate::script::EnvFile;

/// VM-side units compiled into the binary, omitted with `--no-default-scripts`.
pub(crate) const DEFAULT_VM_UNITS: &[(&str, &str)] = &[
    ("10-hostname", include_str!("../scripts/vm/10-hostname")),
    ("20-password", include_str!("../scripts/vm/20-password")),
    ("30-firewall", include_str!("../scripts/vm/30-firewall")),
    ("40-network-wait", include_str!("../scripts/vm/40-network-wait")),
    ("50-disk-resize", include_str!("../scripts/vm/50-disk-resize")),
];

/// Where the units of one bundle come from.
#[derive(Debug, Default)]
pub(crate) struct BundleSources {
    pub(crate) container_scripts: Option<Utf8PathBuf>,
    pub(crate) vm_scripts: Option<Utf8PathBuf>,
    pub(crate) overrides: Option<Utf8PathBuf>,
    pub(crate) include_defaults: bool,
    pub(crate) env: EnvFile,
}

/// Unit names in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct ScriptManifest {
    units: Vec<String>,
}

impl ScriptManifest {
    /// Merge layers; a later layer's unit replaces an earlier one of the same
    /// name, so only the names matter for ordering.
    fn merge<'a>(layers: impl IntoIterator<Item = &'a [String]>) -> Self {
        let set: BTreeSet<&String> = layers.into_iter().flatten().collect();
        Self {
            units: set.into_iter().cloned().collect(),
        }
    }

    pub(crate) fn units(&self) -> &[String] {
        &self.units
    }

    pub(crate) fn len(&self) -> usize {
        self.units.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Reject names the guest could not run as a single word.
///
/// The apply script expands names unquoted, so glob characters are refused
/// along with whitespace.
pub(crate) fn validate_unit_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains(['*', '?', '['])
        || name.chars().any(|c| c.is_whitespace() || c.is_control());
    if bad {
        return Err(BootstrapError::precondition(format!("invalid unit name: {name:?}")).into());
    }
    Ok(())
}

/// A staged bundle tree; removed when dropped.
#[derive(Debug)]
pub(crate) struct StagedBundle {
    dir: tempfile::TempDir,
    pub(crate) manifest: ScriptManifest,
    pub(crate) container_units: ScriptManifest,
}

impl StagedBundle {
    pub(crate) fn path(&self) -> Result<&Utf8Path> {
        Utf8Path::from_path(self.dir.path()).ok_or_else(|| eyre!("Staging path is not valid UTF-8"))
    }

    /// Compress the staged tree.
    pub(crate) fn archive(&self) -> Result<Vec<u8>> {
        Command::new("tar")
            .args(["-C", self.path()?.as_str(), "-czf", "-", "."])
            .run_get_bytes()
            .context("Archiving configuration bundle")
    }
}

fn ensure_source_dir(path: &Utf8Path) -> Result<()> {
    let meta = fs::metadata(path)
        .map_err(|e| BootstrapError::precondition(format!("{path}: {e}")))?;
    if !meta.is_dir() {
        return Err(BootstrapError::precondition(format!("{path}: not a directory")).into());
    }
    fs::read_dir(path).map_err(|e| BootstrapError::precondition(format!("{path}: {e}")))?;
    Ok(())
}

/// Copy the contents of `src` into `dest`, returning the top-level entry names.
///
/// When `units_only` is set every top-level entry must be a regular file with
/// a valid unit name.
fn copy_layer(src: &Utf8Path, dest: &Utf8Path, units_only: bool) -> Result<Vec<String>> {
    ensure_source_dir(src)?;
    let mut names = Vec::new();
    for entry in src
        .read_dir_utf8()
        .map_err(|e| BootstrapError::precondition(format!("{src}: {e}")))?
    {
        let entry = entry.map_err(|e| BootstrapError::precondition(format!("{src}: {e}")))?;
        let name = entry.file_name().to_owned();
        let target = dest.join(&name);
        // Follow symlinks: the guest gets the content, not the link.
        let meta = fs::metadata(entry.path())
            .map_err(|e| BootstrapError::precondition(format!("{}: {e}", entry.path())))?;
        if meta.is_dir() {
            if units_only {
                return Err(BootstrapError::precondition(format!(
                    "{}: unit directories may only contain files",
                    entry.path()
                ))
                .into());
            }
            fs::create_dir_all(&target)?;
            copy_layer(entry.path(), &target, false)?;
        } else {
            if units_only {
                validate_unit_name(&name)?;
            }
            fs::copy(entry.path(), &target)
                .map_err(|e| BootstrapError::precondition(format!("{}: {e}", entry.path())))?;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

/// Stage every source into a fresh temporary tree.
pub(crate) fn stage(sources: &BundleSources) -> Result<StagedBundle> {
    let dir = tempfile::Builder::new().prefix("vmseed-bundle").tempdir()?;
    let root = Utf8PathBuf::from_path_buf(dir.path().to_owned())
        .map_err(|p| eyre!("Staging path is not valid UTF-8: {}", p.display()))?;

    for sub in [
        "container/defaults",
        "container/overrides",
        "vm/defaults",
        "vm/overrides",
    ] {
        fs::create_dir_all(root.join(sub))?;
    }
    fs::write(root.join("env"), sources.env.render())?;

    let mut builtin = Vec::new();
    if sources.include_defaults {
        for (name, content) in DEFAULT_VM_UNITS {
            fs::write(root.join("vm/defaults").join(name), content)?;
            builtin.push((*name).to_owned());
        }
    }

    let vm_defaults = match &sources.vm_scripts {
        Some(p) => copy_layer(p, &root.join("vm/defaults"), true)?,
        None => Vec::new(),
    };
    let vm_overrides = match &sources.overrides {
        Some(p) => copy_layer(p, &root.join("vm/overrides"), true)?,
        None => Vec::new(),
    };
    let container = match &sources.container_scripts {
        Some(p) => copy_layer(p, &root.join("container/defaults"), false)?,
        None => Vec::new(),
    };

    let manifest = ScriptManifest::merge([
        builtin.as_slice(),
        vm_defaults.as_slice(),
        vm_overrides.as_slice(),
    ]);
    debug!(
        "Staged bundle at {root}: {} VM units, {} container entries, env {:?}",
        manifest.len(),
        container.len(),
        sources.env.names().collect::<Vec<_>>()
    );
    Ok(StagedBundle {
        dir,
        manifest,
        container_units: ScriptManifest::merge([container.as_slice()]),
    })
}

/// The channel-safe text transform.
pub(crate) fn encode(bytes: &[u8]) -> String {
    data_encoding::BASE64.encode(bytes)
}

#[cfg(test)]
pub(crate) fn decode(text: &str) -> Result<Vec<u8>> {
    data_encoding::BASE64
        .decode(text.trim().as_bytes())
        .map_err(|e| eyre!("Invalid base64 payload: {e}"))
}

/// The three console segments of one transfer, in write order.
#[derive(Debug)]
pub(crate) struct Payload {
    pub(crate) preamble: String,
    pub(crate) body: String,
    pub(crate) trailer: String,
    pub(crate) manifest: ScriptManifest,
}

impl Payload {
    pub(crate) fn segments(&self) -> [&str; 3] {
        [&self.preamble, &self.body, &self.trailer]
    }

    pub(crate) fn len(&self) -> usize {
        self.segments().iter().map(|s| s.len()).sum()
    }

    /// Write the segments and the manifest into `dir` for inspection.
    pub(crate) fn write_to(&self, dir: &Utf8Path) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("Creating {dir}"))?;
        let mut manifest = self.manifest.units().join("\n");
        if !manifest.is_empty() {
            manifest.push('\n');
        }
        for (name, content) in [
            ("preamble.txt", self.preamble.as_str()),
            ("body.b64", self.body.as_str()),
            ("trailer.txt", self.trailer.as_str()),
            ("manifest.txt", manifest.as_str()),
        ] {
            let path = dir.join(name);
            fs::write(&path, content).with_context(|| format!("Writing {path}"))?;
        }
        Ok(())
    }
}

/// Build the full transfer for `sources` under `contract`.
///
/// All precondition failures surface here, before anything is written to
/// the console.
pub(crate) fn package(sources: &BundleSources, contract: &RemoteContract) -> Result<Payload> {
    let staged = stage(sources)?;
    if staged.manifest.is_empty() {
        tracing::warn!("Bundle contains no VM-side units");
    }
    let archive = staged.archive()?;
    let encoded = encode(&archive);
    debug!(
        "Archive {} bytes, encoded {} bytes, {} container entries",
        archive.len(),
        encoded.len(),
        staged.container_units.len()
    );
    let preamble = contract.preamble(encoded.len())?;
    let trailer = contract.trailer()?;
    debug!(
        "Preamble {} commands, trailer {} commands",
        preamble.len(),
        trailer.len()
    );
    let (preamble, trailer) = (preamble.render(), trailer.render());
    let mut body = encoded;
    body.push('\n');
    Ok(Payload {
        preamble,
        body,
        trailer,
        manifest: staged.manifest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{RemoteCapability, RESULT_PREFIX};

    fn write_unit(dir: &Utf8Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let p = Utf8PathBuf::from_path_buf(td.path().to_owned()).unwrap();
        (td, p)
    }

    #[test]
    fn test_encode_roundtrip() {
        let all: Vec<u8> = (0..=255u8).collect();
        for sample in [&b""[..], &b"f"[..], &b"fo"[..], &b"foo"[..], &all[..]] {
            let text = encode(sample);
            assert!(!text.contains('\n'));
            assert_eq!(decode(&text).unwrap(), sample);
        }
    }

    #[test]
    fn test_unit_names() {
        assert!(validate_unit_name("10-hostname").is_ok());
        assert!(validate_unit_name("99_local.sh").is_ok());
        for bad in [
            "",
            ".hidden",
            "a/b",
            "has space",
            "tab\tname",
            "10-*",
            "20-?",
            "30-[ab]",
        ] {
            assert!(validate_unit_name(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn test_manifest_merge_sorted_and_deduplicated() {
        let a = vec!["20-b".to_owned(), "10-a".to_owned()];
        let b = vec!["15-x".to_owned(), "20-b".to_owned()];
        let m = ScriptManifest::merge([a.as_slice(), b.as_slice()]);
        assert_eq!(m.units(), ["10-a", "15-x", "20-b"]);
    }

    #[test]
    fn test_stage_defaults_and_overrides() {
        let (_td, dir) = utf8_tempdir();
        let vm = dir.join("vm");
        let ov = dir.join("overrides");
        fs::create_dir_all(&vm).unwrap();
        fs::create_dir_all(&ov).unwrap();
        write_unit(&vm, "60-extra", "true\n");
        write_unit(&ov, "30-firewall", "echo custom\n");

        let sources = BundleSources {
            vm_scripts: Some(vm),
            overrides: Some(ov),
            include_defaults: true,
            ..Default::default()
        };
        let staged = stage(&sources).unwrap();
        assert_eq!(
            staged.manifest.units(),
            [
                "10-hostname",
                "20-password",
                "30-firewall",
                "40-network-wait",
                "50-disk-resize",
                "60-extra"
            ]
        );
        let root = staged.path().unwrap();
        assert_eq!(
            fs::read_to_string(root.join("vm/overrides/30-firewall")).unwrap(),
            "echo custom\n"
        );
        assert!(root.join("vm/defaults/30-firewall").exists());
        assert!(root.join("env").exists());
    }

    #[test]
    fn test_stage_without_defaults() {
        let sources = BundleSources::default();
        let staged = stage(&sources).unwrap();
        assert!(staged.manifest.is_empty());
        assert!(staged.container_units.is_empty());
    }

    #[test]
    fn test_missing_source_is_precondition() {
        let sources = BundleSources {
            overrides: Some("/nonexistent/vmseed/overrides".into()),
            ..Default::default()
        };
        let contract = RemoteContract::new("/tmp/vmseed", RemoteCapability::Lua);
        let err = package(&sources, &contract).unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 2);
    }

    #[test]
    fn test_unit_subdirectory_rejected() {
        let (_td, dir) = utf8_tempdir();
        fs::create_dir_all(dir.join("nested")).unwrap();
        let sources = BundleSources {
            vm_scripts: Some(dir),
            ..Default::default()
        };
        assert!(stage(&sources).is_err());
    }

    #[test]
    fn test_glob_unit_name_is_precondition() {
        let (_td, dir) = utf8_tempdir();
        write_unit(&dir, "10-*", "true\n");
        let sources = BundleSources {
            overrides: Some(dir),
            ..Default::default()
        };
        let err = stage(&sources).unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 2);
    }

    #[test]
    fn test_package_segments() {
        let mut env = EnvFile::new();
        env.set("VMSEED_HOSTNAME", "edge").unwrap();
        let sources = BundleSources {
            include_defaults: true,
            env,
            ..Default::default()
        };
        let contract = RemoteContract::new("/tmp/vmseed", RemoteCapability::Lua);
        let payload = package(&sources, &contract).unwrap();
        let body = payload.body.strip_suffix('\n').unwrap();
        assert!(!body.contains('\n'));
        assert!(payload
            .preamble
            .contains(&format!("count={}", body.len())));
        assert!(payload.trailer.ends_with("poweroff\n"));
        assert!(!payload.preamble.contains(RESULT_PREFIX));
        assert_eq!(payload.manifest.len(), DEFAULT_VM_UNITS.len());
        let archive = decode(body).unwrap();
        // gzip magic
        assert_eq!(&archive[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn test_write_to() {
        let (_td, dir) = utf8_tempdir();
        let out = dir.join("out");
        let contract = RemoteContract::new("/tmp/vmseed", RemoteCapability::Lua);
        let sources = BundleSources {
            include_defaults: true,
            ..Default::default()
        };
        let payload = package(&sources, &contract).unwrap();
        payload.write_to(&out).unwrap();
        let manifest = fs::read_to_string(out.join("manifest.txt")).unwrap();
        assert_eq!(manifest.lines().next(), Some("10-hostname"));
        assert_eq!(manifest.lines().count(), DEFAULT_VM_UNITS.len());
        let written: usize = ["preamble.txt", "body.b64", "trailer.txt"]
            .iter()
            .map(|n| fs::metadata(out.join(n)).unwrap().len() as usize)
            .sum();
        assert_eq!(written, payload.len());
    }
}

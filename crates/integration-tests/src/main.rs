//! Integration tests for vmseed
//!
//! Each test drives the real binary against a fake guest console served from
//! a thread over a UNIX socket.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixListener;
use std::process::Output;
use std::thread::JoinHandle;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};
use serde_json::Value;
use xshell::{cmd, Shell};

const PROMPT: &str = "Please press Enter to activate this console.";
const DEFAULT_UNITS: &[&str] = &[
    "10-hostname",
    "20-password",
    "30-firewall",
    "40-network-wait",
    "50-disk-resize",
];

/// Get the path to the vmseed binary, checking VMSEED_PATH env var first, then falling back to "vmseed"
fn get_vmseed_command() -> Result<String> {
    if let Ok(path) = std::env::var("VMSEED_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/vmseed", "target/release/vmseed"]
        .into_iter()
        .find(|p| Utf8Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set VMSEED_PATH={path} to run using this binary"
        ));
    }
    Ok("vmseed".to_owned())
}

/// How the fake guest answers once it has received the whole transfer.
#[derive(Debug, Clone)]
enum Reply {
    /// Report every unit ok, then success.
    Succeed(Vec<String>),
    /// Report `unit` failed, then failure.
    Fail(&'static str),
    /// Say nothing more.
    Silent,
    /// Never print a real prompt, only text containing it.
    NoPrompt,
}

struct FakeConsole {
    path: Utf8PathBuf,
    thread: JoinHandle<std::io::Result<String>>,
}

impl FakeConsole {
    fn start(dir: &Utf8Path, reply: Reply) -> Result<Self> {
        let path = dir.join("console.sock");
        let listener = UnixListener::bind(&path).with_context(|| format!("Binding {path}"))?;
        let thread = std::thread::spawn(move || serve(listener, reply));
        Ok(Self { path, thread })
    }

    /// Everything the guest received.
    fn received(self) -> Result<String> {
        self.thread
            .join()
            .map_err(|_| eyre!("fake console panicked"))?
            .context("fake console I/O")
    }
}

fn serve(listener: UnixListener, reply: Reply) -> std::io::Result<String> {
    let (mut stream, _) = listener.accept()?;
    stream.write_all(b"[    0.000000] Linux version 6.6.73\r\n\x1b[0mprocd: - init -\r\n")?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut received = Vec::new();
    if matches!(reply, Reply::NoPrompt) {
        stream.write_all(format!("echo '{PROMPT}'\r\n").as_bytes())?;
        reader.read_to_end(&mut received)?;
        return Ok(String::from_utf8_lossy(&received).into_owned());
    }
    stream.write_all(format!("{PROMPT}\r\n").as_bytes())?;
    loop {
        let n = reader.read_until(b'\n', &mut received)?;
        if n == 0 || received.ends_with(b"poweroff\n") {
            break;
        }
    }
    match &reply {
        Reply::Succeed(units) => {
            for unit in units {
                stream.write_all(format!("VMSEED-UNIT: {unit} ok\r\n").as_bytes())?;
            }
            stream.write_all(b"VMSEED-RESULT: OK\r\n")?;
        }
        Reply::Fail(unit) => {
            stream.write_all(format!("VMSEED-UNIT: {unit} failed rc=1\r\n").as_bytes())?;
            stream.write_all(format!("VMSEED-RESULT: FAILED {unit}\r\n").as_bytes())?;
        }
        Reply::Silent | Reply::NoPrompt => {}
    }
    // Hold the line open until vmseed hangs up.
    reader.read_to_end(&mut received)?;
    Ok(String::from_utf8_lossy(&received).into_owned())
}

fn tempdir() -> Result<(tempfile::TempDir, Utf8PathBuf)> {
    let td = tempfile::tempdir()?;
    let path = Utf8PathBuf::from_path_buf(td.path().to_owned())
        .map_err(|p| eyre!("non-UTF-8 tempdir {}", p.display()))?;
    Ok((td, path))
}

/// Run `vmseed bootstrap --attach` with a state file under `dir`.
fn bootstrap(sh: &Shell, dir: &Utf8Path, sock: &Utf8Path, extra: &[&str]) -> Result<Output> {
    let bin = get_vmseed_command()?;
    let state = dir.join("state/initialized");
    let out = cmd!(
        sh,
        "{bin} bootstrap --attach {sock} --state-file {state} {extra...}"
    )
    .ignore_status()
    .output()?;
    Ok(out)
}

fn exit_code(out: &Output) -> Option<i32> {
    out.status.code()
}

fn test_bootstrap_success_then_skip() -> Result<()> {
    let sh = Shell::new()?;
    let (_td, dir) = tempdir()?;
    let units = DEFAULT_UNITS.iter().map(|s| s.to_string()).collect();
    let console = FakeConsole::start(&dir, Reply::Succeed(units))?;
    let out = bootstrap(
        &sh,
        &dir,
        &console.path,
        &[
            "--timeout",
            "60",
            "--hostname",
            "edge-1",
            "--root-password",
            "s3cr3t!#",
        ],
    )?;
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert_eq!(exit_code(&out), Some(0), "{stderr}");

    let received = console.received()?;
    assert!(received.starts_with('\n'), "console not activated first");
    assert!(received.contains("poweroff"));
    // Secrets travel only inside the encoded bundle.
    assert!(!received.contains("s3cr3t!#"));
    assert!(!received.contains("VMSEED-RESULT"));

    let marker = std::fs::read_to_string(dir.join("state/initialized"))?;
    let record: Value = serde_json::from_str(&marker)?;
    assert_eq!(record["version"], 1);
    let recorded: Vec<&str> = record["units"]
        .as_array()
        .ok_or_else(|| eyre!("units missing from {marker}"))?
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert_eq!(recorded, DEFAULT_UNITS);

    // Second run: no console exists at all, yet it succeeds immediately.
    let missing = dir.join("absent.sock");
    let out = bootstrap(&sh, &dir, &missing, &["--timeout", "2"])?;
    assert_eq!(exit_code(&out), Some(0));
    assert!(String::from_utf8_lossy(&out.stdout).contains("Already initialized"));
    Ok(())
}

fn test_remote_failure() -> Result<()> {
    let sh = Shell::new()?;
    let (_td, dir) = tempdir()?;
    let console = FakeConsole::start(&dir, Reply::Fail("30-firewall"))?;
    let out = bootstrap(&sh, &dir, &console.path, &["--timeout", "60"])?;
    console.received()?;
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert_eq!(exit_code(&out), Some(6), "{stderr}");
    assert!(stderr.contains("30-firewall"), "{stderr}");
    assert!(!dir.join("state/initialized").exists());
    Ok(())
}

fn test_silence_is_transfer_timeout() -> Result<()> {
    let sh = Shell::new()?;
    let (_td, dir) = tempdir()?;
    let console = FakeConsole::start(&dir, Reply::Silent)?;
    let out = bootstrap(&sh, &dir, &console.path, &["--timeout", "3"])?;
    console.received()?;
    assert_eq!(
        exit_code(&out),
        Some(5),
        "{}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert!(!dir.join("state/initialized").exists());
    Ok(())
}

fn test_prompt_in_noise_is_boot_timeout() -> Result<()> {
    let sh = Shell::new()?;
    let (_td, dir) = tempdir()?;
    let console = FakeConsole::start(&dir, Reply::NoPrompt)?;
    let out = bootstrap(&sh, &dir, &console.path, &["--timeout", "2"])?;
    let received = console.received()?;
    assert_eq!(
        exit_code(&out),
        Some(4),
        "{}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert!(received.is_empty(), "wrote to an inactive console: {received:?}");
    Ok(())
}

fn test_missing_overrides_is_precondition() -> Result<()> {
    let sh = Shell::new()?;
    let (_td, dir) = tempdir()?;
    let missing = dir.join("absent.sock");
    let overrides = dir.join("no-such-dir");
    let out = bootstrap(
        &sh,
        &dir,
        &missing,
        &["--timeout", "30", "--overrides", overrides.as_str()],
    )?;
    assert_eq!(exit_code(&out), Some(2));
    Ok(())
}

fn test_package_and_status() -> Result<()> {
    let sh = Shell::new()?;
    let bin = get_vmseed_command()?;
    let (_td, dir) = tempdir()?;
    let overrides = dir.join("overrides");
    std::fs::create_dir_all(&overrides)?;
    std::fs::write(overrides.join("35-extra"), "true\n")?;
    let out = dir.join("out");
    cmd!(sh, "{bin} package --overrides {overrides} --output {out}").run()?;
    let manifest = std::fs::read_to_string(out.join("manifest.txt"))?;
    let units: Vec<&str> = manifest.lines().collect();
    assert_eq!(
        units,
        [
            "10-hostname",
            "20-password",
            "30-firewall",
            "35-extra",
            "40-network-wait",
            "50-disk-resize"
        ]
    );
    for name in ["preamble.txt", "body.b64", "trailer.txt"] {
        assert!(out.join(name).exists(), "{name} missing");
    }

    let state = dir.join("initialized");
    let status = cmd!(sh, "{bin} status --json --state-file {state}").read()?;
    let status: Value = serde_json::from_str(&status)?;
    assert_eq!(status["initialized"], false);
    Ok(())
}

const TESTS: &[(&str, fn() -> Result<()>)] = &[
    (
        "bootstrap_success_then_skip",
        test_bootstrap_success_then_skip,
    ),
    ("remote_failure", test_remote_failure),
    ("silence_is_transfer_timeout", test_silence_is_transfer_timeout),
    (
        "prompt_in_noise_is_boot_timeout",
        test_prompt_in_noise_is_boot_timeout,
    ),
    (
        "missing_overrides_is_precondition",
        test_missing_overrides_is_precondition,
    ),
    ("package_and_status", test_package_and_status),
];

fn main() {
    // Integration tests are only supported on Linux
    if std::env::consts::OS != "linux" {
        eprintln!(
            "Integration tests are only supported on Linux (current OS: {})",
            std::env::consts::OS
        );
        eprintln!("Skipping all integration tests.");
        std::process::exit(0);
    }

    let args = Arguments::from_args();

    let tests: Vec<Trial> = TESTS
        .iter()
        .map(|&(name, f)| Trial::test(name, move || f().map_err(|e| format!("{e:?}").into())))
        .collect();

    libtest_mimic::run(&args, tests).exit();
}

//! Orchestration of one invocation.
//!
//! The gate is consulted first; only an uninitialized VM ever sees the
//! packager, the console or the transport. Everything between connecting to
//! the console and reading the result marker shares one [`Deadline`].

use std::future::Future;
use std::io::IsTerminal;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::{Report, Result};
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::boot;
use crate::bundle::{package, Payload};
use crate::common_opts::{ProtocolOpts, VmOpts};
use crate::console::{self, ConsoleSession, Deadline};
use crate::error::BootstrapError;
use crate::gate::{CompletionRecord, RunOnceGate};
use crate::image;
use crate::qemu::QemuConfig;
use crate::transport;

/// How long to wait for the transcript writer to drain after the session ends.
const TRANSCRIPT_DRAIN: Duration = Duration::from_secs(1);

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct RunOpts {
    #[clap(flatten)]
    pub protocol: ProtocolOpts,

    #[clap(flatten)]
    pub vm: VmOpts,

    /// VM disk image
    #[clap(long)]
    pub image: Utf8PathBuf,

    /// Expected SHA-256 of the image, checked before the bootstrap boot
    #[clap(long)]
    pub image_sha256: Option<String>,

    /// Seconds to wait for the bootstrap VM to power off before killing it
    #[clap(long, default_value_t = 120)]
    pub shutdown_timeout: u64,

    /// Extra arguments passed to QEMU
    #[clap(last = true)]
    pub qemu_args: Vec<String>,
}

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapOpts {
    #[clap(flatten)]
    pub protocol: ProtocolOpts,

    /// Existing console socket to connect to
    #[clap(long)]
    pub attach: Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BootstrapOutcome {
    /// The completion marker was already present.
    Skipped,
    /// The protocol ran and the marker was written.
    Completed { units: Vec<String> },
}

/// Run `protocol` only if the gate is open, and close the gate on success.
///
/// `protocol` returns the units that ran; they are recorded in the marker.
pub(crate) async fn run_gated<F, Fut>(gate: &RunOnceGate, protocol: F) -> Result<BootstrapOutcome>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<String>>>,
{
    if gate.is_initialized()? {
        info!("{} exists; skipping bootstrap", gate.path());
        return Ok(BootstrapOutcome::Skipped);
    }
    let units = protocol().await?;
    gate.mark_initialized(&CompletionRecord::new(units.clone()))?;
    Ok(BootstrapOutcome::Completed { units })
}

fn spinner(message: &'static str) -> ProgressBar {
    if !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg} ({elapsed})") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message(message);
    pb
}

/// Background copy of the console transcript.
struct Transcript(Option<JoinHandle<()>>);

impl Transcript {
    async fn start(session: &ConsoleSession, opts: &ProtocolOpts) -> Result<Self> {
        match &opts.console_log {
            Some(path) => Ok(Self(Some(session.tee_to_file(path).await?))),
            None => Ok(Self(None)),
        }
    }

    /// Call after the session has been dropped.
    async fn finish(self) {
        if let Some(handle) = self.0 {
            if tokio::time::timeout(TRANSCRIPT_DRAIN, handle).await.is_err() {
                debug!("Transcript writer did not drain in time");
            }
        }
    }
}

/// Boot sync, transfer and result, over an already open console.
async fn converse(
    session: &mut ConsoleSession,
    payload: &Payload,
    opts: &ProtocolOpts,
    deadline: Deadline,
    pb: &ProgressBar,
) -> Result<Vec<String>, BootstrapError> {
    pb.set_message("Waiting for console prompt");
    boot::wait_for_prompt(session, &opts.boot_prompt, deadline).await?;
    pb.set_message("Transferring configuration");
    transport::send(session, payload, deadline).await?;
    pb.set_message("Applying configuration");
    transport::await_result(session, deadline).await
}

/// Open a session over `stream` and run the conversation on it.
async fn bootstrap_over<S>(
    stream: S,
    payload: &Payload,
    opts: &ProtocolOpts,
    deadline: Deadline,
    pb: &ProgressBar,
) -> Result<(ConsoleSession, Transcript)>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut session = ConsoleSession::from_stream(stream);
    let transcript = Transcript::start(&session, opts).await?;
    match converse(&mut session, payload, opts, deadline, pb).await {
        Ok(progress) => {
            debug!("Remote units reported: {progress:?}");
            Ok((session, transcript))
        }
        Err(e) => {
            debug!("Protocol stopped in state {:?}", session.state());
            drop(session);
            transcript.finish().await;
            Err(e.into())
        }
    }
}

/// `vmseed bootstrap --attach`: gate plus protocol against an existing console.
pub(crate) async fn bootstrap(opts: &BootstrapOpts) -> Result<BootstrapOutcome> {
    let gate = opts.protocol.state.gate();
    run_gated(&gate, move || async move {
        let payload = package(&opts.protocol.bundle.sources()?, &opts.protocol.bundle.contract())?;
        let deadline = Deadline::after(opts.protocol.timeout());
        let pb = spinner("Connecting to console");
        let stream = console::connect(&opts.attach, deadline, &opts.protocol.boot_prompt).await?;
        let result = bootstrap_over(stream, &payload, &opts.protocol, deadline, &pb).await;
        pb.finish_and_clear();
        let (session, transcript) = result?;
        drop(session);
        transcript.finish().await;
        info!(
            "Bootstrap completed in {}",
            HumanDuration(deadline.elapsed())
        );
        Ok::<_, Report>(payload.manifest.units().to_vec())
    })
    .await
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("Killing VM: {e}");
    }
    if let Err(e) = child.wait().await {
        warn!("Reaping VM: {e}");
    }
}

/// Boot the VM once with the console on our socket and configure it.
async fn bootstrap_vm(opts: &RunOpts, qemu: QemuConfig) -> Result<Vec<String>> {
    image::verify(&opts.image, opts.image_sha256.as_deref())?;
    let protocol = &opts.protocol;
    let payload = package(&protocol.bundle.sources()?, &protocol.bundle.contract())?;

    let sockdir = tempfile::Builder::new().prefix("vmseed-console").tempdir()?;
    let sock = Utf8PathBuf::from_path_buf(sockdir.path().join("console.sock"))
        .map_err(|p| eyre!("Socket path is not valid UTF-8: {}", p.display()))?;
    let listener = console::bind(&sock)?;

    let deadline = Deadline::after(protocol.timeout());
    let mut child = qemu.bootstrap(&sock).spawn()?;
    let pb = spinner("Waiting for VM console");

    let result = tokio::select! {
        r = async {
            match console::accept(&listener, deadline, &protocol.boot_prompt).await {
                Ok(stream) => bootstrap_over(stream, &payload, protocol, deadline, &pb).await,
                Err(e) => Err(Report::new(e)),
            }
        } => r,
        status = child.wait() => {
            let status = status.map_err(BootstrapError::channel)?;
            Err(Report::new(BootstrapError::channel(format!(
                "VM exited during bootstrap ({status})"
            ))))
        }
    };
    let (session, transcript) = match result {
        Ok(r) => r,
        Err(e) => {
            pb.finish_and_clear();
            kill(&mut child).await;
            return Err(e);
        }
    };

    pb.set_message("Waiting for VM to power off");
    let shutdown = Duration::from_secs(opts.shutdown_timeout);
    match tokio::time::timeout(shutdown, child.wait()).await {
        Ok(Ok(status)) => debug!("Bootstrap VM exited: {status}"),
        Ok(Err(e)) => warn!("Waiting for bootstrap VM: {e}"),
        Err(_) => {
            warn!(
                "VM did not power off within {}s; killing it",
                shutdown.as_secs()
            );
            kill(&mut child).await;
        }
    }
    pb.finish_and_clear();
    drop(session);
    transcript.finish().await;
    info!(
        "Bootstrap completed in {}",
        HumanDuration(deadline.elapsed())
    );
    Ok(payload.manifest.units().to_vec())
}

/// `vmseed run`: bootstrap if needed, then run the VM and mirror its exit code.
pub(crate) async fn run(opts: &RunOpts) -> Result<i32> {
    debug!(
        "Effective options: {}",
        serde_json::to_string(opts).unwrap_or_default()
    );
    let qemu = QemuConfig::new(&opts.vm, &opts.image)?.extra_args(&opts.qemu_args);
    let gate = opts.protocol.state.gate();
    if let BootstrapOutcome::Completed { units } =
        run_gated(&gate, || bootstrap_vm(opts, qemu.clone())).await?
    {
        info!("Applied {} units", units.len());
    }

    info!("Starting VM");
    let mut child = qemu.steady_state().spawn()?;
    let status = child.wait().await?;
    debug!("VM exited: {status}");
    Ok(status.code().unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;
    use crate::bundle::BundleSources;
    use crate::remote::{RemoteCapability, RemoteContract};

    fn gate_in(td: &tempfile::TempDir) -> RunOnceGate {
        RunOnceGate::new(Utf8PathBuf::from_path_buf(td.path().join("initialized")).unwrap())
    }

    #[tokio::test]
    async fn test_gate_set_skips_protocol() {
        let td = tempfile::tempdir().unwrap();
        let gate = gate_in(&td);
        gate.mark_initialized(&CompletionRecord::new(vec![])).unwrap();
        let invoked = AtomicBool::new(false);
        let flag = &invoked;
        let outcome = run_gated(&gate, move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, Report>(vec![])
        })
        .await
        .unwrap();
        assert_eq!(outcome, BootstrapOutcome::Skipped);
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failure_leaves_gate_open() {
        let td = tempfile::tempdir().unwrap();
        let gate = gate_in(&td);
        let err = run_gated(&gate, || async {
            Err::<Vec<String>, _>(Report::new(BootstrapError::TransferTimeout {
                elapsed: Duration::from_secs(300),
            }))
        })
        .await
        .unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 5);
        assert!(!gate.is_initialized().unwrap());

        let outcome = run_gated(&gate, || async { Ok::<_, Report>(vec!["10-a".to_owned()]) })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            BootstrapOutcome::Completed {
                units: vec!["10-a".into()]
            }
        );
        assert!(gate.is_initialized().unwrap());
    }

    fn protocol_opts(td: &tempfile::TempDir) -> ProtocolOpts {
        #[derive(Parser)]
        struct Cli {
            #[clap(flatten)]
            p: ProtocolOpts,
        }
        let state = td.path().join("initialized");
        let log = td.path().join("console.log");
        Cli::try_parse_from([
            "vmseed",
            "--state-file",
            state.to_str().unwrap(),
            "--console-log",
            log.to_str().unwrap(),
            "--timeout",
            "30",
        ])
        .unwrap()
        .p
    }

    /// A guest that prints the prompt, swallows input until `poweroff`, then
    /// reports every unit as successful.
    async fn fake_guest(stream: tokio::io::DuplexStream, units: Vec<String>) -> String {
        let (r, mut w) = tokio::io::split(stream);
        w.write_all(b"[    1.0] procd: boot\r\nPlease press Enter to activate this console.\r\n")
            .await
            .unwrap();
        let mut r = BufReader::new(r);
        let mut received = String::new();
        let mut line = String::new();
        loop {
            line.clear();
            if r.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            received.push_str(&line);
            if line.ends_with("poweroff\n") {
                break;
            }
        }
        for unit in units {
            w.write_all(format!("VMSEED-UNIT: {unit} ok\r\n").as_bytes())
                .await
                .unwrap();
        }
        w.write_all(b"VMSEED-RESULT: OK\r\n").await.unwrap();
        received
    }

    #[tokio::test]
    async fn test_bootstrap_over_fake_guest() {
        let td = tempfile::tempdir().unwrap();
        let opts = protocol_opts(&td);
        let contract = RemoteContract::new("/tmp/vmseed", RemoteCapability::Lua);
        let payload = package(
            &BundleSources {
                include_defaults: true,
                ..Default::default()
            },
            &contract,
        )
        .unwrap();
        let (guest, host) = tokio::io::duplex(1 << 20);
        let guest = tokio::spawn(fake_guest(guest, payload.manifest.units().to_vec()));
        let deadline = Deadline::after(opts.timeout());
        let pb = ProgressBar::hidden();
        let (session, transcript) = bootstrap_over(host, &payload, &opts, deadline, &pb)
            .await
            .unwrap();
        drop(session);
        transcript.finish().await;

        let received = guest.await.unwrap();
        // Activation newline, then all three segments in order.
        assert!(received.starts_with('\n'));
        assert_eq!(&received[1..], payload.segments().concat());

        let log = std::fs::read_to_string(td.path().join("console.log")).unwrap();
        assert!(log.contains("VMSEED-RESULT: OK"));
    }
}

//! Sending the payload and listening for the guest's verdict.

use tracing::{debug, info, warn};

use crate::bundle::Payload;
use crate::console::{ConsoleSession, ConsoleState, Deadline};
use crate::error::BootstrapError;
use crate::remote::{FAILURE_TOKEN, PROGRESS_PREFIX, RESULT_PREFIX, SUCCESS_TOKEN};

/// The guest's reported status, decoded from a result marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ResultStatus {
    Success,
    Failed(String),
}

/// The text after the result prefix, if `line` is a result marker.
///
/// The prefix must open the line; text merely containing it is noise.
pub(crate) fn parse_marker(line: &str) -> Option<&str> {
    line.trim_start().strip_prefix(RESULT_PREFIX).map(str::trim)
}

fn parse_progress(line: &str) -> Option<&str> {
    line.trim_start().strip_prefix(PROGRESS_PREFIX).map(str::trim)
}

/// Failure wins over everything; success needs an exact `OK` token;
/// anything else is treated as a failure.
pub(crate) fn classify(remainder: &str) -> ResultStatus {
    if remainder.contains(FAILURE_TOKEN) {
        return ResultStatus::Failed(remainder.to_owned());
    }
    match remainder.split_whitespace().next() {
        Some(SUCCESS_TOKEN) => ResultStatus::Success,
        _ => ResultStatus::Failed(format!("malformed result marker {remainder:?}")),
    }
}

/// Write all three segments as one contiguous write.
pub(crate) async fn send(
    session: &mut ConsoleSession,
    payload: &Payload,
    deadline: Deadline,
) -> Result<(), BootstrapError> {
    session.set_state(ConsoleState::Transferring);
    let text = payload.segments().concat();
    info!(
        "Sending {} bytes ({} VM units)",
        text.len(),
        payload.manifest.len()
    );
    match tokio::time::timeout_at(deadline.instant(), session.send(&text)).await {
        Ok(r) => r,
        Err(_) => Err(BootstrapError::TransferTimeout {
            elapsed: deadline.elapsed(),
        }),
    }
}

/// Wait for the first result marker. Returns the unit progress lines on
/// success.
pub(crate) async fn await_result(
    session: &mut ConsoleSession,
    deadline: Deadline,
) -> Result<Vec<String>, BootstrapError> {
    session.set_state(ConsoleState::AwaitingResult);
    let mut progress = Vec::new();
    let listen = async {
        while let Some(line) = session.lines().next_line().await {
            if let Some(unit) = parse_progress(&line) {
                info!("Unit {unit}");
                progress.push(line.trim().to_owned());
            } else if let Some(remainder) = parse_marker(&line) {
                debug!("Result marker: {remainder:?}");
                return Ok(classify(remainder));
            }
        }
        Err(BootstrapError::channel(
            "console closed before the result marker",
        ))
    };
    let status = match tokio::time::timeout_at(deadline.instant(), listen).await {
        Ok(r) => r?,
        Err(_) => {
            return Err(BootstrapError::TransferTimeout {
                elapsed: deadline.elapsed(),
            })
        }
    };
    session.set_state(ConsoleState::Finished);
    match status {
        ResultStatus::Success => Ok(progress),
        ResultStatus::Failed(detail) => {
            warn!("Remote configuration failed: {detail}");
            Err(BootstrapError::RemoteScriptFailure { detail, progress })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use camino::Utf8PathBuf;
    use indoc::indoc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};

    use super::*;
    use crate::bundle::{package, BundleSources};
    use crate::remote::{RemoteCapability, RemoteContract};
    use crate::script::EnvFile;

    fn session() -> (ConsoleSession, WriteHalf<DuplexStream>) {
        let (guest, host) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(guest);
        // Keep the guest's read side draining so host writes never block.
        tokio::spawn(async move {
            let mut r = r;
            let mut sink = Vec::new();
            let _ = r.read_to_end(&mut sink).await;
        });
        (ConsoleSession::from_stream(host), w)
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("OK"), ResultStatus::Success);
        assert_eq!(classify("OK 5 units"), ResultStatus::Success);
        assert_eq!(
            classify("FAILED 30-firewall"),
            ResultStatus::Failed("FAILED 30-firewall".into())
        );
        // Failure takes precedence even when OK also appears.
        assert!(matches!(classify("OK FAILED"), ResultStatus::Failed(_)));
        assert!(matches!(classify(""), ResultStatus::Failed(_)));
        assert!(matches!(classify("OKAY"), ResultStatus::Failed(_)));
    }

    #[test]
    fn test_parse_marker_requires_line_start() {
        assert_eq!(parse_marker("VMSEED-RESULT: OK"), Some("OK"));
        assert_eq!(parse_marker("  VMSEED-RESULT:  OK "), Some("OK"));
        assert_eq!(parse_marker("echo VMSEED-RESULT: OK"), None);
        assert_eq!(parse_marker("VMSEED-UNIT: 10-a ok"), None);
    }

    #[tokio::test]
    async fn test_first_marker_wins() {
        let (mut session, mut w) = session();
        w.write_all(
            b"noise VMSEED-RESULT: FAILED fake\n\
              VMSEED-UNIT: 10-a ok\r\n\
              VMSEED-RESULT: OK\n\
              VMSEED-RESULT: FAILED late\n",
        )
        .await
        .unwrap();
        let deadline = Deadline::after(Duration::from_secs(10));
        let progress = await_result(&mut session, deadline).await.unwrap();
        assert_eq!(progress, ["VMSEED-UNIT: 10-a ok"]);
        assert_eq!(session.state(), ConsoleState::Finished);
    }

    #[tokio::test]
    async fn test_failure_marker() {
        let (mut session, mut w) = session();
        w.write_all(b"VMSEED-UNIT: 10-a failed rc=2\nVMSEED-RESULT: FAILED 10-a\n")
            .await
            .unwrap();
        let deadline = Deadline::after(Duration::from_secs(10));
        let err = await_result(&mut session, deadline).await.unwrap_err();
        match err {
            BootstrapError::RemoteScriptFailure { detail, progress } => {
                assert_eq!(detail, "FAILED 10-a");
                assert_eq!(progress.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_is_transfer_timeout() {
        let (mut session, mut w) = session();
        w.write_all(b"booting\n").await.unwrap();
        let deadline = Deadline::after(Duration::from_secs(60));
        let err = await_result(&mut session, deadline).await.unwrap_err();
        assert_eq!(err.exit_code(), 5);
        drop(w);
    }

    #[tokio::test]
    async fn test_eof_is_channel_error() {
        let (mut session, mut w) = session();
        w.shutdown().await.unwrap();
        let deadline = Deadline::after(Duration::from_secs(10));
        let err = await_result(&mut session, deadline).await.unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    /// Run the real apply script locally against a packaged bundle.
    async fn apply_locally(
        units: &[(&str, &str)],
        overrides: &[(&str, &str)],
    ) -> (Vec<u8>, Utf8PathBuf, tempfile::TempDir) {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(td.path().to_owned()).unwrap();
        let vm = root.join("src-vm");
        let ov = root.join("src-overrides");
        let work = root.join("work");
        for d in [&vm, &ov, &work] {
            std::fs::create_dir_all(d).unwrap();
        }
        for (name, body) in units {
            std::fs::write(vm.join(name), body.replace("@ROOT@", root.as_str())).unwrap();
        }
        for (name, body) in overrides {
            std::fs::write(ov.join(name), body.replace("@ROOT@", root.as_str())).unwrap();
        }
        let mut env = EnvFile::new();
        env.set("VMSEED_HOSTNAME", "edge-7").unwrap();
        let sources = BundleSources {
            vm_scripts: Some(vm),
            overrides: Some(ov),
            include_defaults: false,
            env,
            ..Default::default()
        };
        let contract = RemoteContract::new(work.as_str(), RemoteCapability::Base64Util);
        let payload = package(&sources, &contract).unwrap();
        std::fs::write(work.join("bundle.b64"), payload.body.trim_end()).unwrap();
        std::fs::write(work.join("apply.sh"), contract.apply_script().unwrap()).unwrap();
        let out = tokio::process::Command::new("sh")
            .arg(work.join("apply.sh"))
            .output()
            .await
            .unwrap();
        (out.stdout, root, td)
    }

    #[tokio::test]
    async fn test_apply_script_success_and_override() {
        let (stdout, root, _td) = apply_locally(
            &[
                (
                    "10-first",
                    indoc! {r#"
                        set -e
                        test -n "$VMSEED_HOSTNAME"
                        echo "$VMSEED_HOSTNAME" >> @ROOT@/order
                    "#},
                ),
                ("20-second", "echo default >> @ROOT@/order\n"),
            ],
            &[("20-second", "echo override >> @ROOT@/order\n")],
        )
        .await;
        let (mut session, mut w) = session();
        w.write_all(&stdout).await.unwrap();
        let deadline = Deadline::after(Duration::from_secs(10));
        let progress = await_result(&mut session, deadline).await.unwrap();
        assert_eq!(
            progress,
            ["VMSEED-UNIT: 10-first ok", "VMSEED-UNIT: 20-second ok"]
        );
        let order = std::fs::read_to_string(root.join("order")).unwrap();
        assert_eq!(order, "edge-7\noverride\n");
    }

    #[tokio::test]
    async fn test_apply_script_stops_at_first_failure() {
        let (stdout, root, _td) = apply_locally(
            &[
                ("10-ok", "touch @ROOT@/ran-10\n"),
                (
                    "20-bad",
                    indoc! {"
                        echo partial work
                        exit 7
                    "},
                ),
                ("30-never", "touch @ROOT@/ran-30\n"),
            ],
            &[],
        )
        .await;
        let (mut session, mut w) = session();
        w.write_all(&stdout).await.unwrap();
        let deadline = Deadline::after(Duration::from_secs(10));
        let err = await_result(&mut session, deadline).await.unwrap_err();
        match err {
            BootstrapError::RemoteScriptFailure { detail, progress } => {
                assert_eq!(detail, "FAILED 20-bad");
                assert_eq!(
                    progress,
                    ["VMSEED-UNIT: 10-ok ok", "VMSEED-UNIT: 20-bad failed rc=7"]
                );
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(root.join("ran-10").exists());
        assert!(!root.join("ran-30").exists());
    }
}

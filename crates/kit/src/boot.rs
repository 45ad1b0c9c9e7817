//! Waiting for the guest console to become interactive.

use std::time::Duration;

use tracing::{debug, info};

use crate::console::{normalize_line, ConsoleSession, ConsoleState, Deadline};
use crate::error::BootstrapError;

/// The activation prompt printed by the guest init on its serial console.
pub(crate) const DEFAULT_BOOT_PROMPT: &str = "Please press Enter to activate this console.";

/// How long an unterminated prompt must stay unchanged before it counts.
const PROMPT_SETTLE: Duration = Duration::from_millis(200);

fn is_prompt(line: &str, prompt: &str) -> bool {
    line.trim() == prompt
}

/// Consume console output until a line consisting exactly of `prompt`
/// appears, then activate the console.
///
/// The prompt is matched against whole normalized lines and against the
/// unterminated tail, since the guest may leave the cursor after it. The
/// tail only counts once no further output has followed it for
/// [`PROMPT_SETTLE`]. A line merely containing the prompt does not match.
/// Everything preceding the match is discarded.
pub(crate) async fn wait_for_prompt(
    session: &mut ConsoleSession,
    prompt: &str,
    deadline: Deadline,
) -> Result<(), BootstrapError> {
    let prompt = normalize_line(prompt);
    let prompt = prompt.trim();
    let scan = async {
        loop {
            while let Some(line) = session.lines().pop_line() {
                if is_prompt(&line, prompt) {
                    return Ok(());
                }
            }
            let settle = is_prompt(&session.lines().partial(), prompt);
            let filled = if settle {
                match tokio::time::timeout(PROMPT_SETTLE, session.lines().fill()).await {
                    Ok(filled) => filled,
                    Err(_) => {
                        session.lines().discard_partial();
                        return Ok(());
                    }
                }
            } else {
                session.lines().fill().await
            };
            if !filled {
                return Err(BootstrapError::channel(
                    "console closed before the boot prompt",
                ));
            }
        }
    };
    match tokio::time::timeout_at(deadline.instant(), scan).await {
        Ok(r) => r?,
        Err(_) => {
            return Err(BootstrapError::BootTimeout {
                prompt: prompt.to_owned(),
                elapsed: deadline.elapsed(),
            })
        }
    }
    info!("Console prompt reached after {}s", deadline.elapsed().as_secs());
    session.set_state(ConsoleState::PromptReached);
    session.send("\n").await?;
    debug!("Console activated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_prompt_after_noise() {
        let (guest, host) = tokio::io::duplex(1024);
        let mut session = ConsoleSession::from_stream(host);
        let (mut r, mut w) = tokio::io::split(guest);
        w.write_all(b"[    0.000000] Linux version 6.6\r\n\x1b[0mprocd: init\r\n")
            .await
            .unwrap();
        w.write_all(format!("{DEFAULT_BOOT_PROMPT}\r\nleftover\n").as_bytes())
            .await
            .unwrap();
        let deadline = Deadline::after(Duration::from_secs(10));
        wait_for_prompt(&mut session, DEFAULT_BOOT_PROMPT, deadline)
            .await
            .unwrap();
        assert_eq!(session.state(), ConsoleState::PromptReached);
        let mut buf = [0u8; 1];
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\n");
        // Output after the prompt is kept for the next phase.
        assert_eq!(session.lines().next_line().await.unwrap(), "leftover");
    }

    #[tokio::test]
    async fn test_prompt_without_newline() {
        let (guest, host) = tokio::io::duplex(1024);
        let mut session = ConsoleSession::from_stream(host);
        let (_r, mut w) = tokio::io::split(guest);
        w.write_all(format!("boot\n{DEFAULT_BOOT_PROMPT}").as_bytes())
            .await
            .unwrap();
        let deadline = Deadline::after(Duration::from_secs(10));
        wait_for_prompt(&mut session, DEFAULT_BOOT_PROMPT, deadline)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_prefix_continued_later_does_not_match() {
        let (guest, host) = tokio::io::duplex(1024);
        let mut session = ConsoleSession::from_stream(host);
        let (_r, mut w) = tokio::io::split(guest);
        let writer = tokio::spawn(async move {
            w.write_all(DEFAULT_BOOT_PROMPT.as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            w.write_all(b" (noise)\n").await.unwrap();
            w
        });
        let deadline = Deadline::after(Duration::from_secs(30));
        let err = wait_for_prompt(&mut session, DEFAULT_BOOT_PROMPT, deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::BootTimeout { .. }));
        assert_eq!(session.state(), ConsoleState::PreBoot);
        drop(writer.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_embedded_prompt_does_not_match() {
        let (guest, host) = tokio::io::duplex(1024);
        let mut session = ConsoleSession::from_stream(host);
        let (_r, mut w) = tokio::io::split(guest);
        w.write_all(format!("echo '{DEFAULT_BOOT_PROMPT}'\n").as_bytes())
            .await
            .unwrap();
        let deadline = Deadline::after(Duration::from_secs(30));
        let err = wait_for_prompt(&mut session, DEFAULT_BOOT_PROMPT, deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::BootTimeout { .. }));
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test]
    async fn test_eof_before_prompt() {
        let (guest, host) = tokio::io::duplex(1024);
        let mut session = ConsoleSession::from_stream(host);
        drop(guest);
        let deadline = Deadline::after(Duration::from_secs(10));
        let err = wait_for_prompt(&mut session, DEFAULT_BOOT_PROMPT, deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Channel(_)));
    }
}

//! Encoder supervision for one live cycle.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use process_utils::{terminate, tokio_command};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::state::{StreamShared, StreamState};
use crate::config::EncoderConfig;
use crate::error::{Error, Result};

/// ffmpeg's interactive quit key.
const QUIT_SEQUENCE: &[u8] = b"q";

/// Keeps exactly one ingest process alive while its scope is active.
pub(crate) struct EncoderSupervisor {
    shared: Arc<StreamShared>,
    config: EncoderConfig,
    input_url: String,
    ingest_url: String,
    restart_delay: Duration,
    grace_period: Duration,
}

impl EncoderSupervisor {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        config: EncoderConfig,
        input_url: String,
        ingest_url: String,
        restart_delay: Duration,
        grace_period: Duration,
    ) -> Self {
        Self {
            shared,
            config,
            input_url,
            ingest_url,
            restart_delay,
            grace_period,
        }
    }

    /// `<command> -i <input> <args...> -f flv <ingest>`
    fn command_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.config.args.len() + 4);
        args.push("-i".to_string());
        args.push(self.input_url.clone());
        args.extend(self.config.args.iter().cloned());
        args.push("-f".to_string());
        args.push("flv".to_string());
        args.push(self.ingest_url.clone());
        args
    }

    fn spawn(&self) -> std::io::Result<Child> {
        tokio_command(&self.config.command)
            .args(self.command_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
    }

    /// Run until `scope` is cancelled. Fails only if the process cannot be
    /// started at all; the process is never left running on return.
    pub(crate) async fn run(&self, scope: &CancellationToken) -> Result<()> {
        let account = self.shared.name.as_str();

        loop {
            let mut child = self.spawn().map_err(|e| {
                error!(account = %account, command = %self.config.command, error = %e, "Failed to start encoder");
                Error::encoder(format!("failed to start {}: {e}", self.config.command))
            })?;
            info!(account = %account, pid = ?child.id(), "Encoder started");

            tokio::select! {
                _ = scope.cancelled() => {
                    match terminate(&mut child, QUIT_SEQUENCE, self.grace_period).await {
                        Ok(outcome) if outcome.was_killed() => {
                            warn!(account = %account, "Encoder ignored quit request, killed");
                        }
                        Ok(_) => debug!(account = %account, "Encoder stopped"),
                        Err(e) => {
                            // kill_on_drop still reaps the child when `child` goes out of scope
                            error!(account = %account, error = %e, "Failed to stop encoder");
                        }
                    }
                    return Ok(());
                }
                status = child.wait() => {
                    match status {
                        Ok(status) => warn!(account = %account, %status, "Encoder exited unexpectedly"),
                        Err(e) => warn!(account = %account, error = %e, "Failed to wait for encoder"),
                    }
                }
            }

            self.shared.state.set(StreamState::EncoderRestart);
            debug!(account = %account, delay = ?self.restart_delay, "Restarting encoder");

            tokio::select! {
                biased;
                _ = scope.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.restart_delay) => {}
            }

            self.shared.state.set(StreamState::Streaming);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(command: &str, args: &[&str]) -> EncoderSupervisor {
        EncoderSupervisor::new(
            Arc::new(StreamShared::new("alice")),
            EncoderConfig {
                command: command.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
            },
            "rtmp://source/live".to_string(),
            "rtmps://ingest/abc".to_string(),
            Duration::from_millis(50),
            Duration::from_millis(200),
        )
    }

    #[test]
    fn test_command_line_layout() {
        let encoder = supervisor("ffmpeg", &["-c", "copy"]);
        assert_eq!(
            encoder.command_args(),
            vec![
                "-i",
                "rtmp://source/live",
                "-c",
                "copy",
                "-f",
                "flv",
                "rtmps://ingest/abc"
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_fails() {
        let encoder = supervisor("/nonexistent/encoder-binary", &[]);
        let scope = CancellationToken::new();
        let err = encoder.run(&scope).await.unwrap_err();
        assert!(matches!(err, Error::Encoder(_)));
    }
}

//! Small process-related helpers shared across the workspace.
//!
//! Besides the Windows console-window suppression, this crate owns the
//! "stop a child politely, then make sure it is gone" sequence used by the
//! encoder supervisor.

use std::ffi::OsStr;
use std::process::ExitStatus;
use std::time::Duration;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
///
/// The child is killed when its handle is dropped.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}

/// How a child ended after [`terminate`] was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The child had already exited, or exited within the grace period.
    Graceful(Option<ExitStatus>),
    /// The grace period elapsed and the child was killed.
    Killed(Option<ExitStatus>),
}

impl Termination {
    pub fn was_killed(&self) -> bool {
        matches!(self, Self::Killed(_))
    }
}

/// Ask `child` to quit, wait up to `grace`, then kill it.
///
/// The polite request writes `quit_sequence` (e.g. `b"q"` for ffmpeg) to the
/// child's stdin when it was spawned with a piped stdin, and closes the pipe.
/// Returns only after the child has been reaped.
#[cfg(feature = "tokio")]
pub async fn terminate(
    child: &mut tokio::process::Child,
    quit_sequence: &[u8],
    grace: Duration,
) -> std::io::Result<Termination> {
    use tokio::io::AsyncWriteExt;

    if let Some(status) = child.try_wait()? {
        return Ok(Termination::Graceful(Some(status)));
    }

    if let Some(mut stdin) = child.stdin.take() {
        // The child may already be on its way out; a broken pipe is fine.
        if !quit_sequence.is_empty() {
            let _ = stdin.write_all(quit_sequence).await;
            let _ = stdin.flush().await;
        }
        drop(stdin);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => Ok(Termination::Graceful(status.ok())),
        Err(_) => {
            child.kill().await?;
            Ok(Termination::Killed(child.wait().await.ok()))
        }
    }
}

//! Companion relay server launcher
//!
//! The relay that answers tunnel commands ships as prebuilt per-platform
//! binaries. This module picks the right one, starts it with `-target`
//! (and optionally `-port`), and waits for its `Listening on <port>` line.
//! The child is killed when the handle is dropped; nothing restarts it.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::CompanionConfig;

/// First stdout line a healthy relay prints, followed by its UDP port
pub const LISTEN_PREFIX: &str = "Listening on ";

/// Binary file names by (`std::env::consts::OS`, `std::env::consts::ARCH`)
const BINARIES: [(&str, &str, &str); 6] = [
    ("macos", "x86_64", "server-darwin-amd64"),
    ("macos", "aarch64", "server-darwin-arm64"),
    ("linux", "x86_64", "server-linux-amd64"),
    ("linux", "aarch64", "server-linux-arm64"),
    ("windows", "x86_64", "server-windows-amd64.exe"),
    ("windows", "aarch64", "server-windows-arm64.exe"),
];

/// Companion startup failures
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("no companion binary for {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("companion binary {file} not found in {searched:?}")]
    NotFound { file: String, searched: Vec<PathBuf> },

    #[error("failed to spawn companion: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("companion exited before startup ({status:?}): {stderr}")]
    Exited {
        status: Option<ExitStatus>,
        stderr: String,
    },

    #[error("companion printed {0:?} instead of its listening port")]
    UnexpectedOutput(String),

    #[error("companion did not report startup within {0:?}")]
    StartupTimeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// File name of the companion binary for `os`/`arch`
pub fn binary_name(os: &str, arch: &str) -> Option<&'static str> {
    BINARIES
        .iter()
        .find(|(o, a, _)| *o == os && *a == arch)
        .map(|(_, _, file)| *file)
}

/// File name of the companion binary for this host
pub fn platform_binary() -> Result<&'static str, LaunchError> {
    let (os, arch) = (std::env::consts::OS, std::env::consts::ARCH);
    binary_name(os, arch).ok_or_else(|| LaunchError::UnsupportedPlatform {
        os: os.to_string(),
        arch: arch.to_string(),
    })
}

/// First of `dirs` holding this host's companion binary
pub fn locate(dirs: &[PathBuf]) -> Result<PathBuf, LaunchError> {
    locate_file(platform_binary()?, dirs)
}

fn locate_file(file: &str, dirs: &[PathBuf]) -> Result<PathBuf, LaunchError> {
    dirs.iter()
        .map(|dir| dir.join(file))
        .find(|path| path.is_file())
        .ok_or_else(|| LaunchError::NotFound {
            file: file.to_string(),
            searched: dirs.to_vec(),
        })
}

/// Port announced by a `Listening on <port>` line
pub fn parse_listen_line(line: &str) -> Result<u16, LaunchError> {
    line.strip_prefix(LISTEN_PREFIX)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|port| port.parse().ok())
        .ok_or_else(|| LaunchError::UnexpectedOutput(line.to_string()))
}

/// A running companion relay
#[derive(Debug)]
pub struct CompanionServer {
    child: Child,
    port: u16,
}

impl CompanionServer {
    /// Locate and start the relay for `target` as configured
    pub async fn start(config: &CompanionConfig, target: &str) -> Result<Self, LaunchError> {
        let binary = locate(&config.bin_dirs)?;
        info!(binary = %binary.display(), target, "starting companion server");

        let mut command = Command::new(&binary);
        command.arg("-target").arg(target);
        if config.port != 0 {
            command.arg("-port").arg(config.port.to_string());
        }
        Self::spawn(command, Duration::from_secs(config.startup_timeout_secs)).await
    }

    /// Spawn `command` and wait for its startup line
    pub async fn spawn(mut command: Command, startup_timeout: Duration) -> Result<Self, LaunchError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(LaunchError::Spawn)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("companion stdout not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("companion stderr not captured"))?;
        let mut lines = BufReader::new(stdout).lines();

        let first = match tokio::time::timeout(startup_timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                let mut output = String::new();
                let _ = stderr.read_to_string(&mut output).await;
                let status = child.wait().await.ok();
                return Err(LaunchError::Exited {
                    status,
                    stderr: output.trim().to_string(),
                });
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                let _ = child.kill().await;
                return Err(LaunchError::StartupTimeout(startup_timeout));
            }
        };

        let port = match parse_listen_line(first.trim_end()) {
            Ok(port) => port,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };
        info!(port, pid = ?child.id(), "companion server listening");

        // keep both pipes drained so the child never blocks on a full buffer
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(line = %line, "companion stdout");
            }
        });
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(line = %line, "companion stderr");
            }
        });

        Ok(Self { child, port })
    }

    /// UDP port the relay listens on
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the relay to exit on its own
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Kill the relay and reap it
    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

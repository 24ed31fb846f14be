//! CLI-based repair tool using external par2 binary

use super::parser::{ExitStatus, RepairOutcome};
use super::traits::{REPAIR_EVENT_BUFFER, RepairCapabilities, RepairEvent, RepairTool};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;

/// CLI-based repair tool using external par2 binary
///
/// Runs `par2 r <file>` in the file's directory and turns its output into
/// [`RepairEvent`]s as it is printed.
///
/// # Examples
///
/// ```no_run
/// use newsweave::parity::CliRepairTool;
/// use std::path::PathBuf;
///
/// // Create with explicit path
/// let tool = CliRepairTool::new(PathBuf::from("/usr/bin/par2"));
///
/// // Or auto-discover from PATH
/// let tool = CliRepairTool::from_path();
/// ```
pub struct CliRepairTool {
    binary_path: PathBuf,
}

impl CliRepairTool {
    /// Create a new CLI tool with an explicit binary path
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    /// Attempt to find par2 in PATH
    pub fn from_path() -> Option<Self> {
        which::which("par2").ok().map(Self::new)
    }

    /// Path of the binary this tool runs
    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }
}

#[async_trait]
impl RepairTool for CliRepairTool {
    async fn repair(&self, par2_file: &Path) -> crate::Result<mpsc::Receiver<RepairEvent>> {
        let workdir = par2_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut child = Command::new(&self.binary_path)
            .arg("r") // Repair
            .arg(par2_file)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| crate::Error::ExternalTool(format!("Failed to execute par2: {}", e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, rx) = mpsc::channel(REPAIR_EVENT_BUFFER);
        let target = par2_file.display().to_string();

        tokio::spawn(async move {
            let mut outcome = RepairOutcome::default();

            let stderr_task = tokio::spawn(async move {
                let mut collected = String::new();
                if let Some(mut stderr) = stderr {
                    let _ = stderr.read_to_string(&mut collected).await;
                }
                collected
            });

            if let Some(stdout) = stdout {
                forward_lines(stdout, &mut outcome, &tx).await;
            }

            let stderr_text = stderr_task.await.unwrap_or_default();
            for line in stderr_text.split(['\r', '\n']) {
                if let Some(event) = outcome.observe(line) {
                    let _ = tx.send(event).await;
                }
            }

            let exit_status = match child.wait().await {
                Ok(status) => ExitStatus::from(status.success()),
                Err(e) => {
                    tracing::warn!(file = %target, error = %e, "Failed to wait for par2");
                    ExitStatus::Failure
                }
            };

            if !exit_status.is_success() {
                tracing::warn!(
                    file = %target,
                    error = outcome.error().unwrap_or("non-zero exit"),
                    "par2 repair failed"
                );
            }

            for event in outcome.finish(exit_status) {
                let _ = tx.send(event).await;
            }
        });

        Ok(rx)
    }

    fn capabilities(&self) -> RepairCapabilities {
        RepairCapabilities { can_repair: true }
    }

    fn name(&self) -> &'static str {
        "cli-par2"
    }
}

/// Read output as it arrives and emit an event per recognised line
async fn forward_lines<R>(mut reader: R, outcome: &mut RepairOutcome, tx: &mpsc::Sender<RepairEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut pending = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let read = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        pending.extend_from_slice(&chunk[..read]);

        while let Some(pos) = pending.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            if let Some(event) = outcome.observe(&String::from_utf8_lossy(&line)) {
                let _ = tx.send(event).await;
            }
        }
    }

    if !pending.is_empty()
        && let Some(event) = outcome.observe(&String::from_utf8_lossy(&pending))
    {
        let _ = tx.send(event).await;
    }
}

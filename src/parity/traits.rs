//! Traits and types for PAR2 repair

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::mpsc;

/// Buffer size for repair event channels
pub(crate) const REPAIR_EVENT_BUFFER: usize = 64;

/// Signal emitted while a repair runs
///
/// A run always ends with exactly one [`RepairEvent::Finished`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RepairEvent {
    /// Repair progress in percent
    Progress {
        /// 0.0 to 100.0
        percent: f32,
    },
    /// Damaged files were reconstructed
    Repaired,
    /// Everything verified intact; nothing to do
    NotBroken,
    /// Not enough recovery data
    Broken,
    /// The run is over
    Finished {
        /// Files are usable afterwards
        success: bool,
    },
}

/// Capabilities of a repair tool implementation
#[derive(Debug, Clone, Copy)]
pub struct RepairCapabilities {
    /// Can repair damaged files
    pub can_repair: bool,
}

/// Something that can reconstruct damaged files from a primary PAR2 file
///
/// Implementations report through the returned channel instead of a single
/// result so callers can surface progress while the repair runs.
///
/// # Examples
///
/// ```no_run
/// use newsweave::parity::{CliRepairTool, RepairEvent, RepairTool};
/// use std::path::Path;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let tool = CliRepairTool::from_path().ok_or("par2 not found")?;
///
/// let mut events = tool.repair(Path::new("/tmp/repair/show.par2")).await?;
/// while let Some(event) = events.recv().await {
///     if let RepairEvent::Finished { success } = event {
///         println!("repair finished: {}", success);
///     }
/// }
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait RepairTool: Send + Sync {
    /// Start repairing the set described by `par2_file`
    ///
    /// # Errors
    ///
    /// Returns an error if the repair could not be started at all (binary
    /// missing, file unreadable). Failures after starting are reported as
    /// `Broken` followed by `Finished { success: false }`.
    async fn repair(&self, par2_file: &Path) -> crate::Result<mpsc::Receiver<RepairEvent>>;

    /// Query capabilities of this tool
    fn capabilities(&self) -> RepairCapabilities;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}

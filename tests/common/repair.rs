//! Stand-in repair tool that restores files from known-good copies

use async_trait::async_trait;
use newsweave::parity::{RepairCapabilities, RepairEvent, RepairTool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Writes the reference content of every known file next to the repair file
#[derive(Default)]
pub struct FakeRepairTool {
    originals: HashMap<String, Vec<u8>>,
    succeed: bool,
    calls: Mutex<Vec<PathBuf>>,
}

impl FakeRepairTool {
    /// Tool that restores `originals` (filename to content) and succeeds
    pub fn restoring(originals: impl IntoIterator<Item = (String, Vec<u8>)>) -> Self {
        Self {
            originals: originals.into_iter().collect(),
            succeed: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Tool that always fails
    pub fn failing() -> Self {
        Self::default()
    }

    /// Repair files the tool was run on
    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RepairTool for FakeRepairTool {
    async fn repair(&self, par2_file: &Path) -> newsweave::Result<mpsc::Receiver<RepairEvent>> {
        self.calls.lock().unwrap().push(par2_file.to_path_buf());
        let (tx, rx) = mpsc::channel(8);

        if !self.succeed {
            let _ = tx.send(RepairEvent::Broken).await;
            let _ = tx.send(RepairEvent::Finished { success: false }).await;
            return Ok(rx);
        }

        let dir = par2_file.parent().unwrap_or_else(|| Path::new("."));
        let _ = tx.send(RepairEvent::Progress { percent: 50.0 }).await;
        for (name, content) in &self.originals {
            tokio::fs::write(dir.join(name), content).await?;
        }
        let _ = tx.send(RepairEvent::Progress { percent: 100.0 }).await;
        let _ = tx.send(RepairEvent::Repaired).await;
        let _ = tx.send(RepairEvent::Finished { success: true }).await;
        Ok(rx)
    }

    fn capabilities(&self) -> RepairCapabilities {
        RepairCapabilities { can_repair: true }
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

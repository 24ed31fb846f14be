//! No-op repair tool for graceful degradation

use super::traits::{RepairCapabilities, RepairEvent, RepairTool};
use async_trait::async_trait;
use std::path::Path;
use tokio::sync::mpsc;

/// No-op repair tool used when no par2 binary is available
///
/// Every repair immediately reports `Broken` and then an unsuccessful
/// `Finished`, so a manifest that needs repair is marked broken instead of
/// waiting forever.
pub struct NoOpRepairTool;

#[async_trait]
impl RepairTool for NoOpRepairTool {
    async fn repair(&self, par2_file: &Path) -> crate::Result<mpsc::Receiver<RepairEvent>> {
        tracing::warn!(
            file = %par2_file.display(),
            "PAR2 repair requires external par2 binary. Configure par2_path in config or ensure par2 is in PATH."
        );

        let (tx, rx) = mpsc::channel(2);
        let _ = tx.send(RepairEvent::Broken).await;
        let _ = tx.send(RepairEvent::Finished { success: false }).await;
        Ok(rx)
    }

    fn capabilities(&self) -> RepairCapabilities {
        RepairCapabilities { can_repair: false }
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

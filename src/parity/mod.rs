//! PAR2 repair collaborator
//!
//! The manifest only depends on the [`RepairTool`] trait: given the primary
//! repair file it yields a stream of [`RepairEvent`]s ending in `Finished`.
//!
//! - [`CliRepairTool`]: runs the external `par2` binary
//! - [`NoOpRepairTool`]: used when no binary is available; always fails
//!
//! ## Usage
//!
//! ```no_run
//! use newsweave::parity::{CliRepairTool, NoOpRepairTool, RepairTool};
//! use std::sync::Arc;
//!
//! let tool: Arc<dyn RepairTool> = match CliRepairTool::from_path() {
//!     Some(cli) => Arc::new(cli),
//!     None => Arc::new(NoOpRepairTool),
//! };
//! println!("repairing with {}", tool.name());
//! ```

mod cli;
mod noop;
mod parser;
mod traits;

pub use cli::CliRepairTool;
pub use noop::NoOpRepairTool;
pub use parser::{ExitStatus, RepairOutcome, parse_repair_line, parse_repair_output};
pub use traits::{RepairCapabilities, RepairEvent, RepairTool};

use std::path::Path;
use std::sync::Arc;

/// Pick a repair tool: an explicit binary, then `par2` on PATH, then the no-op tool
pub fn select_tool(explicit: Option<&Path>) -> Arc<dyn RepairTool> {
    if let Some(path) = explicit {
        return Arc::new(CliRepairTool::new(path.to_path_buf()));
    }
    match CliRepairTool::from_path() {
        Some(cli) => {
            tracing::debug!(binary = %cli.binary_path().display(), "Using par2 from PATH");
            Arc::new(cli)
        }
        None => {
            tracing::info!("par2 not found, repairs will be reported as impossible");
            Arc::new(NoOpRepairTool)
        }
    }
}

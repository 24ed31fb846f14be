//! Core types for newsweave

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Capacity of the event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Role a file plays within a manifest
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// PAR2 recovery data
    Par,
    /// RAR archive volume
    Rar,
    /// Anything else
    Other,
}

/// Bulk control action applied to a file's queued segment fetches
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    /// Queued fetches were withdrawn
    Aborted,
    /// Queued fetches were held back
    Paused,
    /// Held back fetches were released
    Resumed,
}

/// Event emitted while manifests are downloaded and repaired
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A segment was fetched (or taken from the cache) and decoded
    SegmentFetched {
        /// Manifest name
        manifest: String,
        /// File name
        file: String,
        /// Segment index within the file
        index: usize,
        /// Decoded cleanly
        intact: bool,
        /// Served from the segment cache
        cached: bool,
    },

    /// A segment could not be fetched or decoded
    Corrupted {
        /// Manifest name
        manifest: String,
        /// File name
        file: String,
        /// Segment index within the file
        index: usize,
    },

    /// A file's output stream completed
    FileFinished {
        /// Manifest name
        manifest: String,
        /// File name
        file: String,
        /// Bytes written
        bytes: u64,
        /// The tail was taken from a repaired copy
        repaired: bool,
    },

    /// Queued segment fetches of a file changed state in bulk
    TasksChanged {
        /// Manifest name
        manifest: String,
        /// File name
        file: String,
        /// What was done
        action: TaskAction,
        /// Number of fetches affected
        count: usize,
    },

    /// First corruption seen; the manifest will need repair
    NeedsRepair {
        /// Manifest name
        manifest: String,
    },

    /// Repair files are being downloaded
    RepairStarted {
        /// Manifest name
        manifest: String,
        /// Primary repair file
        par_file: String,
    },

    /// Repair tool progress
    RepairProgress {
        /// Manifest name
        manifest: String,
        /// Progress percentage (0.0 to 100.0)
        percent: f32,
    },

    /// A corrupted file was reconstructed
    FileRepaired {
        /// Manifest name
        manifest: String,
        /// File name
        file: String,
        /// Location of the reconstructed copy
        path: PathBuf,
    },

    /// A file is known to be intact after repair
    FileVerified {
        /// Manifest name
        manifest: String,
        /// File name
        file: String,
    },

    /// The manifest cannot be completed; emitted once
    Broken {
        /// Manifest name
        manifest: String,
        /// Why
        reason: String,
    },

    /// Every file pipeline of the manifest was aborted
    Aborted {
        /// Manifest name
        manifest: String,
        /// Queued fetches withdrawn
        tasks: usize,
    },
}

impl Event {
    /// Name of the manifest this event belongs to
    pub fn manifest(&self) -> &str {
        match self {
            Event::SegmentFetched { manifest, .. }
            | Event::Corrupted { manifest, .. }
            | Event::FileFinished { manifest, .. }
            | Event::TasksChanged { manifest, .. }
            | Event::NeedsRepair { manifest }
            | Event::RepairStarted { manifest, .. }
            | Event::RepairProgress { manifest, .. }
            | Event::FileRepaired { manifest, .. }
            | Event::FileVerified { manifest, .. }
            | Event::Broken { manifest, .. }
            | Event::Aborted { manifest, .. } => manifest,
        }
    }
}

//! Segment pipeline: fetch, decode, reorder and write logical files
//!
//! - [`WorkQueue`]: bounded priority queues for fetches and decodes
//! - [`SegmentDecoder`]: raw article body to payload bytes
//! - [`LogicalFile`]: ordered reassembly with corruption handling

mod decoder;
mod file;
mod queue;

pub use decoder::{DecodedSegment, SegmentDecoder, YencDecoder};
pub use file::{
    CorruptionObserver, LogicalFile, PipelineContext, RepairStatus, Segment, StreamOptions, StreamReport,
    schedule_weight,
};
pub use queue::{QueueSlot, WorkQueue};

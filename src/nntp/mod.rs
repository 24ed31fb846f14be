//! Wire-level protocol client
//!
//! - [`transport`]: plain or TLS byte streams
//! - [`framing`]: status lines, dot-terminated bodies, compressed bodies
//! - [`response`]: the parsed response record and status codes
//! - [`article`]: per-command records (group info, overview rows, headers)
//! - [`server_info`]: per-host cache shared by workers
//! - [`worker`]: one connection with its command and combo queues

pub mod article;
pub mod framing;
pub mod response;
pub mod server_info;
pub mod transport;
pub mod worker;

pub use article::{ActiveGroup, Article, ArticleId, GroupInfo, Headers, OverviewEntry, OverviewField};
pub use framing::FrameMode;
pub use response::Response;
pub use server_info::ServerInfo;
pub use worker::{Worker, WorkerId, WorkerLease, WorkerSettings, WorkerState, WorkerStats};

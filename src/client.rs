//! Top level client tying the pool, queues, repair tool and event bus together

use crate::config::Config;
use crate::error::Result;
use crate::manifest::Manifest;
use crate::parity::{RepairTool, select_tool};
use crate::pipeline::{PipelineContext, SegmentDecoder, WorkQueue, YencDecoder};
use crate::pool::{Pool, PoolStats};
use crate::types::{EVENT_CHANNEL_CAPACITY, Event};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Entry point of the library
///
/// Cheap to clone; clones share the same connections, queues and event bus.
/// Every [`Manifest`] opened through a client downloads over the client's
/// pool and shares its file and decode queues with sibling manifests.
#[derive(Clone)]
pub struct Client {
    config: Arc<Config>,
    pool: Pool,
    file_queue: WorkQueue,
    decode_queue: WorkQueue,
    decoder: Arc<dyn SegmentDecoder>,
    repair_tool: Arc<dyn RepairTool>,
    events: broadcast::Sender<Event>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.config.server.host)
            .field("repair_tool", &self.repair_tool.name())
            .finish()
    }
}

impl Client {
    /// Validate `config` and build the client
    ///
    /// Must be called from within a tokio runtime. No connection is opened
    /// until the first request.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let repair_tool = select_tool(config.par2_path.as_deref());
        Ok(Self::with_repair_tool(config, repair_tool))
    }

    /// Like [`Client::new`] with an explicit repair tool; skips validation
    pub fn with_repair_tool(config: Config, repair_tool: Arc<dyn RepairTool>) -> Self {
        let pool = Pool::from_config(&config);
        let file_queue = WorkQueue::new("file", config.file_queue_limit);
        let decode_queue = WorkQueue::throttled("decode", 1, config.decode_throttle);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        tracing::info!(
            host = %config.server.host,
            port = config.server.port,
            secure = config.server.secure,
            connections = config.server.connections,
            repair_tool = repair_tool.name(),
            "Client created"
        );

        Self {
            config: Arc::new(config),
            pool,
            file_queue,
            decode_queue,
            decoder: Arc::new(YencDecoder),
            repair_tool,
            events,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connection pool shared by every manifest
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Pool snapshot
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Subscribe to events of every manifest opened through this client
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Open a manifest from a URL (`http`/`https`) or a filesystem path
    pub async fn open_manifest(&self, source: &str) -> Result<Manifest> {
        match url::Url::parse(source) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Manifest::from_url(self, source).await,
            _ => Manifest::from_path(self, source).await,
        }
    }

    /// Close the pool; pending requests fail with `Cancelled`
    pub async fn close(&self) {
        self.file_queue.close();
        self.decode_queue.close();
        self.pool.close().await;
        tracing::info!(host = %self.config.server.host, "Client closed");
    }

    pub(crate) fn repair_tool(&self) -> Arc<dyn RepairTool> {
        self.repair_tool.clone()
    }

    pub(crate) fn pipeline_context(&self, manifest: String, cache_dir: PathBuf) -> PipelineContext {
        PipelineContext {
            pool: self.pool.clone(),
            file_queue: self.file_queue.clone(),
            decode_queue: self.decode_queue.clone(),
            decoder: self.decoder.clone(),
            cache_dir,
            events: self.events.clone(),
            manifest,
        }
    }
}

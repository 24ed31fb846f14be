//! Common test utilities for newsweave integration tests

#[allow(dead_code)]
pub mod assertions;
#[allow(dead_code)]
pub mod fixtures;
#[allow(dead_code)]
pub mod repair;
#[allow(dead_code)]
pub mod server;

#[allow(unused_imports)]
pub use assertions::*;
#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use repair::*;
#[allow(unused_imports)]
pub use server::*;

use newsweave::Config;
use std::time::Duration;
use tempfile::TempDir;

/// Configuration pointing at a local mock server, with a fresh temp dir
pub fn local_config(port: u16, connections: usize) -> (Config, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::for_host("127.0.0.1");
    config.server.port = port;
    config.server.connections = connections;
    config.temp_dir = temp_dir.path().join("cache");
    config.decode_throttle = Duration::from_millis(1);
    config.command_timeout = Duration::from_secs(5);
    (config, temp_dir)
}

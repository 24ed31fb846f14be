//! Per-host cache shared by every worker connected to the same server

use super::article::{ActiveGroup, GroupInfo, OverviewField};
use crate::utils::lock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

/// Cached knowledge about one server
///
/// Values are computed once, reused until a caller forces a refresh, and
/// overwritten by whichever request finishes last.
#[derive(Debug, Default)]
pub struct ServerInfo {
    host: String,
    capabilities: Mutex<Option<BTreeSet<String>>>,
    groups: Mutex<HashMap<String, GroupInfo>>,
    overview_format: Mutex<Option<Vec<OverviewField>>>,
    active_list: Mutex<Option<Vec<ActiveGroup>>>,
    xzver: Mutex<Option<bool>>,
}

impl ServerInfo {
    /// Empty cache for `host`
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Hostname this cache belongs to
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Lowercased capability lines, if fetched
    pub fn capabilities(&self) -> Option<BTreeSet<String>> {
        lock(&self.capabilities).clone()
    }

    /// Store the capability list; an advertised `xzver` enables compressed overviews
    pub fn set_capabilities(&self, capabilities: BTreeSet<String>) {
        if capabilities.contains("xzver") {
            *lock(&self.xzver) = Some(true);
        }
        *lock(&self.capabilities) = Some(capabilities);
    }

    /// Last known state of a group
    pub fn group(&self, name: &str) -> Option<GroupInfo> {
        lock(&self.groups).get(name).cloned()
    }

    /// Record a group selection result
    pub fn set_group(&self, info: GroupInfo) {
        lock(&self.groups).insert(info.name.clone(), info);
    }

    /// Cached overview column layout
    pub fn overview_format(&self) -> Option<Vec<OverviewField>> {
        lock(&self.overview_format).clone()
    }

    /// Store the overview column layout
    pub fn set_overview_format(&self, format: Vec<OverviewField>) {
        *lock(&self.overview_format) = Some(format);
    }

    /// Cached unfiltered active list
    pub fn active_list(&self) -> Option<Vec<ActiveGroup>> {
        lock(&self.active_list).clone()
    }

    /// Store the unfiltered active list
    pub fn set_active_list(&self, list: Vec<ActiveGroup>) {
        *lock(&self.active_list) = Some(list);
    }

    /// `None` until compressed overviews have been tried or advertised
    pub fn xzver(&self) -> Option<bool> {
        *lock(&self.xzver)
    }

    /// Remember whether compressed overviews work
    pub fn set_xzver(&self, supported: bool) {
        *lock(&self.xzver) = Some(supported);
    }
}

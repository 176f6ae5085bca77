//! The bucket topology model and the capability that produces it. The core
//! treats the provider as a black box handing out monotone-revision configs;
//! transports (HTTP streaming, long-poll) live with the embedder.

use crate::error::{DcpError, DcpResult};
use crate::events::EventSink;
use serde_derive::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One bucket topology snapshot: node list, vbucket map and the revision the
/// cluster stamped it with.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    pub rev: u64,
    pub name: String,
    #[serde(rename = "vBucketServerMap")]
    server_map: VbucketServerMap,
}

#[derive(Debug, Clone, Deserialize)]
struct VbucketServerMap {
    #[serde(rename = "serverList")]
    server_list: Vec<String>,
    #[serde(rename = "vBucketMap")]
    vbucket_map: Vec<Vec<i32>>,
    #[serde(rename = "vBucketMapForward", default)]
    vbucket_map_forward: Vec<Vec<i32>>,
}

impl BucketConfig {
    /// Parse the cluster's terse JSON config, substituting `$HOST` with the
    /// host the config was fetched from.
    pub fn parse(json: &str, origin_host: &str) -> DcpResult<BucketConfig> {
        let substituted = json.replace("$HOST", origin_host);

        serde_json::from_str(&substituted)
            .map_err(|err| DcpError::Config(format!("config parse failed: {}", err)))
    }

    #[inline]
    pub fn num_partitions(&self) -> u16 {
        self.server_map.vbucket_map.len() as u16
    }

    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.server_map.server_list.len()
    }

    /// Index of the node currently mastering `partition`. `None` while the
    /// cluster has no active copy (mid-failover).
    pub fn master_of(&self, partition: u16, use_fast_forward: bool) -> Option<usize> {
        let map = if use_fast_forward && !self.server_map.vbucket_map_forward.is_empty() {
            &self.server_map.vbucket_map_forward
        } else {
            &self.server_map.vbucket_map
        };

        let chain = map.get(partition as usize)?;

        match chain.first() {
            Some(&node) if node >= 0 => Some(node as usize),
            _ => None,
        }
    }

    /// Data endpoint of node `index`, as listed in the server list.
    pub fn node_addr(&self, index: usize) -> DcpResult<SocketAddr> {
        let entry = self
            .server_map
            .server_list
            .get(index)
            .ok_or(DcpError::InvariantViolation("node index outside server list"))?;

        entry
            .to_socket_addrs()
            .map_err(|err| DcpError::Config(format!("unresolvable node {}: {}", entry, err)))?
            .next()
            .ok_or_else(|| DcpError::Config(format!("node {} resolved to nothing", entry)))
    }

    /// Data endpoint of the master of `partition`. A partition with no
    /// master is a routing invariant violation, surfaced as such.
    pub fn master_addr(&self, partition: u16) -> DcpResult<SocketAddr> {
        let index = self
            .master_of(partition, false)
            .ok_or(DcpError::InvariantViolation("partition has no master"))?;

        self.node_addr(index)
    }

    /// Endpoints of every node that masters at least one partition.
    pub fn master_addrs(&self) -> DcpResult<Vec<SocketAddr>> {
        let mut indices: Vec<usize> = (0..self.num_partitions())
            .filter_map(|partition| self.master_of(partition, false))
            .collect();
        indices.sort_unstable();
        indices.dedup();

        indices.into_iter().map(|index| self.node_addr(index)).collect()
    }
}

/// Produces the current `BucketConfig`. Refresh call sites wrap the call in
/// a `RetryPolicy`; implementations only need one honest attempt.
pub trait ConfigProvider: Send {
    /// Fetch a fresh config from the cluster.
    fn refresh(&mut self, timeout: Duration) -> DcpResult<BucketConfig>;

    /// The last config this provider handed out, if any.
    fn config(&self) -> Option<BucketConfig>;

    /// Wire the provider to the client's event queue so pushed revisions
    /// reach the repair loop.
    fn attach(&mut self, _sink: EventSink) {}
}

struct StaticState {
    current: Option<BucketConfig>,
    fail_with: Option<DcpError>,
    sink: Option<EventSink>,
}

/// An in-memory provider over a mutable config cell. The embedding and test
/// seam: push revisions through the [`StaticProviderHandle`] and they both
/// become visible to `refresh` and flow onto the event queue.
pub struct StaticProvider {
    state: Arc<Mutex<StaticState>>,
}

#[derive(Clone)]
pub struct StaticProviderHandle {
    state: Arc<Mutex<StaticState>>,
}

impl StaticProvider {
    pub fn new(initial: Option<BucketConfig>) -> (StaticProvider, StaticProviderHandle) {
        let state = Arc::new(Mutex::new(StaticState {
            current: initial,
            fail_with: None,
            sink: None,
        }));

        (
            StaticProvider { state: state.clone() },
            StaticProviderHandle { state },
        )
    }
}

impl ConfigProvider for StaticProvider {
    fn refresh(&mut self, _timeout: Duration) -> DcpResult<BucketConfig> {
        let state = self.state.lock().unwrap();

        if let Some(error) = &state.fail_with {
            return Err(error.clone());
        }

        state
            .current
            .clone()
            .ok_or_else(|| DcpError::Config("no config published yet".to_string()))
    }

    fn config(&self) -> Option<BucketConfig> {
        self.state.lock().unwrap().current.clone()
    }

    fn attach(&mut self, sink: EventSink) {
        self.state.lock().unwrap().sink = Some(sink);
    }
}

impl StaticProviderHandle {
    /// Publish a new revision: becomes the refresh result and is pushed onto
    /// the event queue.
    pub fn publish(&self, config: BucketConfig) {
        let mut state = self.state.lock().unwrap();
        state.current = Some(config.clone());

        if let Some(sink) = &state.sink {
            sink.publish(crate::events::DcpEvent::ConfigRevision(config));
        }
    }

    /// Make every subsequent `refresh` fail with `error` until the next
    /// `publish`/`heal`.
    pub fn fail_refreshes(&self, error: DcpError) {
        self.state.lock().unwrap().fail_with = Some(error);
    }

    pub fn heal(&self) {
        self.state.lock().unwrap().fail_with = None;
    }
}

#[cfg(test)]
pub(crate) fn config_json(rev: u64, servers: &[&str], vbucket_map: &[&[i32]]) -> String {
    let server_list: Vec<String> = servers.iter().map(|s| format!("\"{}\"", s)).collect();
    let rows: Vec<String> = vbucket_map
        .iter()
        .map(|row| {
            let cells: Vec<String> = row.iter().map(|c| c.to_string()).collect();
            format!("[{}]", cells.join(","))
        })
        .collect();

    format!(
        r#"{{"rev":{},"name":"beer-sample","vBucketServerMap":{{"serverList":[{}],"vBucketMap":[{}]}}}}"#,
        rev,
        server_list.join(","),
        rows.join(",")
    )
}

//! Worker RPC transport.
//!
//! Strategies and the health prober talk to storage nodes through
//! [`WorkerTransport`], so tests swap the HTTP client for an in-memory
//! double with scriptable per-node behavior.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::config::WorkerAddr;
use crate::error::{ClusterError, ClusterResult};

/// Chunk write RPC payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteChunkRequest {
    /// Object the chunk belongs to
    pub object_id: String,
    /// Chunk identifier
    pub chunk_id: Uuid,
    /// Position within the object
    pub index: u32,
    /// Object version this write embeds
    pub version: u64,
    /// Content checksum
    pub checksum: String,
    /// Opaque chunk bytes
    pub data: Vec<u8>,
}

/// Chunk write RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteChunkResponse {
    /// Node that stored the chunk
    pub node_id: String,
    /// Bytes the node reports as durably written
    pub stored_bytes: u64,
}

/// RPC surface of a storage node.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Store a chunk on `node` within `deadline`.
    async fn write_chunk(
        &self,
        node: &WorkerAddr,
        request: &WriteChunkRequest,
        deadline: Duration,
    ) -> ClusterResult<WriteChunkResponse>;

    /// Fetch a chunk from `node` within `deadline`.
    async fn read_chunk(
        &self,
        node: &WorkerAddr,
        object_id: &str,
        chunk_id: Uuid,
        deadline: Duration,
    ) -> ClusterResult<Vec<u8>>;

    /// Probe `node`, returning the observed round-trip time.
    async fn health(&self, node: &WorkerAddr, deadline: Duration) -> ClusterResult<Duration>;
}

/// HTTP transport over the worker node REST endpoints.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport with a shared connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Config`] when the HTTP client cannot be
    /// constructed.
    pub fn new() -> ClusterResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| ClusterError::Config(format!("HTTP client: {err}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WorkerTransport for HttpTransport {
    async fn write_chunk(
        &self,
        node: &WorkerAddr,
        request: &WriteChunkRequest,
        deadline: Duration,
    ) -> ClusterResult<WriteChunkResponse> {
        let url = format!("{}/v1/chunks", node.address);
        let response = tokio::time::timeout(
            deadline,
            self.client.post(&url).timeout(deadline).json(request).send(),
        )
        .await
        .map_err(|_| ClusterError::Timeout(deadline))??;

        let response = response.error_for_status().map_err(|err| ClusterError::Transport {
            node: node.id.clone(),
            detail: err.to_string(),
        })?;
        Ok(response.json::<WriteChunkResponse>().await?)
    }

    async fn read_chunk(
        &self,
        node: &WorkerAddr,
        object_id: &str,
        chunk_id: Uuid,
        deadline: Duration,
    ) -> ClusterResult<Vec<u8>> {
        let url = format!(
            "{}/v1/objects/{}/chunks/{}",
            node.address, object_id, chunk_id
        );
        let response = tokio::time::timeout(
            deadline,
            self.client.get(&url).timeout(deadline).send(),
        )
        .await
        .map_err(|_| ClusterError::Timeout(deadline))??;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClusterError::NotFound(format!(
                "{object_id}/{chunk_id} on {}",
                node.id
            )));
        }
        let response = response.error_for_status().map_err(|err| ClusterError::Transport {
            node: node.id.clone(),
            detail: err.to_string(),
        })?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn health(&self, node: &WorkerAddr, deadline: Duration) -> ClusterResult<Duration> {
        let url = format!("{}/health", node.address);
        let started = Instant::now();
        let response = tokio::time::timeout(
            deadline,
            self.client.get(&url).timeout(deadline).send(),
        )
        .await
        .map_err(|_| ClusterError::Timeout(deadline))??;

        response.error_for_status().map_err(|err| ClusterError::Transport {
            node: node.id.clone(),
            detail: err.to_string(),
        })?;
        Ok(started.elapsed())
    }
}

/// Scripted behavior of one simulated node.
#[derive(Debug, Clone)]
pub enum NodeBehavior {
    /// Accept every RPC
    Ok,
    /// Accept every RPC after the given artificial latency
    Slow(Duration),
    /// Fail every RPC with a transport error
    Fail,
    /// Never answer; callers hit their deadline
    Down,
}

#[derive(Debug, Default)]
struct NodeSim {
    behavior: Option<NodeBehavior>,
    chunks: HashMap<(String, Uuid), Vec<u8>>,
    writes: u64,
}

/// In-memory transport double for tests.
///
/// Nodes default to [`NodeBehavior::Ok`]; individual nodes can be
/// scripted to fail, stall, or slow down mid-test.
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    nodes: RwLock<HashMap<String, NodeSim>>,
}

impl InMemoryTransport {
    /// Empty simulator; nodes appear on first use.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a node's behavior.
    pub async fn set_behavior(&self, node_id: &str, behavior: NodeBehavior) {
        let mut nodes = self.nodes.write().await;
        nodes.entry(node_id.to_string()).or_default().behavior = Some(behavior);
    }

    /// Bytes a node holds for a chunk, if any.
    pub async fn stored_chunk(&self, node_id: &str, object_id: &str, chunk_id: Uuid) -> Option<Vec<u8>> {
        let nodes = self.nodes.read().await;
        nodes
            .get(node_id)
            .and_then(|sim| sim.chunks.get(&(object_id.to_string(), chunk_id)).cloned())
    }

    /// Number of writes a node has accepted.
    pub async fn write_count(&self, node_id: &str) -> u64 {
        self.nodes
            .read()
            .await
            .get(node_id)
            .map_or(0, |sim| sim.writes)
    }

    async fn behavior_of(&self, node_id: &str) -> NodeBehavior {
        self.nodes
            .read()
            .await
            .get(node_id)
            .and_then(|sim| sim.behavior.clone())
            .unwrap_or(NodeBehavior::Ok)
    }

    async fn gate(&self, node: &WorkerAddr, deadline: Duration) -> ClusterResult<()> {
        match self.behavior_of(&node.id).await {
            NodeBehavior::Ok => Ok(()),
            NodeBehavior::Slow(delay) => {
                if delay >= deadline {
                    tokio::time::sleep(deadline).await;
                    return Err(ClusterError::Timeout(deadline));
                }
                tokio::time::sleep(delay).await;
                Ok(())
            }
            NodeBehavior::Fail => Err(ClusterError::Transport {
                node: node.id.clone(),
                detail: "simulated failure".to_string(),
            }),
            NodeBehavior::Down => {
                tokio::time::sleep(deadline).await;
                Err(ClusterError::Timeout(deadline))
            }
        }
    }
}

#[async_trait]
impl WorkerTransport for InMemoryTransport {
    async fn write_chunk(
        &self,
        node: &WorkerAddr,
        request: &WriteChunkRequest,
        deadline: Duration,
    ) -> ClusterResult<WriteChunkResponse> {
        self.gate(node, deadline).await?;

        let mut nodes = self.nodes.write().await;
        let sim = nodes.entry(node.id.clone()).or_default();
        sim.chunks.insert(
            (request.object_id.clone(), request.chunk_id),
            request.data.clone(),
        );
        sim.writes += 1;
        debug!(node = %node.id, chunk = %request.chunk_id, "Simulated chunk write");

        Ok(WriteChunkResponse {
            node_id: node.id.clone(),
            stored_bytes: request.data.len() as u64,
        })
    }

    async fn read_chunk(
        &self,
        node: &WorkerAddr,
        object_id: &str,
        chunk_id: Uuid,
        deadline: Duration,
    ) -> ClusterResult<Vec<u8>> {
        self.gate(node, deadline).await?;

        self.nodes
            .read()
            .await
            .get(&node.id)
            .and_then(|sim| sim.chunks.get(&(object_id.to_string(), chunk_id)).cloned())
            .ok_or_else(|| ClusterError::NotFound(format!("{object_id}/{chunk_id} on {}", node.id)))
    }

    async fn health(&self, node: &WorkerAddr, deadline: Duration) -> ClusterResult<Duration> {
        let started = Instant::now();
        self.gate(node, deadline).await?;
        Ok(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(id: &str) -> WorkerAddr {
        WorkerAddr::new(id, format!("http://{id}.local"))
    }

    fn request(data: &[u8]) -> WriteChunkRequest {
        WriteChunkRequest {
            object_id: "obj1".into(),
            chunk_id: Uuid::new_v4(),
            index: 0,
            version: 1,
            checksum: "crc".into(),
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_write_read() {
        let transport = InMemoryTransport::new();
        let node = addr("n1");
        let req = request(b"hello");

        transport
            .write_chunk(&node, &req, Duration::from_secs(1))
            .await
            .unwrap();
        let bytes = transport
            .read_chunk(&node, "obj1", req.chunk_id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(transport.write_count("n1").await, 1);
    }

    #[tokio::test]
    async fn test_in_memory_failure_script() {
        let transport = InMemoryTransport::new();
        let node = addr("n1");
        transport.set_behavior("n1", NodeBehavior::Fail).await;

        let err = transport
            .write_chunk(&node, &request(b"x"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Transport { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_down_times_out() {
        let transport = InMemoryTransport::new();
        let node = addr("n1");
        transport.set_behavior("n1", NodeBehavior::Down).await;

        let err = transport
            .health(&node, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_read_missing_chunk_not_found() {
        let transport = InMemoryTransport::new();
        let err = transport
            .read_chunk(&addr("n1"), "obj1", Uuid::new_v4(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }
}

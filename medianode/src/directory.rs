//! Worker pool and placement of new routers

use crate::config::FrontendConfig;
use crate::worker::WorkerNode;
use futures::future::join_all;
use medianode_core::MediaNodeError;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// How a media node is chosen for a new router
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Uniformly at random
    #[default]
    Random,
    /// The node with the most free capacity as last reported. Nodes whose
    /// capacity is unknown rank last.
    MostFreeCapacity,
}

/// The configured media nodes
#[derive(Debug)]
pub struct WorkerDirectory {
    workers: Vec<Arc<WorkerNode>>,
    policy: SelectionPolicy,
}

impl WorkerDirectory {
    /// Directory over already created nodes
    pub fn new(workers: Vec<Arc<WorkerNode>>, policy: SelectionPolicy) -> Self {
        Self { workers, policy }
    }

    /// One disconnected node per configured media node
    pub fn from_config(config: &FrontendConfig) -> Result<Self, MediaNodeError> {
        config.validate()?;
        let options = config.channel_options();
        let workers = config
            .media_nodes
            .iter()
            .map(|node| WorkerNode::new(node, options))
            .collect();
        Ok(Self::new(workers, config.selection_policy))
    }

    /// Every node
    pub fn workers(&self) -> &[Arc<WorkerNode>] {
        &self.workers
    }

    /// Placement policy
    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    /// Pick the node for a new router
    pub fn select(&self) -> Result<Arc<WorkerNode>, MediaNodeError> {
        let selected = match self.policy {
            SelectionPolicy::Random => self.workers.choose(&mut rand::thread_rng()),
            SelectionPolicy::MostFreeCapacity => self.workers.iter().max_by(|a, b| {
                let free = |worker: &WorkerNode| worker.last_capacity().unwrap_or(f64::NEG_INFINITY);
                free(a).total_cmp(&free(b))
            }),
        };

        let worker = selected.ok_or(MediaNodeError::NoWorkers)?;
        debug!("Selected media node {} ({:?})", worker.address(), self.policy);
        Ok(Arc::clone(worker))
    }

    /// Query every node's capacity concurrently
    pub async fn refresh_capacity(&self) -> Vec<Option<f64>> {
        join_all(self.workers.iter().map(|worker| worker.capacity())).await
    }
}

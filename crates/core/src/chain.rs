//! Chain execution record - the aggregate view of a multi-node run.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::{ChainExecutionId, ExecutionId, TaskId};
use crate::Time;

/// Results of completed nodes, keyed by node id.
pub type ChainResults = HashMap<String, serde_json::Value>;

/// Aggregate status of a chain run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainStatus {
    /// Nodes are being processed
    Running,
    /// Every node completed or was skipped
    Completed,
    /// A node failed or timed out
    Failed,
    /// Cancelled by a caller
    Cancelled,
}

impl ChainStatus {
    /// Whether the chain has finished.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status of a single node within a chain run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Not processed yet
    Pending,
    /// Task executing
    Running,
    /// Task completed
    Completed,
    /// Task failed or timed out
    Failed,
    /// Condition was false, or a dependency was skipped
    Skipped,
    /// Chain was cancelled or aborted before the node finished
    Cancelled,
}

/// Per-node record inside a [`ChainExecution`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Current status
    pub status: NodeStatus,
    /// Task created for the node, if any
    pub task_id: Option<TaskId>,
    /// Execution of that task, if any
    pub execution_id: Option<ExecutionId>,
    /// Result of the node
    pub result: Option<serde_json::Value>,
    /// Error message
    pub error: Option<String>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            status: NodeStatus::Pending,
            task_id: None,
            execution_id: None,
            result: None,
            error: None,
        }
    }
}

/// The aggregate record of one chain run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainExecution {
    /// Unique identifier of this run
    pub id: ChainExecutionId,
    /// Identifier of the chain definition
    pub chain_id: String,
    /// Aggregate status
    pub status: ChainStatus,
    /// When the run started
    pub start_time: Time,
    /// When it reached a terminal status
    pub end_time: Option<Time>,
    /// Per-node state, keyed by node id
    pub nodes: HashMap<String, NodeState>,
    /// Accumulated results of completed nodes
    pub results: ChainResults,
    /// Error that ended the chain
    pub error: Option<String>,
}

impl ChainExecution {
    /// Create a running record with every node pending.
    pub fn new<'a>(chain_id: impl Into<String>, node_ids: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            id: ChainExecutionId::new(),
            chain_id: chain_id.into(),
            status: ChainStatus::Running,
            start_time: chrono::Utc::now(),
            end_time: None,
            nodes: node_ids
                .into_iter()
                .map(|id| (id.to_string(), NodeState::default()))
                .collect(),
            results: ChainResults::new(),
            error: None,
        }
    }

    /// Move to a terminal status. Returns false if already terminal.
    pub fn finish(&mut self, status: ChainStatus, error: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.error = error;
        self.end_time = Some(chrono::Utc::now());
        true
    }

    /// Status of one node.
    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes.get(node_id).map(|n| n.status)
    }
}

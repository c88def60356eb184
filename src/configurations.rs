//! A module that contains the cluster roster: which node IDs act as
//! proposers, acceptors and learners for a run. The roster is a flat JSON
//! document and is static for the lifetime of the cluster.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::NodeId;

/// The configuration one node is booted with. `server_list` is the union of
/// the three role lists; a server that appears in no role list acts as a
/// client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(rename = "NodeID")]
    pub node_id: NodeId,
    #[serde(rename = "ServerList", default)]
    pub server_list: Vec<NodeId>,
    #[serde(rename = "ProposerList", default)]
    pub proposer_list: Vec<NodeId>,
    #[serde(rename = "AcceptorList", default)]
    pub acceptor_list: Vec<NodeId>,
    #[serde(rename = "LearnerList", default)]
    pub learner_list: Vec<NodeId>,
}

impl ClusterConfig {
    pub fn new(node_id: NodeId) -> ClusterConfig {
        ClusterConfig {
            node_id,
            ..ClusterConfig::default()
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<ClusterConfig> {
        let bs = fs::read(path).map_err(Error::ConfigRead)?;
        let cfg = serde_json::from_slice(&bs)?;
        Ok(cfg)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bs = serde_json::to_vec(self)?;
        fs::write(path, bs).map_err(Error::ConfigWrite)?;
        Ok(())
    }

    /// The number of acceptors whose agreement decides an instance. Any two
    /// quorums intersect.
    pub fn quorum(&self) -> usize {
        self.acceptor_list.len() / 2 + 1
    }

    pub fn is_proposer(&self, id: NodeId) -> bool {
        self.proposer_list.contains(&id)
    }

    pub fn is_acceptor(&self, id: NodeId) -> bool {
        self.acceptor_list.contains(&id)
    }

    pub fn is_learner(&self, id: NodeId) -> bool {
        self.learner_list.contains(&id)
    }

    /// The proposer a client directs its submissions at.
    pub fn default_leader(&self) -> Option<NodeId> {
        self.proposer_list.first().copied()
    }
}

extern crate env_logger;
#[macro_use]
extern crate log;
extern crate net2;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;
extern crate thiserror;

pub mod configurations;
pub mod error;
pub mod node;
pub mod synod;
pub mod transport;
pub mod wire;

/// The identity of a process in the cluster. Unique per process, assigned by
/// the cluster configuration.
pub type NodeId = u32;

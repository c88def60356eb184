//! Boots one cluster node from a config file and runs its reactor forever.
//! The node's ID and its roles come from the `NodeID` and role list fields
//! of the document.
//!
//! You can run this binary as follows
//!     RUST_LOG=synod=info cargo run --bin start_node -- node1.cfg

extern crate env_logger;
#[macro_use]
extern crate log;
extern crate synod;

use std::env;
use std::process;

use synod::node::Node;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("usage: {} <config-file>", args[0]);
        process::exit(2);
    }

    let mut node = match Node::from_config_file(&args[1]) {
        Ok(n) => n,
        Err(e) => {
            eprintln!("cannot boot node from {}: {}", args[1], e);
            process::exit(1);
        }
    };
    if let Err(e) = node.start() {
        eprintln!("cannot start transport: {}", e);
        process::exit(1);
    }

    info!(
        "node {} up (proposer: {}, acceptor: {}, learner: {}).",
        node.id(),
        node.config().is_proposer(node.id()),
        node.config().is_acceptor(node.id()),
        node.config().is_learner(node.id()),
    );
    node.run();
}

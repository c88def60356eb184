//! An example run which simulates a whole cluster locally: three servers
//! (one proposer, three acceptors, one learner) in their own threads plus a
//! client submitting a handful of values over the loopback transport.
//!
//! Run this binary as follows
//!     RUST_LOG=synod=info cargo run --bin simulate
//! or pass the values to submit
//!     RUST_LOG=synod=info cargo run --bin simulate -- foo bar baz

extern crate env_logger;
#[macro_use]
extern crate log;
extern crate synod;

use std::env;
use std::process;
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use synod::configurations::ClusterConfig;
use synod::node::Node;
use synod::synod::Client;
use synod::transport::UdpTransport;
use synod::wire::{self, Message, Value};
use synod::NodeId;

const CLIENT_ID: NodeId = 9;

fn cluster_cfg(node_id: NodeId) -> ClusterConfig {
    ClusterConfig {
        node_id,
        server_list: vec![1, 2, 3, CLIENT_ID],
        proposer_list: vec![1],
        acceptor_list: vec![1, 2, 3],
        learner_list: vec![3],
    }
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let values: Vec<Vec<u8>> = if args.len() > 1 {
        args.iter().skip(1).map(|v| v.as_bytes().to_vec()).collect()
    } else {
        vec![vec![42, 0, 0, 0], vec![84, 0, 0, 0], vec![126, 0, 0, 0]]
    };

    // one thread per server plus this thread for the client
    let server_ids = [1u32, 2, 3];
    let barrier = Arc::new(Barrier::new(server_ids.len() + 1));

    let mut all_threads = Vec::new();
    for &id in &server_ids {
        let barrier = barrier.clone();
        let handle = thread::spawn(move || {
            let trans = match UdpTransport::bind(id) {
                Ok(t) => t,
                Err(e) => {
                    eprintln!("node {}: cannot bind transport: {}", id, e);
                    process::exit(1);
                }
            };
            let mut node = Node::new(cluster_cfg(id), trans);
            if let Err(e) = node.start() {
                eprintln!("node {}: cannot start transport: {}", id, e);
                process::exit(1);
            }
            barrier.wait();
            node.run();
        });
        all_threads.push(handle);
    }

    let trans = UdpTransport::bind(CLIENT_ID).expect("client transport");
    let (tx, rx) = mpsc::channel();
    trans.start(tx).expect("client receive loop");
    let client = Client::new(CLIENT_ID, 1);

    // wait until every server socket is up before submitting
    barrier.wait();

    for (i, value) in values.into_iter().enumerate() {
        let seq = (i + 1) as u32;
        if let Err(e) = client.submit(seq, Value::new(value), &trans) {
            warn!("submit of seq {} failed: {}", seq, e);
            continue;
        }
        match rx.recv_timeout(Duration::from_secs(2)) {
            Ok((src, data)) => match wire::decode_one(&data) {
                Ok((Message::Response(rsp), _)) => client.on_response(&rsp, src),
                Ok((other, _)) => warn!("unexpected kind {:#04x} from {}", other.kind(), src),
                Err(e) => warn!("malformed frame from {}: {}", src, e),
            },
            Err(_) => warn!("no response for seq {}", seq),
        }
    }

    // let the last commits drain before tearing the process down
    thread::sleep(Duration::from_millis(500));
    info!("simulation finished.");
    process::exit(0);
}

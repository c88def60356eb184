//! A client which reads values from the standard input or, if more than one
//! command-line argument is passed, uses the 2nd, 3rd, etc., arguments as
//! the values to submit. Each value goes to the configured leader and the
//! client waits briefly for the matching Response.
//!
//! You can run this binary as follows
//!     RUST_LOG=synod=info cargo run --bin start_client -- client.cfg
//! to provide one value at a time, or
//!     RUST_LOG=synod=info cargo run --bin start_client -- client.cfg v1 v2 ...

extern crate env_logger;
#[macro_use]
extern crate log;
extern crate synod;
#[macro_use]
extern crate text_io;

use std::env;
use std::io::{self, Write};
use std::process;
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use synod::configurations::ClusterConfig;
use synod::synod::Client;
use synod::transport::UdpTransport;
use synod::wire::{self, Message, Value};
use synod::NodeId;

const RESPONSE_WAIT: Duration = Duration::from_secs(2);

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: {} <config-file> [value ...]", args[0]);
        process::exit(2);
    }

    let cfg = match ClusterConfig::load_from_file(&args[1]) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("cannot load config {}: {}", args[1], e);
            process::exit(1);
        }
    };
    let leader = match cfg.default_leader() {
        Some(l) => l,
        None => {
            eprintln!("config {} lists no proposers", args[1]);
            process::exit(1);
        }
    };
    let trans = match UdpTransport::bind(cfg.node_id) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("cannot bind transport for node {}: {}", cfg.node_id, e);
            process::exit(1);
        }
    };
    let (tx, rx) = mpsc::channel();
    if let Err(e) = trans.start(tx) {
        eprintln!("cannot start transport: {}", e);
        process::exit(1);
    }

    let client = Client::new(cfg.node_id, leader);
    let mut seq: u32 = 1;

    if args.len() > 2 {
        for value in args.iter().skip(2) {
            submit_one(&client, &trans, seq, value.as_bytes().to_vec(), &rx);
            seq += 1;
        }
    } else {
        loop {
            print!("value: ");
            io::stdout().flush().expect("could not flush stdout");
            let line: String = read!("{}\n");
            if line.is_empty() {
                continue;
            }
            submit_one(&client, &trans, seq, line.into_bytes(), &rx);
            seq += 1;
        }
    }
}

fn submit_one(
    client: &Client,
    trans: &UdpTransport,
    seq: u32,
    value: Vec<u8>,
    rx: &Receiver<(NodeId, Vec<u8>)>,
) {
    if let Err(e) = client.submit(seq, Value::new(value), trans) {
        warn!("submit of seq {} failed: {}", seq, e);
        return;
    }
    // there is no retry; either the response makes it back in time or the
    // submission is silently in limbo
    match rx.recv_timeout(RESPONSE_WAIT) {
        Ok((src, data)) => match wire::decode_one(&data) {
            Ok((Message::Response(rsp), _)) => client.on_response(&rsp, src),
            Ok((other, _)) => warn!("unexpected kind {:#04x} from {}", other.kind(), src),
            Err(e) => warn!("malformed frame from {}: {}", src, e),
        },
        Err(_) => warn!("no response for seq {} within {:?}", seq, RESPONSE_WAIT),
    }
}

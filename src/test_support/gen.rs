#![allow(dead_code)]
use std::net::{Ipv4Addr, SocketAddr};

use serde_json::{json, Value};

pub struct Gen {}

impl Gen {
    /// A loopback port nothing is listening on right now.
    pub fn free_port() -> u16 {
        port_scanner::request_open_port().expect("no free local port")
    }

    pub fn local_addr() -> SocketAddr {
        (Ipv4Addr::LOCALHOST, Gen::free_port()).into()
    }

    pub fn params(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!(format!("param-{}", i))).collect()
    }
}

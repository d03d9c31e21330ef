//! Helpers shared by the integration tests

#![allow(dead_code)]

use rpcwire::http::{self, Encoding, MessageBuffer};
use rpcwire::server::{HttpServer, Reply, RequestContext};
use rpcwire::Config;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Body-reversing codec registered under `name`
pub struct Reverse(pub &'static str);

impl Encoding for Reverse {
    fn name(&self) -> &str {
        self.0
    }

    fn encode(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        Ok(data.iter().rev().copied().collect())
    }

    fn decode(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        self.encode(data)
    }
}

/// Server answering every request under `/echo` with its body
pub fn echo_server(config: Config) -> HttpServer {
    init_tracing();
    let server = HttpServer::bind("127.0.0.1:0", config).unwrap();
    server.register_handler(echo);
    server
}

pub fn echo(ctx: &RequestContext) -> http::Result<Option<Reply>> {
    if !ctx.path().starts_with("/echo") {
        return Ok(None);
    }
    Ok(Some(Reply::ok("text/plain", ctx.request().body().clone())))
}

pub fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{}{}", addr, path)
}

/// Send raw bytes and collect everything until the server closes
pub fn exchange(addr: SocketAddr, raw: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(raw).unwrap();
    let mut out = Vec::new();
    let _ = stream.read_to_end(&mut out);
    String::from_utf8_lossy(&out).to_string()
}

/// Read `count` complete responses off `stream`
pub fn read_responses(stream: &mut TcpStream, count: usize) -> Vec<MessageBuffer> {
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut responses = Vec::new();
    let mut current = MessageBuffer::response();
    let mut buf = [0u8; 4096];
    while responses.len() < count {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "connection closed after {} responses", responses.len());
        let mut data = &buf[..n];
        while !data.is_empty() {
            let used = current.feed(data).unwrap();
            data = &data[used..];
            if current.is_complete() {
                responses.push(std::mem::replace(&mut current, MessageBuffer::response()));
            }
        }
    }
    responses
}

pub fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(2));
    }
}

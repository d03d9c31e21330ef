//! rpcwire - bidirectional HTTP RPC transport
//!
//! This crate carries RPC calls over HTTP/1.x in both directions on one
//! non-blocking engine: a single reactor thread multiplexes every
//! socket, complete messages are handled on a resizable worker pool,
//! client connections are pooled per destination, and pipelined server
//! responses are written back in request order.
//!
//! - [`http`]: wire types, the incremental `MessageBuffer`, encodings, TLS
//! - [`net`]: reactor, processor, connection pool, timer, worker pool
//! - [`client`]: `HttpClient` with blocking and callback completion
//! - [`server`]: `HttpServer`, request handlers, response ordering
//! - [`config`]: options shared by clients and servers

pub mod client;
pub mod config;
pub mod http;
pub mod net;
pub mod server;

pub use client::{HttpClient, Request, SharedResources};
pub use config::Config;
pub use net::{Error, Result};
pub use server::{HttpServer, Reply, RequestContext, RequestHandler};

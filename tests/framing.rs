//! Malformed requests are answered with the matching status and closed

mod common;

use common::{echo_server, exchange, Reverse};
use rpcwire::Config;
use std::sync::Arc;

fn status_line(reply: &str) -> &str {
    reply.split("\r\n").next().unwrap_or("")
}

#[test]
fn test_missing_version_is_400() {
    let server = echo_server(Config::default());
    let reply = exchange(server.local_addr(), b"FOO /x\r\n\r\n");
    assert_eq!(status_line(&reply), "HTTP/1.1 400 Bad Request");
    assert!(reply.contains("Connection: close\r\n"));
    assert!(reply.contains("Content-Type: text/plain\r\n"));
    assert!(reply.ends_with("\r\n\r\n400 Bad Request"));
}

#[test]
fn test_unsupported_method_is_501() {
    let server = echo_server(Config::default());
    let reply = exchange(server.local_addr(), b"PUT / HTTP/1.1\r\n");
    assert_eq!(status_line(&reply), "HTTP/1.1 501 Not Implemented");
}

#[test]
fn test_unsupported_version_is_505() {
    let server = echo_server(Config::default());
    let reply = exchange(server.local_addr(), b"GET / HTTP/2.0\r\n");
    assert_eq!(status_line(&reply), "HTTP/1.1 505 HTTP Version Not Supported");
}

#[test]
fn test_missing_required_headers_are_412() {
    let server = echo_server(Config::default());

    let reply = exchange(server.local_addr(), b"GET /echo HTTP/1.1\r\n\r\n");
    assert_eq!(status_line(&reply), "HTTP/1.1 412 Precondition Failed");

    let reply = exchange(
        server.local_addr(),
        b"POST /echo HTTP/1.1\r\nHost: test\r\n\r\nbody",
    );
    assert_eq!(status_line(&reply), "HTTP/1.1 412 Precondition Failed");
}

#[test]
fn test_unknown_content_encoding_is_415() {
    let server = echo_server(Config::default());
    let reply = exchange(
        server.local_addr(),
        b"POST /echo HTTP/1.1\r\nHost: test\r\nContent-Encoding: br\r\nContent-Length: 1\r\n\r\nx",
    );
    assert_eq!(status_line(&reply), "HTTP/1.1 415 Unsupported Media Type");

    server.register_encoding(Arc::new(Reverse("br")));
    let reply = exchange(
        server.local_addr(),
        b"POST /echo HTTP/1.1\r\nHost: test\r\nContent-Encoding: br\r\nContent-Length: 2\r\nConnection: close\r\n\r\nyx",
    );
    assert_eq!(status_line(&reply), "HTTP/1.1 200 OK");
    assert!(reply.ends_with("\r\n\r\nxy"));
}

#[test]
fn test_chunked_body_is_rejected() {
    let server = echo_server(Config::default());
    let reply = exchange(
        server.local_addr(),
        b"POST /echo HTTP/1.1\r\nHost: test\r\nTransfer-Encoding: chunked\r\n\r\n1\r\nx\r\n0\r\n\r\n",
    );
    assert_eq!(status_line(&reply), "HTTP/1.1 400 Bad Request");
}

#[test]
fn test_oversized_header_is_400() {
    let config = Config::builder().max_header_size(256).build();
    let server = echo_server(config);
    let raw = format!("GET /echo HTTP/1.1\r\nHost: test\r\nX-Big: {}\r\n\r\n", "a".repeat(1024));
    let reply = exchange(server.local_addr(), raw.as_bytes());
    assert_eq!(status_line(&reply), "HTTP/1.1 400 Bad Request");
}

#[test]
fn test_http10_request_is_answered_and_closed() {
    let server = echo_server(Config::default());
    let reply = exchange(
        server.local_addr(),
        b"POST /echo HTTP/1.0\r\nContent-Length: 3\r\n\r\nabc",
    );
    assert_eq!(status_line(&reply), "HTTP/1.0 200 OK");
    assert!(reply.contains("Connection: close\r\n"));
    assert!(reply.ends_with("\r\n\r\nabc"));
}

#[test]
fn test_rejection_answers_in_request_version() {
    let server = echo_server(Config::default());
    let reply = exchange(server.local_addr(), b"POST /echo HTTP/1.0\r\n\r\n");
    assert_eq!(status_line(&reply), "HTTP/1.0 412 Precondition Failed");
    assert!(reply.contains("Connection: close\r\n"));

    // Nothing parsed yet: the default version
    let reply = exchange(server.local_addr(), b"GET / HTTP/2.0\r\n");
    assert!(reply.starts_with("HTTP/1.1 505"));
}

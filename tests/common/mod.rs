//! Shared helpers for driving a connection against a scripted TCP server.

// Each test binary uses its own slice of these helpers.
#![allow(dead_code)]

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Encodes a command the way the client frames it: an array of bulk strings.
pub fn encode_command(args: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Encodes a subscription acknowledgement `[word, target, count]`.
pub fn encode_ack(word: &str, target: Option<&str>, count: i64) -> Vec<u8> {
    let mut out = format!("*3\r\n${}\r\n{}\r\n", word.len(), word).into_bytes();
    match target {
        Some(target) => {
            out.extend_from_slice(format!("${}\r\n{}\r\n", target.len(), target).as_bytes())
        }
        None => out.extend_from_slice(b"$-1\r\n"),
    }
    out.extend_from_slice(format!(":{}\r\n", count).as_bytes());
    out
}

/// Encodes a pushed `message` frame.
pub fn encode_message(channel: &str, payload: &str) -> Vec<u8> {
    encode_command(&["message", channel, payload])
}

/// Encodes a pushed `pmessage` frame.
pub fn encode_pmessage(pattern: &str, channel: &str, payload: &str) -> Vec<u8> {
    encode_command(&["pmessage", pattern, channel, payload])
}

/// Binds a listener on a free local port.
pub async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("redis://{}", listener.local_addr().unwrap());
    (listener, address)
}

/// Reads exactly `expected.len()` bytes and asserts they match.
pub async fn expect_bytes(sock: &mut TcpStream, expected: &[u8]) {
    let mut buf = vec![0u8; expected.len()];
    sock.read_exact(&mut buf).await.expect("peer hung up early");
    assert_eq!(
        String::from_utf8_lossy(&buf),
        String::from_utf8_lossy(expected),
        "unexpected bytes on the wire"
    );
}

/// Serves the QUIT exchange a graceful close performs, then waits for EOF.
pub async fn serve_quit(sock: &mut TcpStream) {
    expect_bytes(sock, &encode_command(&["QUIT"])).await;
    sock.write_all(b"+OK\r\n").await.unwrap();
    let mut rest = Vec::new();
    let _ = sock.read_to_end(&mut rest).await;
}

//! Connection lifecycle: handshake, probes, shutdown and end of stream

mod common;

use std::io::Cursor;

use serde_json::json;

use common::{fast_config, identity, MockSession, Outcome, OutputBuffer};
use dh_runner::lifecycle::{serve_connection, EofPolicy};
use dh_runner::{Flow, SharedSession};

fn serve(input: &str, engine: &MockSession, on_eof: EofPolicy) -> (Flow, OutputBuffer) {
    let out = OutputBuffer::new();
    let config = fast_config();
    let flow = serve_connection(
        Cursor::new(input.as_bytes().to_vec()),
        out.writer(),
        &SharedSession::new(engine.clone()),
        &identity(&config),
        &config,
        on_eof,
    )
    .unwrap();
    (flow, out)
}

#[test]
fn test_ready_is_the_first_line() {
    let engine = MockSession::new();
    engine.on("2+2", Outcome::value("4"));
    let input = "\n{\"type\":\"execute\",\"id\":1,\"code\":\"2+2\"}\n";

    let (_, out) = serve(input, &engine, EofPolicy::CloseSession);
    let lines = out.lines();
    assert_eq!(
        lines[0],
        json!({"type": "ready", "port": 10000, "version": "0.36.1", "mode": "embedded"})
    );
    assert_eq!(lines.len(), 2, "blank probe must not be answered");
    assert_eq!(lines[1]["result_repr"], "4");
}

#[test]
fn test_shutdown_stops_reading() {
    let engine = MockSession::new();
    let input = "{\"type\":\"shutdown\",\"id\":1}\n{\"type\":\"list_tables\",\"id\":2}\n";

    let (flow, out) = serve(input, &engine, EofPolicy::KeepSession);
    assert_eq!(flow, Flow::Shutdown);
    let kinds: Vec<_> = out
        .lines()
        .iter()
        .map(|l| l["type"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(kinds, vec!["ready", "shutdown_ack"]);
    assert_eq!(engine.close_count(), 1);
}

#[test]
fn test_stdio_eof_closes_session_without_ack() {
    let engine = MockSession::new();
    let (flow, out) = serve("{\"type\":\"server_info\",\"id\":1}\n", &engine, EofPolicy::CloseSession);
    assert_eq!(flow, Flow::Continue);
    assert!(out.of_type("shutdown_ack").is_empty());
    assert_eq!(engine.close_count(), 1);
}

#[test]
fn test_tcp_eof_keeps_session_for_next_client() {
    let engine = MockSession::new();
    let (flow, _) = serve("{\"type\":\"list_tables\"}\n", &engine, EofPolicy::KeepSession);
    assert_eq!(flow, Flow::Continue);
    assert_eq!(engine.close_count(), 0);

    let (_, out) = serve("{\"type\":\"list_tables\",\"id\":2}\n", &engine, EofPolicy::KeepSession);
    assert_eq!(out.of_type("ready").len(), 1);
    assert_eq!(out.of_type("tables").len(), 1);
}

#[test]
fn test_partial_final_line_is_handled() {
    let engine = MockSession::new();
    let (_, out) = serve("{\"type\":\"list_tables\",\"id\":\"last\"}", &engine, EofPolicy::CloseSession);
    let tables = out.of_type("tables");
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0]["id"], "last");
}

//! End-to-end tests driving the real HTTP surface against a real child process.
//!
//! Grounded on the scope of `examples/original_source/tests/unit-tests/
//! ProgramExecutor.test.cpp` and `OutputBuffer.test.cpp`, but exercised through the
//! full stack (child -> io_pump -> buffer -> server) the way the original's
//! `main.cpp` wires them, since this crate's HTTP layer has no original test file
//! of its own to adapt.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use grid_supervisor::buffer::OutputBuffer;
use grid_supervisor::child::{ChildRunner, ProgramStatus};
use grid_supervisor::io_pump::IoPump;
use grid_supervisor::server::OutputServer;

async fn start_stack(command: &str) -> (Arc<ChildRunner>, Arc<OutputBuffer>, SocketAddr) {
    let child = Arc::new(
        ChildRunner::new(
            vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()],
            HashMap::new(),
            None,
            "test-program",
        )
        .unwrap(),
    );
    child.start().unwrap();

    let buffer = Arc::new(OutputBuffer::with_default_initial(1024 * 1024));
    let pump = Arc::new(IoPump::with_default_chunk_size());
    pump.start(child.clone(), buffer.clone()).unwrap();

    let server = OutputServer::new(child.clone(), buffer.clone(), 65536);
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let (addr, fut) = server.serve(bind_addr).await.unwrap();
    tokio::spawn(fut);

    // Leak the pump's join thread intentionally; tests assert on HTTP behavior,
    // not on pump shutdown ordering.
    std::mem::forget(pump);

    (child, buffer, addr)
}

#[tokio::test]
async fn streams_output_from_the_beginning() {
    let (_child, _buffer, addr) = start_stack("echo hello-from-child; sleep 0.2").await;

    let response = reqwest::get(format!("http://{addr}/output/_stream?begin=0&timeout=5"))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = response.text().await.unwrap();

    // The first line is the hex-encoded begin position of this chunk.
    let mut lines = body.splitn(2, '\n');
    let begin_hex = lines.next().unwrap();
    assert!(i64::from_str_radix(begin_hex, 16).is_ok());
    let payload = lines.next().unwrap_or("");
    assert!(payload.contains("hello-from-child"));
}

#[tokio::test]
async fn returns_gone_after_program_exits_and_buffer_closes() {
    let (child, buffer, addr) = start_stack("true").await;
    // Wait for the child to exit and the pump to drain, then close the buffer the
    // way supervisor::run does after the io pump stops.
    child.wait(None).unwrap();
    assert_eq!(child.status(), ProgramStatus::Exited(0));
    tokio::time::sleep(Duration::from_millis(100)).await;
    buffer.close();

    let response = reqwest::get(format!("http://{addr}/output/_stream?begin=0&timeout=1"))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::GONE);
}

#[tokio::test]
async fn malformed_begin_query_param_is_bad_request() {
    let (_child, _buffer, addr) = start_stack("sleep 0.2").await;

    let response = reqwest::get(format!("http://{addr}/output/_stream?begin=not-a-number"))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn kill_endpoint_terminates_the_child_and_reports_status() {
    let (_child, _buffer, addr) = start_stack("trap '' INT; while true; do sleep 0.05; done").await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/_kill"))
        .timeout(Duration::from_secs(65))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "signalled");
    assert_eq!(body["exitSignal"], libc::SIGKILL);
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let (_child, _buffer, addr) = start_stack("sleep 0.2").await;
    let response = reqwest::get(format!("http://{addr}/nonexistent")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn initial_timeout_with_no_data_is_no_content() {
    let (_child, _buffer, addr) = start_stack("sleep 2").await;

    let response = reqwest::get(format!("http://{addr}/output/_stream?begin=0&timeout=1"))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn count_limit_truncates_the_stream() {
    let (_child, _buffer, addr) =
        start_stack("printf '0123456789'; sleep 0.2").await;

    let response = reqwest::get(format!("http://{addr}/output/_stream?begin=0&timeout=5&count=5"))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = response.text().await.unwrap();

    let mut lines = body.splitn(2, '\n');
    lines.next().unwrap();
    let payload = lines.next().unwrap_or("");
    assert_eq!(payload, "01234");
}

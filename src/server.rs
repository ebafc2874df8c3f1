//! HTTP surface: long-poll output streaming and remote kill.
//!
//! Ground truth: `examples/original_source/src/WebServerFactory.{h,cpp}`. Poco's
//! `HTTPRequestHandlerFactory` dispatch-by-path becomes a single `hyper` 0.14
//! `service_fn` that matches on `req.uri().path()`; the original's
//! `response.send(); r.write(...); r.flush();` pairs become one `body::Sender::
//! send_data` call per chunk, which is the closest `hyper` has to an explicit
//! flush. `hyper` is not a dependency of any full example repo's source, but it
//! appears in the manifest of `examples/other_examples/manifests/vectordotdev-
//! vector/Cargo.toml`, which is this pack's grounding for a custom streaming HTTP
//! surface.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{error, info};
use tokio::task::spawn_blocking;

use crate::buffer::{OutputBuffer, ReadResult};
use crate::child::{ChildRunner, ProgramStatus};

const CLIENT_READ_TIMEOUT_SECONDS: u64 = 90;

/// Shared state handed to every connection's request handler.
pub struct OutputServer {
    child: Arc<ChildRunner>,
    buffer: Arc<OutputBuffer>,
    request_buffer_size: usize,
}

impl OutputServer {
    pub fn new(child: Arc<ChildRunner>, buffer: Arc<OutputBuffer>, request_buffer_size: usize) -> Arc<Self> {
        Arc::new(OutputServer {
            child,
            buffer,
            request_buffer_size,
        })
    }

    /// Binds and serves until the returned future is dropped or the process
    /// shuts the runtime down; returns the bound port for callers that asked for
    /// port 0.
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> std::io::Result<(SocketAddr, impl std::future::Future<Output = ()>)> {
        let make_svc = make_service_fn(move |_conn| {
            let server = self.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.dispatch(req).await) }
                }))
            }
        });

        let builder = Server::try_bind(&addr).map_err(|e| std::io::Error::other(e.to_string()))?;
        let server = builder.serve(make_svc);
        let bound_addr = server.local_addr();
        info!("HTTP server listening on {bound_addr}");
        let fut = async move {
            if let Err(e) = server.await {
                error!("HTTP server error: {e}");
            }
        };
        Ok((bound_addr, fut))
    }

    async fn dispatch(&self, req: Request<Body>) -> Response<Body> {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/output/_stream") => self.handle_stream(req).await,
            (&Method::POST, "/_kill") => self.handle_kill().await,
            _ => not_found(),
        }
    }

    async fn handle_stream(&self, req: Request<Body>) -> Response<Body> {
        let query = parse_query(req.uri().query().unwrap_or(""));

        let mut begin: i64 = 0;
        let max_timeout = Duration::from_secs(CLIENT_READ_TIMEOUT_SECONDS);
        let mut timeout = Some(max_timeout);
        // 0 means unbounded: stream until the program exits or the connection drops.
        let mut count_limit: u64 = 0;

        for (key, value) in &query {
            match key.as_str() {
                "begin" => match value.parse::<i64>() {
                    Ok(v) => begin = v,
                    Err(_) => return bad_request(),
                },
                "timeout" => match value.parse::<u64>() {
                    // A client timeout of 0 means wait forever, matching the buffer's
                    // own `None` contract rather than an immediate deadline.
                    Ok(0) => timeout = None,
                    Ok(v) => timeout = Some(Duration::from_secs(v).min(max_timeout)),
                    Err(_) => return bad_request(),
                },
                "count" => match value.parse::<u64>() {
                    Ok(v) => count_limit = v,
                    Err(_) => return bad_request(),
                },
                _ => {}
            }
        }

        let request_buffer_size = self.request_buffer_size;
        let buffer = self.buffer.clone();
        let result = {
            let buffer = buffer.clone();
            match spawn_blocking(move || buffer.read(begin, request_buffer_size, timeout)).await {
                Ok(r) => r,
                Err(_) => return internal_error(),
            }
        };

        if result.is_closed() {
            return Response::builder()
                .status(StatusCode::GONE)
                .body(Body::from("<h1>Program exited.</h1>\n"))
                .expect("static response is valid");
        }
        if result.is_timeout() {
            return Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(Body::empty())
                .expect("static response is valid");
        }

        let (mut sender, body) = Body::channel();
        let response = Response::builder()
            .status(StatusCode::OK)
            .header("Transfer-Encoding", "chunked")
            .body(body)
            .expect("chunked response is valid");

        tokio::spawn(async move {
            let (first_begin, mut first_data) = match result {
                ReadResult::Data { begin, data } => (begin, data),
                _ => return,
            };
            // 0 stays unbounded; a positive limit truncates the first chunk too.
            let mut remaining = if count_limit == 0 { u64::MAX } else { count_limit };
            if (first_data.len() as u64) > remaining {
                first_data.truncate(remaining as usize);
            }

            let header = format!("{first_begin:x}\n");
            if sender.send_data(Bytes::from(header)).await.is_err() {
                return;
            }
            if sender.send_data(Bytes::from(first_data.clone())).await.is_err() {
                return;
            }
            let mut begin = first_begin + first_data.len() as u64;
            remaining -= first_data.len() as u64;
            if remaining == 0 {
                return;
            }

            loop {
                let buffer = buffer.clone();
                let next = spawn_blocking(move || buffer.read(begin as i64, request_buffer_size, timeout)).await;
                let next = match next {
                    Ok(r) => r,
                    Err(_) => break,
                };
                match next {
                    ReadResult::Closed => break,
                    ReadResult::Data { begin: b, mut data } => {
                        if b != begin {
                            break;
                        }
                        if (data.len() as u64) > remaining {
                            data.truncate(remaining as usize);
                        }
                        if !data.is_empty() && sender.send_data(Bytes::from(data.clone())).await.is_err() {
                            break;
                        }
                        begin = b + data.len() as u64;
                        remaining -= data.len() as u64;
                        if remaining == 0 {
                            break;
                        }
                    }
                    ReadResult::Timeout => continue,
                }
            }
        });

        response
    }

    async fn handle_kill(&self) -> Response<Body> {
        let child = self.child.clone();
        if spawn_blocking(move || child.kill()).await.is_err() {
            return internal_error();
        }

        let body = match self.child.status() {
            ProgramStatus::Exited(code) => {
                format!("{{\"status\": \"exited\", \"exitCode\": {code}}}")
            }
            ProgramStatus::Signalled(sig) => {
                format!("{{\"status\": \"signalled\", \"exitSignal\": {sig}}}")
            }
            ProgramStatus::CannotKill => "{\"status\": \"cannot_kill\"}".to_string(),
            ProgramStatus::NotStarted | ProgramStatus::Running => {
                return internal_error();
            }
        };

        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/json")
            .body(Body::from(body))
            .expect("kill response is valid")
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (decode_component(k), decode_component(v)),
            None => (decode_component(pair), String::new()),
        })
        .collect()
}

fn decode_component(s: &str) -> String {
    // Query values handled by this server are plain integers, so percent-decoding
    // is not required for correctness, but `+` is normalized to space to avoid
    // surprising a client sending form-encoded values.
    s.replace('+', " ")
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from("<h1>Not Found</h1>"))
        .expect("static response is valid")
}

fn bad_request() -> Response<Body> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(Body::from("<h1>Bad Request</h1>\n"))
        .expect("static response is valid")
}

fn internal_error() -> Response<Body> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(Body::empty())
        .expect("static response is valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_begin_and_timeout() {
        let parsed = parse_query("begin=-5&timeout=3");
        assert_eq!(
            parsed,
            vec![("begin".to_string(), "-5".to_string()), ("timeout".to_string(), "3".to_string())]
        );
    }

    #[test]
    fn empty_query_parses_to_no_pairs() {
        assert!(parse_query("").is_empty());
    }
}

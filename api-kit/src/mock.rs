//! A scripted `tower` service standing in for a real HTTP transport.
//!
//! Responses are queued per request path; the final response queued for a
//! path repeats for any further hits, so a single entry scripts a steady
//! endpoint while a longer queue scripts failure-then-recovery sequences.
//! Every request is recorded (method, headers, collected body) along with
//! per-path hit counts and peak concurrency, so tests can assert on the
//! traffic an operation produced.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt as _;
use parking_lot::Mutex;

use crate::BoxFuture;

/// A single canned response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    status: http::StatusCode,
    headers: http::HeaderMap,
    body: Vec<u8>,
    delay: Option<Duration>,
}

impl MockResponse {
    /// A response with the given status and an empty body.
    pub fn new(status: http::StatusCode) -> Self {
        Self {
            status,
            headers: http::HeaderMap::new(),
            body: Vec::new(),
            delay: None,
        }
    }

    /// A response carrying a JSON body.
    pub fn json(status: http::StatusCode, body: &serde_json::Value) -> Self {
        Self::new(status)
            .header(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("application/json"),
            )
            .body(serde_json::to_vec(body).expect("serialize mock body"))
    }

    /// Attach a header to the response.
    pub fn header(mut self, name: http::header::HeaderName, value: http::HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replace the response body.
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Hold the response for `delay` before answering, so tests can observe
    /// request overlap.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A request observed by the mock, with its body fully collected.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// The request method.
    pub method: http::Method,
    /// The full request URI.
    pub uri: http::Uri,
    /// The request headers.
    pub headers: http::HeaderMap,
    /// The collected request body.
    pub body: Bytes,
}

#[derive(Debug, Default)]
struct PathLog {
    hits: usize,
    concurrent: usize,
    peak: usize,
    requests: Vec<RecordedRequest>,
}

#[derive(Debug, Default)]
struct State {
    routes: HashMap<String, VecDeque<MockResponse>>,
    log: HashMap<String, PathLog>,
}

/// A scripted transport service. Clones share the same script and log.
#[derive(Debug, Default, Clone)]
pub struct MockService {
    state: Arc<Mutex<State>>,
}

impl MockService {
    /// Create an empty mock with no scripted responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for a request path.
    pub fn add(&self, path: &str, response: MockResponse) {
        self.state
            .lock()
            .routes
            .entry(path.to_owned())
            .or_default()
            .push_back(response);
    }

    /// How many requests have hit this path.
    pub fn hits(&self, path: &str) -> usize {
        self.state.lock().log.get(path).map_or(0, |log| log.hits)
    }

    /// The highest number of simultaneously in-flight requests observed on
    /// this path.
    pub fn peak(&self, path: &str) -> usize {
        self.state.lock().log.get(path).map_or(0, |log| log.peak)
    }

    /// The requests recorded for this path, in arrival order.
    pub fn requests(&self, path: &str) -> Vec<RecordedRequest> {
        self.state
            .lock()
            .log
            .get(path)
            .map_or_else(Vec::new, |log| log.requests.clone())
    }
}

impl tower::Service<http::Request<hyperdriver::Body>> for MockService {
    type Response = http::Response<hyperdriver::Body>;
    type Error = hyperdriver::client::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<hyperdriver::Body>) -> Self::Future {
        let state = self.state.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = body.collect().await.expect("collect mock request body");
            let path = parts.uri.path().to_owned();

            let response = {
                let mut state = state.lock();

                let log = state.log.entry(path.clone()).or_default();
                log.hits += 1;
                log.concurrent += 1;
                log.peak = log.peak.max(log.concurrent);
                log.requests.push(RecordedRequest {
                    method: parts.method.clone(),
                    uri: parts.uri.clone(),
                    headers: parts.headers.clone(),
                    body: body.to_bytes(),
                });

                let queue = state
                    .routes
                    .get_mut(&path)
                    .unwrap_or_else(|| panic!("no response configured for path: {path}"));

                if queue.len() > 1 {
                    queue.pop_front().expect("non-empty queue")
                } else {
                    queue
                        .front()
                        .unwrap_or_else(|| panic!("no response configured for path: {path}"))
                        .clone()
                }
            };

            if let Some(delay) = response.delay {
                tokio::time::sleep(delay).await;
            }

            {
                let mut state = state.lock();
                if let Some(log) = state.log.get_mut(&path) {
                    log.concurrent -= 1;
                }
            }

            let mut builder = http::response::Builder::new()
                .status(response.status)
                .version(http::Version::HTTP_11);

            for (key, value) in response.headers.iter() {
                builder = builder.header(key, value);
            }

            let response = builder
                .body(hyperdriver::Body::from(Bytes::from(response.body)))
                .expect("valid mock response");

            Ok(response)
        })
    }
}

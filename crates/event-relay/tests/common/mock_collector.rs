// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock upstream collector that records every batch it receives.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{body::Incoming, Request, Response};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Clone, Debug)]
pub struct ReceivedBatch {
    pub authorization: Option<String>,
    pub api_key: String,
    pub event_types: Vec<String>,
    pub body_len: usize,
}

#[derive(Default)]
struct Behaviour {
    statuses: HashMap<String, u16>,
    delays: HashMap<String, Duration>,
}

#[derive(Clone)]
pub struct MockCollector {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<ReceivedBatch>>>,
    behaviour: Arc<Mutex<Behaviour>>,
}

impl MockCollector {
    /// Start a mock collector on a random port. Every tenant gets a 200
    /// unless told otherwise.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock collector");
        let addr = listener.local_addr().expect("Failed to get local addr");

        let received = Arc::new(Mutex::new(Vec::new()));
        let behaviour = Arc::new(Mutex::new(Behaviour::default()));
        let collector = MockCollector {
            addr,
            received: received.clone(),
            behaviour: behaviour.clone(),
        };

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };

                let io = TokioIo::new(stream);
                let received = received.clone();
                let behaviour = behaviour.clone();

                tokio::spawn(async move {
                    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                        let received = received.clone();
                        let behaviour = behaviour.clone();
                        async move {
                            let authorization = req
                                .headers()
                                .get("authorization")
                                .and_then(|v| v.to_str().ok())
                                .map(str::to_string);
                            let body = req
                                .into_body()
                                .collect()
                                .await
                                .map(|collected| collected.to_bytes().to_vec())
                                .unwrap_or_default();
                            let payload: Value =
                                serde_json::from_slice(&body).unwrap_or(Value::Null);
                            let api_key = payload["api_key"].as_str().unwrap_or("").to_string();
                            let event_types = payload["events"]
                                .as_array()
                                .map(|events| {
                                    events
                                        .iter()
                                        .map(|e| e["type"].as_str().unwrap_or("").to_string())
                                        .collect()
                                })
                                .unwrap_or_default();

                            let (status, delay) = {
                                let behaviour = behaviour.lock().unwrap();
                                (
                                    behaviour.statuses.get(&api_key).copied().unwrap_or(200),
                                    behaviour.delays.get(&api_key).copied(),
                                )
                            };
                            if let Some(delay) = delay {
                                tokio::time::sleep(delay).await;
                            }

                            received.lock().unwrap().push(ReceivedBatch {
                                authorization,
                                api_key,
                                event_types,
                                body_len: body.len(),
                            });

                            Ok::<_, hyper::http::Error>(
                                Response::builder()
                                    .status(status)
                                    .body(Full::new(Bytes::from_static(b"{}")))
                                    .unwrap(),
                            )
                        }
                    });

                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        collector
    }

    pub fn url(&self) -> String {
        format!("http://{}/v1/batch", self.addr)
    }

    /// Answer every request for `api_key` with `status`.
    pub fn respond_with(&self, api_key: &str, status: u16) {
        self.behaviour
            .lock()
            .unwrap()
            .statuses
            .insert(api_key.to_string(), status);
    }

    /// Hold every response for `api_key` for `delay`.
    pub fn delay(&self, api_key: &str, delay: Duration) {
        self.behaviour
            .lock()
            .unwrap()
            .delays
            .insert(api_key.to_string(), delay);
    }

    pub fn batches(&self) -> Vec<ReceivedBatch> {
        self.received.lock().unwrap().clone()
    }

    pub fn batches_for(&self, api_key: &str) -> Vec<ReceivedBatch> {
        self.batches()
            .into_iter()
            .filter(|batch| batch.api_key == api_key)
            .collect()
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Inbound HTTP endpoint. Accepted events are appended to the tenant's queue
//! and flushed later; a 202 means "stored", not "delivered".

use crate::api_key::ApiKey;
use crate::config::RelayConfig;
use crate::constants::{EVENTS_ENDPOINT_PATH, INFO_ENDPOINT_PATH};
use crate::errors::IntakeError;
use crate::event::{Event, QueuedItem};
use crate::http_utils::{
    json_response, log_and_create_http_response, verify_request_content_length, HttpResponse,
};
use crate::queue_store::QueueStore;
use crate::tenant::TenantRegistry;
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::io;
use std::pin::pin;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Deserialize)]
struct IntakeRequest {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    events: Option<Value>,
}

pub struct IntakeServer {
    store: Arc<dyn QueueStore>,
    registry: Arc<TenantRegistry>,
    default_api_key: Option<ApiKey>,
    max_content_length: usize,
    info: Value,
}

impl IntakeServer {
    pub fn new(
        store: Arc<dyn QueueStore>,
        registry: Arc<TenantRegistry>,
        config: &RelayConfig,
    ) -> Self {
        let info = json!({
            "flush_interval_ms": u64::try_from(config.flush_interval.as_millis()).unwrap_or(u64::MAX),
            "max_body_size": config.max_body_size,
            "max_requests_per_second": config.max_requests_per_window,
            "max_consecutive_failures": config.max_consecutive_failures,
            "queue_prefix": config.queue_prefix,
            "upstream_configured": config.upstream_url.is_some(),
            "default_api_key_configured": config.api_key.is_some(),
        });
        Self {
            store,
            registry,
            default_api_key: config.default_api_key(),
            max_content_length: config.max_request_content_length,
            info,
        }
    }

    /// Accepts connections on `listener` until `cancel_token` fires, then lets
    /// open connections finish their current request.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel_token: CancellationToken,
    ) -> Result<(), io::Error> {
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = JoinSet::new();

        let service = service_fn(move |req| {
            let intake = Arc::clone(&self);
            async move { Ok::<_, Infallible>(intake.handle(req).await) }
        });

        loop {
            let conn = tokio::select! {
                () = cancel_token.cancelled() => break,
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        return Err(e);
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
            };
            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            let service = service.clone();
            let cancel_token = cancel_token.clone();
            joinset.spawn(async move {
                let mut connection = pin!(server.serve_connection(conn, service));
                let result = tokio::select! {
                    result = connection.as_mut() => result,
                    () = cancel_token.cancelled() => {
                        connection.as_mut().graceful_shutdown();
                        connection.await
                    }
                };
                if let Err(e) = result {
                    error!("Connection error: {e}");
                }
            });
        }

        debug!("Intake stopped accepting connections");
        while joinset.join_next().await.is_some() {}
        Ok(())
    }

    pub async fn handle<B>(&self, req: Request<B>) -> HttpResponse
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match (req.method(), req.uri().path()) {
            (&Method::POST, EVENTS_ENDPOINT_PATH) => self.events_handler(req).await,
            (_, EVENTS_ENDPOINT_PATH) => log_and_create_http_response(
                &format!("Method {} not allowed on {EVENTS_ENDPOINT_PATH}", req.method()),
                StatusCode::METHOD_NOT_ALLOWED,
            ),
            (&Method::GET, INFO_ENDPOINT_PATH) => self.info_handler(),
            _ => {
                let mut not_found = Response::default();
                *not_found.status_mut() = StatusCode::NOT_FOUND;
                not_found
            }
        }
    }

    async fn events_handler<B>(&self, req: Request<B>) -> HttpResponse
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if let Some(response) = verify_request_content_length(
            req.headers(),
            self.max_content_length,
            "Error processing events",
        ) {
            return response;
        }

        let body = match Limited::new(req.into_body(), self.max_content_length)
            .collect()
            .await
        {
            Ok(collected) => collected.to_bytes(),
            Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
                return log_and_create_http_response(
                    "Error processing events: Payload too large",
                    StatusCode::PAYLOAD_TOO_LARGE,
                );
            }
            Err(err) => {
                return log_and_create_http_response(
                    &format!("Error reading request body: {err}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };

        match self.ingest(&body).await {
            Ok(count) => log_and_create_http_response(
                &format!("Accepted {count} events"),
                StatusCode::ACCEPTED,
            ),
            Err(err) => {
                let status = match err {
                    IntakeError::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    IntakeError::InvalidBody(_)
                    | IntakeError::InvalidEvents
                    | IntakeError::MissingApiKey => StatusCode::BAD_REQUEST,
                };
                log_and_create_http_response(&format!("Error processing events: {err}"), status)
            }
        }
    }

    /// Validates a request body and appends every event in it to the tenant's
    /// queue in one store operation. Nothing is stored unless the whole
    /// request is valid.
    pub async fn ingest(&self, body: &[u8]) -> Result<usize, IntakeError> {
        let request: IntakeRequest = serde_json::from_slice(body)
            .map_err(|err| IntakeError::InvalidBody(err.to_string()))?;

        let api_key = request
            .api_key
            .as_deref()
            .and_then(ApiKey::new)
            .or_else(|| self.default_api_key.clone())
            .ok_or(IntakeError::MissingApiKey)?;

        let events = match request.events {
            Some(Value::Array(events)) if !events.is_empty() => events,
            _ => return Err(IntakeError::InvalidEvents),
        };

        let raw = events
            .into_iter()
            .map(|event| {
                let event: Event =
                    serde_json::from_value(event).map_err(|_| IntakeError::InvalidEvents)?;
                QueuedItem::new(api_key.clone(), event)
                    .encode()
                    .map_err(|err| IntakeError::Queue(err.into()))
            })
            .collect::<Result<Vec<String>, IntakeError>>()?;

        let tenant = self.registry.get_or_create(&api_key);
        self.store.push_tail_many(tenant.queue_key(), &raw).await?;
        debug!("Queued {} events for tenant {}", raw.len(), api_key);
        Ok(raw.len())
    }

    fn info_handler(&self) -> HttpResponse {
        json_response(
            json!({
                "endpoints": [EVENTS_ENDPOINT_PATH, INFO_ENDPOINT_PATH],
                "tenants": self.registry.len(),
                "config": self.info,
            }),
            StatusCode::OK,
        )
    }
}

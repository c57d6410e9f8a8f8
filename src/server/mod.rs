// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Inbound HTTP transport for Vireo.
//!
//! The server is a *thin* wrapper around **hyper-util**.  It owns the
//! listening socket, turns every hyper request into a [`ProxyRequest`],
//! hands it to [`GatewayCore::handle`] and writes the single resulting
//! [`GatewayResponse`] back.  The same connection serves HTTP/1.1 and
//! HTTP/2 through `hyper_util::server::conn::auto::Builder`.
//!
//! Request and response bodies are streamed; nothing is buffered here.

mod health;

pub use health::HealthServer;

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use log::{debug, error, info, warn};
use reqwest::Body;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{RwLock, oneshot};
use tokio::task::JoinSet;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

use crate::balancer::UpstreamPool;
use crate::config::ServerSettings;
use crate::core::{GatewayCore, GatewayError, GatewayResponse, ProxyRequest};
use crate::logging::middleware::RequestLogger;

/// How long in-flight connections get to finish after a shutdown signal.
const DRAIN_TIMEOUT_SECS: u64 = 30;

/// HTTP front of the gateway plus its health side port.
#[derive(Debug, Clone)]
pub struct GatewayServer {
    settings: ServerSettings,
    core: Arc<GatewayCore>,
    pool: Arc<UpstreamPool>,
    request_logger: RequestLogger,
    /// Shutdown senders for each open connection, keyed by connection id
    shutdown_senders: Arc<RwLock<HashMap<u64, oneshot::Sender<()>>>>,
    next_connection_id: Arc<AtomicU64>,
}

impl GatewayServer {
    pub fn new(
        settings: ServerSettings,
        core: Arc<GatewayCore>,
        pool: Arc<UpstreamPool>,
        request_logger: RequestLogger,
    ) -> Self {
        Self {
            settings,
            core,
            pool,
            request_logger,
            shutdown_senders: Arc::new(RwLock::new(HashMap::new())),
            next_connection_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Connections currently registered for graceful shutdown.
    pub async fn open_connections(&self) -> usize {
        self.shutdown_senders.read().await.len()
    }

    /// Bind the configured address and serve until Ctrl-C or SIGTERM.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port)
            .parse::<SocketAddr>()
            .map_err(|e| GatewayError::Other(format!("Invalid server address: {e}")))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::Other(format!("Failed to bind {addr}: {e}")))?;
        info!("Vireo gateway listening on http://{}", addr);

        let health_server = HealthServer::new(self.settings.health_port, self.pool.clone());
        health_server.set_ready();

        #[cfg(unix)]
        let mut term_stream = signal(SignalKind::terminate())
            .map_err(|e| GatewayError::Other(format!("Cannot install SIGTERM handler: {e}")))?;

        let shutdown = async move {
            #[cfg(unix)]
            let sigterm = term_stream.recv();
            #[cfg(not(unix))]
            let sigterm = std::future::pending::<Option<()>>();

            tokio::select! {
                _ = signal::ctrl_c() => info!("Received Ctrl-C; initiating graceful shutdown"),
                _ = sigterm => info!("Received SIGTERM; initiating graceful shutdown"),
            }
        };

        let result = self.serve(listener, shutdown).await;
        drop(health_server);
        result
    }

    /// Accept connections on `listener` until `shutdown` resolves, then drain.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let shutdown_senders = self.shutdown_senders.clone();
        let mut join_set = JoinSet::new();
        let shutdown_initiated = Arc::new(AtomicBool::new(false));

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    shutdown_initiated.store(true, Ordering::SeqCst);
                    break;
                }
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, remote_addr)) => {
                            if shutdown_initiated.load(Ordering::SeqCst) {
                                info!("Rejecting new connection during shutdown");
                                continue;
                            }

                            let core = self.core.clone();
                            let request_logger = self.request_logger.clone();
                            let (tx, rx) = oneshot::channel();
                            let senders = shutdown_senders.clone();
                            let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

                            // Registered before the task exists, so its removal below
                            // can never run ahead of the insert.
                            shutdown_senders.write().await.insert(connection_id, tx);

                            join_set.spawn(async move {
                                let service = service_fn(move |req: Request<Incoming>| {
                                    debug!("Incoming over {:?}", req.version());
                                    handle_request(
                                        req,
                                        core.clone(),
                                        request_logger.clone(),
                                        remote_addr,
                                    )
                                });

                                let mut builder = AutoBuilder::new(TokioExecutor::new());
                                builder.http1();
                                builder.http2();
                                let connection = builder.serve_connection(TokioIo::new(stream), service);
                                let mut conn = std::pin::pin!(connection);

                                tokio::select! {
                                    res = &mut conn => {
                                        if let Err(e) = res {
                                            log_connection_error("Connection error", &e);
                                        }
                                    }
                                    _ = rx => {
                                        debug!("Connection received shutdown signal, waiting for graceful close");
                                        conn.as_mut().graceful_shutdown();
                                        if let Err(e) = conn.await {
                                            log_connection_error("Connection error during graceful shutdown", &e);
                                        }
                                    }
                                }

                                senders.write().await.remove(&connection_id);
                                debug!("Connection {} completed", connection_id);
                            });
                        }
                        Err(e) => error!("Accept error: {}", e),
                    }
                }
            }
        }

        {
            let mut senders = shutdown_senders.write().await;
            info!("Signaling {} connection(s) to shut down", senders.len());
            for (_, sender) in senders.drain() {
                let _ = sender.send(());
            }
        }

        let drain_timeout = tokio::time::Duration::from_secs(DRAIN_TIMEOUT_SECS);
        let start_time = tokio::time::Instant::now();
        let drain = async {
            while let Some(res) = join_set.join_next().await {
                match res {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => debug!("Connection task cancelled"),
                    Err(e) => error!("Connection task failed: {}", e),
                }
            }
        };

        match tokio::time::timeout(drain_timeout, drain).await {
            Ok(()) => info!(
                "All connections drained gracefully in {:.1}s",
                start_time.elapsed().as_secs_f32()
            ),
            Err(_) => {
                warn!(
                    "Shutdown timed out after {} seconds, closing remaining connections",
                    drain_timeout.as_secs()
                );
                join_set.shutdown().await;
            }
        }

        info!("Shutdown complete");
        Ok(())
    }
}

fn log_connection_error(what: &str, err: &dyn std::fmt::Display) {
    let text = err.to_string();
    if !text.contains("connection closed") && !text.contains("connection reset") {
        error!("{}: {}", what, text);
    }
}

/// Convert a hyper request to a proxy request, streaming the body.
fn convert_hyper_request(req: Request<Incoming>, client_ip: String) -> ProxyRequest {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_owned();
    let query = parts.uri.query().map(str::to_owned);

    log::trace!(
        "Converting request: {} {} with {} headers",
        parts.method,
        path,
        parts.headers.len()
    );

    let byte_stream = body.into_data_stream().map_ok(Bytes::from);

    ProxyRequest {
        method: parts.method,
        path,
        query,
        headers: parts.headers,
        body: Body::wrap_stream(byte_stream),
        client_ip: Some(client_ip),
    }
}

/// Convert the gateway's response into a hyper response.
fn convert_gateway_response(resp: GatewayResponse) -> Response<Body> {
    let status = StatusCode::from_u16(resp.status).unwrap_or_else(|_| {
        warn!("Invalid status code {}, answering 500", resp.status);
        StatusCode::INTERNAL_SERVER_ERROR
    });

    let mut response = Response::new(resp.body);
    *response.status_mut() = status;
    *response.headers_mut() = resp.headers;
    response
}

/// Handle an incoming HTTP request.
async fn handle_request(
    req: Request<Incoming>,
    core: Arc<GatewayCore>,
    request_logger: RequestLogger,
    remote_addr: SocketAddr,
) -> Result<Response<Body>, Infallible> {
    let info = request_logger.start(
        req.method().as_str(),
        req.uri().path(),
        req.headers(),
        Some(remote_addr),
    );

    let proxy_req = convert_hyper_request(req, remote_addr.ip().to_string());
    let mut response = convert_gateway_response(core.handle(proxy_req).await);

    if let Some((name, value)) = request_logger.trace_header(&info) {
        response.headers_mut().insert(name, value);
    }
    request_logger.finish(&info, response.status().as_u16());

    Ok(response)
}

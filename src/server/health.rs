// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Liveness, readiness and upstream inspection on a side port.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming as IncomingBody;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::BTreeMap;
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::balancer::UpstreamPool;
use crate::core::Upstream;
use crate::{error_fmt, warn_fmt};

type HealthBody = http_body_util::combinators::BoxBody<Bytes, std::io::Error>;

#[derive(Debug)]
pub struct HealthServer {
    is_ready: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl HealthServer {
    /// Serve `/health`, `/ready` and `/upstreams` on `0.0.0.0:port`.
    pub fn new(port: u16, pool: Arc<UpstreamPool>) -> Self {
        let is_ready = Arc::new(AtomicBool::new(false));
        let ready_clone = is_ready.clone();

        let handle = tokio::spawn(async move {
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let listener = match TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    error_fmt!("HealthServer", "bind on {} failed: {}", addr, e);
                    return;
                }
            };

            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(s) => s,
                    Err(e) => {
                        warn_fmt!("HealthServer", "accept failed: {}", e);
                        continue;
                    }
                };

                let ready = ready_clone.clone();
                let pool = pool.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req: Request<IncomingBody>| {
                        let ready = ready.clone();
                        let pool = pool.clone();
                        async move {
                            let response = match req.uri().path() {
                                "/health" => text(StatusCode::OK, "OK"),
                                "/ready" if ready.load(Ordering::Relaxed) => {
                                    text(StatusCode::OK, "READY")
                                }
                                "/ready" => text(StatusCode::SERVICE_UNAVAILABLE, "NOT READY"),
                                "/upstreams" => upstreams(&pool),
                                _ => text(StatusCode::NOT_FOUND, "Not Found"),
                            };
                            Ok::<_, std::io::Error>(response)
                        }
                    });

                    let builder = hyper_util::server::conn::auto::Builder::new(
                        hyper_util::rt::TokioExecutor::new(),
                    );
                    let conn = builder.serve_connection(io, service);

                    if let Err(err) = conn.await {
                        warn_fmt!("HealthServer", "connection error: {}", err);
                    }
                });
            }
        });

        Self {
            is_ready,
            handle,
        }
    }

    pub fn set_ready(&self) {
        self.is_ready.store(true, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::Relaxed)
    }
}

impl Drop for HealthServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn full(bytes: impl Into<Bytes>) -> HealthBody {
    Full::new(bytes.into())
        .map_err(|never: std::convert::Infallible| match never {})
        .boxed()
}

fn text(status: StatusCode, body: &'static str) -> Response<HealthBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
}

/// Current pool snapshot, selector id to upstream list.
fn upstreams(pool: &UpstreamPool) -> Response<HealthBody> {
    let snapshot = pool.snapshot();
    let view: BTreeMap<&str, &[Upstream]> = snapshot
        .iter()
        .map(|(selector, list)| (selector.as_str(), list.as_slice()))
        .collect();

    match serde_json::to_vec(&view) {
        Ok(json) => {
            let mut response = Response::new(full(json));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error_fmt!("HealthServer", "failed to render upstreams: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

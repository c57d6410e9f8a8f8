// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Active TCP health probing of upstreams.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use super::UpstreamPool;
use crate::config::HealthCheckSettings;
use crate::core::Upstream;
use crate::{debug_fmt, info_fmt, warn_fmt};

/// Periodically connects to every distinct upstream and feeds the result
/// into [`UpstreamPool::report_status`].
#[derive(Debug, Clone)]
pub struct UpstreamHealthChecker {
    pool: Arc<UpstreamPool>,
    interval: Duration,
    timeout: Duration,
}

impl UpstreamHealthChecker {
    pub fn new(pool: Arc<UpstreamPool>, settings: &HealthCheckSettings) -> Self {
        Self {
            pool,
            interval: Duration::from_millis(settings.interval_ms.max(1)),
            timeout: Duration::from_millis(settings.timeout_ms.max(1)),
        }
    }

    /// Probe all upstreams once.  Returns how many entries changed status.
    pub async fn check_once(&self) -> usize {
        let mut changed = 0;
        for upstream in self.pool.distinct_upstreams() {
            let healthy = self.probe(&upstream).await;
            changed += self.pool.report_status(&upstream.url, healthy);
        }
        changed
    }

    /// Run [`check_once`](Self::check_once) on a fixed interval until the
    /// returned task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        info_fmt!(
            "HealthChecker",
            "probing upstreams every {:?} (timeout {:?})",
            self.interval,
            self.timeout
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let changed = self.check_once().await;
                if changed > 0 {
                    debug_fmt!("HealthChecker", "{} upstream status change(s)", changed);
                }
            }
        })
    }

    async fn probe(&self, upstream: &Upstream) -> bool {
        let Some(address) = socket_address(upstream) else {
            warn_fmt!("HealthChecker", "cannot derive an address from '{}'", upstream.url);
            return false;
        };
        match tokio::time::timeout(self.timeout, TcpStream::connect(&address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug_fmt!("HealthChecker", "{} unreachable: {}", address, e);
                false
            }
            Err(_) => {
                debug_fmt!("HealthChecker", "{} timed out after {:?}", address, self.timeout);
                false
            }
        }
    }
}

/// `host:port` of an upstream, defaulting the port from the scheme.
pub(crate) fn socket_address(upstream: &Upstream) -> Option<String> {
    let domain = upstream.domain();
    let (scheme, rest) = domain.split_once("://").unwrap_or(("http", domain.as_str()));
    let authority = rest.split(['/', '?']).next().filter(|a| !a.is_empty())?;
    let has_port = match authority.rfind(':') {
        Some(i) => !authority[i + 1..].is_empty() && !authority.ends_with(']'),
        None => false,
    };
    if has_port {
        return Some(authority.to_string());
    }
    let port = if scheme.eq_ignore_ascii_case("https") { 443 } else { 80 };
    Some(format!("{authority}:{port}"))
}

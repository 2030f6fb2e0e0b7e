use std::{collections::HashMap, net::SocketAddr};

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

type RateLimitMap = HashMap<String, Vec<DateTime<Utc>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimited {
    pub retry_after_seconds: u64,
}

/// Sliding-window request counter per client IP. Lives for the process only.
pub struct RateLimiter {
    buckets: Mutex<RateLimitMap>,
    max_requests: usize,
    window: chrono::Duration,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: chrono::Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            max_requests,
            window,
        }
    }

    pub async fn register(&self, ip: &str) -> Result<(), RateLimited> {
        self.register_at(ip, Utc::now()).await
    }

    pub async fn register_at(&self, ip: &str, now: DateTime<Utc>) -> Result<(), RateLimited> {
        let window_start = now - self.window;
        let mut buckets = self.buckets.lock().await;
        let entries = buckets.entry(ip.to_string()).or_default();
        entries.retain(|timestamp| *timestamp > window_start);

        if entries.len() >= self.max_requests {
            let reset_at = entries
                .iter()
                .min()
                .copied()
                .map(|oldest| oldest + self.window)
                .unwrap_or(now + self.window);
            let seconds = (reset_at - now).num_seconds().max(1);
            return Err(RateLimited {
                retry_after_seconds: u64::try_from(seconds).unwrap_or(1),
            });
        }

        entries.push(now);
        Ok(())
    }

    /// Drops expired timestamps and empty buckets. Idempotent.
    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        let window_start = now - self.window;
        let mut buckets = self.buckets.lock().await;
        buckets.retain(|_, timestamps| {
            timestamps.retain(|timestamp| *timestamp > window_start);
            !timestamps.is_empty()
        });
        buckets.len()
    }
}

fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    if let Some(forwarded) = check_header("x-forwarded-for") {
        let first_ip = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);

        if first_ip.is_some() {
            return first_ip;
        }
    }

    check_header("cf-connecting-ip").or_else(|| check_header("x-real-ip"))
}

pub fn client_ip(headers: &HeaderMap, addr: SocketAddr, trust_proxy_headers: bool) -> String {
    if trust_proxy_headers {
        extract_client_ip(headers).unwrap_or_else(|| addr.ip().to_string())
    } else {
        addr.ip().to_string()
    }
}

//! Health checking for the managed server

use inferlet_core::{InferletError, InferletResult};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Polls the server's health endpoints
pub struct HealthChecker {
    /// HTTP client for health checks
    client: reqwest::Client,
    /// Per-request timeout
    timeout: Duration,
}

impl HealthChecker {
    /// Create a new health checker
    pub fn new(request_timeout: Duration) -> InferletResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .no_proxy()
            .build()
            .map_err(|e| InferletError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            timeout: request_timeout,
        })
    }

    /// Check one endpoint
    pub async fn check(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => {
                let healthy = response.status().is_success();
                if healthy {
                    debug!(endpoint = %url, "Health check passed");
                } else {
                    debug!(
                        endpoint = %url,
                        status = %response.status(),
                        "Health check failed"
                    );
                }
                healthy
            }
            Err(e) => {
                debug!(
                    endpoint = %url,
                    error = %e,
                    "Health check error"
                );
                false
            }
        }
    }

    /// Probe `urls` in order every `interval` until one answers or `timeout`
    /// passes. Returns `false` on timeout.
    pub async fn await_health(&self, urls: &[String], timeout: Duration, interval: Duration) -> bool {
        self.await_health_while(urls, timeout, interval, || true).await
    }

    /// Like [`await_health`](Self::await_health), giving up early once
    /// `still_running` reports the server gone
    pub async fn await_health_while<F>(
        &self,
        urls: &[String],
        timeout: Duration,
        interval: Duration,
        still_running: F,
    ) -> bool
    where
        F: Fn() -> bool,
    {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut rounds = 0u32;

        loop {
            rounds += 1;
            for url in urls {
                if self.check(url).await {
                    info!(
                        endpoint = %url,
                        elapsed_secs = started.elapsed().as_secs(),
                        "Server is healthy"
                    );
                    return true;
                }
            }

            if !still_running() {
                warn!(rounds, "Server exited before becoming healthy");
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    rounds,
                    timeout_secs = timeout.as_secs(),
                    "Server did not become healthy in time"
                );
                return false;
            }
            if rounds % 15 == 0 {
                info!(elapsed_secs = started.elapsed().as_secs(), "Still waiting for server health");
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }

    /// Get the per-request timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Poll `urls` with a default checker
pub async fn await_health(urls: &[String], timeout: Duration, interval: Duration) -> bool {
    match HealthChecker::new(Duration::from_secs(5)) {
        Ok(checker) => checker.await_health(urls, timeout, interval).await,
        Err(e) => {
            warn!(error = %e, "Health checker unavailable");
            false
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP server answering `GET <ok_path>` with 200 and anything else with 404
    pub(crate) async fn serve(ok_path: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let path = request.split_whitespace().nth(1).unwrap_or("");
                    let status = if path == ok_path { "200 OK" } else { "404 Not Found" };
                    let response = format!("HTTP/1.1 {}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok", status);
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_health_checker_creation() {
        let checker = HealthChecker::new(Duration::from_secs(10)).unwrap();
        assert_eq!(checker.timeout(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_second_path_counts() {
        let base = serve("/health").await;
        let urls = vec![format!("{}/healthz", base), format!("{}/health", base)];
        assert!(await_health(&urls, Duration::from_secs(5), Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_timeout_returns_false() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let urls = vec![format!("http://{}/healthz", addr)];
        let started = std::time::Instant::now();
        assert!(!await_health(&urls, Duration::from_millis(300), Duration::from_millis(50)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_gives_up_when_server_exits() {
        let base = serve("/never").await;
        let checker = HealthChecker::new(Duration::from_secs(1)).unwrap();
        let urls = vec![format!("{}/healthz", base)];
        let healthy = checker
            .await_health_while(&urls, Duration::from_secs(30), Duration::from_millis(50), || false)
            .await;
        assert!(!healthy);
    }
}

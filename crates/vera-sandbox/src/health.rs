//! Health prober
//!
//! Bounded readiness polling. Any HTTP status below 500 counts as ready:
//! readiness is being tested here, not correctness. Connection errors are
//! expected while a service boots and are only logged at debug.

use crate::error::HealthCheckTimeout;
use std::time::{Duration, Instant};

/// Default interval between probes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Polls a service until it answers or a deadline elapses
#[derive(Debug, Clone)]
pub struct HealthProber {
    client: reqwest::Client,
    poll_interval: Duration,
    request_timeout: Duration,
}

impl HealthProber {
    /// Create new prober
    #[must_use]
    pub fn new(poll_interval: Duration, request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            poll_interval,
            request_timeout,
        }
    }

    /// Interval between probes
    #[inline]
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Wait until the service is ready
    ///
    /// Without a URL this sleeps `fallback_wait` and assumes readiness.
    ///
    /// # Errors
    /// `HealthCheckTimeout` once `deadline` has elapsed without a response
    /// below 500. The returned error carries no logs; callers attach them.
    pub async fn wait_until_healthy(
        &self,
        url: Option<&str>,
        fallback_wait: Duration,
        deadline: Duration,
    ) -> Result<(), HealthCheckTimeout> {
        let Some(url) = url else {
            tracing::info!(
                wait_secs = fallback_wait.as_secs(),
                "no health check URL, waiting estimated startup time"
            );
            tokio::time::sleep(fallback_wait).await;
            return Ok(());
        };

        tracing::info!(url, deadline_secs = deadline.as_secs(), "waiting for health check");

        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                tracing::warn!(url, attempts = attempt, "health check deadline exhausted");
                return Err(HealthCheckTimeout {
                    url: url.to_string(),
                    waited_secs: elapsed.as_secs(),
                    logs: String::new(),
                });
            }

            attempt += 1;
            let budget = self.request_timeout.min(deadline - elapsed);
            match self.client.get(url).timeout(budget).send().await {
                Ok(response) if response.status().as_u16() < 500 => {
                    tracing::info!(
                        url,
                        status = response.status().as_u16(),
                        attempts = attempt,
                        "health check passed"
                    );
                    return Ok(());
                }
                Ok(response) => {
                    tracing::debug!(
                        url,
                        status = response.status().as_u16(),
                        elapsed_secs = started.elapsed().as_secs(),
                        "service not ready"
                    );
                }
                Err(e) => {
                    tracing::debug!(
                        url,
                        error = %e,
                        elapsed_secs = started.elapsed().as_secs(),
                        "health probe failed"
                    );
                }
            }

            let remaining = deadline.saturating_sub(started.elapsed());
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }
}

impl Default for HealthProber {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_REQUEST_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_status(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response =
                    format!("HTTP/1.1 {status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    async fn dead_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test(start_paused = true)]
    async fn no_url_waits_fallback_then_succeeds() {
        let prober = HealthProber::default();
        let started = tokio::time::Instant::now();

        let result = prober
            .wait_until_healthy(None, Duration::from_secs(7), Duration::from_secs(1))
            .await;

        assert!(result.is_ok());
        assert!(started.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test]
    async fn client_error_status_counts_as_healthy() {
        let port = serve_status("404 Not Found").await;
        let prober = HealthProber::new(Duration::from_millis(100), Duration::from_secs(1));
        let url = format!("http://127.0.0.1:{port}/health");

        let result = prober
            .wait_until_healthy(Some(&url), Duration::ZERO, Duration::from_secs(5))
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn server_error_never_becomes_healthy() {
        let port = serve_status("503 Service Unavailable").await;
        let prober = HealthProber::new(Duration::from_millis(100), Duration::from_secs(1));
        let url = format!("http://127.0.0.1:{port}/");

        let err = prober
            .wait_until_healthy(Some(&url), Duration::ZERO, Duration::from_millis(600))
            .await
            .unwrap_err();

        assert_eq!(err.url, url);
        assert!(err.logs.is_empty());
    }

    #[tokio::test]
    async fn refused_connection_times_out_within_bounds() {
        let port = dead_port().await;
        let interval = Duration::from_millis(250);
        let deadline = Duration::from_secs(1);
        let prober = HealthProber::new(interval, Duration::from_millis(200));
        let url = format!("http://127.0.0.1:{port}/health");

        let started = Instant::now();
        let result = prober
            .wait_until_healthy(Some(&url), Duration::ZERO, deadline)
            .await;
        let elapsed = started.elapsed();

        assert!(result.is_err());
        assert!(elapsed >= deadline, "failed early after {elapsed:?}");
        assert!(
            elapsed <= deadline + interval + Duration::from_millis(300),
            "failed late after {elapsed:?}"
        );
    }
}

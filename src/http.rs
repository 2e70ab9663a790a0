//! HTTP client with rate limiting and retries for catalog sidecar requests.
//!
//! This module provides a wrapper around `reqwest::Client` that adds:
//! * Request rate limiting so artwork lookups don't hammer catalog services
//! * Automatic retries with exponential backoff for transient failures
//! * Consistent timeouts and a stable `User-Agent`
//!
//! The heavy lifting (the actual media download) goes through the external
//! fetch tool; this client only serves the small side requests around it:
//! artwork upgrades, cover bytes for tagging, and the connectivity probe.

use std::time::Duration;

use exponential_backoff::Backoff;
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::StatusCode;

use crate::error::{Error, Result};

/// HTTP client with built-in rate limiting and retries.
pub struct Client {
    /// Unlimited request client for special cases.
    ///
    /// Direct access to the underlying client without rate limiting.
    pub unlimited: reqwest::Client,

    /// Rate limiter applied to catalog-facing requests.
    rate_limiter: DefaultDirectRateLimiter,
}

impl Client {
    /// Rolling window for the rate limiter.
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(5);

    /// Maximum catalog-facing calls per interval.
    ///
    /// Artwork endpoints are polite-use services; bursts beyond this are
    /// delayed rather than sent.
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 10;

    /// Duration to keep idle connections alive.
    ///
    /// Prevents frequent reconnection overhead for subsequent requests.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Total time budget for a single request.
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Retry schedule for transient failures.
    const RETRY_ATTEMPTS: u32 = 3;
    const RETRY_MIN: Duration = Duration::from_millis(500);
    const RETRY_MAX: Duration = Duration::from_secs(8);

    /// Creates a new client with the given `User-Agent`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    ///
    /// # Panics
    ///
    /// Panics if the rate limit parameters are zero.
    pub fn new(user_agent: &str) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .timeout(Self::REQUEST_TIMEOUT)
            .user_agent(user_agent)
            .build()?;

        // Rate limit own requests as to not overload catalog services.
        let replenish_interval =
            Self::RATE_LIMIT_INTERVAL / u32::from(Self::RATE_LIMIT_CALLS_PER_INTERVAL);
        let quota = Quota::with_period(replenish_interval)
            .expect("quota time interval is zero")
            .allow_burst(
                u32::from(Self::RATE_LIMIT_CALLS_PER_INTERVAL)
                    .try_into()
                    .expect("calls per interval is zero"),
            );

        Ok(Self {
            unlimited: http_client,
            rate_limiter: governor::RateLimiter::direct(quota),
        })
    }

    /// Performs a rate-limited GET with retries.
    ///
    /// Retries on connection failures, timeouts, `429` and server errors,
    /// sleeping with exponential backoff between attempts.
    ///
    /// # Errors
    ///
    /// Returns the last error when all attempts are exhausted.
    pub async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let backoff = Backoff::new(Self::RETRY_ATTEMPTS, Self::RETRY_MIN, Self::RETRY_MAX);

        let mut last_error = Error::unavailable(format!("no attempts made for {url}"));
        for duration in &backoff {
            self.rate_limiter.until_ready().await;

            match self.unlimited.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if !Self::is_retryable(status) {
                        return Err(Error::unavailable(format!("{url} returned {status}")));
                    }
                    last_error = Error::unavailable(format!("{url} returned {status}"));
                }
                Err(e) => last_error = e.into(),
            }

            match duration {
                Some(duration) => {
                    debug!("retrying {url} in {:.1}s: {last_error}", duration.as_secs_f32());
                    tokio::time::sleep(duration).await;
                }
                None => break,
            }
        }

        Err(last_error)
    }

    /// Performs a rate-limited GET and returns the response body.
    ///
    /// # Errors
    ///
    /// Returns an error when the request fails or the body can't be read.
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.get(url).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Probes connectivity with a single uncounted, unretried request.
    ///
    /// Used by the network monitor; any response at all counts as connected.
    pub async fn probe(&self, url: &str, timeout: Duration) -> bool {
        self.unlimited
            .head(url)
            .timeout(timeout)
            .send()
            .await
            .is_ok()
    }

    fn is_retryable(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }
}

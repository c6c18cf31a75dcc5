// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HTTP client construction and retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, ClientBuilder};
use tracing::{debug, warn};

/// SDK version for identification.
const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the User-Agent sent with every request.
///
/// Format: `loom-analysis/{version}`
pub fn user_agent() -> String {
	format!("loom-analysis/{SDK_VERSION}")
}

/// Creates an HTTP client builder with the SDK User-Agent header.
pub fn builder() -> ClientBuilder {
	Client::builder().user_agent(user_agent())
}

/// Errors that can tell whether repeating the request might succeed.
pub trait RetryableError {
	fn is_retryable(&self) -> bool;
}

impl RetryableError for reqwest::Error {
	fn is_retryable(&self) -> bool {
		if self.is_timeout() || self.is_connect() {
			return true;
		}
		self
			.status()
			.is_some_and(|status| matches!(status.as_u16(), 429 | 408 | 500 | 502 | 503 | 504))
	}
}

/// Retry policy for request/response calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
	/// Total attempts, including the first one.
	pub max_attempts: u32,
	pub base_delay: Duration,
	pub max_delay: Duration,
	pub backoff_factor: f64,
	/// Randomise each delay to between half and all of its nominal value.
	pub jitter: bool,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			base_delay: Duration::from_millis(200),
			max_delay: Duration::from_secs(5),
			backoff_factor: 2.0,
			jitter: true,
		}
	}
}

impl RetryConfig {
	/// Configuration that makes a single attempt.
	pub fn no_retry() -> Self {
		Self {
			max_attempts: 1,
			..Self::default()
		}
	}

	/// Delay before retry number `retry` (zero-based), before jitter.
	pub fn delay_for(&self, retry: u32) -> Duration {
		let factor = self.backoff_factor.max(1.0).powi(retry.min(16) as i32);
		let delay_ms = self.base_delay.as_millis() as f64 * factor;
		let max_ms = self.max_delay.as_millis() as f64;
		Duration::from_millis(delay_ms.min(max_ms) as u64)
	}

	fn jittered(&self, delay: Duration) -> Duration {
		if !self.jitter {
			return delay;
		}
		delay.mul_f64(0.5 + fastrand::f64() * 0.5)
	}
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the attempts configured in `config` are used up.
pub async fn retry<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
	E: RetryableError + std::fmt::Display,
{
	let max_attempts = config.max_attempts.max(1);
	let mut attempt = 1;

	loop {
		match operation().await {
			Ok(value) => return Ok(value),
			Err(e) if attempt < max_attempts && e.is_retryable() => {
				let delay = config.jittered(config.delay_for(attempt - 1));
				warn!(
					attempt,
					max_attempts,
					delay_ms = delay.as_millis() as u64,
					error = %e,
					"Request failed, retrying"
				);
				tokio::time::sleep(delay).await;
				attempt += 1;
			}
			Err(e) => {
				debug!(attempt, error = %e, "Request failed, not retrying");
				return Err(e);
			}
		}
	}
}

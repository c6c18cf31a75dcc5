// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HTTP client for the analysis API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loom_analysis_core::{Roster, RunRecord, RunRef, WorkflowEvent};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::controller::{ControllerConfig, RunController};
use crate::error::{AnalysisError, Result};
use crate::http::{self, RetryConfig};
use crate::snapshot::SnapshotSource;
use crate::stream::{decode_sse, EventTransport, FrameStream};

/// SDK version for identification.
const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Configuration for the analysis client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Timeout for request/response calls. Not applied to event streams.
	pub request_timeout: Duration,
	/// Timeout for establishing connections, including event streams.
	pub connect_timeout: Duration,
	/// Retry configuration for run and history fetches.
	pub retry_config: RetryConfig,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			request_timeout: Duration::from_secs(30),
			connect_timeout: Duration::from_secs(10),
			retry_config: RetryConfig::default(),
		}
	}
}

/// Builder for constructing an [`AnalysisClient`].
pub struct AnalysisClientBuilder {
	base_url: Option<String>,
	auth_token: Option<String>,
	session_id: Option<String>,
	config: ClientConfig,
}

impl AnalysisClientBuilder {
	pub fn new() -> Self {
		Self {
			base_url: None,
			auth_token: None,
			session_id: None,
			config: ClientConfig::default(),
		}
	}

	/// Sets the API base URL, including any path prefix.
	///
	/// Example: `https://analysis.example.com/api`
	pub fn base_url(mut self, url: impl Into<String>) -> Self {
		self.base_url = Some(url.into());
		self
	}

	/// Sets the bearer token sent with every request.
	pub fn auth_token(mut self, token: impl Into<String>) -> Self {
		self.auth_token = Some(token.into());
		self
	}

	/// Sets the session id the server keys live event queues by.
	///
	/// Defaults to a random UUID. Use the same id that started a run to
	/// follow it.
	pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
		self.session_id = Some(session_id.into());
		self
	}

	/// Sets the HTTP request timeout.
	pub fn request_timeout(mut self, timeout: Duration) -> Self {
		self.config.request_timeout = timeout;
		self
	}

	/// Sets the connect timeout.
	pub fn connect_timeout(mut self, timeout: Duration) -> Self {
		self.config.connect_timeout = timeout;
		self
	}

	/// Sets the retry configuration.
	pub fn retry_config(mut self, config: RetryConfig) -> Self {
		self.config.retry_config = config;
		self
	}

	/// Builds the client.
	pub fn build(self) -> Result<AnalysisClient> {
		let base_url = self.base_url.ok_or(AnalysisError::InvalidBaseUrl)?;

		// Normalize base URL
		let base_url = base_url.trim_end_matches('/').to_string();
		let parsed = Url::parse(&base_url).map_err(|_| AnalysisError::InvalidBaseUrl)?;
		if !matches!(parsed.scheme(), "http" | "https")
			|| parsed.host_str().is_none()
			|| parsed.cannot_be_a_base()
		{
			return Err(AnalysisError::InvalidBaseUrl);
		}

		let session_id = self
			.session_id
			.unwrap_or_else(|| Uuid::new_v4().to_string());

		let http_client = http::builder()
			.timeout(self.config.request_timeout)
			.connect_timeout(self.config.connect_timeout)
			.build()
			.map_err(AnalysisError::RequestFailed)?;

		let stream_client = http::builder()
			.connect_timeout(self.config.connect_timeout)
			.build()
			.map_err(AnalysisError::RequestFailed)?;

		info!(
			base_url = %base_url,
			session_id = %session_id,
			sdk_version = SDK_VERSION,
			"Analysis client initialized"
		);

		Ok(AnalysisClient {
			inner: Arc::new(AnalysisClientInner {
				base_url,
				base: parsed,
				auth_token: self.auth_token,
				session_id,
				http_client,
				stream_client,
				config: self.config,
			}),
		})
	}
}

impl Default for AnalysisClientBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Internal client state.
struct AnalysisClientInner {
	base_url: String,
	base: Url,
	auth_token: Option<String>,
	session_id: String,
	http_client: Client,
	/// Same as `http_client` without the total request timeout.
	stream_client: Client,
	config: ClientConfig,
}

/// Client for the analysis API.
///
/// # Example
///
/// ```ignore
/// use loom_analysis::{AnalysisClient, ControllerConfig, Roster, RunRef};
///
/// let client = AnalysisClient::builder()
///     .base_url("https://analysis.example.com/api")
///     .auth_token("token")
///     .build()?;
///
/// let mut controller = client.controller(Roster::investment(), ControllerConfig::default());
/// controller.select(RunRef::new("opp-1", "run-1"));
///
/// while let Some(view) = controller.next_update().await {
///     println!("{} {:?}", view.run.status, view.connection);
/// }
/// ```
#[derive(Clone)]
pub struct AnalysisClient {
	inner: Arc<AnalysisClientInner>,
}

impl AnalysisClient {
	pub fn builder() -> AnalysisClientBuilder {
		AnalysisClientBuilder::new()
	}

	pub fn base_url(&self) -> &str {
		&self.inner.base_url
	}

	pub fn session_id(&self) -> &str {
		&self.inner.session_id
	}

	/// Creates a controller backed by this client.
	pub fn controller(&self, roster: Roster, config: ControllerConfig) -> RunController {
		let client = Arc::new(self.clone());
		RunController::new(client.clone(), client, roster, config)
	}

	/// Starts the workflow for a run and returns its updated record.
	///
	/// Not retried: the server rejects a second start of the same run.
	pub async fn start(&self, run: &RunRef) -> Result<RunRecord> {
		let url = self.run_url(run, &["start", self.inner.session_id.as_str()])?;
		debug!(url = %url, run = %run, "Starting run");

		let response = self
			.authorize(self.inner.http_client.post(url))
			.send()
			.await?;
		let record: RunRecord = parse_json(check_response(run, response, "start run").await?).await?;

		info!(run = %run, status = ?record.status, "Run started");
		Ok(record)
	}

	/// Builds `{base}/analysis/{opportunity}/{run}/{tail..}` with every id
	/// percent-encoded as a single path segment.
	fn run_url(&self, run: &RunRef, tail: &[&str]) -> Result<Url> {
		let mut url = self.inner.base.clone();
		url.path_segments_mut()
			.map_err(|_| AnalysisError::InvalidBaseUrl)?
			.pop_if_empty()
			.extend(["analysis", run.opportunity_id.as_str(), run.run_id.as_str()])
			.extend(tail);
		Ok(url)
	}

	fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
		match &self.inner.auth_token {
			Some(token) => request.header("Authorization", format!("Bearer {}", token)),
			None => request,
		}
	}

	async fn get_json<T: DeserializeOwned>(&self, run: &RunRef, url: &Url, action: &str) -> Result<T> {
		let response = self
			.authorize(self.inner.http_client.get(url.clone()))
			.send()
			.await?;
		parse_json(check_response(run, response, action).await?).await
	}
}

#[async_trait]
impl SnapshotSource for AnalysisClient {
	async fn fetch_run(&self, run: &RunRef) -> Result<RunRecord> {
		let url = self.run_url(run, &[])?;
		debug!(url = %url, run = %run, "Fetching run record");

		http::retry(&self.inner.config.retry_config, || {
			self.get_json(run, &url, "fetch run")
		})
		.await
	}

	async fn fetch_events(&self, run: &RunRef) -> Result<Vec<WorkflowEvent>> {
		let url = self.run_url(run, &["events"])?;
		debug!(url = %url, run = %run, "Fetching run history");

		let raw: Vec<serde_json::Value> = http::retry(&self.inner.config.retry_config, || {
			self.get_json(run, &url, "fetch history")
		})
		.await?;

		Ok(raw
			.into_iter()
			.filter_map(|value| match serde_json::from_value(value) {
				Ok(event) => Some(event),
				Err(e) => {
					warn!(run = %run, error = %e, "Skipping malformed history event");
					None
				}
			})
			.collect())
	}
}

#[async_trait]
impl EventTransport for AnalysisClient {
	async fn subscribe(&self, run: &RunRef, since_sequence: Option<u64>) -> Result<FrameStream> {
		let url = self.run_url(run, &["stream", self.inner.session_id.as_str()])?;
		debug!(url = %url, since_sequence = ?since_sequence, "Opening event stream");

		let mut request = self
			.authorize(self.inner.stream_client.get(url))
			.header("Accept", "text/event-stream")
			.header("Cache-Control", "no-cache");
		if let Some(since) = since_sequence {
			request = request.query(&[("since_sequence", since)]);
		}

		let response = request.send().await?;
		let response = check_response(run, response, "open event stream").await?;
		Ok(decode_sse(response.bytes_stream()))
	}
}

/// Maps error statuses onto SDK errors.
async fn check_response(run: &RunRef, response: Response, action: &str) -> Result<Response> {
	if response.status() == StatusCode::NOT_FOUND {
		return Err(AnalysisError::RunNotFound { run: run.clone() });
	}

	if response.status() == StatusCode::TOO_MANY_REQUESTS {
		let retry_after = response
			.headers()
			.get("Retry-After")
			.and_then(|v| v.to_str().ok())
			.and_then(|s| s.parse().ok());
		return Err(AnalysisError::RateLimited {
			retry_after_secs: retry_after,
		});
	}

	if !response.status().is_success() {
		let status = response.status().as_u16();
		let message = response.text().await.unwrap_or_default();
		error!(run = %run, action, status, message = %message, "Analysis request failed");
		return Err(AnalysisError::ServerError { status, message });
	}

	Ok(response)
}

async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T> {
	let body = response.text().await?;
	serde_json::from_str(&body).map_err(|e| AnalysisError::ParseFailed(e.to_string()))
}

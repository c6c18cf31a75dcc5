// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the analysis SDK.

use loom_analysis_core::{AnalysisCoreError, RunRef, RunStatus};
use thiserror::Error;

use crate::http::RetryableError;

/// Analysis SDK errors.
#[derive(Debug, Error)]
pub enum AnalysisError {
	/// Base URL is missing or not an http(s) URL.
	#[error("invalid base URL")]
	InvalidBaseUrl,

	/// HTTP request failed.
	#[error("HTTP request failed: {0}")]
	RequestFailed(#[from] reqwest::Error),

	/// Server returned an error response.
	#[error("server error ({status}): {message}")]
	ServerError { status: u16, message: String },

	/// The run does not exist, or is not visible to this user.
	#[error("run not found: {run}")]
	RunNotFound { run: RunRef },

	/// Rate limited by the server.
	#[error("rate limited, retry after {retry_after_secs:?} seconds")]
	RateLimited { retry_after_secs: Option<u64> },

	/// The event stream failed after it was established.
	#[error("event stream error: {0}")]
	StreamError(String),

	/// A response body could not be decoded.
	#[error("failed to parse response: {0}")]
	ParseFailed(String),

	/// A snapshot was requested for a run that has not finished.
	#[error("run {run} is not finished (status: {status})")]
	NotTerminal { run: RunRef, status: RunStatus },

	/// Controller has been closed.
	#[error("client has been shut down")]
	ClientShutdown,

	#[error(transparent)]
	Core(#[from] AnalysisCoreError),
}

impl RetryableError for AnalysisError {
	fn is_retryable(&self) -> bool {
		match self {
			AnalysisError::RequestFailed(e) => e.is_retryable(),
			AnalysisError::ServerError { status, .. } => {
				matches!(*status, 429 | 408 | 500 | 502 | 503 | 504)
			}
			AnalysisError::RateLimited { .. } => true,
			_ => false,
		}
	}
}

/// Result type alias for analysis SDK operations.
pub type Result<T> = std::result::Result<T, AnalysisError>;

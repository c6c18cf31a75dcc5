// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for analysis core operations.

use thiserror::Error;

/// Result type for analysis core operations.
pub type Result<T> = std::result::Result<T, AnalysisCoreError>;

/// Errors that can occur in analysis core operations.
#[derive(Debug, Error)]
pub enum AnalysisCoreError {
	#[error("invalid run reference '{0}': expected <opportunity_id>/<run_id>")]
	InvalidRunRef(String),

	#[error("invalid roster: {0}")]
	InvalidRoster(String),
}

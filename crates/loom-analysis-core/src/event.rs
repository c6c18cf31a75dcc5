// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Event frames reported by the analysis workflow.
//!
//! The same frame shape is used for live stream messages and for the
//! persisted history of a finished run.
//!
//! # Events
//!
//! - `workflow_started` - The run began executing
//! - `executor_invoked` - An executor started work
//! - `executor_completed` - An executor's handler returned
//! - `workflow_output` - An executor produced its result
//! - `executor_failed` - An executor failed
//! - `workflow_status` - The backend run state changed (`data.state`)
//! - `workflow_failed` - The run failed
//! - `error` - The server's stream gave up (no sequence)
//!
//! Frames are kept loosely typed: a new event type or an unexpected payload
//! must never make a frame unreadable.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Recognised event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
	WorkflowStarted,
	ExecutorInvoked,
	ExecutorCompleted,
	WorkflowOutput,
	ExecutorFailed,
	WorkflowStatus,
	WorkflowFailed,
	Error,
	Unknown,
}

impl EventKind {
	pub fn parse(event_type: &str) -> Self {
		match event_type {
			"workflow_started" => Self::WorkflowStarted,
			"executor_invoked" => Self::ExecutorInvoked,
			"executor_completed" => Self::ExecutorCompleted,
			"workflow_output" => Self::WorkflowOutput,
			"executor_failed" => Self::ExecutorFailed,
			"workflow_status" => Self::WorkflowStatus,
			"workflow_failed" => Self::WorkflowFailed,
			"error" => Self::Error,
			_ => Self::Unknown,
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			Self::WorkflowStarted => "workflow_started",
			Self::ExecutorInvoked => "executor_invoked",
			Self::ExecutorCompleted => "executor_completed",
			Self::WorkflowOutput => "workflow_output",
			Self::ExecutorFailed => "executor_failed",
			Self::WorkflowStatus => "workflow_status",
			Self::WorkflowFailed => "workflow_failed",
			Self::Error => "error",
			Self::Unknown => "unknown",
		}
	}
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One frame of the event feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
	#[serde(rename = "type")]
	pub event_type: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub executor: Option<String>,
	/// Per-run ordinal used for ordering and deduplication.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sequence: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
	/// ISO-8601 timestamp, kept as sent.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub timestamp: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub additional_context: Option<Value>,
}

impl WorkflowEvent {
	/// Creates a frame of the given kind with a sequence number and no payload.
	pub fn new(kind: EventKind, sequence: u64) -> Self {
		Self {
			event_type: kind.as_str().to_string(),
			executor: None,
			sequence: Some(sequence),
			data: None,
			message: None,
			timestamp: Some(Utc::now().to_rfc3339()),
			additional_context: None,
		}
	}

	pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
		self.executor = Some(executor.into());
		self
	}

	pub fn with_data(mut self, data: Value) -> Self {
		self.data = Some(data);
		self
	}

	pub fn with_message(mut self, message: impl Into<String>) -> Self {
		self.message = Some(message.into());
		self
	}

	pub fn kind(&self) -> EventKind {
		EventKind::parse(&self.event_type)
	}

	/// Parses the timestamp, if present and well formed.
	pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
		self
			.timestamp
			.as_deref()
			.and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
			.map(|ts| ts.with_timezone(&Utc))
	}

	/// Reads a string field of the payload.
	pub fn data_str(&self, key: &str) -> Option<&str> {
		self.data.as_ref()?.get(key)?.as_str()
	}

	/// Backend run state carried by `workflow_status` frames.
	pub fn workflow_state(&self) -> Option<&str> {
		self.data_str("state")
	}

	/// Error text from `data.error`, falling back to `message`.
	pub fn error_message(&self) -> Option<String> {
		self
			.data_str("error")
			.or(self.message.as_deref())
			.map(str::to_string)
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Persisted run records and reconstruction of finished runs.
//!
//! A finished run is rebuilt from its record instead of replaying the live
//! path: every key of `agent_results` is resolved through the same [`Roster`]
//! the state machine uses and its agents are marked completed. Agents without
//! an entry never ran and stay pending.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::event::{EventKind, WorkflowEvent};
use crate::roster::Roster;
use crate::run::{AgentStatus, Run, RunRef, RunStatus};

/// Run status as stored by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
	#[default]
	Pending,
	InProgress,
	Completed,
	Failed,
	#[serde(other)]
	Unknown,
}

impl RecordStatus {
	pub const fn run_status(self) -> RunStatus {
		match self {
			Self::Pending | Self::Unknown => RunStatus::Idle,
			Self::InProgress => RunStatus::Running,
			Self::Completed => RunStatus::Completed,
			Self::Failed => RunStatus::Failed,
		}
	}

	#[must_use]
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Failed)
	}
}

/// Failure details stored on a failed run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
	#[serde(default)]
	pub error: Option<String>,
	#[serde(default)]
	pub error_type: Option<String>,
	#[serde(default)]
	pub traceback: Option<String>,
}

/// A run as returned by the run endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
	#[serde(default)]
	pub id: String,
	#[serde(default)]
	pub status: RecordStatus,
	#[serde(default)]
	pub name: Option<String>,
	/// Per-executor results, keyed by executor id.
	#[serde(default, deserialize_with = "null_as_default")]
	pub agent_results: Map<String, Value>,
	/// Embedded history, when the server includes it. Kept raw so that one
	/// malformed entry does not make the whole record unreadable.
	#[serde(default, deserialize_with = "null_as_default")]
	pub events: Vec<Value>,
	#[serde(default)]
	pub error_details: Option<ErrorDetails>,
	/// Final summary.
	#[serde(default)]
	pub result: Option<Value>,
	#[serde(default)]
	pub started_at: Option<String>,
	#[serde(default)]
	pub completed_at: Option<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
	D: Deserializer<'de>,
	T: Default + Deserialize<'de>,
{
	Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl RunRecord {
	pub fn is_terminal(&self) -> bool {
		self.status.is_terminal()
	}

	/// Parses the embedded history, skipping entries that are not events.
	pub fn embedded_events(&self) -> Vec<WorkflowEvent> {
		self
			.events
			.iter()
			.filter_map(|raw| match serde_json::from_value(raw.clone()) {
				Ok(event) => Some(event),
				Err(e) => {
					warn!(run_id = %self.id, error = %e, "Skipping malformed embedded event");
					None
				}
			})
			.collect()
	}
}

/// Builds the state of a finished run from its record and, optionally, its
/// event history.
///
/// The history only fills gaps the record cannot express: an agent that has
/// no result but reported `executor_failed`, or that failed before its first
/// output, is shown as failed, as live replay would show it.
pub fn reconstruct(id: RunRef, record: &RunRecord, history: &[WorkflowEvent], roster: Roster) -> Run {
	let mut run = Run::new(id, roster);
	run.advance(record.status.run_status());

	let entry_of = |event: &WorkflowEvent| event.executor.as_deref().and_then(|e| roster.resolve(e));
	let failures: Vec<_> = history
		.iter()
		.filter(|e| e.kind() == EventKind::ExecutorFailed)
		.filter_map(|e| entry_of(e).map(|entry| (entry, e)))
		.collect();

	// A failure reported before the executor's first output wins, as it does live.
	for (entry, failure) in &failures {
		let first_output = history
			.iter()
			.filter(|e| e.kind() == EventKind::WorkflowOutput)
			.filter(|e| entry_of(e).is_some_and(|other| other.key == entry.key))
			.filter_map(|e| e.sequence)
			.min();
		let failed_first = match (failure.sequence, first_output) {
			(Some(failed), Some(output)) => failed < output,
			_ => false,
		};
		if failed_first {
			for slot in entry.agents {
				if let Some(agent) = run.agent_mut(slot.name) {
					agent.fail(failure.error_message());
				}
			}
		}
	}

	for (key, value) in &record.agent_results {
		let Some(entry) = roster.resolve(key) else {
			warn!(run = %run.id, executor = %key, "Ignoring result for executor outside the roster");
			continue;
		};
		let result = (!value.is_null()).then(|| value.clone());
		for slot in entry.agents {
			if let Some(agent) = run.agent_mut(slot.name) {
				agent.complete(result.clone(), None);
			}
		}
	}

	for (entry, failure) in &failures {
		for slot in entry.agents {
			if let Some(agent) = run.agent_mut(slot.name) {
				if agent.status == AgentStatus::Pending {
					agent.fail(failure.error_message());
				}
			}
		}
	}

	run.error = record
		.error_details
		.as_ref()
		.and_then(|details| details.error.clone())
		.or_else(|| {
			history
				.iter()
				.rev()
				.find(|e| e.kind() == EventKind::WorkflowFailed)
				.and_then(WorkflowEvent::error_message)
		});
	run.name = record.name.clone();
	run.summary = match &record.result {
		None | Some(Value::Null) => None,
		Some(Value::String(summary)) => Some(summary.clone()),
		Some(other) => Some(other.to_string()),
	};
	run.started_at = record.started_at.clone();
	run.completed_at = record.completed_at.clone();
	run
}

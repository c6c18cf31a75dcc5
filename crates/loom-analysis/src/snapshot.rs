// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Loading finished runs over request/response calls.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use loom_analysis_core::{reconstruct, Roster, Run, RunRecord, RunRef, WorkflowEvent};
use tracing::{debug, info};

use crate::error::{AnalysisError, Result};

/// Fetches persisted run data. Implemented over HTTP by
/// [`AnalysisClient`](crate::AnalysisClient).
#[async_trait]
pub trait SnapshotSource: Send + Sync {
	/// Fetches the run record.
	async fn fetch_run(&self, run: &RunRef) -> Result<RunRecord>;

	/// Fetches the persisted event history.
	async fn fetch_events(&self, run: &RunRef) -> Result<Vec<WorkflowEvent>>;
}

pub type SharedSource = Arc<dyn SnapshotSource>;

/// A finished run and the history it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSnapshot {
	pub run: Run,
	/// History in sequence order. Empty when history was not requested.
	pub events: Vec<WorkflowEvent>,
}

/// Rebuilds finished runs from their persisted record.
#[derive(Clone)]
pub struct SnapshotLoader {
	source: SharedSource,
	roster: Roster,
	include_history: bool,
}

impl SnapshotLoader {
	pub fn new(source: SharedSource, roster: Roster) -> Self {
		Self {
			source,
			roster,
			include_history: true,
		}
	}

	/// Whether to load the event history alongside the record.
	pub fn include_history(mut self, include: bool) -> Self {
		self.include_history = include;
		self
	}

	pub fn source(&self) -> &SharedSource {
		&self.source
	}

	/// Fetches and rebuilds a finished run. Fails with
	/// [`AnalysisError::NotTerminal`] if the run is still going.
	pub async fn load(&self, run: &RunRef) -> Result<LoadedSnapshot> {
		let record = self.source.fetch_run(run).await?;
		self.load_record(run, record).await
	}

	/// Rebuilds a finished run from a record the caller already fetched.
	pub async fn load_record(&self, run: &RunRef, record: RunRecord) -> Result<LoadedSnapshot> {
		if !record.is_terminal() {
			return Err(AnalysisError::NotTerminal {
				run: run.clone(),
				status: record.status.run_status(),
			});
		}

		let mut events = if !self.include_history {
			Vec::new()
		} else {
			let embedded = record.embedded_events();
			if embedded.is_empty() {
				self.source.fetch_events(run).await?
			} else {
				debug!(run = %run, count = embedded.len(), "Using history embedded in run record");
				embedded
			}
		};
		events.retain(|event| event.sequence.is_some());
		events.sort_by_key(|event| event.sequence);
		events.dedup_by_key(|event| event.sequence);

		let state = reconstruct(run.clone(), &record, &events, self.roster);
		info!(
			run = %run,
			status = %state.status,
			results = record.agent_results.len(),
			events = events.len(),
			"Loaded run snapshot"
		);

		Ok(LoadedSnapshot { run: state, events })
	}
}

impl fmt::Debug for SnapshotLoader {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SnapshotLoader")
			.field("roster", &self.roster)
			.field("include_history", &self.include_history)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::StaticSource;
	use loom_analysis_core::{AgentStatus, EventKind, RunStatus};
	use serde_json::json;

	fn run_ref() -> RunRef {
		RunRef::new("opp-1", "run-1")
	}

	fn completed_record() -> serde_json::Value {
		json!({
			"id": "run-1",
			"status": "completed",
			"agent_results": {"financial_analyst": {"score": 78}}
		})
	}

	#[tokio::test]
	async fn test_load_finished_run() {
		let history = vec![
			WorkflowEvent::new(EventKind::WorkflowStatus, 3).with_data(json!({"state": "IDLE"})),
			WorkflowEvent::new(EventKind::WorkflowStarted, 0),
			WorkflowEvent::new(EventKind::WorkflowStarted, 0),
			WorkflowEvent::new(EventKind::ExecutorFailed, 2).with_executor("market_analyst"),
		];
		let source = Arc::new(
			StaticSource::new()
				.with_record(&run_ref(), completed_record())
				.with_events(&run_ref(), history),
		);
		let loader = SnapshotLoader::new(source.clone(), Roster::investment());

		let snapshot = loader.load(&run_ref()).await.unwrap();
		assert_eq!(snapshot.run.status, RunStatus::Completed);
		assert_eq!(
			snapshot.run.agent("financial").unwrap().status,
			AgentStatus::Completed
		);
		assert_eq!(snapshot.run.agent("market").unwrap().status, AgentStatus::Failed);
		assert_eq!(snapshot.run.agent("risk").unwrap().status, AgentStatus::Pending);

		let sequences: Vec<_> = snapshot.events.iter().map(|e| e.sequence).collect();
		assert_eq!(sequences, vec![Some(0), Some(2), Some(3)]);
		assert_eq!(source.event_fetches(), 1);
	}

	#[tokio::test]
	async fn test_load_is_repeatable() {
		let source = Arc::new(StaticSource::new().with_record(&run_ref(), completed_record()));
		let loader = SnapshotLoader::new(source, Roster::investment());

		let first = loader.load(&run_ref()).await.unwrap();
		let second = loader.load(&run_ref()).await.unwrap();
		assert_eq!(first, second);
	}

	#[tokio::test]
	async fn test_running_run_is_rejected() {
		let source = Arc::new(StaticSource::new().with_record(
			&run_ref(),
			json!({"id": "run-1", "status": "in_progress"}),
		));
		let loader = SnapshotLoader::new(source, Roster::investment());

		let err = loader.load(&run_ref()).await.unwrap_err();
		assert!(matches!(
			err,
			AnalysisError::NotTerminal {
				status: RunStatus::Running,
				..
			}
		));
	}

	#[tokio::test]
	async fn test_fetch_failure_is_an_error() {
		let loader = SnapshotLoader::new(Arc::new(StaticSource::new()), Roster::investment());
		let err = loader.load(&run_ref()).await.unwrap_err();
		assert!(matches!(err, AnalysisError::RunNotFound { .. }));
	}

	#[tokio::test]
	async fn test_history_failure_fails_the_load() {
		let source = Arc::new(StaticSource::new().with_record(&run_ref(), completed_record()));
		source.fail_event_fetches(true);
		let loader = SnapshotLoader::new(source, Roster::investment());

		assert!(loader.load(&run_ref()).await.is_err());
	}

	#[tokio::test]
	async fn test_history_can_be_skipped() {
		let source = Arc::new(StaticSource::new().with_record(&run_ref(), completed_record()));
		source.fail_event_fetches(true);
		let loader = SnapshotLoader::new(source.clone(), Roster::investment()).include_history(false);

		let snapshot = loader.load(&run_ref()).await.unwrap();
		assert!(snapshot.events.is_empty());
		assert_eq!(source.event_fetches(), 0);
	}

	#[tokio::test]
	async fn test_embedded_history_avoids_second_fetch() {
		let source = Arc::new(StaticSource::new().with_record(
			&run_ref(),
			json!({
				"id": "run-1",
				"status": "failed",
				"error_details": {"error": "boom"},
				"events": [
					{"type": "workflow_started", "sequence": 0},
					{"type": "workflow_failed", "sequence": 1, "data": {"error": "boom"}}
				]
			}),
		));
		let loader = SnapshotLoader::new(source.clone(), Roster::investment());

		let snapshot = loader.load(&run_ref()).await.unwrap();
		assert_eq!(snapshot.events.len(), 2);
		assert_eq!(snapshot.run.error.as_deref(), Some("boom"));
		assert_eq!(source.event_fetches(), 0);
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Single entry point for following a run.
//!
//! [`RunController`] decides once per run identity whether a run is followed
//! live (event stream plus state machine) or rebuilt from its snapshot, and
//! owns all per-run state. Selecting a different run tears the previous one
//! down before anything for the new run starts: its stream is closed, its
//! in-flight fetch is aborted and any result it still delivers is dropped.
//!
//! The controller is driven by [`RunController::next_update`], which
//! processes one message at a time and returns the merged [`RunView`].

use std::sync::Arc;

use loom_analysis_core::{
	ConnectionState, Roster, Run, RunRef, RunStatus, SequenceLedger, WorkflowEvent,
	WorkflowStateMachine,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::snapshot::{LoadedSnapshot, SharedSource, SnapshotLoader};
use crate::stream::{SharedTransport, StreamConnection, StreamUpdate};

/// Configuration for a [`RunController`].
#[derive(Debug, Clone)]
pub struct ControllerConfig {
	/// Load the event history of finished runs.
	pub include_history: bool,
	/// Close the event stream once the run completes or fails.
	pub close_on_terminal: bool,
}

impl Default for ControllerConfig {
	fn default() -> Self {
		Self {
			include_history: true,
			close_on_terminal: true,
		}
	}
}

/// Which data source backs the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
	/// Fetching the run's status to pick a path.
	Resolving,
	/// Following the event stream.
	Live,
	/// Rebuilt from the persisted record.
	Snapshot,
	/// Fetching the run or its snapshot failed.
	LoadFailed,
}

/// Everything a rendering layer needs about the selected run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunView {
	pub run: Run,
	pub phase: RunPhase,
	pub connection: ConnectionState,
	pub connection_error: Option<String>,
	pub load_error: Option<String>,
	/// Applied events in sequence order. Shared with the controller until
	/// the next event is applied.
	pub events: Arc<Vec<WorkflowEvent>>,
}

#[derive(Debug)]
enum LoadMode {
	/// Fetch the record and pick a path from its status.
	Resolve,
	/// The run is known to be finished.
	Snapshot,
}

#[derive(Debug)]
enum LoadResult {
	Live(RunStatus),
	Snapshot(LoadedSnapshot),
	Failed(String),
}

#[derive(Debug)]
struct LoadEnvelope {
	generation: u64,
	result: LoadResult,
}

#[derive(Debug)]
struct RunSession {
	id: RunRef,
	machine: WorkflowStateMachine,
	ledger: SequenceLedger,
	events: Arc<Vec<WorkflowEvent>>,
	phase: RunPhase,
	load_error: Option<String>,
	load_task: Option<JoinHandle<()>>,
}

impl RunSession {
	fn new(id: RunRef, roster: Roster) -> Self {
		Self {
			machine: WorkflowStateMachine::new(id.clone(), roster),
			id,
			ledger: SequenceLedger::new(),
			events: Arc::default(),
			phase: RunPhase::Resolving,
			load_error: None,
			load_task: None,
		}
	}
}

/// Follows one run at a time.
#[derive(Debug)]
pub struct RunController {
	roster: Roster,
	config: ControllerConfig,
	loader: SnapshotLoader,
	connection: StreamConnection,
	load_tx: mpsc::UnboundedSender<LoadEnvelope>,
	load_rx: mpsc::UnboundedReceiver<LoadEnvelope>,
	/// Bumped on every identity change; load results carry the value they
	/// were started with.
	generation: u64,
	session: Option<RunSession>,
}

impl RunController {
	pub fn new(
		transport: SharedTransport,
		source: SharedSource,
		roster: Roster,
		config: ControllerConfig,
	) -> Self {
		let (load_tx, load_rx) = mpsc::unbounded_channel();
		Self {
			loader: SnapshotLoader::new(source, roster).include_history(config.include_history),
			connection: StreamConnection::new(transport),
			roster,
			config,
			load_tx,
			load_rx,
			generation: 0,
			session: None,
		}
	}

	/// Follows `run`, fetching its record first to decide between the live
	/// and snapshot paths. Returns false if `run` is already selected.
	///
	/// Must be called from within a Tokio runtime.
	pub fn select(&mut self, run: RunRef) -> bool {
		if !self.begin(&run) {
			return false;
		}
		self.spawn_load(run, LoadMode::Resolve);
		true
	}

	/// Follows `run` whose status the caller already knows, skipping the
	/// status fetch. Returns false if `run` is already selected.
	pub fn select_with_status(&mut self, run: RunRef, status: RunStatus) -> bool {
		if !self.begin(&run) {
			return false;
		}
		if status.is_terminal() {
			self.spawn_load(run, LoadMode::Snapshot);
		} else {
			self.go_live(status);
		}
		true
	}

	/// Retries whatever failed: reopens a failed or ended stream from the
	/// last contiguous sequence, or repeats a failed load. Returns false when
	/// there is nothing to retry.
	pub fn reconnect(&mut self) -> bool {
		let Some(session) = self.session.as_mut() else {
			return false;
		};
		match session.phase {
			RunPhase::Live if !session.machine.run().is_terminal() => {
				let since = session.ledger.resume_point();
				self.connection.reconnect(since)
			}
			RunPhase::LoadFailed => {
				info!(run = %session.id, "Retrying run load");
				session.phase = RunPhase::Resolving;
				session.load_error = None;
				let run = session.id.clone();
				self.spawn_load(run, LoadMode::Resolve);
				true
			}
			_ => false,
		}
	}

	/// Stops following the current run. Nothing is applied afterwards.
	pub fn close(&mut self) {
		self.teardown();
	}

	/// The selected run, if any.
	pub fn current(&self) -> Option<&RunRef> {
		self.session.as_ref().map(|session| &session.id)
	}

	pub fn connection_state(&self) -> ConnectionState {
		self.connection.state()
	}

	/// The merged view of the selected run.
	pub fn view(&self) -> Option<RunView> {
		let session = self.session.as_ref()?;
		Some(RunView {
			run: session.machine.run().clone(),
			phase: session.phase,
			connection: self.connection.state(),
			connection_error: self.connection.last_error().map(str::to_string),
			load_error: session.load_error.clone(),
			events: Arc::clone(&session.events),
		})
	}

	/// Processes messages until one changes the view, and returns the new
	/// view. Returns `None` when nothing is in flight: no run is selected,
	/// or the run is settled (snapshot loaded, load failed, or stream closed
	/// or failed).
	///
	/// Cancel safe: a message is either fully processed or left queued.
	pub async fn next_update(&mut self) -> Option<RunView> {
		loop {
			let session = self.session.as_ref()?;
			let loading = session.load_task.is_some();
			let streaming = self.connection.has_pending_updates();
			if !loading && !streaming {
				return None;
			}

			let changed = tokio::select! {
				Some(envelope) = self.load_rx.recv(), if loading => self.on_load(envelope),
				Some(update) = self.connection.next_update(), if streaming => self.on_stream(update),
				else => return None,
			};
			if changed {
				return self.view();
			}
		}
	}

	/// Clears the previous run and creates a fresh session for `run`.
	fn begin(&mut self, run: &RunRef) -> bool {
		if self.current() == Some(run) {
			debug!(run = %run, "Run already selected");
			return false;
		}
		self.teardown();
		info!(run = %run, "Selected run");
		self.session = Some(RunSession::new(run.clone(), self.roster));
		true
	}

	fn teardown(&mut self) {
		self.generation += 1;
		self.connection.close();
		if let Some(session) = self.session.take() {
			if let Some(task) = session.load_task {
				task.abort();
			}
			debug!(run = %session.id, "Discarded run state");
		}
	}

	fn spawn_load(&mut self, run: RunRef, mode: LoadMode) {
		let Some(session) = self.session.as_mut() else {
			return;
		};
		let loader = self.loader.clone();
		let tx = self.load_tx.clone();
		let generation = self.generation;

		session.load_task = Some(tokio::spawn(async move {
			let result = load(&loader, &run, mode).await;
			let _ = tx.send(LoadEnvelope { generation, result });
		}));
	}

	fn go_live(&mut self, status: RunStatus) {
		let Some(session) = self.session.as_mut() else {
			return;
		};
		session.machine.seed_status(status);
		session.phase = RunPhase::Live;
		info!(run = %session.id, status = %status, "Following run live");
		self.connection.open(session.id.clone(), None);
	}

	fn on_load(&mut self, envelope: LoadEnvelope) -> bool {
		if envelope.generation != self.generation {
			debug!(
				generation = envelope.generation,
				current = self.generation,
				"Dropping load result for a previous run"
			);
			return false;
		}
		let Some(session) = self.session.as_mut() else {
			return false;
		};
		session.load_task = None;

		match envelope.result {
			LoadResult::Live(status) => self.go_live(status),
			LoadResult::Snapshot(snapshot) => {
				for event in &snapshot.events {
					if let Some(sequence) = event.sequence {
						session.ledger.mark_applied(sequence);
					}
				}
				session.machine = WorkflowStateMachine::from_run(snapshot.run, self.roster);
				session.events = Arc::new(snapshot.events);
				session.phase = RunPhase::Snapshot;
				session.load_error = None;
			}
			LoadResult::Failed(message) => {
				error!(run = %session.id, error = %message, "Failed to load run");
				session.phase = RunPhase::LoadFailed;
				session.load_error = Some(message);
			}
		}
		true
	}

	fn on_stream(&mut self, update: StreamUpdate) -> bool {
		match update {
			StreamUpdate::Connected | StreamUpdate::Failed(_) => true,
			StreamUpdate::Frame(event) => self.ingest(event),
			StreamUpdate::Ended => {
				let finished = self
					.session
					.as_ref()
					.is_some_and(|session| session.machine.run().is_terminal());
				if !finished {
					self.connection.fail("event stream ended before the run finished");
				}
				true
			}
		}
	}

	fn ingest(&mut self, event: WorkflowEvent) -> bool {
		let Some(session) = self.session.as_mut() else {
			return false;
		};
		if self.connection.run() != Some(&session.id) {
			debug!(run = %session.id, "Dropping frame from a previous subscription");
			return false;
		}
		let Some(sequence) = event.sequence else {
			warn!(
				run = %session.id,
				event_type = %event.event_type,
				"Ignoring frame without a sequence"
			);
			return false;
		};
		if !session.ledger.mark_applied(sequence) {
			debug!(run = %session.id, sequence, "Skipping already applied event");
			return false;
		}

		session.machine.apply(&event);
		let index = session
			.events
			.partition_point(|applied| applied.sequence < Some(sequence));
		Arc::make_mut(&mut session.events).insert(index, event);

		if session.machine.run().is_terminal() && self.config.close_on_terminal {
			info!(
				run = %session.id,
				status = %session.machine.run().status,
				"Run finished, closing event stream"
			);
			self.connection.close();
		}
		true
	}
}

impl Drop for RunController {
	fn drop(&mut self) {
		if let Some(task) = self.session.as_mut().and_then(|session| session.load_task.take()) {
			task.abort();
		}
	}
}

async fn load(loader: &SnapshotLoader, run: &RunRef, mode: LoadMode) -> LoadResult {
	let result = match mode {
		LoadMode::Snapshot => loader.load(run).await.map(LoadResult::Snapshot),
		LoadMode::Resolve => match loader.source().fetch_run(run).await {
			Ok(record) if record.is_terminal() => {
				loader.load_record(run, record).await.map(LoadResult::Snapshot)
			}
			Ok(record) => Ok(LoadResult::Live(record.status.run_status())),
			Err(e) => Err(e),
		},
	};
	result.unwrap_or_else(|e| LoadResult::Failed(e.to_string()))
}

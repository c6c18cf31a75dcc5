// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Applies workflow events to a run.
//!
//! The machine is the authoritative mapping from `(state, event)` to the next
//! state. It never fails: anything it cannot interpret is reported as
//! [`ApplyOutcome::Ignored`] and logged.
//!
//! Events may be applied in arrival order. Agent and run terminal states are
//! sticky, which makes the resulting statuses independent of arrival order,
//! and result payloads are only replaced by payloads from a higher sequence.
//! Deduplication is the caller's job (see [`crate::SequenceLedger`]).

use tracing::{debug, warn};

use crate::event::{EventKind, WorkflowEvent};
use crate::roster::{Roster, RosterEntry};
use crate::run::{Run, RunRef, RunStatus};

/// Why an event had no effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
	/// The event type is not known to this client.
	UnknownType(String),
	/// An executor-scoped event arrived without an executor.
	MissingExecutor,
	/// The executor is not part of the roster.
	UnknownExecutor(String),
	/// A `workflow_status` frame carried a state with no run-level meaning.
	UnrecognisedState(String),
	/// Stream control frames belong to the connection, not the run.
	TransportFrame,
}

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
	/// The run changed.
	Applied,
	/// The event was understood but the run was already past it.
	Unchanged,
	Ignored(IgnoreReason),
}

impl ApplyOutcome {
	fn from_changed(changed: bool) -> Self {
		if changed {
			Self::Applied
		} else {
			Self::Unchanged
		}
	}
}

/// Reconstructs a [`Run`] from its event feed.
#[derive(Debug, Clone)]
pub struct WorkflowStateMachine {
	roster: Roster,
	run: Run,
}

impl WorkflowStateMachine {
	/// Starts from an idle run with every agent pending.
	pub fn new(run: RunRef, roster: Roster) -> Self {
		Self {
			run: Run::new(run, roster),
			roster,
		}
	}

	/// Continues from an existing run state.
	pub fn from_run(run: Run, roster: Roster) -> Self {
		Self { roster, run }
	}

	pub fn run(&self) -> &Run {
		&self.run
	}

	pub fn into_run(self) -> Run {
		self.run
	}

	pub fn roster(&self) -> Roster {
		self.roster
	}

	/// Moves the run to a status learned out of band, such as from the run
	/// record fetched before subscribing. The usual transition rules apply.
	pub fn seed_status(&mut self, status: RunStatus) -> bool {
		self.run.advance(status)
	}

	/// Applies one event.
	pub fn apply(&mut self, event: &WorkflowEvent) -> ApplyOutcome {
		let kind = event.kind();
		let outcome = match kind {
			EventKind::WorkflowStarted => self.workflow_started(event),
			EventKind::ExecutorInvoked => self.with_entry(event, |run, entry, _| {
				let mut changed = false;
				for slot in entry.agents {
					if let Some(agent) = run.agent_mut(slot.name) {
						changed |= agent.mark_running();
					}
				}
				changed
			}),
			// Completion is driven by `workflow_output`, which carries the result.
			EventKind::ExecutorCompleted => self.with_entry(event, |_, _, _| false),
			EventKind::WorkflowOutput => self.with_entry(event, |run, entry, event| {
				let mut changed = false;
				for slot in entry.agents {
					if let Some(agent) = run.agent_mut(slot.name) {
						changed |= agent.complete(event.data.clone(), event.sequence);
					}
				}
				changed
			}),
			EventKind::ExecutorFailed => self.with_entry(event, |run, entry, event| {
				let error = event.error_message();
				let mut changed = false;
				for slot in entry.agents {
					if let Some(agent) = run.agent_mut(slot.name) {
						changed |= agent.fail(error.clone());
					}
				}
				changed
			}),
			EventKind::WorkflowStatus => self.workflow_status(event),
			EventKind::WorkflowFailed => self.workflow_failed(event),
			EventKind::Error => ApplyOutcome::Ignored(IgnoreReason::TransportFrame),
			EventKind::Unknown => {
				ApplyOutcome::Ignored(IgnoreReason::UnknownType(event.event_type.clone()))
			}
		};

		match &outcome {
			ApplyOutcome::Applied => debug!(
				run = %self.run.id,
				sequence = ?event.sequence,
				event_type = %kind,
				executor = ?event.executor,
				"Applied workflow event"
			),
			ApplyOutcome::Unchanged => debug!(
				run = %self.run.id,
				sequence = ?event.sequence,
				event_type = %kind,
				"Workflow event had no effect"
			),
			ApplyOutcome::Ignored(reason) => warn!(
				run = %self.run.id,
				sequence = ?event.sequence,
				event_type = %event.event_type,
				?reason,
				"Ignoring workflow event"
			),
		}
		outcome
	}

	fn with_entry(
		&mut self,
		event: &WorkflowEvent,
		update: impl FnOnce(&mut Run, &'static RosterEntry, &WorkflowEvent) -> bool,
	) -> ApplyOutcome {
		let Some(executor) = event.executor.as_deref() else {
			return ApplyOutcome::Ignored(IgnoreReason::MissingExecutor);
		};
		let Some(entry) = self.roster.resolve(executor) else {
			return ApplyOutcome::Ignored(IgnoreReason::UnknownExecutor(executor.to_string()));
		};
		ApplyOutcome::from_changed(update(&mut self.run, entry, event))
	}

	fn workflow_started(&mut self, event: &WorkflowEvent) -> ApplyOutcome {
		let changed = self.run.advance(RunStatus::Running);
		if changed && self.run.started_at.is_none() {
			self.run.started_at = event.timestamp.clone();
		}
		ApplyOutcome::from_changed(changed)
	}

	fn workflow_status(&mut self, event: &WorkflowEvent) -> ApplyOutcome {
		let Some(state) = event.workflow_state() else {
			return ApplyOutcome::Ignored(IgnoreReason::UnrecognisedState(String::new()));
		};

		let target = match state.to_ascii_lowercase().as_str() {
			"idle" | "completed" | "cancelled" => RunStatus::Completed,
			"failed" => RunStatus::Failed,
			"in_progress" | "started" | "running" => RunStatus::Running,
			_ => return ApplyOutcome::Ignored(IgnoreReason::UnrecognisedState(state.to_string())),
		};

		let changed = self.run.advance(target);
		if changed && target.is_terminal() && self.run.completed_at.is_none() {
			self.run.completed_at = event.timestamp.clone();
		}
		ApplyOutcome::from_changed(changed)
	}

	/// Agents are left as they are: a run failure says nothing about agents
	/// that have not reported one themselves.
	fn workflow_failed(&mut self, event: &WorkflowEvent) -> ApplyOutcome {
		let changed = self.run.advance(RunStatus::Failed);
		if changed {
			if self.run.error.is_none() {
				self.run.error = event.error_message();
			}
			if self.run.completed_at.is_none() {
				self.run.completed_at = event.timestamp.clone();
			}
		}
		ApplyOutcome::from_changed(changed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ledger::SequenceLedger;
	use crate::run::AgentStatus;
	use proptest::prelude::*;
	use serde_json::json;

	fn machine() -> WorkflowStateMachine {
		WorkflowStateMachine::new(RunRef::new("opp-1", "run-1"), Roster::investment())
	}

	fn scenario_a() -> Vec<WorkflowEvent> {
		vec![
			WorkflowEvent::new(EventKind::WorkflowStarted, 0),
			WorkflowEvent::new(EventKind::ExecutorInvoked, 1).with_executor("financial"),
			WorkflowEvent::new(EventKind::WorkflowOutput, 2)
				.with_executor("financial")
				.with_data(json!({"score": 78})),
		]
	}

	fn apply_deduped(machine: &mut WorkflowStateMachine, events: &[WorkflowEvent]) {
		let mut ledger = SequenceLedger::new();
		for event in events {
			if let Some(sequence) = event.sequence {
				if ledger.mark_applied(sequence) {
					machine.apply(event);
				}
			}
		}
	}

	#[test]
	fn test_scenario_a_single_agent_completes() {
		let mut machine = machine();
		for event in scenario_a() {
			machine.apply(&event);
		}

		let run = machine.run();
		assert_eq!(run.status, RunStatus::Running);
		let financial = run.agent("financial").unwrap();
		assert_eq!(financial.status, AgentStatus::Completed);
		assert_eq!(financial.result_field("score"), Some(&json!(78)));
		assert!(run
			.agents
			.iter()
			.filter(|agent| agent.name != "financial")
			.all(|agent| agent.status == AgentStatus::Pending));
	}

	#[test]
	fn test_scenario_b_redelivery_is_a_no_op() {
		let events = scenario_a();

		let mut once = machine();
		apply_deduped(&mut once, &events);

		let mut twice = machine();
		let redelivered: Vec<_> = events.iter().chain(events.iter()).cloned().collect();
		apply_deduped(&mut twice, &redelivered);

		assert_eq!(once.run(), twice.run());
	}

	#[test]
	fn test_scenario_c_run_failure_leaves_agents_alone() {
		let mut machine = machine();
		machine.apply(&WorkflowEvent::new(EventKind::WorkflowStarted, 0));
		machine.apply(&WorkflowEvent::new(EventKind::ExecutorInvoked, 1).with_executor("financial_analyst"));
		machine.apply(&WorkflowEvent::new(EventKind::ExecutorInvoked, 2).with_executor("risk_analyst"));
		machine.apply(&WorkflowEvent::new(EventKind::ExecutorFailed, 3).with_executor("risk_analyst"));

		let outcome = machine.apply(
			&WorkflowEvent::new(EventKind::WorkflowFailed, 5).with_data(json!({"error": "x"})),
		);

		assert_eq!(outcome, ApplyOutcome::Applied);
		let run = machine.run();
		assert_eq!(run.status, RunStatus::Failed);
		assert_eq!(run.error.as_deref(), Some("x"));
		assert_eq!(run.agent("financial").unwrap().status, AgentStatus::Running);
		assert_eq!(run.agent("risk").unwrap().status, AgentStatus::Failed);
		assert_eq!(run.agent("market").unwrap().status, AgentStatus::Pending);
	}

	#[test]
	fn test_fan_out_mirrors_output_onto_both_agents() {
		let mut machine = machine();
		let payload = json!({
			"investment_supporter": "Strong buy",
			"investment_challenger": "Overvalued"
		});
		machine.apply(
			&WorkflowEvent::new(EventKind::WorkflowOutput, 9)
				.with_executor("investment_debate_executor")
				.with_data(payload.clone()),
		);

		let run = machine.run();
		let supporter = run.agent("supporter").unwrap();
		let challenger = run.agent("challenger").unwrap();
		assert_eq!(supporter.status, AgentStatus::Completed);
		assert_eq!(challenger.status, AgentStatus::Completed);
		assert_eq!(supporter.result.as_ref(), Some(&payload));
		assert_eq!(supporter.result, challenger.result);
	}

	#[test]
	fn test_fan_out_mirrors_invocation_and_failure() {
		let mut machine = machine();
		machine.apply(&WorkflowEvent::new(EventKind::ExecutorInvoked, 1).with_executor("debateGroup"));
		assert_eq!(machine.run().agent("supporter").unwrap().status, AgentStatus::Running);
		assert_eq!(machine.run().agent("challenger").unwrap().status, AgentStatus::Running);

		machine.apply(
			&WorkflowEvent::new(EventKind::ExecutorFailed, 2)
				.with_executor("investment_debate_executor")
				.with_data(json!({"error": "debate timed out"})),
		);
		for name in ["supporter", "challenger"] {
			let agent = machine.run().agent(name).unwrap();
			assert_eq!(agent.status, AgentStatus::Failed);
			assert_eq!(agent.error.as_deref(), Some("debate timed out"));
		}
	}

	#[test]
	fn test_terminal_agent_is_not_overwritten() {
		let mut machine = machine();
		machine.apply(
			&WorkflowEvent::new(EventKind::WorkflowOutput, 2)
				.with_executor("market")
				.with_data(json!({"score": 60})),
		);
		let outcome = machine.apply(&WorkflowEvent::new(EventKind::ExecutorFailed, 3).with_executor("market"));
		assert_eq!(outcome, ApplyOutcome::Unchanged);

		let invoked = machine.apply(&WorkflowEvent::new(EventKind::ExecutorInvoked, 1).with_executor("market"));
		assert_eq!(invoked, ApplyOutcome::Unchanged);
		assert_eq!(machine.run().agent("market").unwrap().status, AgentStatus::Completed);
	}

	#[test]
	fn test_pending_agent_can_complete_directly() {
		let mut machine = machine();
		machine.apply(&WorkflowEvent::new(EventKind::WorkflowOutput, 4).with_executor("summary_report_generator"));
		let summary = machine.run().agent("summary").unwrap();
		assert_eq!(summary.status, AgentStatus::Completed);
		assert!(summary.result.is_none());
	}

	#[test]
	fn test_unknown_executor_is_ignored() {
		let mut machine = machine();
		let before = machine.run().clone();
		let outcome = machine.apply(&WorkflowEvent::new(EventKind::WorkflowOutput, 7).with_executor("analysis_aggregator"));

		assert_eq!(
			outcome,
			ApplyOutcome::Ignored(IgnoreReason::UnknownExecutor("analysis_aggregator".to_string()))
		);
		assert_eq!(machine.run(), &before);
	}

	#[test]
	fn test_unknown_type_is_ignored() {
		let mut machine = machine();
		let mut event = WorkflowEvent::new(EventKind::Unknown, 3);
		event.event_type = "agent_heartbeat".to_string();

		assert_eq!(
			machine.apply(&event),
			ApplyOutcome::Ignored(IgnoreReason::UnknownType("agent_heartbeat".to_string()))
		);
	}

	#[test]
	fn test_executor_event_without_executor_is_ignored() {
		let mut machine = machine();
		assert_eq!(
			machine.apply(&WorkflowEvent::new(EventKind::ExecutorInvoked, 1)),
			ApplyOutcome::Ignored(IgnoreReason::MissingExecutor)
		);
	}

	#[test]
	fn test_executor_completed_changes_nothing() {
		let mut machine = machine();
		machine.apply(&WorkflowEvent::new(EventKind::ExecutorInvoked, 1).with_executor("risk"));
		let outcome = machine.apply(&WorkflowEvent::new(EventKind::ExecutorCompleted, 2).with_executor("risk"));

		assert_eq!(outcome, ApplyOutcome::Unchanged);
		assert_eq!(machine.run().agent("risk").unwrap().status, AgentStatus::Running);
	}

	#[test]
	fn test_workflow_status_idle_completes_run() {
		let mut machine = machine();
		machine.apply(&WorkflowEvent::new(EventKind::WorkflowStarted, 0));
		let outcome = machine.apply(
			&WorkflowEvent::new(EventKind::WorkflowStatus, 12).with_data(json!({"state": "IDLE"})),
		);

		assert_eq!(outcome, ApplyOutcome::Applied);
		assert_eq!(machine.run().status, RunStatus::Completed);
		assert!(machine.run().completed_at.is_some());
	}

	#[test]
	fn test_workflow_status_cancelled_finishes_run() {
		let mut machine = machine();
		machine.apply(&WorkflowEvent::new(EventKind::WorkflowStarted, 0));
		let outcome = machine.apply(
			&WorkflowEvent::new(EventKind::WorkflowStatus, 1).with_data(json!({"state": "CANCELLED"})),
		);

		assert_eq!(outcome, ApplyOutcome::Applied);
		assert!(machine.run().is_terminal());
		assert_eq!(machine.run().status, RunStatus::Completed);
		assert!(machine.run().completed_at.is_some());
	}

	#[test]
	fn test_workflow_status_other_states_are_ignored() {
		let mut machine = machine();
		let outcome = machine.apply(
			&WorkflowEvent::new(EventKind::WorkflowStatus, 3)
				.with_data(json!({"state": "IDLE_WITH_PENDING_REQUESTS"})),
		);
		assert!(matches!(
			outcome,
			ApplyOutcome::Ignored(IgnoreReason::UnrecognisedState(_))
		));
		assert_eq!(machine.run().status, RunStatus::Idle);
	}

	#[test]
	fn test_workflow_status_in_progress_starts_run() {
		let mut machine = machine();
		machine.apply(
			&WorkflowEvent::new(EventKind::WorkflowStatus, 1).with_data(json!({"state": "IN_PROGRESS"})),
		);
		assert_eq!(machine.run().status, RunStatus::Running);
	}

	#[test]
	fn test_completed_run_is_sticky() {
		let mut machine = machine();
		machine.apply(
			&WorkflowEvent::new(EventKind::WorkflowStatus, 10).with_data(json!({"state": "idle"})),
		);
		assert_eq!(
			machine.apply(&WorkflowEvent::new(EventKind::WorkflowFailed, 11)),
			ApplyOutcome::Unchanged
		);
		assert_eq!(
			machine.apply(&WorkflowEvent::new(EventKind::WorkflowStarted, 0)),
			ApplyOutcome::Unchanged
		);
		assert_eq!(machine.run().status, RunStatus::Completed);
		assert!(machine.run().error.is_none());
	}

	#[test]
	fn test_error_frame_does_not_touch_run() {
		let mut machine = machine();
		let mut frame = WorkflowEvent::new(EventKind::Error, 0).with_message("Stream error: boom");
		frame.sequence = None;

		assert_eq!(
			machine.apply(&frame),
			ApplyOutcome::Ignored(IgnoreReason::TransportFrame)
		);
		assert_eq!(machine.run().status, RunStatus::Idle);
	}

	#[test]
	fn test_seed_status_follows_transition_rules() {
		let mut machine = machine();
		assert!(machine.seed_status(RunStatus::Running));
		assert!(!machine.seed_status(RunStatus::Idle));
		assert_eq!(machine.run().status, RunStatus::Running);
	}

	fn full_history() -> Vec<WorkflowEvent> {
		vec![
			WorkflowEvent::new(EventKind::WorkflowStarted, 0),
			WorkflowEvent::new(EventKind::ExecutorInvoked, 1).with_executor("data_prepper"),
			WorkflowEvent::new(EventKind::WorkflowOutput, 2)
				.with_executor("data_prepper")
				.with_data(json!({"rows": 12})),
			WorkflowEvent::new(EventKind::ExecutorInvoked, 3).with_executor("financial_analyst"),
			WorkflowEvent::new(EventKind::ExecutorInvoked, 4).with_executor("risk_analyst"),
			WorkflowEvent::new(EventKind::WorkflowOutput, 5)
				.with_executor("financial_analyst")
				.with_data(json!({"score": 78})),
			WorkflowEvent::new(EventKind::ExecutorFailed, 6)
				.with_executor("risk_analyst")
				.with_data(json!({"error": "model unavailable"})),
			WorkflowEvent::new(EventKind::WorkflowOutput, 7)
				.with_executor("investment_debate_executor")
				.with_data(json!({"investment_supporter": "yes", "investment_challenger": "no"})),
			WorkflowEvent::new(EventKind::WorkflowStatus, 8).with_data(json!({"state": "IDLE"})),
		]
	}

	proptest! {
		#[test]
		fn prop_redelivery_matches_single_delivery(
			deliveries in prop::collection::vec(0usize..9, 0..64)
		) {
			let history = full_history();

			let mut seen = std::collections::HashSet::new();
			let first_occurrences: Vec<_> = deliveries
				.iter()
				.filter(|index| seen.insert(**index))
				.map(|index| history[*index].clone())
				.collect();
			let redelivered: Vec<_> = deliveries.iter().map(|index| history[*index].clone()).collect();

			let mut once = machine();
			for event in &first_occurrences {
				once.apply(event);
			}
			let mut repeated = machine();
			apply_deduped(&mut repeated, &redelivered);

			prop_assert_eq!(once.run(), repeated.run());
		}

		#[test]
		fn prop_agent_outcome_is_order_independent(
			order in Just(vec![1u64, 2, 3]).prop_shuffle()
		) {
			let mut machine = machine();
			for sequence in order {
				let event = match sequence {
					1 => WorkflowEvent::new(EventKind::ExecutorInvoked, 1).with_executor("compliance"),
					n => WorkflowEvent::new(EventKind::WorkflowOutput, n)
						.with_executor("compliance")
						.with_data(json!({"version": n})),
				};
				machine.apply(&event);
			}

			let agent = machine.run().agent("compliance").unwrap();
			prop_assert_eq!(agent.status, AgentStatus::Completed);
			prop_assert_eq!(agent.result_field("version"), Some(&json!(3)));
		}

		#[test]
		fn prop_agent_statuses_are_order_independent(
			order in Just((0usize..9).collect::<Vec<_>>()).prop_shuffle()
		) {
			let history = full_history();

			let mut ordered = machine();
			for event in &history {
				ordered.apply(event);
			}
			let mut shuffled = machine();
			for index in order {
				shuffled.apply(&history[index]);
			}

			for (left, right) in ordered.run().agents.iter().zip(&shuffled.run().agents) {
				prop_assert_eq!(left.status, right.status);
				prop_assert_eq!(&left.result, &right.result);
			}
			prop_assert_eq!(ordered.run().status, shuffled.run().status);
		}
	}
}

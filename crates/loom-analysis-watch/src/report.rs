// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Turns successive run views into printable transitions.

use std::fmt;
use std::io::Write;

use loom_analysis::{AgentStatus, ConnectionState, RunPhase, RunStatus, RunView};
use serde::Serialize;

/// One observable change between two views.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
	Phase {
		phase: RunPhase,
	},
	Connection {
		state: ConnectionState,
		#[serde(skip_serializing_if = "Option::is_none")]
		error: Option<String>,
	},
	Agent {
		agent: &'static str,
		label: &'static str,
		status: AgentStatus,
		#[serde(skip_serializing_if = "Option::is_none")]
		error: Option<String>,
	},
	Run {
		status: RunStatus,
		#[serde(skip_serializing_if = "Option::is_none")]
		error: Option<String>,
	},
	Summary {
		text: String,
	},
	LoadFailed {
		error: String,
	},
}

impl fmt::Display for Transition {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Phase { phase } => {
				let phase = match phase {
					RunPhase::Resolving => "resolving",
					RunPhase::Live => "live",
					RunPhase::Snapshot => "snapshot",
					RunPhase::LoadFailed => "load failed",
				};
				write!(f, "[phase] {phase}")
			}
			Self::Connection { state, error } => match error {
				Some(error) => write!(f, "[stream] {state}: {error}"),
				None => write!(f, "[stream] {state}"),
			},
			Self::Agent {
				label,
				status,
				error,
				..
			} => match error {
				Some(error) => write!(f, "[agent] {label}: {status} ({error})"),
				None => write!(f, "[agent] {label}: {status}"),
			},
			Self::Run { status, error } => match error {
				Some(error) => write!(f, "[run] {status}: {error}"),
				None => write!(f, "[run] {status}"),
			},
			Self::Summary { text } => write!(f, "[summary] {text}"),
			Self::LoadFailed { error } => write!(f, "[load] failed: {error}"),
		}
	}
}

/// Remembers the last view so only changes are printed.
#[derive(Debug, Default)]
pub struct Reporter {
	json: bool,
	last: Option<RunView>,
}

impl Reporter {
	pub fn new(json: bool) -> Self {
		Self { json, last: None }
	}

	/// Computes the transitions from the previous view to `view`.
	pub fn diff(&mut self, view: &RunView) -> Vec<Transition> {
		let mut out = Vec::new();
		let last = self.last.take();

		if last.as_ref().map(|l| l.phase) != Some(view.phase) {
			out.push(Transition::Phase { phase: view.phase });
		}

		let last_connection = last
			.as_ref()
			.map(|l| l.connection)
			.unwrap_or(ConnectionState::Disconnected);
		if last_connection != view.connection {
			out.push(Transition::Connection {
				state: view.connection,
				error: view.connection_error.clone(),
			});
		}

		for agent in &view.run.agents {
			let before = last
				.as_ref()
				.and_then(|l| l.run.agent(agent.name))
				.map(|a| a.status)
				.unwrap_or(AgentStatus::Pending);
			if before != agent.status {
				out.push(Transition::Agent {
					agent: agent.name,
					label: agent.display.label,
					status: agent.status,
					error: agent.error.clone(),
				});
			}
		}

		let last_status = last.as_ref().map(|l| l.run.status).unwrap_or(RunStatus::Idle);
		if last_status != view.run.status {
			out.push(Transition::Run {
				status: view.run.status,
				error: view.run.error.clone(),
			});
		}

		if let Some(summary) = &view.run.summary {
			if last.as_ref().and_then(|l| l.run.summary.as_ref()) != Some(summary) {
				out.push(Transition::Summary {
					text: summary.clone(),
				});
			}
		}

		if let Some(error) = &view.load_error {
			if last.as_ref().and_then(|l| l.load_error.as_ref()) != Some(error) {
				out.push(Transition::LoadFailed {
					error: error.clone(),
				});
			}
		}

		// Events are not diffed, so the shared list is not retained.
		let mut last = view.clone();
		last.events = Default::default();
		self.last = Some(last);
		out
	}

	/// Writes the transitions for `view`, one per line.
	pub fn report(&mut self, view: &RunView, out: &mut impl Write) -> anyhow::Result<()> {
		for transition in self.diff(view) {
			if self.json {
				writeln!(out, "{}", serde_json::to_string(&transition)?)?;
			} else {
				writeln!(out, "{transition}")?;
			}
		}
		out.flush()?;
		Ok(())
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Run and agent state reconstructed from the event feed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AnalysisCoreError;
use crate::roster::{AgentSlot, DisplayMeta, Roster};

/// Identifies one analysis run.
///
/// Runs are nested under opportunities on the server, so both ids are needed
/// to address one. The pair is the run's identity: changing either part is a
/// different run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunRef {
	pub opportunity_id: String,
	pub run_id: String,
}

impl RunRef {
	pub fn new(opportunity_id: impl Into<String>, run_id: impl Into<String>) -> Self {
		Self {
			opportunity_id: opportunity_id.into(),
			run_id: run_id.into(),
		}
	}
}

impl fmt::Display for RunRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.opportunity_id, self.run_id)
	}
}

impl FromStr for RunRef {
	type Err = AnalysisCoreError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.split_once('/') {
			Some((opportunity_id, run_id))
				if !opportunity_id.is_empty() && !run_id.is_empty() && !run_id.contains('/') =>
			{
				Ok(Self::new(opportunity_id, run_id))
			}
			_ => Err(AnalysisCoreError::InvalidRunRef(s.to_string())),
		}
	}
}

/// Overall status of a run.
///
/// Moves forward only: `idle -> running -> {completed, failed}`. A run may
/// also jump from `idle` straight to a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
	#[default]
	Idle,
	Running,
	Completed,
	Failed,
}

impl RunStatus {
	#[must_use]
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Failed)
	}
}

impl fmt::Display for RunStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Idle => write!(f, "idle"),
			Self::Running => write!(f, "running"),
			Self::Completed => write!(f, "completed"),
			Self::Failed => write!(f, "failed"),
		}
	}
}

/// Status of a single agent inside a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
	#[default]
	Pending,
	Running,
	Completed,
	Failed,
}

impl AgentStatus {
	/// Completed and failed agents never change status again within a run.
	#[must_use]
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Failed)
	}
}

impl fmt::Display for AgentStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Pending => write!(f, "pending"),
			Self::Running => write!(f, "running"),
			Self::Completed => write!(f, "completed"),
			Self::Failed => write!(f, "failed"),
		}
	}
}

/// Lifecycle of the event stream subscription, independent of [`RunStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
	#[default]
	Disconnected,
	Connecting,
	Connected,
	Error,
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Disconnected => write!(f, "disconnected"),
			Self::Connecting => write!(f, "connecting"),
			Self::Connected => write!(f, "connected"),
			Self::Error => write!(f, "error"),
		}
	}
}

/// State of one agent slot from the roster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentState {
	pub name: &'static str,
	pub display: DisplayMeta,
	pub status: AgentStatus,
	/// Payload attached on completion. Opaque; consumers read named fields.
	pub result: Option<Value>,
	/// Error message reported when the agent failed.
	pub error: Option<String>,
	/// Sequence of the event that supplied `result`.
	#[serde(skip)]
	pub result_sequence: Option<u64>,
}

impl AgentState {
	pub fn pending(slot: &AgentSlot) -> Self {
		Self {
			name: slot.name,
			display: slot.display,
			status: AgentStatus::Pending,
			result: None,
			error: None,
			result_sequence: None,
		}
	}

	/// Reads a top-level field of the result payload.
	pub fn result_field(&self, key: &str) -> Option<&Value> {
		self.result.as_ref().and_then(|result| result.get(key))
	}

	pub(crate) fn mark_running(&mut self) -> bool {
		if self.status == AgentStatus::Pending {
			self.status = AgentStatus::Running;
			return true;
		}
		false
	}

	/// Marks the agent completed and keeps the payload from the highest
	/// sequence seen so far, whatever order the events arrive in. A failed
	/// agent keeps no result.
	pub(crate) fn complete(&mut self, result: Option<Value>, sequence: Option<u64>) -> bool {
		if self.status == AgentStatus::Failed {
			return false;
		}
		let mut changed = false;
		if !self.status.is_terminal() {
			self.status = AgentStatus::Completed;
			changed = true;
		}

		let fresher = match (self.result_sequence, sequence) {
			(None, _) => self.result.is_none() || sequence.is_some(),
			(Some(current), Some(incoming)) => incoming > current,
			(Some(_), None) => false,
		};
		if fresher {
			changed |= self.result != result;
			self.result = result;
			self.result_sequence = sequence;
		}
		changed
	}

	pub(crate) fn fail(&mut self, error: Option<String>) -> bool {
		if self.status.is_terminal() {
			return false;
		}
		self.status = AgentStatus::Failed;
		self.error = error;
		true
	}
}

/// One workflow execution, as reconstructed on the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Run {
	pub id: RunRef,
	pub status: RunStatus,
	/// Agent slots in roster (display) order.
	pub agents: Vec<AgentState>,
	/// Run-level error, surfaced verbatim from the server.
	pub error: Option<String>,
	pub name: Option<String>,
	/// Final summary stored on the run record.
	pub summary: Option<String>,
	pub started_at: Option<String>,
	pub completed_at: Option<String>,
}

impl Run {
	/// Creates an idle run with every roster agent pending.
	pub fn new(id: RunRef, roster: Roster) -> Self {
		Self {
			id,
			status: RunStatus::Idle,
			agents: roster.agent_slots().map(AgentState::pending).collect(),
			error: None,
			name: None,
			summary: None,
			started_at: None,
			completed_at: None,
		}
	}

	pub fn agent(&self, name: &str) -> Option<&AgentState> {
		self.agents.iter().find(|agent| agent.name == name)
	}

	pub(crate) fn agent_mut(&mut self, name: &str) -> Option<&mut AgentState> {
		self.agents.iter_mut().find(|agent| agent.name == name)
	}

	pub fn is_terminal(&self) -> bool {
		self.status.is_terminal()
	}

	/// Moves the run status forward. Returns false when the transition is not
	/// allowed (terminal runs never change, and only idle runs start running).
	pub(crate) fn advance(&mut self, target: RunStatus) -> bool {
		if self.status == target || self.status.is_terminal() {
			return false;
		}
		match target {
			RunStatus::Idle => false,
			RunStatus::Running if self.status != RunStatus::Idle => false,
			_ => {
				self.status = target;
				true
			}
		}
	}
}

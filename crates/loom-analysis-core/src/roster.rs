// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Declarative agent roster.
//!
//! The roster is the single table that maps what the server reports (an
//! executor id on an event, or a key in a finished run's result map) onto the
//! agent slots a run displays. Both the live state machine and the snapshot
//! reconstruction resolve executors through it, so they cannot disagree.
//!
//! An entry with more than one agent slot is a fan-out: the server reports a
//! single executor, and every one of its events is mirrored onto each slot.

use std::collections::HashSet;

use serde::Serialize;

use crate::error::{AnalysisCoreError, Result};

/// Presentation hints for an agent slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DisplayMeta {
	pub label: &'static str,
	pub icon: &'static str,
	pub color: &'static str,
}

/// One agent as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgentSlot {
	pub name: &'static str,
	pub display: DisplayMeta,
}

/// One unit of work as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RosterEntry {
	/// Roster key. Also accepted as an executor reference.
	pub key: &'static str,
	/// Executor ids the server uses for this entry.
	pub executor_ids: &'static [&'static str],
	/// Agent slots driven by this entry, in display order.
	pub agents: &'static [AgentSlot],
}

impl RosterEntry {
	pub fn is_fan_out(&self) -> bool {
		self.agents.len() > 1
	}

	pub fn matches(&self, executor: &str) -> bool {
		self.key == executor || self.executor_ids.contains(&executor)
	}
}

const fn slot(name: &'static str, label: &'static str, icon: &'static str, color: &'static str) -> AgentSlot {
	AgentSlot {
		name,
		display: DisplayMeta { label, icon, color },
	}
}

/// Roster of the investment analysis workflow.
pub const INVESTMENT_ROSTER: &[RosterEntry] = &[
	RosterEntry {
		key: "dataPrep",
		executor_ids: &["data_prepper"],
		agents: &[slot("dataPrep", "Data Preparation", "database", "slate")],
	},
	RosterEntry {
		key: "financial",
		executor_ids: &["financial_analyst"],
		agents: &[slot("financial", "Financial Analyst", "chart-line", "emerald")],
	},
	RosterEntry {
		key: "risk",
		executor_ids: &["risk_analyst"],
		agents: &[slot("risk", "Risk Analyst", "shield-alert", "rose")],
	},
	RosterEntry {
		key: "market",
		executor_ids: &["market_analyst"],
		agents: &[slot("market", "Market Analyst", "globe", "sky")],
	},
	RosterEntry {
		key: "compliance",
		executor_ids: &["compliance_analyst"],
		agents: &[slot("compliance", "Compliance Analyst", "scale", "amber")],
	},
	RosterEntry {
		key: "debateGroup",
		executor_ids: &["investment_debate_executor"],
		agents: &[
			slot("supporter", "Investment Supporter", "thumbs-up", "green"),
			slot("challenger", "Investment Challenger", "thumbs-down", "red"),
		],
	},
	RosterEntry {
		key: "summary",
		executor_ids: &["summary_report_generator"],
		agents: &[slot("summary", "Summary Report", "file-text", "violet")],
	},
];

/// A closed set of roster entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roster {
	entries: &'static [RosterEntry],
}

impl Roster {
	/// Creates a roster after checking that every executor reference and
	/// agent name is unique and every entry drives at least one agent.
	pub fn new(entries: &'static [RosterEntry]) -> Result<Self> {
		let mut references = HashSet::new();
		let mut agents = HashSet::new();

		for entry in entries {
			if entry.agents.is_empty() {
				return Err(AnalysisCoreError::InvalidRoster(format!(
					"entry '{}' has no agent slots",
					entry.key
				)));
			}
			for reference in std::iter::once(&entry.key).chain(entry.executor_ids) {
				if !references.insert(*reference) {
					return Err(AnalysisCoreError::InvalidRoster(format!(
						"executor reference '{reference}' is listed twice"
					)));
				}
			}
			for agent in entry.agents {
				if !agents.insert(agent.name) {
					return Err(AnalysisCoreError::InvalidRoster(format!(
						"agent '{}' is listed twice",
						agent.name
					)));
				}
			}
		}

		Ok(Self { entries })
	}

	/// The investment analysis roster.
	pub fn investment() -> Self {
		Self {
			entries: INVESTMENT_ROSTER,
		}
	}

	pub fn entries(&self) -> &'static [RosterEntry] {
		self.entries
	}

	/// Finds the entry for an executor id or roster key.
	pub fn resolve(&self, executor: &str) -> Option<&'static RosterEntry> {
		self.entries.iter().find(|entry| entry.matches(executor))
	}

	/// All agent slots in display order.
	pub fn agent_slots(&self) -> impl Iterator<Item = &'static AgentSlot> {
		self.entries.iter().flat_map(|entry| entry.agents.iter())
	}
}

impl Default for Roster {
	fn default() -> Self {
		Self::investment()
	}
}

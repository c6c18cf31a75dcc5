// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for following Loom analysis workflow runs.
//!
//! This crate holds everything needed to rebuild the state of a multi-agent
//! analysis run from the events the server reports about it. It performs no
//! I/O and is shared by the client SDK (`loom-analysis`) and its consumers.
//!
//! # Overview
//!
//! - [`WorkflowEvent`]: one frame of the ordered, at-least-once event feed
//! - [`SequenceLedger`]: remembers which sequence numbers were applied
//! - [`WorkflowStateMachine`]: applies events to a [`Run`]
//! - [`reconstruct`]: builds the same [`Run`] from a finished run's record
//! - [`Roster`]: the declarative table of agents, shared by both paths
//!
//! # Example
//!
//! ```
//! use loom_analysis_core::{
//!     AgentStatus, EventKind, Roster, RunRef, SequenceLedger, WorkflowEvent,
//!     WorkflowStateMachine,
//! };
//!
//! let run = RunRef::new("opp-1", "run-1");
//! let mut machine = WorkflowStateMachine::new(run, Roster::investment());
//! let mut ledger = SequenceLedger::new();
//!
//! let events = [
//!     WorkflowEvent::new(EventKind::WorkflowStarted, 0),
//!     WorkflowEvent::new(EventKind::ExecutorInvoked, 1).with_executor("financial"),
//!     WorkflowEvent::new(EventKind::WorkflowOutput, 2)
//!         .with_executor("financial")
//!         .with_data(serde_json::json!({ "score": 78 })),
//! ];
//!
//! for event in events.iter().chain(events.iter()) {
//!     let sequence = event.sequence.unwrap();
//!     if ledger.mark_applied(sequence) {
//!         machine.apply(event);
//!     }
//! }
//!
//! let financial = machine.run().agent("financial").unwrap();
//! assert_eq!(financial.status, AgentStatus::Completed);
//! ```

pub mod error;
pub mod event;
pub mod ledger;
pub mod machine;
pub mod roster;
pub mod run;
pub mod snapshot;

pub use error::{AnalysisCoreError, Result};
pub use event::{EventKind, WorkflowEvent};
pub use ledger::SequenceLedger;
pub use machine::{ApplyOutcome, IgnoreReason, WorkflowStateMachine};
pub use roster::{AgentSlot, DisplayMeta, Roster, RosterEntry, INVESTMENT_ROSTER};
pub use run::{AgentState, AgentStatus, ConnectionState, Run, RunRef, RunStatus};
pub use snapshot::{reconstruct, ErrorDetails, RecordStatus, RunRecord};

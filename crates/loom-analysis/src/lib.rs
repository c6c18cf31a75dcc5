// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Rust SDK for following Loom analysis workflow runs.
//!
//! This crate provides a client that keeps a live, deduplicated view of a
//! multi-agent analysis run, or rebuilds a finished one from its stored
//! record.
//!
//! # Features
//!
//! - **Live runs**: Server-Sent Events subscription with explicit,
//!   resumable reconnects
//! - **Finished runs**: Snapshot reconstruction from the run record and history
//! - **Run switching**: All state of the previous run is discarded, and late
//!   messages for it are dropped
//! - **Retries**: Request/response fetches retry transient failures with
//!   exponential backoff
//!
//! # Example
//!
//! ```ignore
//! use loom_analysis::{AnalysisClient, ControllerConfig, Roster, RunRef};
//!
//! let client = AnalysisClient::builder()
//!     .base_url("https://analysis.example.com/api")
//!     .auth_token("token")
//!     .build()?;
//!
//! let mut controller = client.controller(Roster::investment(), ControllerConfig::default());
//! controller.select("opp-1/run-1".parse::<RunRef>()?);
//!
//! while let Some(view) = controller.next_update().await {
//!     for agent in &view.run.agents {
//!         println!("{}: {}", agent.display.label, agent.status);
//!     }
//! }
//! ```

mod client;
mod controller;
mod error;
pub mod http;
mod snapshot;
mod stream;

#[cfg(test)]
mod testing;

pub use client::{AnalysisClient, AnalysisClientBuilder, ClientConfig};
pub use controller::{ControllerConfig, RunController, RunPhase, RunView};
pub use error::{AnalysisError, Result};
pub use http::{RetryConfig, RetryableError};
pub use snapshot::{LoadedSnapshot, SharedSource, SnapshotLoader, SnapshotSource};
pub use stream::{
	decode_sse, EventTransport, FrameStream, SharedTransport, StreamConnection, StreamUpdate,
};

// Re-export core types for convenience
pub use loom_analysis_core::{
	AgentState, AgentStatus, ConnectionState, DisplayMeta, EventKind, Roster, Run, RunRecord,
	RunRef, RunStatus, WorkflowEvent,
};

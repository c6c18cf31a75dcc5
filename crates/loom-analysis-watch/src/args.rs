// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::time::Duration;

use clap::Parser;
use loom_analysis::RunRef;

/// Follow a Loom analysis run and print its transitions.
#[derive(Parser, Debug)]
#[command(name = "loom-analysis-watch", version)]
pub struct Args {
	/// Run to follow, as `<opportunity_id>/<run_id>`
	pub run: RunRef,

	/// API base URL, including any path prefix
	#[arg(long, env = "LOOM_ANALYSIS_URL", default_value = "http://localhost:8000/api")]
	pub base_url: String,

	/// Bearer token (or set LOOM_ANALYSIS_TOKEN)
	#[arg(long, env = "LOOM_ANALYSIS_TOKEN", hide_env_values = true)]
	pub token: Option<String>,

	/// Session id for starting and streaming; random when unset
	#[arg(long, env = "LOOM_ANALYSIS_SESSION")]
	pub session_id: Option<String>,

	/// Start the run before following it
	#[arg(long)]
	pub start: bool,

	/// Print transitions as JSON lines
	#[arg(long)]
	pub json: bool,

	/// Skip loading the event history of finished runs
	#[arg(long)]
	pub no_history: bool,

	/// How many times to reconnect after a stream or load failure
	#[arg(long, default_value_t = 0)]
	pub max_reconnects: u32,

	/// Request timeout in seconds
	#[arg(long, default_value_t = 30)]
	pub timeout_secs: u64,

	/// Emit logs as JSON
	#[arg(long)]
	pub log_json: bool,
}

impl Args {
	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.timeout_secs)
	}
}

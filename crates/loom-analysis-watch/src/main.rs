// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Loom analysis watcher binary.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use loom_analysis::{
	AnalysisClient, ControllerConfig, Roster, RunController, RunPhase, RunStatus, RunView,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod args;
mod report;

use args::Args;
use report::Reporter;

const EXIT_COMPLETED: u8 = 0;
const EXIT_FAILED: u8 = 1;
const EXIT_ERROR: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
	let args = Args::parse();
	init_tracing(args.log_json);

	let mut builder = AnalysisClient::builder()
		.base_url(&args.base_url)
		.request_timeout(args.request_timeout());
	if let Some(token) = &args.token {
		builder = builder.auth_token(token);
	}
	if let Some(session_id) = &args.session_id {
		builder = builder.session_id(session_id);
	}
	let client = builder.build().context("invalid client configuration")?;

	let config = ControllerConfig {
		include_history: !args.no_history,
		close_on_terminal: true,
	};
	let mut controller = client.controller(Roster::investment(), config);

	if args.start {
		let record = client
			.start(&args.run)
			.await
			.with_context(|| format!("failed to start run {}", args.run))?;
		info!(run = %args.run, status = ?record.status, "Started run");
		controller.select_with_status(args.run.clone(), RunStatus::Running);
	} else {
		controller.select(args.run.clone());
	}

	let code = watch(&mut controller, &args).await?;
	controller.close();
	Ok(ExitCode::from(code))
}

fn init_tracing(json: bool) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let builder = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr);
	if json {
		builder.json().init();
	} else {
		builder.init();
	}
}

/// Drives the controller until the run settles, returning the exit code.
async fn watch(controller: &mut RunController, args: &Args) -> anyhow::Result<u8> {
	let mut reporter = Reporter::new(args.json);
	let mut stdout = std::io::stdout();
	let mut reconnects = 0;

	let ctrl_c = tokio::signal::ctrl_c();
	tokio::pin!(ctrl_c);

	loop {
		let update = tokio::select! {
			_ = &mut ctrl_c => None,
			update = controller.next_update() => Some(update),
		};
		let Some(update) = update else {
			info!(run = %args.run, "Interrupted");
			return Ok(EXIT_INTERRUPTED);
		};

		if let Some(view) = update {
			reporter.report(&view, &mut stdout)?;
			continue;
		}

		// Nothing left in flight: the run finished or something failed.
		let Some(view) = controller.view() else {
			return Ok(EXIT_ERROR);
		};
		if let Some(code) = outcome(&view) {
			return Ok(code);
		}
		if reconnects < args.max_reconnects && controller.reconnect() {
			reconnects += 1;
			warn!(
				run = %args.run,
				attempt = reconnects,
				max = args.max_reconnects,
				"Reconnecting"
			);
			continue;
		}

		error!(
			run = %args.run,
			connection_error = ?view.connection_error,
			load_error = ?view.load_error,
			"Giving up on run"
		);
		return Ok(EXIT_ERROR);
	}
}

/// Exit code for a settled view, or `None` if it can still be retried.
fn outcome(view: &RunView) -> Option<u8> {
	match view.run.status {
		RunStatus::Completed => Some(EXIT_COMPLETED),
		RunStatus::Failed => Some(EXIT_FAILED),
		_ if view.phase == RunPhase::Snapshot => Some(EXIT_ERROR),
		_ => None,
	}
}

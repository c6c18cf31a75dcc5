// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-process transport and snapshot source for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use loom_analysis_core::{RunRecord, RunRef, WorkflowEvent};
use tokio::sync::Semaphore;

use crate::error::{AnalysisError, Result};
use crate::snapshot::SnapshotSource;
use crate::stream::{EventTransport, FrameStream};

struct Subscription {
	run: RunRef,
	since: Option<u64>,
	sender: UnboundedSender<Result<WorkflowEvent>>,
}

/// Transport whose subscriptions are fed by the test.
#[derive(Default)]
pub(crate) struct ChannelTransport {
	subscriptions: Mutex<Vec<Subscription>>,
	refuse: AtomicBool,
}

impl ChannelTransport {
	pub(crate) fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub(crate) fn refuse_subscriptions(&self, refuse: bool) {
		self.refuse.store(refuse, Ordering::SeqCst);
	}

	pub(crate) fn subscription_count(&self) -> usize {
		self.subscriptions.lock().unwrap().len()
	}

	pub(crate) fn since(&self, index: usize) -> Option<u64> {
		self.subscriptions.lock().unwrap()[index].since
	}

	pub(crate) fn run(&self, index: usize) -> RunRef {
		self.subscriptions.lock().unwrap()[index].run.clone()
	}

	/// Sends a frame. Frames for released subscriptions are silently lost.
	pub(crate) fn send(&self, index: usize, event: WorkflowEvent) {
		let _ = self.subscriptions.lock().unwrap()[index]
			.sender
			.unbounded_send(Ok(event));
	}

	pub(crate) fn fail(&self, index: usize, message: &str) {
		let _ = self.subscriptions.lock().unwrap()[index]
			.sender
			.unbounded_send(Err(AnalysisError::StreamError(message.to_string())));
	}

	/// Closes the subscription from the server side.
	pub(crate) fn end(&self, index: usize) {
		self.subscriptions.lock().unwrap()[index].sender.close_channel();
	}
}

#[async_trait]
impl EventTransport for ChannelTransport {
	async fn subscribe(&self, run: &RunRef, since_sequence: Option<u64>) -> Result<FrameStream> {
		if self.refuse.load(Ordering::SeqCst) {
			return Err(AnalysisError::StreamError("connection refused".to_string()));
		}
		let (sender, receiver) = unbounded();
		self.subscriptions.lock().unwrap().push(Subscription {
			run: run.clone(),
			since: since_sequence,
			sender,
		});
		Ok(receiver.boxed())
	}
}

/// Snapshot source serving fixed records, optionally held back until the
/// test releases them.
#[derive(Default)]
pub(crate) struct StaticSource {
	records: Mutex<HashMap<RunRef, RunRecord>>,
	events: Mutex<HashMap<RunRef, Vec<WorkflowEvent>>>,
	gate: Option<Semaphore>,
	fail_events: AtomicBool,
	run_fetches: AtomicU32,
	event_fetches: AtomicU32,
}

impl StaticSource {
	pub(crate) fn new() -> Self {
		Self::default()
	}

	/// Every record fetch waits for a call to [`StaticSource::release`].
	pub(crate) fn gated() -> Self {
		Self {
			gate: Some(Semaphore::new(0)),
			..Self::default()
		}
	}

	pub(crate) fn with_record(self, run: &RunRef, record: serde_json::Value) -> Self {
		self.insert_record(run, record);
		self
	}

	pub(crate) fn with_events(self, run: &RunRef, events: Vec<WorkflowEvent>) -> Self {
		self.events.lock().unwrap().insert(run.clone(), events);
		self
	}

	pub(crate) fn insert_record(&self, run: &RunRef, record: serde_json::Value) {
		let record: RunRecord = serde_json::from_value(record).unwrap();
		self.records.lock().unwrap().insert(run.clone(), record);
	}

	pub(crate) fn fail_event_fetches(&self, fail: bool) {
		self.fail_events.store(fail, Ordering::SeqCst);
	}

	pub(crate) fn release(&self) {
		if let Some(gate) = &self.gate {
			gate.add_permits(1);
		}
	}

	pub(crate) fn run_fetches(&self) -> u32 {
		self.run_fetches.load(Ordering::SeqCst)
	}

	pub(crate) fn event_fetches(&self) -> u32 {
		self.event_fetches.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl SnapshotSource for StaticSource {
	async fn fetch_run(&self, run: &RunRef) -> Result<RunRecord> {
		self.run_fetches.fetch_add(1, Ordering::SeqCst);
		if let Some(gate) = &self.gate {
			gate.acquire().await.unwrap().forget();
		}
		self.records
			.lock()
			.unwrap()
			.get(run)
			.cloned()
			.ok_or_else(|| AnalysisError::RunNotFound { run: run.clone() })
	}

	async fn fetch_events(&self, run: &RunRef) -> Result<Vec<WorkflowEvent>> {
		self.event_fetches.fetch_add(1, Ordering::SeqCst);
		if self.fail_events.load(Ordering::SeqCst) {
			return Err(AnalysisError::ServerError {
				status: 503,
				message: "unavailable".to_string(),
			});
		}
		Ok(self
			.events
			.lock()
			.unwrap()
			.get(run)
			.cloned()
			.unwrap_or_default())
	}
}

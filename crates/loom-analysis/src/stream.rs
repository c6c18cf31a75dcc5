// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Event stream subscription for a single run.
//!
//! [`StreamConnection`] supervises one subscription at a time. Frames are read
//! by a background task and handed to the consumer through a channel, in
//! arrival order. The connection never reconnects on its own: after a failure
//! it stays in [`ConnectionState::Error`] until the consumer calls
//! [`StreamConnection::reconnect`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::future;
use futures::stream::{BoxStream, Stream, StreamExt};
use loom_analysis_core::{ConnectionState, EventKind, RunRef, WorkflowEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{AnalysisError, Result};

/// Decoded frames of one subscription.
pub type FrameStream = BoxStream<'static, Result<WorkflowEvent>>;

/// Opens event subscriptions. Implemented over HTTP by
/// [`AnalysisClient`](crate::AnalysisClient).
#[async_trait]
pub trait EventTransport: Send + Sync {
	/// Subscribes to the events of `run`. When `since_sequence` is set, only
	/// events with a higher sequence are requested.
	async fn subscribe(&self, run: &RunRef, since_sequence: Option<u64>) -> Result<FrameStream>;
}

pub type SharedTransport = Arc<dyn EventTransport>;

/// Decodes a `text/event-stream` body into event frames.
///
/// Comments (such as keep-alives) and empty messages are skipped. A message
/// that is not a valid frame is logged and skipped; a transport error is
/// passed through and ends the subscription.
pub fn decode_sse<S, B, E>(body: S) -> FrameStream
where
	S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
	B: AsRef<[u8]> + Send + 'static,
	E: fmt::Display + Send + 'static,
{
	body
		.eventsource()
		.filter_map(|message| {
			future::ready(match message {
				Ok(message) => decode_frame(&message.data),
				Err(e) => Some(Err(AnalysisError::StreamError(e.to_string()))),
			})
		})
		.boxed()
}

fn decode_frame(data: &str) -> Option<Result<WorkflowEvent>> {
	if data.trim().is_empty() {
		return None;
	}
	match serde_json::from_str::<WorkflowEvent>(data) {
		Ok(event) => Some(Ok(event)),
		Err(e) => {
			warn!(data = %data, error = %e, "Failed to parse stream frame");
			None
		}
	}
}

/// Message from the subscription task.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
	/// The subscription was established.
	Connected,
	/// A frame arrived.
	Frame(WorkflowEvent),
	/// The subscription failed. No further updates follow.
	Failed(String),
	/// The server closed the stream. No further updates follow.
	Ended,
}

/// Supervises the event subscription for one run.
pub struct StreamConnection {
	transport: SharedTransport,
	state: ConnectionState,
	run: Option<RunRef>,
	last_error: Option<String>,
	events_received: u64,
	task: Option<JoinHandle<()>>,
	updates: Option<mpsc::Receiver<StreamUpdate>>,
}

impl StreamConnection {
	pub fn new(transport: SharedTransport) -> Self {
		Self {
			transport,
			state: ConnectionState::Disconnected,
			run: None,
			last_error: None,
			events_received: 0,
			task: None,
			updates: None,
		}
	}

	/// Opens a subscription for `run`. Returns false without doing anything if
	/// a subscription for the same run is already connecting or connected.
	///
	/// Must be called from within a Tokio runtime.
	pub fn open(&mut self, run: RunRef, since_sequence: Option<u64>) -> bool {
		if self.is_active() && self.run.as_ref() == Some(&run) {
			debug!(run = %run, "Event stream already open");
			return false;
		}
		self.close();
		self.spawn(run, since_sequence);
		true
	}

	/// Reopens the subscription for the current run after a failure or a
	/// server-side close. Returns false when there is nothing to reconnect.
	pub fn reconnect(&mut self, since_sequence: Option<u64>) -> bool {
		if self.is_active() {
			return false;
		}
		let Some(run) = self.run.clone() else {
			return false;
		};
		info!(run = %run, since_sequence = ?since_sequence, "Reconnecting event stream");
		self.spawn(run, since_sequence);
		true
	}

	/// Releases the subscription. Nothing from it is delivered afterwards.
	pub fn close(&mut self) {
		self.stop_task();
		if let Some(run) = self.run.take() {
			info!(run = %run, events_received = self.events_received, "Event stream closed");
		}
		self.state = ConnectionState::Disconnected;
		self.last_error = None;
		self.events_received = 0;
	}

	/// Marks the subscription failed, keeping the run so it can be reconnected.
	pub(crate) fn fail(&mut self, message: impl Into<String>) {
		let message = message.into();
		self.stop_task();
		warn!(run = ?self.run, error = %message, "Event stream failed");
		self.state = ConnectionState::Error;
		self.last_error = Some(message);
	}

	/// Waits for the next message from the subscription and updates the
	/// connection state accordingly. Returns `None` when no subscription is
	/// running.
	///
	/// Cancel safe: dropping the future before it completes loses nothing.
	pub async fn next_update(&mut self) -> Option<StreamUpdate> {
		let updates = self.updates.as_mut()?;
		let update = match updates.recv().await {
			Some(update) => update,
			None => StreamUpdate::Failed("event stream task stopped unexpectedly".to_string()),
		};

		match &update {
			StreamUpdate::Connected => {
				self.state = ConnectionState::Connected;
				info!(run = ?self.run, "Event stream connected");
			}
			StreamUpdate::Frame(_) => {
				self.events_received += 1;
			}
			StreamUpdate::Failed(message) => {
				self.fail(message.clone());
			}
			StreamUpdate::Ended => {
				self.stop_task();
				self.state = ConnectionState::Disconnected;
				info!(run = ?self.run, "Event stream ended by server");
			}
		}
		Some(update)
	}

	pub fn state(&self) -> ConnectionState {
		self.state
	}

	pub fn run(&self) -> Option<&RunRef> {
		self.run.as_ref()
	}

	pub fn last_error(&self) -> Option<&str> {
		self.last_error.as_deref()
	}

	/// Frames received since the connection was last opened.
	pub fn events_received(&self) -> u64 {
		self.events_received
	}

	/// Returns true while connecting or connected.
	pub fn is_active(&self) -> bool {
		matches!(
			self.state,
			ConnectionState::Connecting | ConnectionState::Connected
		)
	}

	/// Returns true while a subscription task may still deliver updates.
	pub fn has_pending_updates(&self) -> bool {
		self.updates.is_some()
	}

	fn spawn(&mut self, run: RunRef, since_sequence: Option<u64>) {
		let (tx, rx) = mpsc::channel(64);
		let transport = Arc::clone(&self.transport);
		let task_run = run.clone();

		self.task = Some(tokio::spawn(async move {
			run_subscription(transport, task_run, since_sequence, tx).await;
		}));
		self.updates = Some(rx);
		self.run = Some(run);
		self.state = ConnectionState::Connecting;
		self.last_error = None;
	}

	fn stop_task(&mut self) {
		if let Some(task) = self.task.take() {
			task.abort();
		}
		self.updates = None;
	}
}

impl fmt::Debug for StreamConnection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("StreamConnection")
			.field("state", &self.state)
			.field("run", &self.run)
			.field("last_error", &self.last_error)
			.field("events_received", &self.events_received)
			.finish_non_exhaustive()
	}
}

impl Drop for StreamConnection {
	fn drop(&mut self) {
		if let Some(task) = self.task.take() {
			task.abort();
		}
	}
}

/// Reads one subscription until it fails, ends, or the receiver goes away.
async fn run_subscription(
	transport: SharedTransport,
	run: RunRef,
	since_sequence: Option<u64>,
	tx: mpsc::Sender<StreamUpdate>,
) {
	info!(run = %run, since_sequence = ?since_sequence, "Connecting to event stream");

	let mut frames = match transport.subscribe(&run, since_sequence).await {
		Ok(frames) => frames,
		Err(e) => {
			let _ = tx.send(StreamUpdate::Failed(e.to_string())).await;
			return;
		}
	};

	if tx.send(StreamUpdate::Connected).await.is_err() {
		return;
	}

	while let Some(frame) = frames.next().await {
		let update = match frame {
			Ok(event) if event.kind() == EventKind::Error => {
				let message = event
					.error_message()
					.unwrap_or_else(|| "server reported a stream error".to_string());
				let _ = tx.send(StreamUpdate::Failed(message)).await;
				return;
			}
			Ok(event) => StreamUpdate::Frame(event),
			Err(e) => {
				let _ = tx.send(StreamUpdate::Failed(e.to_string())).await;
				return;
			}
		};
		if tx.send(update).await.is_err() {
			debug!(run = %run, "Event stream receiver dropped");
			return;
		}
	}

	let _ = tx.send(StreamUpdate::Ended).await;
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Applied-sequence bookkeeping for one run.

use std::collections::BTreeSet;

/// Remembers which sequence numbers have been applied to a run.
///
/// The ledger lives exactly as long as the client-side session for a run, so
/// nothing is ever evicted. Reset it when the run identity changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceLedger {
	applied: BTreeSet<u64>,
	/// Largest `n` such that every sequence in `0..=n` has been applied.
	watermark: Option<u64>,
}

impl SequenceLedger {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns true if `sequence` has not been applied yet.
	pub fn should_apply(&self, sequence: u64) -> bool {
		!self.applied.contains(&sequence)
	}

	/// Records `sequence` as applied. Returns false if it already was.
	pub fn mark_applied(&mut self, sequence: u64) -> bool {
		if !self.applied.insert(sequence) {
			return false;
		}

		let mut next = self.watermark.map_or(0, |w| w + 1);
		while self.applied.contains(&next) {
			self.watermark = Some(next);
			next += 1;
		}
		true
	}

	/// Sequence to resume a stream after: everything up to and including it
	/// has been applied. `None` when sequence 0 has not been seen.
	pub fn resume_point(&self) -> Option<u64> {
		self.watermark
	}

	pub fn highest(&self) -> Option<u64> {
		self.applied.last().copied()
	}

	pub fn len(&self) -> usize {
		self.applied.len()
	}

	pub fn is_empty(&self) -> bool {
		self.applied.is_empty()
	}

	pub fn reset(&mut self) {
		self.applied.clear();
		self.watermark = None;
	}
}

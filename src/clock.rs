// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Time sources, deadlines and cancellation.

use {
	crate::common::{Error, Result},
	std::{
		fmt,
		sync::{Arc, atomic::{AtomicBool, Ordering}},
		time::{Duration, Instant, SystemTime}
	}
};

/// Upper bound for a single blocking wait, so that a pending cancellation is observed
/// even if nobody signals the condition being waited on.
pub const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A source of monotonic and wall clock time.
pub trait Clock: Send + Sync + fmt::Debug {
	/// Monotonic time, used for deadlines, idle times and round trip times.
	fn now(&self) -> Instant;
	
	/// Wall clock time, used for staleness estimation against the servers' write dates.
	fn system_time(&self) -> SystemTime;
	
	fn elapsed(&self, since: Instant) -> Duration {
		self.now().saturating_duration_since(since)
	}
}

#[derive(Debug, Default, Copy, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> Instant {
		Instant::now()
	}
	
	fn system_time(&self) -> SystemTime {
		SystemTime::now()
	}
}

/// A cloneable flag that aborts every blocking point it is passed to.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
	pub fn new() -> Self {
		Self::default()
	}
	
	pub fn cancel(&self) {
		self.0.store(true, Ordering::Release);
	}
	
	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::Acquire)
	}
}

/// The overall deadline and cancellation signal of one operation, threaded through
/// server selection, connection checkout and the network call.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
	pub deadline:     Option<Instant>,
	pub cancellation: CancellationToken
}

impl OperationContext {
	pub fn new() -> Self {
		Self::default()
	}
	
	pub fn with_timeout(clock: &dyn Clock, timeout: Duration) -> Self {
		Self {
			deadline:     Some(clock.now() + timeout),
			cancellation: CancellationToken::default()
		}
	}
	
	pub fn with_deadline(deadline: Instant) -> Self {
		Self { deadline: Some(deadline), cancellation: CancellationToken::default() }
	}
	
	pub fn cancellation(mut self, token: CancellationToken) -> Self {
		self.cancellation = token;
		self
	}
	
	/// Returns the earlier of the operation deadline and `now + timeout`.
	pub fn deadline_within(&self, now: Instant, timeout: Duration) -> Instant {
		let local = now + timeout;
		match self.deadline {
			Some(deadline) if deadline < local => deadline,
			_ => local
		}
	}
	
	/// Time left until the operation deadline, `None` if there is none.
	pub fn remaining(&self, now: Instant) -> Option<Duration> {
		self.deadline.map(|deadline| deadline.saturating_duration_since(now))
	}
	
	/// Fails if the operation was cancelled.
	pub fn check(&self) -> Result<()> {
		if self.cancellation.is_cancelled() {
			Err(Error::Cancelled)
		} else {
			Ok(())
		}
	}
}

/// Computes how long a blocking wait may last before it has to re-check its condition.
pub fn wait_slice(now: Instant, deadline: Instant) -> Option<Duration> {
	match deadline.checked_duration_since(now) {
		Some(left) if left > Duration::from_millis(0) => Some(left.min(CANCELLATION_POLL_INTERVAL)),
		_ => None
	}
}

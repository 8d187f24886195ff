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

//! Client sessions, see
//! https://github.com/mongodb/specifications/blob/master/source/sessions/driver-sessions.rst

use {
	crate::{
		common::{Error, Result, ServerId},
		clock::Clock,
		wire::CommandReply
	},
	std::{
		collections::VecDeque,
		fmt,
		sync::{Arc, Mutex},
		time::{Duration, Instant}
	},
	rand::Rng,
	log::trace
};

/// Server sessions this close to expiring are not used anymore.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// A logical timestamp of the cluster, ordered by time, then increment.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Timestamp {
	pub time:      u32,
	pub increment: u32
}

impl Timestamp {
	pub fn new(time: u32, increment: u32) -> Self {
		Self { time, increment }
	}
}

/// A signed cluster time as gossiped by the servers.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ClusterTime {
	pub cluster_time: Timestamp,
	pub signature:    Vec<u8>
}

/// A random UUID identifying a server session.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SessionId(pub [u8; 16]);

impl SessionId {
	pub fn random() -> Self {
		let mut id: [u8; 16] = rand::thread_rng().gen();
		id[6] = (id[6] & 0x0f) | 0x40;
		id[8] = (id[8] & 0x3f) | 0x80;
		Self(id)
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(&hex::encode(self.0))
	}
}

#[derive(Debug)]
pub struct ServerSession {
	pub id:         SessionId,
	pub txn_number: i64,
	/// Set after a network error; the session is discarded instead of reused.
	pub dirty:      bool,
	last_use:       Instant
}

impl ServerSession {
	fn new(now: Instant) -> Self {
		Self { id: SessionId::random(), txn_number: 0, dirty: false, last_use: now }
	}
	
	/// Whether the server may expire the session within a minute.
	fn is_about_to_expire(&self, now: Instant, timeout_minutes: Option<i64>) -> bool {
		match timeout_minutes {
			Some(minutes) => {
				let timeout = Duration::from_secs(minutes.max(0) as u64 * 60);
				now.saturating_duration_since(self.last_use) + EXPIRY_MARGIN >= timeout
			}
			None => false
		}
	}
}

/// Server sessions not in use, most recently used first.
#[derive(Debug)]
pub struct ServerSessionPool {
	sessions: Mutex<VecDeque<ServerSession>>,
	clock:    Arc<dyn Clock>
}

impl ServerSessionPool {
	pub fn new(clock: Arc<dyn Clock>) -> Self {
		Self { sessions: Mutex::new(VecDeque::new()), clock }
	}
	
	/// Takes the most recently used session that is not about to expire, or creates a new one.
	pub fn acquire(&self, timeout_minutes: Option<i64>) -> Result<ServerSession> {
		let now = self.clock.now();
		let mut sessions = self.sessions.lock()?;
		while let Some(session) = sessions.pop_front() {
			if !session.is_about_to_expire(now, timeout_minutes) {
				return Ok(session);
			}
			trace!("discarding expired server session {}", session.id);
		}
		Ok(ServerSession::new(now))
	}
	
	/// Returns a session to the pool, unless it is dirty or about to expire.
	pub fn release(&self, mut session: ServerSession, timeout_minutes: Option<i64>) -> Result<()> {
		let now = self.clock.now();
		let mut sessions = self.sessions.lock()?;
		
		while sessions.back().map_or(false, |s| s.is_about_to_expire(now, timeout_minutes)) {
			sessions.pop_back();
		}
		
		if !session.dirty && !session.is_about_to_expire(now, timeout_minutes) {
			session.last_use = now;
			sessions.push_front(session);
		}
		Ok(())
	}
	
	pub fn len(&self) -> Result<usize> {
		Ok(self.sessions.lock()?.len())
	}
	
	pub fn is_empty(&self) -> Result<bool> {
		Ok(self.len()? == 0)
	}
	
	/// Empties the pool, returning the ids of the discarded sessions.
	pub fn drain(&self) -> Result<Vec<SessionId>> {
		Ok(self.sessions.lock()?.drain(..).map(|session| session.id).collect())
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SessionOptions {
	/// Reads observe the session's earlier operations.
	pub causal_consistency: bool
}

impl Default for SessionOptions {
	fn default() -> Self {
		Self { causal_consistency: true }
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransactionState {
	NoTransaction,
	Starting,
	InProgress,
	Committing,
	Aborting
}

impl Default for TransactionState {
	fn default() -> Self {
		Self::NoTransaction
	}
}

/// A logical session. Returns its server session to the pool when dropped.
#[derive(Debug)]
pub struct ClientSession {
	server_session:      Option<ServerSession>,
	pool:                Arc<ServerSessionPool>,
	/// Created by the driver for a single operation rather than by the user.
	implicit:            bool,
	options:             SessionOptions,
	timeout_minutes:     Option<i64>,
	cluster_time:        Option<ClusterTime>,
	operation_time:      Option<Timestamp>,
	transaction:         TransactionState,
	pinned:              Option<ServerId>
}

impl ClientSession {
	/// Starts a session on a server session of `pool`, returned to it on drop.
	pub fn new(
		pool:            Arc<ServerSessionPool>,
		options:         SessionOptions,
		timeout_minutes: Option<i64>,
		implicit:        bool
	) -> Result<Self> {
		Ok(Self {
			server_session: Some(pool.acquire(timeout_minutes)?),
			pool,
			implicit,
			options,
			timeout_minutes,
			cluster_time:   None,
			operation_time: None,
			transaction:    TransactionState::NoTransaction,
			pinned:         None
		})
	}
	
	fn server_session(&self) -> &ServerSession {
		self.server_session.as_ref().unwrap_or_else(|| unreachable!("server session is only taken on drop"))
	}
	
	fn server_session_mut(&mut self) -> &mut ServerSession {
		self.server_session.as_mut().unwrap_or_else(|| unreachable!("server session is only taken on drop"))
	}
	
	pub fn id(&self) -> SessionId {
		self.server_session().id
	}
	
	pub fn is_implicit(&self) -> bool {
		self.implicit
	}
	
	pub fn options(&self) -> &SessionOptions {
		&self.options
	}
	
	pub fn cluster_time(&self) -> Option<&ClusterTime> {
		self.cluster_time.as_ref()
	}
	
	pub fn operation_time(&self) -> Option<Timestamp> {
		self.operation_time
	}
	
	/// Keeps the later of the current and the given cluster time.
	pub fn advance_cluster_time(&mut self, cluster_time: &ClusterTime) {
		if self.cluster_time.as_ref().map_or(true, |current| current.cluster_time < cluster_time.cluster_time) {
			self.cluster_time = Some(cluster_time.clone());
		}
	}
	
	/// Keeps the later of the current and the given operation time.
	pub fn advance_operation_time(&mut self, operation_time: Timestamp) {
		if self.operation_time.map_or(true, |current| current < operation_time) {
			self.operation_time = Some(operation_time);
		}
	}
	
	/// Advances the session's clocks from a command reply.
	pub fn process_reply(&mut self, reply: &CommandReply) {
		if let Some(cluster_time) = &reply.cluster_time {
			self.advance_cluster_time(cluster_time);
		}
		if let Some(operation_time) = reply.operation_time {
			self.advance_operation_time(operation_time);
		}
	}
	
	/// The `afterClusterTime` to send with the next read.
	pub fn after_cluster_time(&self) -> Option<Timestamp> {
		if self.options.causal_consistency { self.operation_time } else { None }
	}
	
	/// Marks the server session dirty, so that it is discarded when the session ends.
	pub fn mark_dirty(&mut self) {
		self.server_session_mut().dirty = true;
	}
	
	pub fn txn_number(&self) -> i64 {
		self.server_session().txn_number
	}
	
	/// Increments the transaction number for a retryable write and returns it.
	pub fn next_txn_number(&mut self) -> i64 {
		let session = self.server_session_mut();
		session.txn_number += 1;
		session.txn_number
	}
	
	pub fn transaction_state(&self) -> TransactionState {
		self.transaction
	}
	
	pub fn in_transaction(&self) -> bool {
		matches!(self.transaction, TransactionState::Starting | TransactionState::InProgress)
	}
	
	/// Use [`Cluster::start_transaction`](crate::cluster::Cluster::start_transaction), which checks
	/// that the deployment supports transactions.
	pub(crate) fn start_transaction(&mut self) -> Result<()> {
		if self.implicit {
			return Err(Error::Transaction("transactions can not be started on implicit sessions".to_string()));
		}
		if self.in_transaction() {
			return Err(Error::Transaction("transaction already in progress".to_string()));
		}
		self.unpin();
		self.next_txn_number();
		self.transaction = TransactionState::Starting;
		Ok(())
	}
	
	/// Records that the first operation of the transaction was sent.
	pub fn transaction_started(&mut self) {
		if self.transaction == TransactionState::Starting {
			self.transaction = TransactionState::InProgress;
		}
	}
	
	pub fn begin_commit(&mut self) -> Result<()> {
		match self.transaction {
			TransactionState::Starting | TransactionState::InProgress | TransactionState::Committing => {
				self.transaction = TransactionState::Committing;
				Ok(())
			}
			TransactionState::NoTransaction => Err(Error::Transaction("no transaction started".to_string())),
			TransactionState::Aborting => Err(Error::Transaction(
				"can not commit a transaction after calling abort".to_string()))
		}
	}
	
	pub fn begin_abort(&mut self) -> Result<()> {
		match self.transaction {
			TransactionState::Starting | TransactionState::InProgress => {
				self.transaction = TransactionState::Aborting;
				Ok(())
			}
			TransactionState::NoTransaction => Err(Error::Transaction("no transaction started".to_string())),
			TransactionState::Committing => Err(Error::Transaction(
				"can not abort a transaction after calling commit".to_string())),
			TransactionState::Aborting => Err(Error::Transaction("transaction already aborted".to_string()))
		}
	}
	
	/// Ends a commit or abort and unpins the session.
	pub fn end_transaction(&mut self) {
		self.transaction = TransactionState::NoTransaction;
		self.unpin();
	}
	
	pub fn pinned(&self) -> Option<&ServerId> {
		self.pinned.as_ref()
	}
	
	pub fn pin(&mut self, server_id: ServerId) {
		trace!("pinning session {} to {}", self.id(), server_id);
		self.pinned = Some(server_id);
	}
	
	pub fn unpin(&mut self) {
		self.pinned = None;
	}
}

impl Drop for ClientSession {
	fn drop(&mut self) {
		if let Some(session) = self.server_session.take() {
			self.pool.release(session, self.timeout_minutes).unwrap_or(());
		}
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{common::ClusterId, mock::MockClock}
	};
	
	fn pool() -> (Arc<ServerSessionPool>, MockClock) {
		let clock = MockClock::new();
		(Arc::new(ServerSessionPool::new(Arc::new(clock.clone()))), clock)
	}
	
	fn session(pool: &Arc<ServerSessionPool>) -> ClientSession {
		ClientSession::new(pool.clone(), SessionOptions::default(), Some(30), false).unwrap()
	}
	
	#[test]
	fn operation_time_never_decreases() {
		let (pool, _) = pool();
		let mut session = session(&pool);
		assert_eq!(session.operation_time(), None);
		
		for (time, expected) in &[(5, 5), (3, 5), (8, 8)] {
			session.advance_operation_time(Timestamp::new(*time, 0));
			assert_eq!(session.operation_time(), Some(Timestamp::new(*expected, 0)));
		}
		
		session.advance_operation_time(Timestamp::new(8, 2));
		session.advance_operation_time(Timestamp::new(8, 1));
		assert_eq!(session.after_cluster_time(), Some(Timestamp::new(8, 2)));
	}
	
	#[test]
	fn cluster_time_never_decreases() {
		let (pool, _) = pool();
		let mut session = session(&pool);
		let time = |t| ClusterTime { cluster_time: Timestamp::new(t, 1), signature: vec![t as u8] };
		
		session.advance_cluster_time(&time(10));
		session.advance_cluster_time(&time(4));
		assert_eq!(session.cluster_time(), Some(&time(10)));
		
		session.process_reply(&CommandReply {
			cluster_time:   Some(time(12)),
			operation_time: Some(Timestamp::new(11, 0)),
			..CommandReply::default()
		});
		assert_eq!(session.cluster_time(), Some(&time(12)));
		assert_eq!(session.operation_time(), Some(Timestamp::new(11, 0)));
	}
	
	#[test]
	fn causal_consistency_can_be_disabled() {
		let (pool, _) = pool();
		let mut session = ClientSession::new(pool, SessionOptions { causal_consistency: false }, Some(30), false).unwrap();
		session.advance_operation_time(Timestamp::new(1, 1));
		assert_eq!(session.after_cluster_time(), None);
	}
	
	#[test]
	fn server_sessions_are_reused_lifo() {
		let (pool, _) = pool();
		let first = session(&pool);
		let second = session(&pool);
		let (first_id, second_id) = (first.id(), second.id());
		assert_ne!(first_id, second_id);
		
		drop(first);
		drop(second);
		assert_eq!(pool.len().unwrap(), 2);
		assert_eq!(session(&pool).id(), second_id);
	}
	
	#[test]
	fn expiring_server_sessions_are_discarded() {
		let (pool, clock) = pool();
		let id = session(&pool).id();
		
		clock.advance(Duration::from_secs(29 * 60 + 1));
		assert_ne!(session(&pool).id(), id);
		assert_eq!(pool.len().unwrap(), 1, "only the fresh session is pooled");
	}
	
	#[test]
	fn dirty_server_sessions_are_discarded() {
		let (pool, _) = pool();
		let mut session = session(&pool);
		session.mark_dirty();
		drop(session);
		assert!(pool.is_empty().unwrap());
	}
	
	#[test]
	fn transaction_lifecycle() {
		let (pool, _) = pool();
		let mut session = session(&pool);
		assert!(matches!(session.begin_commit(), Err(Error::Transaction(_))));
		
		session.start_transaction().unwrap();
		assert_eq!(session.transaction_state(), TransactionState::Starting);
		assert_eq!(session.txn_number(), 1);
		assert!(session.start_transaction().is_err());
		
		session.pin(ServerId { cluster_id: ClusterId(1), address: "a:27017".parse().unwrap() });
		session.transaction_started();
		assert_eq!(session.transaction_state(), TransactionState::InProgress);
		
		session.begin_commit().unwrap();
		assert!(session.begin_abort().is_err());
		session.end_transaction();
		assert_eq!(session.transaction_state(), TransactionState::NoTransaction);
		assert!(session.pinned().is_none());
		
		session.start_transaction().unwrap();
		assert_eq!(session.txn_number(), 2);
		session.begin_abort().unwrap();
		session.end_transaction();
	}
	
	#[test]
	fn implicit_sessions_reject_transactions() {
		let (pool, _) = pool();
		let mut session = ClientSession::new(pool, SessionOptions::default(), None, true).unwrap();
		assert!(session.is_implicit());
		assert!(session.start_transaction().is_err());
	}
	
	#[test]
	fn session_id_is_uuid_v4() {
		let id = SessionId::random();
		assert_eq!(id.0[6] >> 4, 4);
		assert_eq!(id.0[8] >> 6, 2);
		assert_eq!(id.to_string().len(), 32);
	}
}

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

//! Connection pooling, see
//! https://github.com/mongodb/specifications/blob/master/source/connection-monitoring-and-pooling/connection-monitoring-and-pooling.rst
//!
//! Event listeners are invoked while the pool lock is held and must not call back into the pool.

use {
	crate::{
		common::{ClusterOptions, ConnectionId, ConnectionPoolOptions, Error, Result, ServerId},
		apm::{Event, EventHandler, ConnectionCheckOutFailedReason, ConnectionClosedReason},
		clock::{Clock, OperationContext, wait_slice},
		wire::{Connector, CommandReply, HandshakeReply, HandshakeRequest, Stream}
	},
	std::{
		collections::VecDeque,
		fmt,
		ops::{Deref, DerefMut},
		sync::{Arc, Mutex, MutexGuard, Condvar},
		time::{Duration, Instant}
	},
	log::{debug, trace}
};

/// An established connection owned by a pool.
#[derive(Debug)]
pub struct Connection {
	pub id:         ConnectionId,
	/// The pool generation the connection was created in.
	pub generation: u32,
	pub handshake:  HandshakeReply,
	stream:         Box<dyn Stream>,
	last_used:      Instant
}

/// A pool of connections to one server. Cheap to clone; all clones share the pool.
#[derive(Clone)]
pub struct ConnectionPool(Arc<PoolInner>);

struct PoolInner {
	server_id:        ServerId,
	options:          ConnectionPoolOptions,
	checkout_timeout: Duration,
	connect_timeout:  Duration,
	handshake:        HandshakeRequest,
	connector:        Arc<dyn Connector>,
	clock:            Arc<dyn Clock>,
	events:           EventHandler,
	state:            Mutex<PoolState>,
	changed:          Condvar
}

#[derive(Debug, Default)]
struct PoolState {
	generation:  u32,
	closed:      bool,
	/// Most recently used last.
	idle:        VecDeque<Connection>,
	/// Connections alive or being established, checked out or not.
	total:       usize,
	pending:     usize,
	/// Tickets of the threads waiting to check out, served in order.
	queue:       VecDeque<u64>,
	next_ticket: u64,
	next_id:     u64
}

impl fmt::Debug for ConnectionPool {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("ConnectionPool")
			.field("server_id", &self.0.server_id)
			.field("options", &self.0.options)
			.field("state", &self.0.state)
			.finish()
	}
}

impl ConnectionPool {
	pub fn new(
		server_id: ServerId,
		options:   &ClusterOptions,
		connector: Arc<dyn Connector>,
		clock:     Arc<dyn Clock>,
		events:    EventHandler
	) -> Self {
		let self_ = Self(Arc::new(PoolInner {
			options:          options.pool_options,
			checkout_timeout: options.pool_options.wait_queue_timeout
				.unwrap_or(options.server_selection_config.server_selection_timeout),
			connect_timeout:  options.connect_timeout,
			handshake:        HandshakeRequest {
				appname:       options.appname.clone(),
				load_balanced: options.load_balanced,
				..HandshakeRequest::default()
			},
			state:            Mutex::new(PoolState { next_id: 1, ..PoolState::default() }),
			changed:          Condvar::new(),
			server_id,
			connector,
			clock,
			events
		}));
		
		self_.0.events.dispatch(Event::PoolCreated { server_id: &self_.0.server_id });
		self_.0.events.dispatch(Event::PoolReady { server_id: &self_.0.server_id });
		self_
	}
	
	pub fn server_id(&self) -> &ServerId {
		&self.0.server_id
	}
	
	fn lock(&self) -> Result<MutexGuard<PoolState>> {
		Ok(self.0.state.lock()?)
	}
	
	pub fn generation(&self) -> Result<u32> {
		Ok(self.lock()?.generation)
	}
	
	pub fn is_closed(&self) -> Result<bool> {
		Ok(self.lock()?.closed)
	}
	
	/// Number of connections alive or being established.
	pub fn total_connections(&self) -> Result<usize> {
		Ok(self.lock()?.total)
	}
	
	pub fn idle_connections(&self) -> Result<usize> {
		Ok(self.lock()?.idle.len())
	}
	
	/// Checks out a connection, reusing an idle one, establishing a new one or waiting for one to
	/// be checked in. Waits at most until the wait queue timeout or the operation deadline.
	pub fn checkout(&self, ctx: &OperationContext) -> Result<PooledConnection> {
		let inner = &*self.0;
		let start = inner.clock.now();
		let deadline = ctx.deadline_within(start, inner.checkout_timeout);
		inner.events.dispatch(Event::ConnectionCheckOutStarted { server_id: &inner.server_id });
		
		let fail = |state: &mut PoolState, ticket: Option<u64>, reason: ConnectionCheckOutFailedReason, err: Error| -> Result<PooledConnection> {
			if let Some(ticket) = ticket {
				state.queue.retain(|t| *t != ticket);
				inner.changed.notify_all();
			}
			inner.events.dispatch(Event::ConnectionCheckOutFailed {
				server_id: &inner.server_id,
				duration:  inner.clock.elapsed(start),
				reason
			});
			Err(err)
		};
		
		let mut state = self.lock()?;
		if state.closed {
			return fail(&mut *state, None, ConnectionCheckOutFailedReason::PoolClosed, self.closed_error());
		}
		if matches!(inner.options.wait_queue_size, Some(size) if state.queue.len() >= size) {
			return fail(&mut *state, None, ConnectionCheckOutFailedReason::WaitQueueFull,
				Error::WaitQueueFull { address: inner.server_id.address.clone() });
		}
		
		let ticket = state.next_ticket;
		state.next_ticket += 1;
		state.queue.push_back(ticket);
		
		loop {
			if state.closed {
				return fail(&mut *state, Some(ticket), ConnectionCheckOutFailedReason::PoolClosed, self.closed_error());
			}
			if let Err(e) = ctx.check() {
				return fail(&mut *state, Some(ticket), ConnectionCheckOutFailedReason::Timeout, e);
			}
			
			if state.queue.front() == Some(&ticket) {
				self.evict_perished(&mut state);
				
				if let Some(connection) = state.idle.pop_back() {
					state.queue.pop_front();
					inner.changed.notify_all();
					return Ok(self.checked_out(connection, start));
				}
				
				if (inner.options.max_pool_size == 0 || state.total < inner.options.max_pool_size)
					&& state.pending < inner.options.max_connecting.max(1) {
					state.queue.pop_front();
					state.total += 1;
					state.pending += 1;
					let (generation, local_id) = (state.generation, state.next_id);
					state.next_id += 1;
					inner.changed.notify_all();
					drop(state);
					
					let result = self.establish(generation, local_id, deadline);
					
					let mut state = self.lock()?;
					state.pending -= 1;
					inner.changed.notify_all();
					return match result {
						// the pool was cleared or closed while connecting
						Ok(connection) if state.closed || connection.generation != state.generation => {
							let (closed, failed, err) = if state.closed {
								(ConnectionClosedReason::PoolClosed, ConnectionCheckOutFailedReason::PoolClosed,
									self.closed_error())
							} else {
								(ConnectionClosedReason::Stale, ConnectionCheckOutFailedReason::ConnectionError,
									Error::PoolCleared { address: inner.server_id.address.clone() })
							};
							inner.events.dispatch(Event::ConnectionClosed { connection_id: &connection.id, reason: closed });
							state.total -= 1;
							fail(&mut *state, None, failed, err)
						}
						Ok(connection) => Ok(self.checked_out(connection, start)),
						Err(e) => {
							state.total -= 1;
							fail(&mut *state, None, ConnectionCheckOutFailedReason::ConnectionError, e)
						}
					};
				}
			}
			
			let slice = match wait_slice(inner.clock.now(), deadline) {
				Some(slice) => slice,
				None => {
					let timeout = inner.clock.elapsed(start);
					debug!("checkout from {} timed out after {:?}", inner.server_id.address, timeout);
					return fail(&mut *state, Some(ticket), ConnectionCheckOutFailedReason::Timeout,
						Error::PoolTimeout { address: inner.server_id.address.clone(), timeout });
				}
			};
			state = inner.changed.wait_timeout(state, slice)?.0;
		}
	}
	
	fn closed_error(&self) -> Error {
		Error::PoolClosed { address: self.0.server_id.address.clone() }
	}
	
	fn checked_out(&self, connection: Connection, start: Instant) -> PooledConnection {
		self.0.events.dispatch(Event::ConnectionCheckedOut {
			connection_id: &connection.id,
			duration:      self.0.clock.elapsed(start)
		});
		PooledConnection { connection: Some(connection), pool: self.clone(), has_error: false }
	}
	
	/// Opens a connection without holding the pool lock. The caller accounts for it in `total`.
	fn establish(&self, generation: u32, local_id: u64, deadline: Instant) -> Result<Connection> {
		let inner = &*self.0;
		let id = ConnectionId { server_id: inner.server_id.clone(), local_id };
		inner.events.dispatch(Event::ConnectionCreated { connection_id: &id });
		
		let start = inner.clock.now();
		let timeout = inner.connect_timeout.min(deadline.saturating_duration_since(start));
		match inner.connector.connect(&inner.server_id.address, &inner.handshake, timeout) {
			Ok((stream, handshake)) => {
				inner.events.dispatch(Event::ConnectionReady { connection_id: &id, duration: inner.clock.elapsed(start) });
				trace!("established connection {}", id);
				Ok(Connection { id, generation, handshake, stream, last_used: inner.clock.now() })
			}
			Err(e) => {
				inner.events.dispatch(Event::ConnectionClosed { connection_id: &id, reason: ConnectionClosedReason::Error });
				Err(e)
			}
		}
	}
	
	/// Closes idle connections of an older generation or idle for longer than the max idle time.
	fn evict_perished(&self, state: &mut PoolState) {
		let now = self.0.clock.now();
		let max_idle_time = self.0.options.max_idle_time;
		let generation = state.generation;
		
		let mut kept = VecDeque::with_capacity(state.idle.len());
		for connection in state.idle.drain(..) {
			let reason = if connection.generation != generation {
				ConnectionClosedReason::Stale
			} else if matches!(max_idle_time, Some(max) if now.saturating_duration_since(connection.last_used) > max) {
				ConnectionClosedReason::Idle
			} else {
				kept.push_back(connection);
				continue;
			};
			self.0.events.dispatch(Event::ConnectionClosed { connection_id: &connection.id, reason });
			state.total -= 1;
		}
		state.idle = kept;
	}
	
	fn check_in(&self, mut connection: Connection, has_error: bool) {
		let inner = &*self.0;
		inner.events.dispatch(Event::ConnectionCheckedIn { connection_id: &connection.id });
		
		let mut state = match inner.state.lock() {
			Ok(state) => state,
			Err(poisoned) => poisoned.into_inner()
		};
		
		let reason = if has_error {
			ConnectionClosedReason::Error
		} else if state.closed {
			ConnectionClosedReason::PoolClosed
		} else if connection.generation != state.generation {
			ConnectionClosedReason::Stale
		} else {
			connection.last_used = inner.clock.now();
			state.idle.push_back(connection);
			inner.changed.notify_all();
			return;
		};
		
		inner.events.dispatch(Event::ConnectionClosed { connection_id: &connection.id, reason });
		state.total -= 1;
		inner.changed.notify_all();
	}
	
	/// Invalidates all connections by incrementing the generation. Idle connections are closed
	/// right away; checked out ones are closed when checked in. Returns the new generation.
	pub fn clear(&self) -> Result<u32> {
		let mut state = self.lock()?;
		state.generation += 1;
		self.evict_perished(&mut state);
		debug!("cleared pool for {}, generation is now {}", self.0.server_id.address, state.generation);
		self.0.events.dispatch(Event::PoolCleared { server_id: &self.0.server_id, generation: state.generation });
		self.0.changed.notify_all();
		Ok(state.generation)
	}
	
	/// Closes all idle connections and fails all pending and future checkouts.
	pub fn close(&self) -> Result<()> {
		let mut state = self.lock()?;
		if state.closed { return Ok(()); }
		
		state.closed = true;
		for connection in state.idle.drain(..).collect::<Vec<_>>() {
			self.0.events.dispatch(Event::ConnectionClosed {
				connection_id: &connection.id,
				reason:        ConnectionClosedReason::PoolClosed
			});
			state.total -= 1;
		}
		self.0.events.dispatch(Event::PoolClosed { server_id: &self.0.server_id });
		self.0.changed.notify_all();
		Ok(())
	}
	
	/// Establishes connections until the pool holds at least the min pool size.
	pub fn populate(&self) -> Result<()> {
		loop {
			let mut state = self.lock()?;
			if state.closed
				|| state.total >= self.0.options.min_pool_size
				|| state.pending >= self.0.options.max_connecting.max(1) {
				return Ok(());
			}
			
			state.total += 1;
			state.pending += 1;
			let (generation, local_id) = (state.generation, state.next_id);
			state.next_id += 1;
			drop(state);
			
			let deadline = self.0.clock.now() + self.0.connect_timeout;
			let result = self.establish(generation, local_id, deadline);
			
			let mut state = self.lock()?;
			state.pending -= 1;
			self.0.changed.notify_all();
			match result {
				Ok(connection) => {
					state.idle.push_front(connection);
					self.evict_perished(&mut state);
				}
				Err(e) => {
					state.total -= 1;
					return Err(e);
				}
			}
		}
	}
}

/// A checked out connection, checked back in when dropped.
#[derive(Debug)]
pub struct PooledConnection {
	connection: Option<Connection>,
	pool:       ConnectionPool,
	has_error:  bool
}

impl PooledConnection {
	pub fn id(&self) -> &ConnectionId {
		&self.connection().id
	}
	
	pub fn generation(&self) -> u32 {
		self.connection().generation
	}
	
	pub fn handshake(&self) -> &HandshakeReply {
		&self.connection().handshake
	}
	
	fn connection(&self) -> &Connection {
		self.connection.as_ref().unwrap_or_else(|| unreachable!("connection is only taken on drop"))
	}
	
	/// Closes the connection instead of returning it to the pool on drop.
	pub fn mark_error(&mut self) {
		self.has_error = true;
	}
	
	/// Sends a command, closing the connection on check in if it failed with a network error.
	pub fn send_command(&mut self, command: &[u8], timeout: Option<Duration>) -> Result<CommandReply> {
		let result = self.deref_mut().send_command(command, timeout);
		if let Err(e) = &result {
			if e.is_network_error() || e.is_network_timeout() {
				self.mark_error();
			}
		}
		result
	}
}

impl Deref for PooledConnection {
	type Target = dyn Stream;
	
	fn deref(&self) -> &Self::Target {
		&*self.connection().stream
	}
}

impl DerefMut for PooledConnection {
	fn deref_mut(&mut self) -> &mut Self::Target {
		match &mut self.connection {
			Some(connection) => &mut *connection.stream,
			None => unreachable!("connection is only taken on drop")
		}
	}
}

impl Drop for PooledConnection {
	fn drop(&mut self) {
		if let Some(connection) = self.connection.take() {
			self.pool.check_in(connection, self.has_error);
		}
	}
}

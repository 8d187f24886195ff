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

//! Monitoring events for topology changes, heartbeats and connection pools.

use {
	crate::{
		common::{ClusterId, ConnectionId, Error, ServerId},
		server::{ServerAddress, ServerDescription},
		topology::TopologyDescription
	},
	std::{
		sync::{Arc, RwLock, atomic::{AtomicBool, Ordering}},
		time::Duration
	}
};

pub type EventListener = Box<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug)]
pub enum Event<'a> {
	TopologyOpening {
		cluster_id: ClusterId
	},
	TopologyClosed {
		cluster_id: ClusterId
	},
	TopologyDescriptionChanged {
		cluster_id:           ClusterId,
		previous_description: &'a TopologyDescription,
		new_description:      &'a TopologyDescription
	},
	ServerOpening {
		server_id: &'a ServerId
	},
	ServerClosed {
		server_id: &'a ServerId
	},
	ServerDescriptionChanged {
		server_id:            &'a ServerId,
		previous_description: &'a ServerDescription,
		new_description:      &'a ServerDescription
	},
	ServerHeartbeatStarted {
		address: &'a ServerAddress,
		awaited: bool
	},
	ServerHeartbeatSucceeded {
		address:  &'a ServerAddress,
		duration: Duration,
		awaited:  bool
	},
	ServerHeartbeatFailed {
		address:  &'a ServerAddress,
		duration: Duration,
		failure:  &'a Error,
		awaited:  bool
	},
	PoolCreated {
		server_id: &'a ServerId
	},
	PoolReady {
		server_id: &'a ServerId
	},
	PoolCleared {
		server_id:  &'a ServerId,
		generation: u32
	},
	PoolClosed {
		server_id: &'a ServerId
	},
	ConnectionCreated {
		connection_id: &'a ConnectionId
	},
	ConnectionReady {
		connection_id: &'a ConnectionId,
		duration:      Duration
	},
	ConnectionClosed {
		connection_id: &'a ConnectionId,
		reason:        ConnectionClosedReason
	},
	ConnectionCheckOutStarted {
		server_id: &'a ServerId
	},
	ConnectionCheckOutFailed {
		server_id: &'a ServerId,
		reason:    ConnectionCheckOutFailedReason,
		duration:  Duration
	},
	ConnectionCheckedOut {
		connection_id: &'a ConnectionId,
		duration:      Duration
	},
	ConnectionCheckedIn {
		connection_id: &'a ConnectionId
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionCheckOutFailedReason {
	PoolClosed,
	Timeout,
	WaitQueueFull,
	ConnectionError
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionClosedReason {
	Stale,
	Idle,
	Error,
	PoolClosed
}

/// Dispatches events to the registered listeners. Cheap to clone; all clones share the listeners.
#[derive(Clone, Default)]
pub struct EventHandler(Arc<EventHandlerInner>);

#[derive(Default)]
struct EventHandlerInner {
	listeners_set: AtomicBool,
	listeners:     RwLock<Vec<EventListener>>
}

impl std::fmt::Debug for EventHandler {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("EventHandler")
			.field("listeners_set", &self.0.listeners_set)
			.finish()
	}
}

impl EventHandler {
	pub fn add_listener(&self, listener: impl Fn(&Event) + Send + Sync + 'static) {
		let mut listeners = match self.0.listeners.write() {
			Ok(listeners) => listeners,
			Err(poisoned) => poisoned.into_inner()
		};
		listeners.push(Box::new(listener));
		self.0.listeners_set.store(true, Ordering::SeqCst);
	}
	
	pub fn dispatch(&self, event: Event) {
		if !self.0.listeners_set.load(Ordering::SeqCst) { return; }
		
		// the lock is only poisoned by a panicking listener
		let listeners = match self.0.listeners.read() {
			Ok(listeners) => listeners,
			Err(poisoned) => poisoned.into_inner()
		};
		for listener in listeners.iter() {
			listener(&event)
		}
	}
}

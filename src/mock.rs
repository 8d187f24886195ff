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

//! Test doubles for the wire layer and the clock.

use {
	crate::{
		common::{Error, Result},
		clock::Clock,
		server::ServerAddress,
		wire::{CommandReply, Connector, HandshakeReply, HandshakeRequest, Stream}
	},
	std::{
		collections::{HashMap, VecDeque},
		sync::{Arc, Mutex},
		time::{Duration, Instant, SystemTime}
	}
};

pub const STANDALONE: &str = r#"{"ok": 1, "isWritablePrimary": true, "maxWireVersion": 21,
	"logicalSessionTimeoutMinutes": 30}"#;
pub const MONGOS: &str = r#"{"ok": 1, "isWritablePrimary": true, "msg": "isdbgrid", "maxWireVersion": 21,
	"logicalSessionTimeoutMinutes": 30}"#;

/// How long an awaitable handshake blocks before replying.
const AWAIT_DELAY: Duration = Duration::from_millis(20);

pub fn network_error() -> Error {
	std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset").into()
}

pub fn timeout_error() -> Error {
	std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out").into()
}

pub fn reply(json: &str) -> HandshakeReply {
	serde_json::from_str(json).expect("invalid handshake reply fixture")
}

fn key(address: &str) -> ServerAddress {
	address.parse().expect("invalid address")
}

#[derive(Debug, Default)]
struct MockState {
	replies:  HashMap<ServerAddress, HandshakeReply>,
	errors:   HashMap<ServerAddress, VecDeque<Error>>,
	/// Used once the queue of errors is exhausted.
	down:     HashMap<ServerAddress, Error>,
	commands: HashMap<ServerAddress, VecDeque<Result<CommandReply>>>,
	connects: HashMap<ServerAddress, usize>,
	checks:   HashMap<ServerAddress, usize>,
	sent:     Vec<ServerAddress>
}

impl MockState {
	fn handshake(&mut self, address: &ServerAddress) -> Result<HandshakeReply> {
		*self.checks.entry(address.clone()).or_default() += 1;
		if let Some(err) = self.errors.get_mut(address).and_then(VecDeque::pop_front) {
			return Err(err);
		}
		if let Some(err) = self.down.get(address) {
			return Err(err.clone());
		}
		self.replies.get(address).cloned().ok_or_else(|| std::io::Error::new(
			std::io::ErrorKind::ConnectionRefused, format!("no server at {}", address)).into())
	}
}

/// A scripted [`Connector`]. Clones share the script.
#[derive(Debug, Clone, Default)]
pub struct MockConnector(Arc<Mutex<MockState>>);

impl MockConnector {
	pub fn new() -> Self {
		Self::default()
	}
	
	/// Sets the handshake reply of a server.
	pub fn set_reply(&self, address: &str, json: &str) {
		self.0.lock().unwrap().replies.insert(key(address), reply(json));
	}
	
	/// Makes every connect and handshake to a server fail until [`MockConnector::set_up`].
	pub fn set_error(&self, address: &str, err: Error) {
		self.0.lock().unwrap().down.insert(key(address), err);
	}
	
	pub fn set_up(&self, address: &str) {
		self.0.lock().unwrap().down.remove(&key(address));
	}
	
	/// Makes the next connect or handshake to a server fail once.
	pub fn fail_next(&self, address: &str, err: Error) {
		self.0.lock().unwrap().errors.entry(key(address)).or_default().push_back(err);
	}
	
	/// Queues a reply for the next command sent to a server. Commands without a queued reply succeed.
	pub fn push_command_reply(&self, address: &str, reply: Result<CommandReply>) {
		self.0.lock().unwrap().commands.entry(key(address)).or_default().push_back(reply);
	}
	
	pub fn connects(&self, address: &str) -> usize {
		self.0.lock().unwrap().connects.get(&key(address)).copied().unwrap_or(0)
	}
	
	/// Number of handshakes attempted, including the ones of new connections.
	pub fn checks(&self, address: &str) -> usize {
		self.0.lock().unwrap().checks.get(&key(address)).copied().unwrap_or(0)
	}
	
	/// The servers commands were sent to, in order.
	pub fn sent(&self) -> Vec<ServerAddress> {
		self.0.lock().unwrap().sent.clone()
	}
}

impl Connector for MockConnector {
	fn connect(&self, address: &ServerAddress, _request: &HandshakeRequest, _timeout: Duration)
		-> Result<(Box<dyn Stream>, HandshakeReply)> {
		let mut state = self.0.lock()?;
		*state.connects.entry(address.clone()).or_default() += 1;
		let reply = state.handshake(address)?;
		Ok((Box::new(MockStream { address: address.clone(), state: self.0.clone() }), reply))
	}
}

#[derive(Debug)]
pub struct MockStream {
	address: ServerAddress,
	state:   Arc<Mutex<MockState>>
}

impl Stream for MockStream {
	fn handshake(&mut self, request: &HandshakeRequest) -> Result<HandshakeReply> {
		if request.is_awaitable() {
			std::thread::sleep(AWAIT_DELAY.min(request.max_await_time.unwrap_or(AWAIT_DELAY)));
		}
		self.state.lock()?.handshake(&self.address)
	}
	
	fn send_command(&mut self, _command: &[u8], _timeout: Option<Duration>) -> Result<CommandReply> {
		let mut state = self.state.lock()?;
		state.sent.push(self.address.clone());
		if let Some(err) = state.down.get(&self.address) {
			return Err(err.clone());
		}
		state.commands.get_mut(&self.address)
			.and_then(VecDeque::pop_front)
			.unwrap_or_else(|| Ok(CommandReply::ok(Vec::new())))
	}
}

/// A clock that only moves when advanced.
#[derive(Debug, Clone)]
pub struct MockClock(Arc<Mutex<(Instant, SystemTime)>>);

impl MockClock {
	pub fn new() -> Self {
		Self(Arc::new(Mutex::new((Instant::now(), SystemTime::now()))))
	}
	
	pub fn advance(&self, by: Duration) {
		let mut now = self.0.lock().unwrap();
		now.0 += by;
		now.1 += by;
	}
}

impl Clock for MockClock {
	fn now(&self) -> Instant {
		self.0.lock().unwrap().0
	}
	
	fn system_time(&self) -> SystemTime {
		self.0.lock().unwrap().1
	}
}

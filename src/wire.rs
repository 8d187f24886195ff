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

//! The narrow interface to the wire protocol layer. Encoding commands and decoding replies
//! is done by the implementors of [`Connector`] and [`Stream`]; this crate only looks at the
//! handshake fields and the few reply fields it needs for sessions and error handling.

use {
	crate::{
		common::{CommandError, Result, TagSet},
		server::{ObjectId, ServerAddress, TopologyVersion},
		session::{ClusterTime, Timestamp}
	},
	std::{fmt, time::Duration},
	serde::Deserialize
};

/// Lowest wire version this driver can talk to.
pub const MIN_WIRE_VERSION: i32 = 6;
/// Highest wire version this driver can talk to.
pub const MAX_WIRE_VERSION: i32 = 25;

/// Opens connections to servers.
pub trait Connector: Send + Sync + fmt::Debug {
	/// Opens a connection and performs the initial handshake on it.
	fn connect(&self, address: &ServerAddress, request: &HandshakeRequest, timeout: Duration)
		-> Result<(Box<dyn Stream>, HandshakeReply)>;
}

/// An established connection to a server.
pub trait Stream: Send + fmt::Debug {
	/// Runs a `hello` command. If `request.topology_version` is set, the server holds the reply
	/// until its topology changes or `request.max_await_time` elapsed.
	fn handshake(&mut self, request: &HandshakeRequest) -> Result<HandshakeReply>;
	
	/// Sends an encoded command and waits for the reply.
	fn send_command(&mut self, command: &[u8], timeout: Option<Duration>) -> Result<CommandReply>;
}

/// see https://github.com/mongodb/specifications/blob/master/source/mongodb-handshake/handshake.rst
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct HandshakeRequest {
	pub appname:          Option<String>,
	pub load_balanced:    bool,
	/// Set for awaitable `hello` commands of the streaming protocol.
	pub topology_version: Option<TopologyVersion>,
	pub max_await_time:   Option<Duration>
}

impl HandshakeRequest {
	pub fn awaitable(&self, topology_version: TopologyVersion, max_await_time: Duration) -> Self {
		Self {
			topology_version: Some(topology_version),
			max_await_time:   Some(max_await_time),
			..self.clone()
		}
	}
	
	pub fn is_awaitable(&self) -> bool {
		self.topology_version.is_some()
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HandshakeReply {
	pub ok:                              f64,
	#[serde(alias = "ismaster")]
	pub is_writable_primary:             bool,
	pub logical_session_timeout_minutes: Option<i64>,
	pub min_wire_version:                i32,
	pub max_wire_version:                i32,
	pub topology_version:                Option<TopologyVersion>,
	// sharded instances
	pub msg:                             Option<String>,
	// replica sets
	pub set_name:                        Option<String>,
	pub set_version:                     Option<i32>,
	pub secondary:                       Option<bool>,
	pub hosts:                           Option<Vec<ServerAddress>>,
	pub passives:                        Option<Vec<ServerAddress>>,
	pub arbiters:                        Option<Vec<ServerAddress>>,
	pub primary:                         Option<ServerAddress>,
	pub arbiter_only:                    Option<bool>,
	pub hidden:                          Option<bool>,
	pub tags:                            Option<TagSet>,
	pub me:                              Option<ServerAddress>,
	pub election_id:                     Option<ObjectId>,
	pub last_write:                      Option<LastWrite>,
	pub isreplicaset:                    Option<bool>,
	// load balanced
	pub service_id:                      Option<ObjectId>
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastWrite {
	/// Milliseconds since the unix epoch.
	pub last_write_date: i64
}

/// The parts of a command reply the topology layer inspects.
#[derive(Debug, Clone, Default)]
pub struct CommandReply {
	/// The encoded reply, passed through to the caller.
	pub body:           Vec<u8>,
	pub operation_time: Option<Timestamp>,
	pub cluster_time:   Option<ClusterTime>,
	pub error:          Option<CommandError>
}

impl CommandReply {
	pub fn ok(body: Vec<u8>) -> Self {
		Self { body, ..Self::default() }
	}
}

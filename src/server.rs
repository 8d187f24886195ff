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

use {
	crate::{
		common::{DEFAULT_MONGO_PORT, Error, Result, TagSet},
		wire::HandshakeReply
	},
	std::{
		cmp::Ordering,
		fmt,
		str::FromStr,
		time::{Duration, SystemTime, UNIX_EPOCH}
	},
	serde::{Deserialize, Deserializer}
};

/// Weight of a new round trip time sample in the moving average.
pub const RTT_ALPHA: f64 = 0.2;

/// A `host:port` pair. Host names are compared case insensitively.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ServerAddress {
	pub host: String,
	pub port: u16
}

impl ServerAddress {
	pub fn new(host: &str, port: u16) -> Self {
		Self { host: host.to_ascii_lowercase(), port }
	}
}

impl FromStr for ServerAddress {
	type Err = Error;
	
	fn from_str(s: &str) -> Result<Self> {
		let invalid = || Error::InvalidArgument(format!("invalid server address `{}`", s));
		
		let (host, port) = if s.starts_with('[') {
			// ipv6 literal
			let end = s.find(']').ok_or_else(invalid)?;
			(&s[1..end], match &s[end + 1..] {
				"" => None,
				rest if rest.starts_with(':') => Some(&rest[1..]),
				_ => return Err(invalid())
			})
		} else {
			match s.rfind(':') {
				Some(i) => (&s[..i], Some(&s[i + 1..])),
				None => (s, None)
			}
		};
		
		if host.is_empty() {
			return Err(invalid());
		}
		
		let port = match port {
			None => DEFAULT_MONGO_PORT,
			Some(port) => match port.parse::<u16>() {
				Ok(port) if port != 0 => port,
				_ => return Err(invalid())
			}
		};
		
		Ok(Self::new(host, port))
	}
}

impl fmt::Display for ServerAddress {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		if self.host.contains(':') {
			write!(f, "[{}]:{}", self.host, self.port)
		} else {
			write!(f, "{}:{}", self.host, self.port)
		}
	}
}

impl<'de> Deserialize<'de> for ServerAddress {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

/// A 12 byte object id, as used for election ids and process ids.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct ObjectId(pub [u8; 12]);

impl FromStr for ObjectId {
	type Err = Error;
	
	fn from_str(s: &str) -> Result<Self> {
		let mut bytes = [0u8; 12];
		hex::decode_to_slice(s, &mut bytes)
			.map_err(|e| Error::InvalidArgument(format!("invalid object id `{}`: {}", s, e)))?;
		Ok(Self(bytes))
	}
}

impl fmt::Display for ObjectId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(&hex::encode(self.0))
	}
}

impl fmt::Debug for ObjectId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "ObjectId({})", self)
	}
}

impl<'de> Deserialize<'de> for ObjectId {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
		#[derive(Deserialize)]
		#[serde(untagged)]
		enum Repr {
			Hex(String),
			Extended {
				#[serde(rename = "$oid")]
				oid: String
			}
		}
		
		match Repr::deserialize(deserializer)? {
			Repr::Hex(s) | Repr::Extended { oid: s } => s.parse().map_err(serde::de::Error::custom)
		}
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#topologyversion
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyVersion {
	pub process_id: ObjectId,
	pub counter:    i64
}

impl TopologyVersion {
	/// Compares two versions; versions from different processes are incomparable.
	pub fn compare(&self, other: &Self) -> Option<Ordering> {
		if self.process_id == other.process_id {
			Some(self.counter.cmp(&other.counter))
		} else {
			None
		}
	}
}

/// Whether `incoming` is older than `current`, in which case the update carrying it must be ignored.
pub fn is_stale_topology_version(current: Option<&TopologyVersion>, incoming: Option<&TopologyVersion>) -> bool {
	match (current, incoming) {
		(Some(current), Some(incoming)) => incoming.compare(current) == Some(Ordering::Less),
		_ => false
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ServerType {
	Standalone,
	Mongos,
	RSPrimary,
	RSSecondary,
	RSArbiter,
	RSOther,
	RSGhost,
	LoadBalancer,
	Unknown
}

impl Default for ServerType {
	fn default() -> Self {
		Self::Unknown
	}
}

impl ServerType {
	pub fn is_replica_set_member(self) -> bool {
		matches!(self, Self::RSPrimary | Self::RSSecondary | Self::RSArbiter | Self::RSOther | Self::RSGhost)
	}
	
	pub fn is_data_bearing(self) -> bool {
		matches!(self, Self::Standalone | Self::Mongos | Self::RSPrimary | Self::RSSecondary | Self::LoadBalancer)
	}
}

impl fmt::Display for ServerType {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#serverdescription
#[derive(Debug, Clone, Default)]
pub struct ServerDescription {
	pub address:                         ServerAddress,
	pub r#type:                          ServerType,
	/// Moving average, `None` until the first successful check.
	pub rtt:                             Option<Duration>,
	pub last_update_time:                Option<SystemTime>,
	// fields from handshake
	pub last_write_date:                 Option<SystemTime>,
	pub min_wire_version:                i32,
	pub max_wire_version:                i32,
	pub me:                              Option<ServerAddress>,
	pub hosts:                           Vec<ServerAddress>,
	pub passives:                        Vec<ServerAddress>,
	pub arbiters:                        Vec<ServerAddress>,
	pub tags:                            TagSet,
	pub set_name:                        Option<String>,
	pub set_version:                     Option<i32>,
	pub election_id:                     Option<ObjectId>,
	pub primary:                         Option<ServerAddress>,
	pub logical_session_timeout_minutes: Option<i64>,
	pub topology_version:                Option<TopologyVersion>,
	pub error:                           Option<Error>
}

impl Default for ServerAddress {
	fn default() -> Self {
		Self::new("localhost", DEFAULT_MONGO_PORT)
	}
}

impl ServerDescription {
	/// The description of a server that has not been checked yet.
	pub fn new(address: ServerAddress) -> Self {
		Self { address, ..Self::default() }
	}
	
	/// The description of a server whose last check failed.
	pub fn with_error(address: ServerAddress, error: Error, now: SystemTime) -> Self {
		Self {
			address,
			topology_version: error.topology_version(),
			last_update_time: Some(now),
			error:            Some(error),
			..Self::default()
		}
	}
	
	/// Builds a description from a successful handshake.
	/// Fails if the reply is malformed; the caller records the error on an `Unknown` description.
	pub fn from_reply(address: ServerAddress, reply: HandshakeReply, rtt: Option<Duration>, now: SystemTime) -> Result<Self> {
		if reply.ok != 1f64 {
			return Err(Error::InvalidReply(format!("handshake with {} returned ok: {}", address, reply.ok)));
		}
		
		if reply.min_wire_version > reply.max_wire_version {
			return Err(Error::InvalidReply(format!(
				"minWireVersion {} exceeds maxWireVersion {}", reply.min_wire_version, reply.max_wire_version)));
		}
		
		if reply.set_name.as_deref() == Some("") {
			return Err(Error::InvalidReply("empty replica set name".to_string()));
		}
		
		let r#type = match &reply {
			HandshakeReply { msg: Some(msg), .. } if msg == "isdbgrid" => ServerType::Mongos,
			HandshakeReply { isreplicaset: Some(true),                      .. } => ServerType::RSGhost,
			HandshakeReply { set_name: Some(_), is_writable_primary: true, .. } => ServerType::RSPrimary,
			HandshakeReply { set_name: Some(_), hidden: Some(true),         .. } => ServerType::RSOther,
			HandshakeReply { set_name: Some(_), secondary: Some(true),      .. } => ServerType::RSSecondary,
			HandshakeReply { set_name: Some(_), arbiter_only: Some(true),   .. } => ServerType::RSArbiter,
			HandshakeReply { set_name: Some(_),                             .. } => ServerType::RSOther,
			_                                                                    => ServerType::Standalone
		};
		
		Ok(Self {
			address,
			r#type,
			rtt,
			last_update_time:                Some(now),
			last_write_date:                 reply.last_write.as_ref().map(|v|
				UNIX_EPOCH + Duration::from_millis(v.last_write_date.max(0) as u64)),
			min_wire_version:                reply.min_wire_version,
			max_wire_version:                reply.max_wire_version,
			me:                              reply.me,
			hosts:                           reply.hosts.unwrap_or_default(),
			passives:                        reply.passives.unwrap_or_default(),
			arbiters:                        reply.arbiters.unwrap_or_default(),
			tags:                            reply.tags.unwrap_or_default(),
			set_name:                        reply.set_name,
			set_version:                     reply.set_version,
			election_id:                     reply.election_id,
			primary:                         reply.primary,
			logical_session_timeout_minutes: reply.logical_session_timeout_minutes,
			topology_version:                reply.topology_version,
			error:                           None
		})
	}
	
	pub fn is_available(&self) -> bool {
		self.r#type != ServerType::Unknown
	}
	
	/// All members this server reports for its replica set.
	pub fn members(&self) -> impl Iterator<Item = &ServerAddress> {
		self.hosts.iter().chain(&self.passives).chain(&self.arbiters)
	}
	
	/// Whether the server has every tag of `tags`.
	pub fn matches_tag_set(&self, tags: &TagSet) -> bool {
		tags.iter().all(|(k, v)| self.tags.get(k) == Some(v))
	}
	
	/// Compares the fields relevant for discovery, ignoring round trip and update times.
	pub fn sdam_equals(&self, other: &Self) -> bool {
		self.address == other.address
			&& self.r#type == other.r#type
			&& self.min_wire_version == other.min_wire_version
			&& self.max_wire_version == other.max_wire_version
			&& self.me == other.me
			&& self.hosts == other.hosts
			&& self.passives == other.passives
			&& self.arbiters == other.arbiters
			&& self.tags == other.tags
			&& self.set_name == other.set_name
			&& self.set_version == other.set_version
			&& self.election_id == other.election_id
			&& self.primary == other.primary
			&& self.logical_session_timeout_minutes == other.logical_session_timeout_minutes
			&& self.topology_version == other.topology_version
			&& self.error.as_ref().map(ToString::to_string) == other.error.as_ref().map(ToString::to_string)
	}
}

impl fmt::Display for ServerDescription {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{{ address: {}, type: {}", self.address, self.r#type)?;
		if let Some(rtt) = self.rtt {
			write!(f, ", rtt: {}ms", rtt.as_millis())?;
		}
		if let Some(set_name) = &self.set_name {
			write!(f, ", setName: {}", set_name)?;
		}
		if !self.tags.is_empty() {
			let mut tags = self.tags.iter().collect::<Vec<_>>();
			tags.sort();
			write!(f, ", tags: {:?}", tags)?;
		}
		if let Some(error) = &self.error {
			write!(f, ", error: {}", error)?;
		}
		write!(f, " }}")
	}
}

/// Exponentially weighted moving average of round trip times.
#[derive(Debug, Copy, Clone, Default)]
pub struct RoundTripTime {
	average: Option<Duration>
}

impl RoundTripTime {
	pub fn add_sample(&mut self, sample: Duration) -> Duration {
		let average = match self.average {
			None => sample,
			Some(old) => Duration::from_secs_f64(RTT_ALPHA * sample.as_secs_f64() + (1.0 - RTT_ALPHA) * old.as_secs_f64())
		};
		self.average = Some(average);
		average
	}
	
	pub fn average(&self) -> Option<Duration> {
		self.average
	}
	
	pub fn reset(&mut self) {
		self.average = None;
	}
}

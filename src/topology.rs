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
		common::{ClusterOptions, Result, DEFAULT_HEARTBEAT_FREQUENCY},
		server::{ServerAddress, ServerDescription, ServerType, ObjectId, is_stale_topology_version},
		wire::{MIN_WIRE_VERSION, MAX_WIRE_VERSION}
	},
	std::{
		collections::HashMap,
		fmt,
		sync::{Arc, Mutex, Condvar, mpsc, atomic::{AtomicBool, Ordering}},
		time::Duration
	},
	arc_swap::ArcSwap,
	log::{debug, info}
};

/// Servers with at least this max wire version order election tuples by election id first.
const ELECTION_ID_PRIORITY_WIRE_VERSION: i32 = 17;

/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#topologydescription
#[derive(Debug, Clone)]
pub struct TopologyDescription {
	pub r#type:                          TopologyType,
	pub servers:                         HashMap<ServerAddress, ServerDescription>,
	pub set_name:                        Option<String>,
	pub max_set_version:                 Option<i32>,
	pub max_election_id:                 Option<ObjectId>,
	pub compatibility_error:             Option<CompatibilityError>,
	pub logical_session_timeout_minutes: Option<i64>,
	pub heartbeat_frequency:             Duration
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TopologyType {
	Single,
	ReplicaSetNoPrimary,
	ReplicaSetWithPrimary,
	Sharded,
	LoadBalanced,
	Unknown
}

impl Default for TopologyType {
	fn default() -> Self {
		Self::Unknown
	}
}

impl fmt::Display for TopologyType {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CompatibilityError {
	#[error("server at {address} requires wire version {min_wire_version}, but this driver only supports up to {}", MAX_WIRE_VERSION)]
	WireVersionTooNew { address: ServerAddress, min_wire_version: i32 },
	#[error("server at {address} reports wire version {max_wire_version}, but this driver requires at least {}", MIN_WIRE_VERSION)]
	WireVersionTooOld { address: ServerAddress, max_wire_version: i32 }
}

impl Default for TopologyDescription {
	fn default() -> Self {
		Self {
			r#type:                          TopologyType::Unknown,
			servers:                         HashMap::new(),
			set_name:                        None,
			max_set_version:                 None,
			max_election_id:                 None,
			compatibility_error:             None,
			logical_session_timeout_minutes: None,
			heartbeat_frequency:             DEFAULT_HEARTBEAT_FREQUENCY
		}
	}
}

impl TopologyDescription {
	
	/// The description of a topology before any server has been checked.
	pub fn new(options: &ClusterOptions) -> Self {
		let r#type = options.initial_topology_type();
		Self {
			r#type,
			servers: options.hosts.iter()
				.map(|address| (address.clone(), ServerDescription {
					// load balancers are never monitored
					r#type: if r#type == TopologyType::LoadBalanced { ServerType::LoadBalancer } else { ServerType::Unknown },
					..ServerDescription::new(address.clone())
				}))
				.collect(),
			set_name:            options.replica_set.clone(),
			heartbeat_frequency: options.server_selection_config.heartbeat_frequency,
			..Self::default()
		}
	}
	
	pub fn server(&self, address: &ServerAddress) -> Option<&ServerDescription> {
		self.servers.get(address)
	}
	
	pub fn primary(&self) -> Option<&ServerDescription> {
		self.servers.values().find(|server| server.r#type == ServerType::RSPrimary)
	}
	
	pub fn servers_of_type(&self, r#type: ServerType) -> impl Iterator<Item = &ServerDescription> {
		self.servers.values().filter(move |server| server.r#type == r#type)
	}
	
	/// Folds a new server description into this topology according to
	/// https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst
	///
	/// Returns `None` if the update must be ignored: the server is not part of the topology, the
	/// description carries an older topology version than the recorded one, or it comes from a
	/// primary with an older election tuple than the newest one seen.
	pub fn apply(&self, description: ServerDescription) -> Option<Self> {
		let address = description.address.clone();
		let current = self.servers.get(&address)?;
		
		if is_stale_topology_version(current.topology_version.as_ref(), description.topology_version.as_ref()) {
			debug!("ignoring stale description of {} (topology version {:?} < {:?})",
				address, description.topology_version, current.topology_version);
			return None;
		}
		
		let mut new = self.clone();
		let r#type = description.r#type;
		
		match self.r#type {
			TopologyType::LoadBalanced => return None,
			TopologyType::Single => {
				let description = match &self.set_name {
					Some(set_name) if r#type != ServerType::Unknown && description.set_name.as_ref() != Some(set_name) =>
						ServerDescription::with_error(address.clone(), crate::common::Error::InvalidReply(format!(
							"expected replica set `{}`, but {} reported {:?}", set_name, address, description.set_name)),
							description.last_update_time.unwrap_or_else(std::time::SystemTime::now)),
					_ => description
				};
				new.servers.insert(address, description);
			}
			_ => {
				new.servers.insert(address.clone(), description.clone());
				
				match (self.r#type, r#type) {
					// no-op
					(TopologyType::Unknown, ServerType::Unknown)
					| (TopologyType::Unknown, ServerType::RSGhost)
					| (TopologyType::Unknown, ServerType::LoadBalancer)
					| (TopologyType::Sharded, ServerType::Unknown)
					| (TopologyType::Sharded, ServerType::Mongos)
					| (TopologyType::ReplicaSetNoPrimary, ServerType::Unknown)
					| (TopologyType::ReplicaSetNoPrimary, ServerType::RSGhost) => (),
					// remove
					(TopologyType::Sharded, _)
					| (TopologyType::ReplicaSetNoPrimary, ServerType::Standalone)
					| (TopologyType::ReplicaSetNoPrimary, ServerType::Mongos)
					| (TopologyType::ReplicaSetNoPrimary, ServerType::LoadBalancer) => {
						new.remove(&address, r#type);
					}
					(TopologyType::ReplicaSetWithPrimary, ServerType::Standalone)
					| (TopologyType::ReplicaSetWithPrimary, ServerType::Mongos)
					| (TopologyType::ReplicaSetWithPrimary, ServerType::LoadBalancer) => {
						new.remove(&address, r#type);
						new.check_if_has_primary();
					}
					// update topology type
					(TopologyType::Unknown, ServerType::Standalone) => if self.servers.len() == 1 {
						new.r#type = TopologyType::Single;
					} else {
						new.remove(&address, r#type);
					},
					(TopologyType::Unknown, ServerType::Mongos) => new.r#type = TopologyType::Sharded,
					
					// replica set primary
					(TopologyType::Unknown, ServerType::RSPrimary)
					| (TopologyType::ReplicaSetNoPrimary, ServerType::RSPrimary)
					| (TopologyType::ReplicaSetWithPrimary, ServerType::RSPrimary) => if !new.update_rs_from_primary(&description) {
						return None;
					},
					
					// replica set without primary
					(TopologyType::Unknown, ServerType::RSSecondary)
					| (TopologyType::Unknown, ServerType::RSArbiter)
					| (TopologyType::Unknown, ServerType::RSOther)
					| (TopologyType::ReplicaSetNoPrimary, ServerType::RSSecondary)
					| (TopologyType::ReplicaSetNoPrimary, ServerType::RSArbiter)
					| (TopologyType::ReplicaSetNoPrimary, ServerType::RSOther) => {
						new.r#type = TopologyType::ReplicaSetNoPrimary;
						new.update_rs_without_primary(&description);
					}
					
					// replica set with primary
					(TopologyType::ReplicaSetWithPrimary, ServerType::RSSecondary)
					| (TopologyType::ReplicaSetWithPrimary, ServerType::RSArbiter)
					| (TopologyType::ReplicaSetWithPrimary, ServerType::RSOther) =>
						new.update_rs_with_primary_from_member(&description),
					
					(TopologyType::ReplicaSetWithPrimary, ServerType::Unknown)
					| (TopologyType::ReplicaSetWithPrimary, ServerType::RSGhost) => new.check_if_has_primary(),
					
					(TopologyType::Single, _) | (TopologyType::LoadBalanced, _) => unreachable!()
				}
			}
		}
		
		new.update_derived_fields();
		debug_assert!(new.servers_of_type(ServerType::RSPrimary).count() <= 1);
		
		if new.r#type != self.r#type {
			info!("topology type changed from {} to {}", self.r#type, new.r#type);
		}
		
		Some(new)
	}
	
	/// Marks a server as unknown, keeping it as a monitoring target. Used for application errors.
	pub fn mark_unknown(&self, description: ServerDescription) -> Option<Self> {
		debug_assert_eq!(description.r#type, ServerType::Unknown);
		self.apply(description)
	}
	
	fn remove(&mut self, address: &ServerAddress, r#type: ServerType) {
		debug!("removing {} ({}) from {} topology", address, r#type, self.r#type);
		self.servers.remove(address);
	}
	
	/// Sets the replica set topology type depending on whether a primary is known.
	fn check_if_has_primary(&mut self) {
		self.r#type = if self.primary().is_some() {
			TopologyType::ReplicaSetWithPrimary
		} else {
			TopologyType::ReplicaSetNoPrimary
		};
	}
	
	/// Checks the replica set name, initializing it if unknown. Removes the server on mismatch.
	fn check_set_name(&mut self, description: &ServerDescription) -> bool {
		if self.set_name.is_none() {
			self.set_name = description.set_name.clone();
			true
		} else if self.set_name != description.set_name {
			debug!("{} reports replica set {:?}, expected {:?}", description.address, description.set_name, self.set_name);
			self.remove(&description.address, description.r#type);
			false
		} else {
			true
		}
	}
	
	/// Returns `false` if the primary is stale and the whole update must be ignored.
	fn update_rs_from_primary(&mut self, description: &ServerDescription) -> bool {
		if !self.check_set_name(description) {
			self.check_if_has_primary();
			return true;
		}
		
		// update setVersion and electionId
		
		if description.max_wire_version >= ELECTION_ID_PRIORITY_WIRE_VERSION {
			if (self.max_election_id, self.max_set_version) > (description.election_id, description.set_version) {
				debug!("ignoring stale primary {} with (electionId, setVersion) ({:?}, {:?}) < ({:?}, {:?})",
					description.address, description.election_id, description.set_version,
					self.max_election_id, self.max_set_version);
				return false;
			}
			
			self.max_election_id = description.election_id;
			self.max_set_version = description.set_version;
		} else {
			if let (Some(set_version), Some(election_id)) = (description.set_version, description.election_id) {
				if let (Some(max_set_version), Some(max_election_id)) = (self.max_set_version, self.max_election_id) {
					if max_set_version > set_version || (max_set_version == set_version && max_election_id > election_id) {
						debug!("ignoring stale primary {} with (setVersion, electionId) ({}, {}) < ({}, {})",
							description.address, set_version, election_id, max_set_version, max_election_id);
						return false;
					}
				}
				self.max_election_id = Some(election_id);
			}
			
			if let Some(set_version) = description.set_version {
				if self.max_set_version.map_or(true, |max| set_version > max) {
					self.max_set_version = Some(set_version);
				}
			}
		}
		
		// invalidate old primary
		
		let old_primaries = self.servers.values()
			.filter(|server| server.r#type == ServerType::RSPrimary && server.address != description.address)
			.map(|server| server.address.clone())
			.collect::<Vec<_>>();
		
		for address in old_primaries {
			debug!("{} is no longer primary, {} is", address, description.address);
			self.servers.insert(address.clone(), ServerDescription::new(address));
		}
		
		// update servers
		
		self.servers.retain(|address, _| description.members().any(|member| member == address));
		self.add_missing_members(description);
		self.check_if_has_primary();
		true
	}
	
	fn update_rs_without_primary(&mut self, description: &ServerDescription) {
		if !self.check_set_name(description) {
			return;
		}
		
		self.add_missing_members(description);
		
		if description.me.as_ref().map_or(false, |me| me != &description.address) {
			self.remove(&description.address, description.r#type);
		}
	}
	
	fn update_rs_with_primary_from_member(&mut self, description: &ServerDescription) {
		if self.set_name != description.set_name
			|| description.me.as_ref().map_or(false, |me| me != &description.address) {
			self.remove(&description.address, description.r#type);
		}
		
		self.check_if_has_primary();
	}
	
	fn add_missing_members(&mut self, description: &ServerDescription) {
		for address in description.members() {
			if !self.servers.contains_key(address) {
				self.servers.insert(address.clone(), ServerDescription::new(address.clone()));
			}
		}
	}
	
	fn update_derived_fields(&mut self) {
		let mut servers = self.servers.values()
			.filter(|server| server.is_available())
			.collect::<Vec<_>>();
		servers.sort_by(|a, b| a.address.cmp(&b.address));
		
		self.compatibility_error = servers.iter().find_map(|server| if server.min_wire_version > MAX_WIRE_VERSION {
			Some(CompatibilityError::WireVersionTooNew {
				address:          server.address.clone(),
				min_wire_version: server.min_wire_version
			})
		} else if server.max_wire_version < MIN_WIRE_VERSION && server.r#type != ServerType::LoadBalancer {
			Some(CompatibilityError::WireVersionTooOld {
				address:          server.address.clone(),
				max_wire_version: server.max_wire_version
			})
		} else {
			None
		});
		
		let data_bearing = servers.iter()
			.filter(|server| server.r#type.is_data_bearing() && server.r#type != ServerType::LoadBalancer)
			.collect::<Vec<_>>();
		
		self.logical_session_timeout_minutes = if data_bearing.is_empty() {
			None
		} else {
			data_bearing.iter()
				.map(|server| server.logical_session_timeout_minutes)
				.collect::<Option<Vec<_>>>()
				.and_then(|timeouts| timeouts.into_iter().min())
		};
	}
	
	/// Whether the topology has at least one server that could serve a session.
	pub fn supports_sessions(&self) -> bool {
		self.r#type == TopologyType::LoadBalanced || self.logical_session_timeout_minutes.is_some()
	}
}

impl fmt::Display for TopologyDescription {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{{ type: {}", self.r#type)?;
		if let Some(set_name) = &self.set_name {
			write!(f, ", setName: {}", set_name)?;
		}
		if let Some(error) = &self.compatibility_error {
			write!(f, ", compatibilityError: {}", error)?;
		}
		let mut servers = self.servers.values().collect::<Vec<_>>();
		servers.sort_by(|a, b| a.address.cmp(&b.address));
		write!(f, ", servers: [")?;
		for (i, server) in servers.into_iter().enumerate() {
			write!(f, "{}{}", if i == 0 { " " } else { ", " }, server)?;
		}
		write!(f, " ] }}")
	}
}

/// The atomically published current topology description.
///
/// Updates are serialized; readers take a snapshot without locking and never wait for a writer.
#[derive(Debug)]
pub struct Topology {
	description: ArcSwap<TopologyDescription>,
	update_lock: Mutex<()>,
	epoch:       Mutex<u64>,
	changed:     Condvar,
	subscribers: Mutex<Vec<mpsc::Sender<Arc<TopologyDescription>>>>,
	closed:      AtomicBool
}

/// A stream of published topology descriptions, starting with the one current at subscription.
#[derive(Debug)]
pub struct TopologySubscription(mpsc::Receiver<Arc<TopologyDescription>>);

impl TopologySubscription {
	pub fn recv(&self) -> Option<Arc<TopologyDescription>> {
		self.0.recv().ok()
	}
	
	pub fn recv_timeout(&self, timeout: Duration) -> Option<Arc<TopologyDescription>> {
		self.0.recv_timeout(timeout).ok()
	}
	
	pub fn try_recv(&self) -> Option<Arc<TopologyDescription>> {
		self.0.try_recv().ok()
	}
}

impl Iterator for TopologySubscription {
	type Item = Arc<TopologyDescription>;
	
	fn next(&mut self) -> Option<Self::Item> {
		self.recv()
	}
}

impl Topology {
	pub fn new(description: TopologyDescription) -> Self {
		Self {
			description: ArcSwap::from_pointee(description),
			update_lock: Mutex::new(()),
			epoch:       Mutex::new(0),
			changed:     Condvar::new(),
			subscribers: Mutex::new(Vec::new()),
			closed:      AtomicBool::new(false)
		}
	}
	
	/// The latest published description.
	pub fn description(&self) -> Arc<TopologyDescription> {
		self.description.load_full()
	}
	
	/// A counter incremented after every publish. Read it before taking a snapshot to wait for
	/// the next change with [`Topology::wait_for_change`] without missing one.
	pub fn epoch(&self) -> Result<u64> {
		Ok(*self.epoch.lock()?)
	}
	
	/// Runs `f` on the current description and publishes its result, unless it returns `None`.
	/// Returns the previous and the new description if something was published.
	pub fn update(
		&self,
		f: impl FnOnce(&TopologyDescription) -> Option<TopologyDescription>
	) -> Result<Option<(Arc<TopologyDescription>, Arc<TopologyDescription>)>> {
		let _guard = self.update_lock.lock()?;
		if self.closed.load(Ordering::Acquire) { return Ok(None); }
		
		let previous = self.description.load_full();
		let new = match f(&previous) {
			Some(new) => Arc::new(new),
			None => return Ok(None)
		};
		
		self.description.store(new.clone());
		self.publish(&new)?;
		Ok(Some((previous, new)))
	}
	
	fn publish(&self, description: &Arc<TopologyDescription>) -> Result<()> {
		*self.epoch.lock()? += 1;
		self.changed.notify_all();
		self.subscribers.lock()?.retain(|subscriber| subscriber.send(description.clone()).is_ok());
		Ok(())
	}
	
	/// Blocks until the epoch differs from `seen`, the topology is closed or `timeout` elapsed.
	/// Returns the current epoch.
	pub fn wait_for_change(&self, seen: u64, timeout: Duration) -> Result<u64> {
		let epoch = self.epoch.lock()?;
		if *epoch != seen || self.closed.load(Ordering::Acquire) {
			return Ok(*epoch);
		}
		let (epoch, _) = self.changed.wait_timeout_while(epoch, timeout,
			|epoch| *epoch == seen && !self.closed.load(Ordering::Acquire))?;
		Ok(*epoch)
	}
	
	pub fn subscribe(&self) -> Result<TopologySubscription> {
		let _guard = self.update_lock.lock()?;
		let (tx, rx) = mpsc::channel();
		tx.send(self.description.load_full()).unwrap_or(());
		if !self.closed.load(Ordering::Acquire) {
			self.subscribers.lock()?.push(tx);
		}
		Ok(TopologySubscription(rx))
	}
	
	/// Stops accepting updates, wakes up all waiters and ends all subscriptions.
	pub fn close(&self) -> Result<()> {
		let _guard = self.update_lock.lock()?;
		self.closed.store(true, Ordering::Release);
		*self.epoch.lock()? += 1;
		self.changed.notify_all();
		self.subscribers.lock()?.clear();
		Ok(())
	}
	
	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}
}

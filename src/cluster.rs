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
		common::{ClusterId, ClusterOptions, Error, ReadPreference, ReadPreferenceMode, Result, ServerId},
		apm::{Event, EventHandler},
		clock::{Clock, OperationContext, SystemClock, wait_slice},
		monitor::Monitor,
		pool::{ConnectionPool, PooledConnection},
		select::{self, SelectionCriteria, ServerSelectionError},
		server::{ServerAddress, ServerDescription, ServerType},
		session::{ClientSession, ServerSessionPool, SessionOptions},
		topology::{Topology, TopologyDescription, TopologySubscription, TopologyType},
		wire::Connector
	},
	std::{
		cmp::Ordering,
		collections::{HashMap, hash_map::DefaultHasher},
		hash::{Hash, Hasher},
		sync::{Arc, Mutex, RwLock, mpsc},
	},
	log::{debug, info, warn}
};

/// A server chosen by server selection.
#[derive(Debug, Clone)]
pub struct SelectedServer {
	pub id:          ServerId,
	/// The description the server was selected by.
	pub description: ServerDescription,
	pub pool:        ConnectionPool
}

#[derive(Debug)]
struct Server {
	id:      ServerId,
	pool:    ConnectionPool,
	monitor: Option<Monitor>
}

/// A monitored deployment. Cheap to clone; all clones share the same topology.
#[derive(Debug, Clone)]
pub struct Cluster(Arc<ClusterInner>);

#[derive(Debug)]
pub struct ClusterInner {
	pub id:      ClusterId,
	pub options: ClusterOptions,
	topology:    Topology,
	servers:     Mutex<HashMap<ServerAddress, Server>>,
	connector:   Arc<dyn Connector>,
	clock:       Arc<dyn Clock>,
	events:      EventHandler,
	sessions:    Arc<ServerSessionPool>,
	updates:     Mutex<mpsc::Sender<ServerDescription>>
}

impl std::ops::Deref for Cluster {
	type Target = ClusterInner;
	
	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl Cluster {
	pub fn new(options: ClusterOptions, connector: Arc<dyn Connector>) -> Result<Self> {
		Self::with_parts(options, connector, Arc::new(SystemClock), EventHandler::default())
	}
	
	/// Creates a cluster and starts monitoring its seed list. Listeners of `events` observe the
	/// opening events as well.
	pub fn with_parts(
		options:   ClusterOptions,
		connector: Arc<dyn Connector>,
		clock:     Arc<dyn Clock>,
		events:    EventHandler
	) -> Result<Self> {
		options.validate()?;
		
		let (tx, rx) = mpsc::channel();
		let self_ = Self(Arc::new(ClusterInner {
			id:       ClusterId::next(),
			topology: Topology::new(TopologyDescription::new(&options)),
			servers:  Mutex::new(HashMap::new()),
			sessions: Arc::new(ServerSessionPool::new(clock.clone())),
			updates:  Mutex::new(tx),
			options,
			connector,
			clock,
			events
		}));
		
		self_.events.dispatch(Event::TopologyOpening { cluster_id: self_.id });
		
		let weak = Arc::downgrade(&self_.0);
		std::thread::Builder::new()
			.name(format!("topology-updater-{}", self_.id))
			.spawn(move || for description in rx {
				let inner = match weak.upgrade() {
					Some(inner) => inner,
					None => break
				};
				if let Err(e) = inner.fold(description) {
					warn!("failed to update topology of {}: {}", inner.id, e);
				}
			})?;
		
		self_.sync_servers()?;
		info!("opened {} with seeds {:?}", self_.id, self_.options.hosts);
		Ok(self_)
	}
	
	/// The latest published topology description.
	pub fn description(&self) -> Arc<TopologyDescription> {
		self.topology.description()
	}
	
	/// Every published topology description, starting with the current one.
	pub fn subscribe(&self) -> Result<TopologySubscription> {
		self.topology.subscribe()
	}
	
	pub fn add_event_listener(&self, listener: impl Fn(&Event) + Send + Sync + 'static) {
		self.events.add_listener(listener)
	}
	
	/// Selects a server matching `criteria`, waiting for the topology to change while none does.
	/// Fails once the server selection timeout or the operation deadline passed.
	pub fn select_server(&self, criteria: &SelectionCriteria, ctx: &OperationContext) -> Result<SelectedServer> {
		let start = self.clock.now();
		let deadline = ctx.deadline_within(start, self.options.server_selection_config.server_selection_timeout);
		let mut checks_requested = false;
		
		loop {
			ctx.check()?;
			if self.topology.is_closed() {
				return Err(Error::ClusterClosed);
			}
			
			let epoch = self.topology.epoch()?;
			let description = self.topology.description();
			let selected = select::select_server(&description, criteria,
				self.options.server_selection_config.local_threshold)?;
			if let Some(server) = selected {
				if let Some(server) = self.selected(server)? {
					return Ok(server);
				}
			}
			
			if !checks_requested {
				checks_requested = true;
				self.request_checks()?;
			}
			
			match wait_slice(self.clock.now(), deadline) {
				Some(slice) => { self.topology.wait_for_change(epoch, slice)?; }
				None => return Err(ServerSelectionError::Timeout {
					criteria: criteria.to_string(),
					topology: description.to_string(),
					timeout:  self.clock.elapsed(start)
				}.into())
			}
		}
	}
	
	/// Like [`Cluster::select_server`], but returns the server `session` is pinned to without
	/// selecting, as long as it is still a router or load balancer.
	pub fn select_server_for_session(
		&self,
		criteria: &SelectionCriteria,
		session:  Option<&ClientSession>,
		ctx:      &OperationContext
	) -> Result<SelectedServer> {
		if let Some(pinned) = session.and_then(ClientSession::pinned) {
			let description = self.topology.description();
			if let Some(server) = description.server(&pinned.address) {
				if matches!(server.r#type, ServerType::Mongos | ServerType::LoadBalancer) {
					if let Some(server) = self.selected(server)? {
						return Ok(server);
					}
				}
			}
		}
		
		self.select_server(criteria, ctx)
	}
	
	/// Checks out a connection from a selected server. Connection failures are handled like
	/// errors before the handshake completed.
	pub fn checkout(&self, server: &SelectedServer, ctx: &OperationContext) -> Result<PooledConnection> {
		let generation = server.pool.generation()?;
		server.pool.checkout(ctx).map_err(|e| {
			if let Err(err) = self.handle_application_error(&server.id.address, &e, generation, true) {
				warn!("failed to handle error of {}: {}", server.id.address, err);
			}
			e
		})
	}
	
	/// Updates the topology after an operation on `address` failed with `error`.
	///
	/// `generation` is the pool generation of the connection the error occurred on; errors from
	/// older generations are ignored. Network errors, and timeouts before the handshake completed,
	/// mark the server unknown and clear its pool. State change errors mark it unknown, but only
	/// clear the pool if the server is shutting down or too old to keep connections open.
	pub fn handle_application_error(
		&self,
		address:          &ServerAddress,
		error:            &Error,
		generation:       u32,
		before_handshake: bool
	) -> Result<()> {
		let (pool, monitor_present) = match self.servers.lock()?.get(address) {
			Some(server) => (server.pool.clone(), server.monitor.is_some()),
			None => return Ok(())
		};
		
		if generation < pool.generation()? {
			debug!("ignoring error from stale connection to {}: {}", address, error);
			return Ok(());
		}
		
		if error.is_network_error() || (before_handshake && error.is_network_timeout()) {
			if monitor_present {
				self.mark_unknown(address, error)?;
			}
			pool.clear()?;
			self.request_check(address)?;
		} else if error.is_state_change_error() {
			let description = self.topology.description();
			let current = description.server(address);
			
			if let (Some(current), Some(incoming)) = (current.and_then(|s| s.topology_version), error.topology_version()) {
				if matches!(incoming.compare(&current), Some(Ordering::Less) | Some(Ordering::Equal)) {
					debug!("ignoring stale state change error from {}: {}", address, error);
					return Ok(());
				}
			}
			
			let max_wire_version = current.map_or(0, |s| s.max_wire_version);
			if monitor_present {
				self.mark_unknown(address, error)?;
			}
			if error.is_shutdown_error() || max_wire_version < 8 {
				pool.clear()?;
			}
			self.request_check(address)?;
		}
		
		Ok(())
	}
	
	/// Starts an explicit session. If no data-bearing server is known yet, waits for one to find
	/// out whether the deployment supports sessions.
	pub fn start_session(&self, options: SessionOptions, ctx: &OperationContext) -> Result<ClientSession> {
		let mut description = self.topology.description();
		if !description.supports_sessions()
			&& !description.servers.values().any(|s| s.r#type.is_data_bearing()) {
			self.select_server(&SelectionCriteria::ReadPreference(
				ReadPreference::new(ReadPreferenceMode::PrimaryPreferred)), ctx)?;
			description = self.topology.description();
		}
		
		if !description.supports_sessions() {
			return Err(Error::InvalidArgument("sessions are not supported by this deployment".to_string()));
		}
		ClientSession::new(self.sessions.clone(), options, description.logical_session_timeout_minutes, false)
	}
	
	/// Starts a transaction on `session`. Fails if a connected server does not support
	/// transactions: standalone servers never do, replica set members need wire version 7 and
	/// routers wire version 8.
	pub fn start_transaction(&self, session: &mut ClientSession) -> Result<()> {
		let description = self.topology.description();
		if description.r#type != TopologyType::LoadBalanced {
			for server in description.servers.values().filter(|s| s.r#type.is_data_bearing()) {
				let required = match server.r#type {
					ServerType::Standalone => return Err(Error::Transaction(
						"standalone servers do not support transactions".to_string())),
					ServerType::LoadBalancer => continue,
					ServerType::Mongos => 8,
					_ => 7
				};
				if server.max_wire_version < required {
					return Err(Error::Transaction(format!("{} does not support transactions", server.address)));
				}
			}
		}
		session.start_transaction()
	}
	
	/// Starts a session for a single operation, if the deployment is known to support sessions.
	pub fn start_implicit_session(&self) -> Result<Option<ClientSession>> {
		let description = self.topology.description();
		if !description.supports_sessions() {
			return Ok(None);
		}
		ClientSession::new(self.sessions.clone(), SessionOptions::default(),
			description.logical_session_timeout_minutes, true).map(Some)
	}
	
	pub fn session_pool(&self) -> &Arc<ServerSessionPool> {
		&self.sessions
	}
	
	/// Stops all monitors, closes all pools and fails pending and future server selections.
	pub fn close(&self) -> Result<()> {
		self.0.close()
	}
	
	pub fn is_closed(&self) -> bool {
		self.topology.is_closed()
	}
}

impl ClusterInner {
	/// Folds a description produced by a monitor into the topology.
	fn fold(&self, description: ServerDescription) -> Result<()> {
		if let Some((previous, new)) = self.topology.update(|current| current.apply(description))? {
			self.published(&previous, &new)?;
		}
		Ok(())
	}
	
	fn mark_unknown(&self, address: &ServerAddress, error: &Error) -> Result<()> {
		let description = ServerDescription::with_error(address.clone(), error.clone(), self.clock.system_time());
		if let Some((previous, new)) = self.topology.update(|current| current.mark_unknown(description))? {
			self.published(&previous, &new)?;
		}
		Ok(())
	}
	
	fn published(&self, previous: &TopologyDescription, new: &TopologyDescription) -> Result<()> {
		for (address, server) in &new.servers {
			if let Some(old) = previous.servers.get(address) {
				if !old.sdam_equals(server) {
					self.events.dispatch(Event::ServerDescriptionChanged {
						server_id:            &ServerId { cluster_id: self.id, address: address.clone() },
						previous_description: old,
						new_description:      server
					});
				}
			}
		}
		
		self.events.dispatch(Event::TopologyDescriptionChanged {
			cluster_id:           self.id,
			previous_description: previous,
			new_description:      new
		});
		
		self.sync_servers()?;
		
		// former primaries replaced by a newer one
		for (address, server) in &new.servers {
			if server.r#type == ServerType::Unknown && server.error.is_none()
				&& previous.server(address).map_or(false, |old| old.r#type == ServerType::RSPrimary) {
				self.request_check(address)?;
			}
		}
		Ok(())
	}
	
	/// Opens and closes servers until the registry matches the latest topology description.
	fn sync_servers(&self) -> Result<()> {
		let mut servers = self.servers.lock()?;
		if self.topology.is_closed() {
			return Ok(());
		}
		
		let description = self.topology.description();
		let removed = servers.keys()
			.filter(|address| !description.servers.contains_key(address))
			.cloned()
			.collect::<Vec<_>>();
		for address in removed {
			if let Some(server) = servers.remove(&address) {
				self.close_server(server);
			}
		}
		
		for address in description.servers.keys() {
			if !servers.contains_key(address) {
				let server = self.open_server(address.clone())?;
				servers.insert(address.clone(), server);
			}
		}
		Ok(())
	}
	
	fn open_server(&self, address: ServerAddress) -> Result<Server> {
		let id = ServerId { cluster_id: self.id, address: address.clone() };
		self.events.dispatch(Event::ServerOpening { server_id: &id });
		
		let pool = ConnectionPool::new(id.clone(), &self.options, self.connector.clone(),
			self.clock.clone(), self.events.clone());
		let monitor = if self.topology.description().r#type == TopologyType::LoadBalanced {
			None
		} else {
			Some(Monitor::start(address, &self.options, self.connector.clone(), self.clock.clone(),
				self.events.clone(), Some(pool.clone()), self.updates.lock()?.clone())?)
		};
		
		debug!("opened server {}", id);
		Ok(Server { id, pool, monitor })
	}
	
	fn close_server(&self, server: Server) {
		if let Some(monitor) = &server.monitor {
			monitor.stop();
		}
		if let Err(e) = server.pool.close() {
			warn!("failed to close pool of {}: {}", server.id, e);
		}
		self.events.dispatch(Event::ServerClosed { server_id: &server.id });
		debug!("closed server {}", server.id);
	}
	
	/// The registered server for a selected description, `None` if it is not registered yet.
	fn selected(&self, description: &ServerDescription) -> Result<Option<SelectedServer>> {
		Ok(self.servers.lock()?.get(&description.address).map(|server| SelectedServer {
			id:          server.id.clone(),
			description: description.clone(),
			pool:        server.pool.clone()
		}))
	}
	
	fn request_check(&self, address: &ServerAddress) -> Result<()> {
		if let Some(monitor) = self.servers.lock()?.get(address).and_then(|server| server.monitor.as_ref()) {
			monitor.request_check();
		}
		Ok(())
	}
	
	fn request_checks(&self) -> Result<()> {
		for monitor in self.servers.lock()?.values().filter_map(|server| server.monitor.as_ref()) {
			monitor.request_check();
		}
		Ok(())
	}
	
	fn close(&self) -> Result<()> {
		if self.topology.is_closed() {
			return Ok(());
		}
		
		self.topology.close()?;
		let servers = self.servers.lock()?.drain().map(|(_, server)| server).collect::<Vec<_>>();
		for server in servers {
			self.close_server(server);
		}
		let ended = self.sessions.drain()?;
		debug!("discarded {} server sessions of {}", ended.len(), self.id);
		self.events.dispatch(Event::TopologyClosed { cluster_id: self.id });
		info!("closed {}", self.id);
		Ok(())
	}
}

impl Drop for ClusterInner {
	fn drop(&mut self) {
		if let Err(e) = self.close() {
			warn!("failed to close {}: {}", self.id, e);
		}
	}
}

/// Identifies clusters with equal options.
#[derive(Debug, Clone)]
pub struct ClusterKey {
	hash:    u64,
	options: ClusterOptions
}

impl ClusterKey {
	pub fn new(options: &ClusterOptions) -> Self {
		let mut hasher = DefaultHasher::new();
		options.hosts.hash(&mut hasher);
		options.appname.hash(&mut hasher);
		options.connect_timeout.hash(&mut hasher);
		options.direct_connection.hash(&mut hasher);
		options.load_balanced.hash(&mut hasher);
		options.replica_set.hash(&mut hasher);
		options.retry_reads.hash(&mut hasher);
		options.retry_writes.hash(&mut hasher);
		options.server_selection_config.hash(&mut hasher);
		options.pool_options.hash(&mut hasher);
		options.read_preference.mode.hash(&mut hasher);
		options.read_preference.max_staleness.hash(&mut hasher);
		for tags in &options.read_preference.tag_sets {
			let mut tags = tags.iter().collect::<Vec<_>>();
			tags.sort();
			tags.hash(&mut hasher);
		}
		options.initial_topology_type.hash(&mut hasher);
		
		Self { hash: hasher.finish(), options: options.clone() }
	}
}

impl PartialEq for ClusterKey {
	fn eq(&self, other: &Self) -> bool {
		self.hash == other.hash && self.options == other.options
	}
}

impl Eq for ClusterKey {}

impl Hash for ClusterKey {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.hash.hash(state)
	}
}

#[derive(Debug)]
struct RegistryEntry {
	cluster: Cluster,
	refs:    usize
}

/// Shares clusters between clients with equal options.
#[derive(Debug)]
pub struct ClusterRegistry {
	connector: Arc<dyn Connector>,
	clock:     Arc<dyn Clock>,
	clusters:  Mutex<HashMap<ClusterKey, RegistryEntry>>
}

lazy_static::lazy_static! {
	static ref GLOBAL_REGISTRY: RwLock<Option<Arc<ClusterRegistry>>> = RwLock::new(None);
}

impl ClusterRegistry {
	pub fn new(connector: Arc<dyn Connector>, clock: Arc<dyn Clock>) -> Self {
		Self { connector, clock, clusters: Mutex::new(HashMap::new()) }
	}
	
	/// The process wide registry, created with `connector` on first use.
	pub fn global(connector: Arc<dyn Connector>) -> Result<Arc<Self>> {
		if let Some(registry) = GLOBAL_REGISTRY.read()?.as_ref() {
			return Ok(registry.clone());
		}
		Ok(GLOBAL_REGISTRY.write()?
			.get_or_insert_with(|| Arc::new(Self::new(connector, Arc::new(SystemClock))))
			.clone())
	}
	
	/// Shuts down the process wide registry, if it was created.
	pub fn shutdown_global() -> Result<()> {
		match GLOBAL_REGISTRY.write()?.take() {
			Some(registry) => registry.shutdown(),
			None => Ok(())
		}
	}
	
	/// Returns the cluster for `options`, creating it if there is none, and increments its
	/// reference count.
	pub fn acquire(&self, options: &ClusterOptions) -> Result<Cluster> {
		let key = ClusterKey::new(options);
		let mut clusters = self.clusters.lock()?;
		
		if let Some(entry) = clusters.get_mut(&key) {
			entry.refs += 1;
			return Ok(entry.cluster.clone());
		}
		
		let cluster = Cluster::with_parts(options.clone(), self.connector.clone(), self.clock.clone(),
			EventHandler::default())?;
		clusters.insert(key, RegistryEntry { cluster: cluster.clone(), refs: 1 });
		Ok(cluster)
	}
	
	/// Decrements the reference count of a cluster, closing it when it drops to zero.
	/// Returns whether the cluster was closed.
	pub fn release(&self, cluster: &Cluster) -> Result<bool> {
		let key = ClusterKey::new(&cluster.options);
		let mut clusters = self.clusters.lock()?;
		
		let entry = match clusters.get_mut(&key) {
			Some(entry) if entry.cluster.id == cluster.id => entry,
			_ => return Ok(false)
		};
		
		entry.refs -= 1;
		if entry.refs > 0 {
			return Ok(false);
		}
		
		if let Some(entry) = clusters.remove(&key) {
			entry.cluster.close()?;
		}
		Ok(true)
	}
	
	pub fn len(&self) -> Result<usize> {
		Ok(self.clusters.lock()?.len())
	}
	
	pub fn is_empty(&self) -> Result<bool> {
		Ok(self.len()? == 0)
	}
	
	/// Closes all clusters regardless of their reference counts.
	pub fn shutdown(&self) -> Result<()> {
		let clusters = self.clusters.lock()?.drain().map(|(_, entry)| entry.cluster).collect::<Vec<_>>();
		info!("shutting down {} clusters", clusters.len());
		for cluster in clusters {
			cluster.close()?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::mock::{self, MockConnector},
		std::{str::FromStr, time::{Duration, Instant}}
	};
	
	const PRIMARY: &str = r#"{"ok": 1, "setName": "rs", "isWritablePrimary": true, "maxWireVersion": 21,
		"hosts": ["a:27017", "b:27017", "c:27017"], "me": "a:27017", "setVersion": 1,
		"electionId": "7fffffff0000000000000001", "logicalSessionTimeoutMinutes": 30}"#;
	const SECONDARY: &str = r#"{"ok": 1, "setName": "rs", "secondary": true, "maxWireVersion": 21,
		"hosts": ["a:27017", "b:27017", "c:27017"], "me": "b:27017", "logicalSessionTimeoutMinutes": 30}"#;
	
	fn cluster(uri: &str, connector: &MockConnector) -> Cluster {
		Cluster::new(ClusterOptions::from_str(uri).unwrap(), Arc::new(connector.clone())).unwrap()
	}
	
	fn standalone() -> (Cluster, MockConnector) {
		let connector = MockConnector::new();
		connector.set_reply("a:27017", mock::STANDALONE);
		(cluster("mongodb://a", &connector), connector)
	}
	
	fn ctx(ms: u64) -> OperationContext {
		OperationContext::with_deadline(Instant::now() + Duration::from_millis(ms))
	}
	
	fn wait_for(cluster: &Cluster, mut f: impl FnMut(&TopologyDescription) -> bool) -> Arc<TopologyDescription> {
		let subscription = cluster.subscribe().unwrap();
		loop {
			let description = subscription.recv_timeout(Duration::from_secs(5)).expect("topology did not change");
			if f(&description) {
				return description;
			}
		}
	}
	
	/// Polls `f` until it holds; the registry and events follow a publish asynchronously.
	fn eventually(mut f: impl FnMut() -> bool) {
		let deadline = Instant::now() + Duration::from_secs(5);
		while !f() {
			assert!(Instant::now() < deadline, "condition not met in time");
			std::thread::sleep(Duration::from_millis(5));
		}
	}
	
	fn address(s: &str) -> ServerAddress {
		s.parse().unwrap()
	}
	
	#[test]
	fn select_standalone() {
		let (cluster, connector) = standalone();
		let criteria = SelectionCriteria::ReadPreference(ReadPreference::new(ReadPreferenceMode::Secondary));
		let server = cluster.select_server(&criteria, &ctx(5000)).unwrap();
		assert_eq!(server.description.r#type, ServerType::Standalone);
		assert_eq!(cluster.description().r#type, TopologyType::Single);
		
		let mut connection = cluster.checkout(&server, &ctx(5000)).unwrap();
		connection.send_command(b"ping", None).unwrap();
		assert_eq!(connector.sent(), vec![address("a")]);
	}
	
	#[test]
	fn selection_fails_fast_without_time_left() {
		let connector = MockConnector::new();
		connector.set_error("a:27017", mock::network_error());
		let cluster = cluster("mongodb://a", &connector);
		
		let start = Instant::now();
		let err = cluster.select_server(&SelectionCriteria::Writable, &OperationContext::with_deadline(start)).unwrap_err();
		assert!(start.elapsed() < Duration::from_secs(1));
		match err {
			Error::ServerSelection(ServerSelectionError::Timeout { criteria, topology, .. }) => {
				assert_eq!(criteria, "writable server");
				assert!(topology.contains("a:27017"), "{}", topology);
			}
			other => panic!("expected a selection timeout, got {:?}", other)
		}
	}
	
	#[test]
	fn selection_times_out() {
		let connector = MockConnector::new();
		connector.set_error("a:27017", mock::network_error());
		let cluster = cluster("mongodb://a/?serverSelectionTimeoutMS=100", &connector);
		
		let start = Instant::now();
		let err = cluster.select_server(&SelectionCriteria::Writable, &OperationContext::new()).unwrap_err();
		assert!(start.elapsed() >= Duration::from_millis(100));
		assert!(matches!(err, Error::ServerSelection(ServerSelectionError::Timeout { .. })));
	}
	
	#[test]
	fn selection_waits_for_server() {
		let connector = MockConnector::new();
		connector.set_error("a:27017", mock::network_error());
		let cluster = cluster("mongodb://a", &connector);
		wait_for(&cluster, |t| t.server(&address("a")).map_or(false, |s| s.error.is_some()));
		
		connector.set_up("a:27017");
		connector.set_reply("a:27017", mock::STANDALONE);
		let server = cluster.select_server(&SelectionCriteria::Writable, &ctx(5000)).unwrap();
		assert_eq!(server.id.address, address("a"));
	}
	
	#[test]
	fn discover_replica_set() {
		let connector = MockConnector::new();
		connector.set_reply("a:27017", PRIMARY);
		connector.set_reply("b:27017", SECONDARY);
		connector.set_error("c:27017", mock::network_error());
		let cluster = cluster("mongodb://a/?replicaSet=rs", &connector);
		
		let secondary = SelectionCriteria::ReadPreference(ReadPreference::new(ReadPreferenceMode::Secondary));
		assert_eq!(cluster.select_server(&secondary, &ctx(5000)).unwrap().id.address, address("b"));
		assert_eq!(cluster.select_server(&SelectionCriteria::Writable, &ctx(5000)).unwrap().id.address, address("a"));
		
		let description = cluster.description();
		assert_eq!(description.r#type, TopologyType::ReplicaSetWithPrimary);
		assert_eq!(description.servers.len(), 3);
		assert_eq!(cluster.servers.lock().unwrap().len(), 3);
	}
	
	#[test]
	fn removed_members_are_closed() {
		let connector = MockConnector::new();
		connector.set_error("a:27017", mock::network_error());
		let cluster = cluster("mongodb://a,c/?replicaSet=rs&heartbeatFrequencyMS=500", &connector);
		let removed_pool = cluster.servers.lock().unwrap()[&address("c")].pool.clone();
		
		connector.set_reply("a:27017", &PRIMARY.replace(r#", "c:27017""#, ""));
		connector.set_up("a:27017");
		wait_for(&cluster, |t| t.r#type == TopologyType::ReplicaSetWithPrimary);
		eventually(|| {
			let servers = cluster.servers.lock().unwrap();
			servers.contains_key(&address("b")) && !servers.contains_key(&address("c"))
		});
		assert!(removed_pool.is_closed().unwrap());
		
		// a running monitor would check again within the heartbeat frequency
		let checks = connector.checks("c:27017");
		std::thread::sleep(Duration::from_millis(1200));
		assert!(connector.checks("c:27017") <= checks + 1, "monitor of removed server still running");
	}
	
	#[test]
	fn standalone_rejects_transactions() {
		let (cluster, _) = standalone();
		let mut session = cluster.start_session(SessionOptions::default(), &ctx(5000)).unwrap();
		match cluster.start_transaction(&mut session) {
			Err(Error::Transaction(msg)) => assert!(msg.contains("standalone"), "{}", msg),
			other => panic!("expected a transaction error, got {:?}", other)
		}
		assert_eq!(session.transaction_state(), crate::session::TransactionState::NoTransaction);
	}
	
	#[test]
	fn old_router_rejects_transactions() {
		let connector = MockConnector::new();
		connector.set_reply("a:27017", &mock::MONGOS.replace("21", "7"));
		let cluster = cluster("mongodb://a", &connector);
		let mut session = cluster.start_session(SessionOptions::default(), &ctx(5000)).unwrap();
		assert!(matches!(cluster.start_transaction(&mut session), Err(Error::Transaction(_))));
	}
	
	#[test]
	fn replica_set_accepts_transactions() {
		let connector = MockConnector::new();
		connector.set_reply("a:27017", PRIMARY);
		let cluster = cluster("mongodb://a/?replicaSet=rs", &connector);
		let mut session = cluster.start_session(SessionOptions::default(), &ctx(5000)).unwrap();
		cluster.start_transaction(&mut session).unwrap();
		assert!(session.in_transaction());
	}
	
	#[test]
	fn network_error_clears_pool() {
		let (cluster, _) = standalone();
		let server = cluster.select_server(&SelectionCriteria::Writable, &ctx(5000)).unwrap();
		let connection = cluster.checkout(&server, &ctx(5000)).unwrap();
		let generation = connection.generation();
		
		cluster.handle_application_error(&address("a"), &mock::network_error(), generation, false).unwrap();
		assert_eq!(server.pool.generation().unwrap(), generation + 1);
		
		// an error from a connection of the old generation changes nothing
		cluster.handle_application_error(&address("a"), &mock::network_error(), generation, false).unwrap();
		assert_eq!(server.pool.generation().unwrap(), generation + 1);
	}
	
	#[test]
	fn timeout_after_handshake_keeps_pool() {
		let (cluster, _) = standalone();
		let server = cluster.select_server(&SelectionCriteria::Writable, &ctx(5000)).unwrap();
		cluster.handle_application_error(&address("a"), &mock::timeout_error(), 0, false).unwrap();
		assert_eq!(server.pool.generation().unwrap(), 0);
		cluster.handle_application_error(&address("a"), &mock::timeout_error(), 0, true).unwrap();
		assert_eq!(server.pool.generation().unwrap(), 1);
	}
	
	#[test]
	fn state_change_errors() {
		let (cluster, _) = standalone();
		let server = cluster.select_server(&SelectionCriteria::Writable, &ctx(5000)).unwrap();
		
		let not_primary = Error::Command(crate::common::CommandError::new(10107, "not primary"));
		cluster.handle_application_error(&address("a"), &not_primary, 0, false).unwrap();
		assert_eq!(server.pool.generation().unwrap(), 0, "a stepped down primary keeps its pool");
		
		let shutdown = Error::Command(crate::common::CommandError::new(91, "shutting down"));
		cluster.handle_application_error(&address("a"), &shutdown, 0, false).unwrap();
		assert_eq!(server.pool.generation().unwrap(), 1);
	}
	
	#[test]
	fn load_balancer_is_not_monitored() {
		let connector = MockConnector::new();
		connector.set_reply("lb:27017", mock::STANDALONE);
		let cluster = cluster("mongodb://lb/?loadBalanced=true", &connector);
		
		let server = cluster.select_server(&SelectionCriteria::Writable, &ctx(0)).unwrap();
		assert_eq!(server.description.r#type, ServerType::LoadBalancer);
		assert_eq!(connector.checks("lb:27017"), 0);
	}
	
	#[test]
	fn sessions() {
		let (cluster, _) = standalone();
		let session = cluster.start_session(SessionOptions::default(), &ctx(5000)).unwrap();
		assert!(!session.is_implicit());
		drop(session);
		assert_eq!(cluster.session_pool().len().unwrap(), 1);
		assert!(cluster.start_implicit_session().unwrap().unwrap().is_implicit());
	}
	
	#[test]
	fn close_fails_selection() {
		let (cluster, _) = standalone();
		let server = cluster.select_server(&SelectionCriteria::Writable, &ctx(5000)).unwrap();
		drop(cluster.start_session(SessionOptions::default(), &ctx(5000)).unwrap());
		assert_eq!(cluster.session_pool().len().unwrap(), 1);
		cluster.close().unwrap();
		assert!(cluster.session_pool().is_empty().unwrap());
		cluster.close().unwrap();
		
		assert!(cluster.is_closed());
		assert!(server.pool.is_closed().unwrap());
		assert!(matches!(cluster.select_server(&SelectionCriteria::Writable, &ctx(5000)), Err(Error::ClusterClosed)));
	}
	
	#[test]
	fn events_are_dispatched() {
		let connector = MockConnector::new();
		connector.set_reply("a:27017", mock::STANDALONE);
		let events = EventHandler::default();
		let seen = Arc::new(Mutex::new(Vec::new()));
		{
			let seen = seen.clone();
			events.add_listener(move |event| {
				let name = match event {
					Event::TopologyOpening { .. }          => "topology opening",
					Event::ServerOpening { .. }            => "server opening",
					Event::PoolCreated { .. }              => "pool created",
					Event::ServerDescriptionChanged { .. } => "server changed",
					_ => return
				};
				seen.lock().unwrap().push(name);
			});
		}
		
		let cluster = Cluster::with_parts(ClusterOptions::from_str("mongodb://a").unwrap(),
			Arc::new(connector), Arc::new(SystemClock), events).unwrap();
		cluster.select_server(&SelectionCriteria::Writable, &ctx(5000)).unwrap();
		
		eventually(|| seen.lock().unwrap().contains(&"server changed"));
		assert_eq!(&seen.lock().unwrap()[..3], &["topology opening", "server opening", "pool created"]);
	}
	
	#[test]
	fn registry_shares_clusters() {
		let connector = MockConnector::new();
		connector.set_reply("a:27017", mock::STANDALONE);
		let registry = ClusterRegistry::new(Arc::new(connector), Arc::new(SystemClock));
		let options = ClusterOptions::from_str("mongodb://a").unwrap();
		
		let first = registry.acquire(&options).unwrap();
		let second = registry.acquire(&options).unwrap();
		let other = registry.acquire(&ClusterOptions::from_str("mongodb://a/?appname=x").unwrap()).unwrap();
		assert_eq!(first.id, second.id);
		assert_ne!(first.id, other.id);
		assert_eq!(registry.len().unwrap(), 2);
		
		assert!(!registry.release(&first).unwrap());
		assert!(registry.release(&second).unwrap());
		assert!(first.is_closed());
		assert_eq!(registry.len().unwrap(), 1);
		
		registry.shutdown().unwrap();
		assert!(other.is_closed());
		assert!(registry.is_empty().unwrap());
	}
	
	#[test]
	fn cluster_key_ignores_tag_order() {
		let a = ClusterOptions::from_str("mongodb://a/?readPreference=nearest&readPreferenceTags=dc:ny,rack:1").unwrap();
		let b = ClusterOptions::from_str("mongodb://a/?readPreference=nearest&readPreferenceTags=rack:1,dc:ny").unwrap();
		assert_eq!(ClusterKey::new(&a), ClusterKey::new(&b));
	}
}

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
		server::{ServerAddress, TopologyVersion},
		topology::TopologyType,
		select::ServerSelectionError,
		monitor::{BackoffPolicy, ServerMonitoringMode}
	},
	std::{
		collections::HashMap,
		fmt,
		str::FromStr,
		sync::{Arc, atomic::{AtomicU64, Ordering}},
		time::Duration
	}
};

pub const DEFAULT_MONGO_PORT:               u16      = 27017;
pub const DEFAULT_CONNECT_TIMEOUT:          Duration = Duration::from_secs(10);
pub const DEFAULT_MIN_POOL_SIZE:            usize    = 0;
pub const DEFAULT_MAX_POOL_SIZE:            usize    = 100;
pub const DEFAULT_MAX_CONNECTING:           usize    = 2;
pub const DEFAULT_LOCAL_THRESHOLD:          Duration = Duration::from_millis(15);
pub const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_FREQUENCY:      Duration = Duration::from_secs(10);
pub const MIN_HEARTBEAT_FREQUENCY:          Duration = Duration::from_millis(500);

/// see https://github.com/mongodb/specifications/blob/master/source/uri-options/uri-options.rst
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClusterOptions {
	pub hosts:                   Vec<ServerAddress>,
	pub appname:                 Option<String>,
	pub connect_timeout:         Duration,
	pub direct_connection:       Option<bool>,
	pub load_balanced:           bool,
	pub replica_set:             Option<String>,
	pub retry_reads:             bool,
	pub retry_writes:            bool,
	pub server_selection_config: ServerSelectionConfig,
	pub pool_options:            ConnectionPoolOptions,
	pub read_preference:         ReadPreference,
	pub initial_topology_type:   Option<TopologyType>
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ClusterOptionsParseError {
	#[error("connection string must start with `mongodb://`")]
	InvalidScheme,
	#[error("unknown option `{0}`")]
	InvalidKey(String),
	#[error("invalid value `{val}` for option `{key}`")]
	InvalidValue { key: &'static str, val: String },
	#[error("conflicting options: {0}")]
	Conflict(&'static str)
}

impl<T: fmt::Display> From<(&'static str, T)> for ClusterOptionsParseError {
	fn from((key, val): (&'static str, T)) -> Self {
		Self::InvalidValue { key, val: val.to_string() }
	}
}

impl ClusterOptions {
	/// The topology type the cluster starts with before any server has been contacted.
	pub fn initial_topology_type(&self) -> TopologyType {
		if let Some(r#type) = self.initial_topology_type {
			r#type
		} else if self.load_balanced {
			TopologyType::LoadBalanced
		} else if self.direct_connection == Some(true) {
			TopologyType::Single
		} else if self.replica_set.is_some() {
			TopologyType::ReplicaSetNoPrimary
		} else {
			TopologyType::Unknown
		}
	}
	
	/// Checks option combinations that can not be expressed by the parser alone.
	pub fn validate(&self) -> std::result::Result<(), ClusterOptionsParseError> {
		if self.hosts.is_empty() {
			return Err(ClusterOptionsParseError::Conflict("at least one host is required"));
		}
		
		if self.direct_connection == Some(true) && self.hosts.len() > 1 {
			return Err(ClusterOptionsParseError::Conflict("directConnection=true requires exactly one host"));
		}
		
		if self.load_balanced {
			if self.hosts.len() > 1 {
				return Err(ClusterOptionsParseError::Conflict("loadBalanced=true requires exactly one host"));
			}
			if self.replica_set.is_some() {
				return Err(ClusterOptionsParseError::Conflict("loadBalanced=true can not be used with replicaSet"));
			}
			if self.direct_connection == Some(true) {
				return Err(ClusterOptionsParseError::Conflict("loadBalanced=true can not be used with directConnection=true"));
			}
		}
		
		if self.server_selection_config.heartbeat_frequency < self.server_selection_config.min_heartbeat_frequency {
			return Err(ClusterOptionsParseError::from((
				"heartbeatFrequencyMS", self.server_selection_config.heartbeat_frequency.as_millis())));
		}
		
		if self.pool_options.max_pool_size != 0 && self.pool_options.min_pool_size > self.pool_options.max_pool_size {
			return Err(ClusterOptionsParseError::Conflict("minPoolSize must not exceed maxPoolSize"));
		}
		
		Ok(())
	}
}

impl Default for ClusterOptions {
	fn default() -> Self {
		Self {
			hosts:                   Vec::new(),
			appname:                 None,
			connect_timeout:         DEFAULT_CONNECT_TIMEOUT,
			direct_connection:       None,
			load_balanced:           false,
			replica_set:             None,
			retry_reads:             true,
			retry_writes:            true,
			server_selection_config: ServerSelectionConfig::default(),
			pool_options:            ConnectionPoolOptions::default(),
			read_preference:         ReadPreference::default(),
			initial_topology_type:   None
		}
	}
}

impl FromStr for ClusterOptions {
	type Err = Error;
	
	fn from_str(mut s: &str) -> std::result::Result<Self, Self::Err> {
		let mut self_ = Self::default();
		
		if !s.starts_with("mongodb://") {
			return Err(Error::InvalidClusterOptions(ClusterOptionsParseError::InvalidScheme));
		}
		
		s = s.trim_start_matches("mongodb://");
		
		// credentials are handled by the authentication layer
		
		if let Some(i) = s.find('@') {
			s = &s[i + 1..];
		}
		
		let i = s.find(|c: char| c == '/' || c == '?').unwrap_or_else(|| s.len());
		self_.hosts = s[..i].split(',')
			.filter(|host| !host.is_empty())
			.map(|host| host.parse().map_err(|_| ClusterOptionsParseError::from(("host", host))))
			.collect::<std::result::Result<_, _>>()?;
		
		s = &s[i..];
		let s = match s.find('?') {
			Some(i) => &s[i + 1..],
			None => ""
		};
		
		// options
		
		fn bool_value(key: &'static str, value: &str) -> std::result::Result<bool, ClusterOptionsParseError> {
			match value {
				"true"  => Ok(true),
				"false" => Ok(false),
				_ => Err(ClusterOptionsParseError::from((key, value)))
			}
		}
		
		fn ms_value(key: &'static str, value: &str) -> std::result::Result<Duration, ClusterOptionsParseError> {
			value.parse::<u64>()
				.map(Duration::from_millis)
				.map_err(|_| ClusterOptionsParseError::from((key, value)))
		}
		
		fn usize_value(key: &'static str, value: &str) -> std::result::Result<usize, ClusterOptionsParseError> {
			value.parse().map_err(|_| ClusterOptionsParseError::from((key, value)))
		}
		
		s.split('&').filter(|s| !s.is_empty()).map(|s| {
			let i = s.find('=').unwrap_or_else(|| s.len());
			(&s[..i], s.get(i + 1..).unwrap_or(""))
		}).try_for_each(|(key, value)| Ok::<_, ClusterOptionsParseError>(match key {
			"appname"                  => self_.appname = Some(value.to_string()),
			"connectTimeoutMS"         => self_.connect_timeout = ms_value("connectTimeoutMS", value)?,
			"directConnection"         => self_.direct_connection = Some(bool_value("directConnection", value)?),
			"heartbeatFrequencyMS"     => self_.server_selection_config.heartbeat_frequency =
				ms_value("heartbeatFrequencyMS", value)?,
			"loadBalanced"             => self_.load_balanced = bool_value("loadBalanced", value)?,
			"localThresholdMS"         => self_.server_selection_config.local_threshold =
				ms_value("localThresholdMS", value)?,
			"maxIdleTimeMS"            => self_.pool_options.max_idle_time = match ms_value("maxIdleTimeMS", value)? {
				v if v == Duration::from_millis(0) => None,
				v => Some(v)
			},
			"maxPoolSize"              => self_.pool_options.max_pool_size = usize_value("maxPoolSize", value)?,
			"minPoolSize"              => self_.pool_options.min_pool_size = usize_value("minPoolSize", value)?,
			"maxConnecting"            => self_.pool_options.max_connecting = match usize_value("maxConnecting", value)? {
				0 => return Err(ClusterOptionsParseError::from(("maxConnecting", value))),
				v => v
			},
			"waitQueueSize"            => self_.pool_options.wait_queue_size = match usize_value("waitQueueSize", value)? {
				0 => None,
				v => Some(v)
			},
			"waitQueueTimeoutMS"       => self_.pool_options.wait_queue_timeout = Some(ms_value("waitQueueTimeoutMS", value)?),
			"maxStalenessSeconds"      => self_.read_preference.max_staleness = match value.parse::<i64>()
				.map_err(|_| ClusterOptionsParseError::from(("maxStalenessSeconds", value)))? {
				-1 => None,
				v if v < 0 => return Err(ClusterOptionsParseError::from(("maxStalenessSeconds", value))),
				v => Some(Duration::from_secs(v as u64))
			},
			"readPreference"           => self_.read_preference.mode = value.parse()
				.map_err(|_| ClusterOptionsParseError::from(("readPreference", value)))?,
			"readPreferenceTags"       => self_.read_preference.tag_sets.push(value.split(',')
				.filter(|s| !s.is_empty())
				.map(|s| {
					let i = s.find(':').unwrap_or_else(|| s.len());
					(s[..i].to_string(), s.get(i + 1..).unwrap_or("").to_string())
				}).collect()),
			"replicaSet"               => self_.replica_set = Some(value.to_string()),
			"retryReads"               => self_.retry_reads = bool_value("retryReads", value)?,
			"retryWrites"              => self_.retry_writes = bool_value("retryWrites", value)?,
			"serverSelectionTimeoutMS" => self_.server_selection_config.server_selection_timeout =
				ms_value("serverSelectionTimeoutMS", value)?,
			"serverMonitoringMode"     => self_.server_selection_config.monitoring_mode = value.parse()
				.map_err(|_| ClusterOptionsParseError::from(("serverMonitoringMode", value)))?,
			key => return Err(ClusterOptionsParseError::InvalidKey(key.to_string()))
		}))?;
		
		self_.validate()?;
		Ok(self_)
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionPoolOptions {
	/// `0` means unlimited.
	pub max_pool_size:      usize,
	pub min_pool_size:      usize,
	pub max_idle_time:      Option<Duration>,
	pub max_connecting:     usize,
	/// Maximum number of threads waiting for a connection, unlimited if `None`.
	pub wait_queue_size:    Option<usize>,
	/// Checkout timeout, bounded by the operation deadline. Falls back to the server selection timeout.
	pub wait_queue_timeout: Option<Duration>
}

impl Default for ConnectionPoolOptions {
	fn default() -> Self {
		Self {
			max_pool_size:      DEFAULT_MAX_POOL_SIZE,
			min_pool_size:      DEFAULT_MIN_POOL_SIZE,
			max_idle_time:      None,
			max_connecting:     DEFAULT_MAX_CONNECTING,
			wait_queue_size:    None,
			wait_queue_timeout: None
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ServerSelectionConfig {
	pub local_threshold:          Duration,
	pub server_selection_timeout: Duration,
	pub heartbeat_frequency:      Duration,
	pub min_heartbeat_frequency:  Duration,
	pub monitoring_mode:          ServerMonitoringMode,
	pub backoff:                  BackoffPolicy
}

impl Default for ServerSelectionConfig {
	fn default() -> Self {
		Self {
			local_threshold:          DEFAULT_LOCAL_THRESHOLD,
			server_selection_timeout: DEFAULT_SERVER_SELECTION_TIMEOUT,
			heartbeat_frequency:      DEFAULT_HEARTBEAT_FREQUENCY,
			min_heartbeat_frequency:  MIN_HEARTBEAT_FREQUENCY,
			monitoring_mode:          ServerMonitoringMode::default(),
			backoff:                  BackoffPolicy::default()
		}
	}
}

pub type TagSet = HashMap<String, String>;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReadPreference {
	pub mode:          ReadPreferenceMode,
	pub max_staleness: Option<Duration>,
	pub tag_sets:      Vec<TagSet>,
}

impl ReadPreference {
	pub fn new(mode: ReadPreferenceMode) -> Self {
		Self { mode, ..Self::default() }
	}
	
	pub fn primary() -> Self {
		Self::new(ReadPreferenceMode::Primary)
	}
	
	pub fn with_tag_sets(mut self, tag_sets: Vec<TagSet>) -> Self {
		self.tag_sets = tag_sets;
		self
	}
	
	pub fn with_max_staleness(mut self, max_staleness: Duration) -> Self {
		self.max_staleness = Some(max_staleness);
		self
	}
}

impl Default for ReadPreference {
	fn default() -> Self {
		Self {
			mode:          ReadPreferenceMode::Primary,
			max_staleness: None,
			tag_sets:      vec![]
		}
	}
}

impl fmt::Display for ReadPreference {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{{ mode: {}", self.mode)?;
		if let Some(max_staleness) = self.max_staleness {
			write!(f, ", maxStalenessSeconds: {}", max_staleness.as_secs())?;
		}
		if !self.tag_sets.is_empty() {
			write!(f, ", tagSets: [")?;
			for (i, tags) in self.tag_sets.iter().enumerate() {
				let mut tags = tags.iter().collect::<Vec<_>>();
				tags.sort();
				write!(f, "{}{{", if i == 0 { "" } else { ", " })?;
				for (j, (k, v)) in tags.into_iter().enumerate() {
					write!(f, "{}{}: {}", if j == 0 { "" } else { ", " }, k, v)?;
				}
				write!(f, "}}")?;
			}
			write!(f, "]")?;
		}
		write!(f, " }}")
	}
}

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum ReadPreferenceMode {
	Primary,
	PrimaryPreferred,
	Secondary,
	SecondaryPreferred,
	Nearest
}

impl FromStr for ReadPreferenceMode {
	type Err = ();
	
	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"primary"            => Self::Primary,
			"primaryPreferred"   => Self::PrimaryPreferred,
			"secondary"          => Self::Secondary,
			"secondaryPreferred" => Self::SecondaryPreferred,
			"nearest"            => Self::Nearest,
			_ => return Err(())
		})
	}
}

impl fmt::Display for ReadPreferenceMode {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(match self {
			Self::Primary            => "primary",
			Self::PrimaryPreferred   => "primaryPreferred",
			Self::Secondary          => "secondary",
			Self::SecondaryPreferred => "secondaryPreferred",
			Self::Nearest            => "nearest"
		})
	}
}

static NEXT_CLUSTER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one cluster instance within the process.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ClusterId(pub u64);

impl ClusterId {
	pub fn next() -> Self {
		Self(NEXT_CLUSTER_ID.fetch_add(1, Ordering::Relaxed))
	}
}

impl fmt::Display for ClusterId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "cluster-{}", self.0)
	}
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ServerId {
	pub cluster_id: ClusterId,
	pub address:    ServerAddress
}

impl fmt::Display for ServerId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}/{}", self.cluster_id, self.address)
	}
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionId {
	pub server_id: ServerId,
	/// Unique within the pool of `server_id`, starting at 1.
	pub local_id:  u64
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}#{}", self.server_id, self.local_id)
	}
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	#[error("invalid cluster options: {0}")]
	InvalidClusterOptions(#[from] ClusterOptionsParseError),
	#[error("a lock was poisoned")]
	Sync,
	#[error("network error: {0}")]
	Io(Arc<std::io::Error>),
	#[error(transparent)]
	ServerSelection(#[from] ServerSelectionError),
	#[error("timed out after {timeout:?} while checking out a connection from {address}")]
	PoolTimeout { address: ServerAddress, timeout: Duration },
	#[error("connection pool for {address} was cleared")]
	PoolCleared { address: ServerAddress },
	#[error("connection pool for {address} is closed")]
	PoolClosed { address: ServerAddress },
	#[error("wait queue of the connection pool for {address} is full")]
	WaitQueueFull { address: ServerAddress },
	#[error(transparent)]
	Command(#[from] CommandError),
	#[error("invalid handshake reply: {0}")]
	InvalidReply(String),
	#[error("invalid argument: {0}")]
	InvalidArgument(String),
	#[error("transaction error: {0}")]
	Transaction(String),
	#[error("operation was cancelled")]
	Cancelled,
	#[error("cluster is closed")]
	ClusterClosed
}

impl Error {
	/// An I/O failure other than a timeout.
	pub fn is_network_error(&self) -> bool {
		matches!(self, Self::Io(_)) && !self.is_network_timeout()
	}
	
	pub fn is_network_timeout(&self) -> bool {
		match self {
			Self::Io(err) => matches!(err.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock),
			_ => false
		}
	}
	
	/// The server is no longer primary or is recovering.
	pub fn is_state_change_error(&self) -> bool {
		match self {
			Self::Command(err) => err.is_not_writable_primary() || err.is_recovering(),
			_ => false
		}
	}
	
	pub fn is_shutdown_error(&self) -> bool {
		match self {
			Self::Command(err) => err.is_shutdown(),
			_ => false
		}
	}
	
	/// Whether an operation failing with this error may be attempted once more.
	pub fn is_retryable(&self) -> bool {
		match self {
			Self::Io(_) | Self::PoolCleared { .. } => true,
			Self::Command(err) => err.is_retryable(),
			_ => false
		}
	}
	
	pub fn topology_version(&self) -> Option<TopologyVersion> {
		match self {
			Self::Command(err) => err.topology_version,
			_ => None
		}
	}
	
	pub fn has_label(&self, label: &str) -> bool {
		match self {
			Self::Command(err) => err.labels.iter().any(|l| l == label),
			Self::Io(_) => label == TRANSIENT_TRANSACTION_ERROR,
			_ => false
		}
	}
}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Self {
		Self::Io(Arc::new(e))
	}
}

impl<T> From<std::sync::PoisonError<T>> for Error {
	fn from(_: std::sync::PoisonError<T>) -> Self {
		Self::Sync
	}
}

pub const RETRYABLE_WRITE_ERROR:       &str = "RetryableWriteError";
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// An error reply returned by a server for a command.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("command failed with {code_name} ({code}): {message}")]
pub struct CommandError {
	pub code:             i32,
	pub code_name:        String,
	pub message:          String,
	pub labels:           Vec<String>,
	pub topology_version: Option<TopologyVersion>
}

impl CommandError {
	pub fn new(code: i32, message: impl Into<String>) -> Self {
		Self {
			code,
			code_name:        format!("{:?}", ServerErrorCode::from(code)),
			message:          message.into(),
			labels:           Vec::new(),
			topology_version: None
		}
	}
	
	pub fn kind(&self) -> ServerErrorCode {
		self.code.into()
	}
	
	pub fn is_not_writable_primary(&self) -> bool {
		matches!(self.kind(),
			ServerErrorCode::NotWritablePrimary
			| ServerErrorCode::NotPrimaryNoSecondaryOk
			| ServerErrorCode::LegacyNotPrimary)
	}
	
	pub fn is_recovering(&self) -> bool {
		matches!(self.kind(),
			ServerErrorCode::InterruptedAtShutdown
			| ServerErrorCode::InterruptedDueToReplStateChange
			| ServerErrorCode::NotPrimaryOrSecondary
			| ServerErrorCode::PrimarySteppedDown
			| ServerErrorCode::ShutdownInProgress)
	}
	
	pub fn is_shutdown(&self) -> bool {
		matches!(self.kind(), ServerErrorCode::InterruptedAtShutdown | ServerErrorCode::ShutdownInProgress)
	}
	
	pub fn is_retryable(&self) -> bool {
		self.labels.iter().any(|l| l == RETRYABLE_WRITE_ERROR) || matches!(self.kind(),
			ServerErrorCode::InterruptedAtShutdown
			| ServerErrorCode::InterruptedDueToReplStateChange
			| ServerErrorCode::NotWritablePrimary
			| ServerErrorCode::NotPrimaryNoSecondaryOk
			| ServerErrorCode::NotPrimaryOrSecondary
			| ServerErrorCode::PrimarySteppedDown
			| ServerErrorCode::ShutdownInProgress
			| ServerErrorCode::HostNotFound
			| ServerErrorCode::HostUnreachable
			| ServerErrorCode::NetworkTimeout
			| ServerErrorCode::SocketException
			| ServerErrorCode::ExceededTimeLimit
			| ServerErrorCode::ReadConcernMajorityNotAvailableYet)
	}
}

/// Server error codes the topology layer reacts to.
#[repr(i32)]
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ServerErrorCode {
	HostUnreachable                    = 6,
	HostNotFound                       = 7,
	NetworkTimeout                     = 89,
	ShutdownInProgress                 = 91,
	ReadConcernMajorityNotAvailableYet = 134,
	PrimarySteppedDown                 = 189,
	ExceededTimeLimit                  = 262,
	SocketException                    = 9001,
	LegacyNotPrimary                   = 10058,
	NotWritablePrimary                 = 10107,
	InterruptedAtShutdown              = 11600,
	InterruptedDueToReplStateChange    = 11602,
	NotPrimaryNoSecondaryOk            = 13435,
	NotPrimaryOrSecondary              = 13436,
	Other                              = -1
}

impl From<i32> for ServerErrorCode {
	fn from(code: i32) -> Self {
		match code {
			6     => Self::HostUnreachable,
			7     => Self::HostNotFound,
			89    => Self::NetworkTimeout,
			91    => Self::ShutdownInProgress,
			134   => Self::ReadConcernMajorityNotAvailableYet,
			189   => Self::PrimarySteppedDown,
			262   => Self::ExceededTimeLimit,
			9001  => Self::SocketException,
			10058 => Self::LegacyNotPrimary,
			10107 => Self::NotWritablePrimary,
			11600 => Self::InterruptedAtShutdown,
			11602 => Self::InterruptedDueToReplStateChange,
			13435 => Self::NotPrimaryNoSecondaryOk,
			13436 => Self::NotPrimaryOrSecondary,
			_     => Self::Other
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	
	#[test]
	fn parse_connection_string() {
		let options = ClusterOptions::from_str(
			"mongodb://user:pw@a.example.com:27017,b.example.com/admin?replicaSet=rs0&readPreference=secondary\
			&readPreferenceTags=dc:ny,rack:1&readPreferenceTags=&maxStalenessSeconds=120&localThresholdMS=20\
			&serverSelectionTimeoutMS=500&maxPoolSize=5&maxIdleTimeMS=1000&heartbeatFrequencyMS=2000").unwrap();
		
		assert_eq!(options.hosts, vec![
			"a.example.com:27017".parse::<ServerAddress>().unwrap(),
			"b.example.com".parse::<ServerAddress>().unwrap()
		]);
		assert_eq!(options.replica_set.as_deref(), Some("rs0"));
		assert_eq!(options.read_preference.mode, ReadPreferenceMode::Secondary);
		assert_eq!(options.read_preference.tag_sets.len(), 2);
		assert_eq!(options.read_preference.tag_sets[0].get("dc").map(String::as_str), Some("ny"));
		assert!(options.read_preference.tag_sets[1].is_empty());
		assert_eq!(options.read_preference.max_staleness, Some(Duration::from_secs(120)));
		assert_eq!(options.server_selection_config.local_threshold, Duration::from_millis(20));
		assert_eq!(options.server_selection_config.server_selection_timeout, Duration::from_millis(500));
		assert_eq!(options.server_selection_config.heartbeat_frequency, Duration::from_secs(2));
		assert_eq!(options.pool_options.max_pool_size, 5);
		assert_eq!(options.pool_options.max_idle_time, Some(Duration::from_secs(1)));
		assert_eq!(options.initial_topology_type(), TopologyType::ReplicaSetNoPrimary);
	}
	
	#[test]
	fn parse_rejects_invalid_input() {
		assert!(matches!(ClusterOptions::from_str("http://localhost"),
			Err(Error::InvalidClusterOptions(ClusterOptionsParseError::InvalidScheme))));
		assert!(matches!(ClusterOptions::from_str("mongodb://localhost/?foo=bar"),
			Err(Error::InvalidClusterOptions(ClusterOptionsParseError::InvalidKey(_)))));
		assert!(matches!(ClusterOptions::from_str("mongodb://localhost/?retryReads=yes"),
			Err(Error::InvalidClusterOptions(ClusterOptionsParseError::InvalidValue { key: "retryReads", .. }))));
		assert!(matches!(ClusterOptions::from_str("mongodb://a,b/?directConnection=true"),
			Err(Error::InvalidClusterOptions(ClusterOptionsParseError::Conflict(_)))));
		assert!(matches!(ClusterOptions::from_str("mongodb://a/?loadBalanced=true&replicaSet=rs"),
			Err(Error::InvalidClusterOptions(ClusterOptionsParseError::Conflict(_)))));
		assert!(ClusterOptions::from_str("mongodb://a/?heartbeatFrequencyMS=100").is_err());
	}
	
	#[test]
	fn initial_topology_type() {
		let parse = |s: &str| ClusterOptions::from_str(s).unwrap().initial_topology_type();
		assert_eq!(parse("mongodb://a"), TopologyType::Unknown);
		assert_eq!(parse("mongodb://a/?directConnection=true"), TopologyType::Single);
		assert_eq!(parse("mongodb://a/?loadBalanced=true"), TopologyType::LoadBalanced);
		assert_eq!(parse("mongodb://a,b/?replicaSet=rs"), TopologyType::ReplicaSetNoPrimary);
	}
	
	#[test]
	fn error_classification() {
		let not_primary = Error::Command(CommandError::new(10107, "not primary"));
		assert!(not_primary.is_state_change_error());
		assert!(!not_primary.is_shutdown_error());
		assert!(not_primary.is_retryable());
		
		let shutdown = Error::Command(CommandError::new(91, "shutting down"));
		assert!(shutdown.is_state_change_error());
		assert!(shutdown.is_shutdown_error());
		
		let timeout = Error::from(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"));
		assert!(timeout.is_network_timeout());
		assert!(!timeout.is_network_error());
		
		let reset = Error::from(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
		assert!(reset.is_network_error());
		assert!(reset.has_label(TRANSIENT_TRANSACTION_ERROR));
		
		let duplicate = Error::Command(CommandError::new(11000, "duplicate key"));
		assert!(!duplicate.is_retryable());
		assert!(!duplicate.is_state_change_error());
	}
	
	#[test]
	fn read_preference_display() {
		let mut tags = TagSet::new();
		tags.insert("dc".to_string(), "ny".to_string());
		let read_pref = ReadPreference::new(ReadPreferenceMode::Nearest)
			.with_tag_sets(vec![tags])
			.with_max_staleness(Duration::from_secs(90));
		assert_eq!(read_pref.to_string(), "{ mode: nearest, maxStalenessSeconds: 90, tagSets: [{dc: ny}] }");
	}
}

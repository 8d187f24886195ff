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

//! Server selection, see
//! https://github.com/mongodb/specifications/blob/master/source/server-selection/server-selection.rst
//! and https://github.com/mongodb/specifications/blob/master/source/max-staleness/max-staleness.rst

use {
	crate::{
		common::{ReadPreference, ReadPreferenceMode, TagSet},
		server::{ServerDescription, ServerType},
		topology::{TopologyDescription, TopologyType, CompatibilityError}
	},
	std::{fmt, time::{Duration, SystemTime, UNIX_EPOCH}},
	rand::Rng
};

/// Assumed interval in which a primary writes a no-op to the oplog.
pub const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);
/// Lower bound for `maxStalenessSeconds`.
pub const SMALLEST_MAX_STALENESS: Duration = Duration::from_secs(90);

/// What kind of server an operation needs.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SelectionCriteria {
	ReadPreference(ReadPreference),
	/// A server that accepts writes.
	Writable
}

impl From<ReadPreference> for SelectionCriteria {
	fn from(read_preference: ReadPreference) -> Self {
		Self::ReadPreference(read_preference)
	}
}

impl fmt::Display for SelectionCriteria {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::ReadPreference(read_preference) => write!(f, "read preference {}", read_preference),
			Self::Writable => f.write_str("writable server")
		}
	}
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ServerSelectionError {
	#[error("server selection timed out after {timeout:?}: no server matches {criteria}, topology: {topology}")]
	Timeout { criteria: String, topology: String, timeout: Duration },
	#[error("incompatible topology: {0}")]
	Incompatible(CompatibilityError),
	#[error("invalid {criteria}: {reason}")]
	InvalidCriteria { criteria: String, reason: String }
}

/// Selects one server matching `criteria`, choosing randomly among the suitable servers in
/// the latency window. Returns `Ok(None)` if no server is suitable at the moment.
pub fn select_server<'a>(
	topology:        &'a TopologyDescription,
	criteria:        &SelectionCriteria,
	local_threshold: Duration
) -> Result<Option<&'a ServerDescription>, ServerSelectionError> {
	let servers = in_latency_window(suitable_servers(topology, criteria)?, local_threshold);
	Ok(match servers.len() {
		0 => None,
		1 => Some(servers[0]),
		len => Some(servers[rand::thread_rng().gen_range(0, len)])
	})
}

/// All servers of `topology` that match `criteria`, ignoring latency.
pub fn suitable_servers<'a>(
	topology: &'a TopologyDescription,
	criteria: &SelectionCriteria
) -> Result<Vec<&'a ServerDescription>, ServerSelectionError> {
	if let Some(err) = &topology.compatibility_error {
		return Err(ServerSelectionError::Incompatible(err.clone()));
	}
	
	let available = || topology.servers.values().filter(|server| server.is_available());
	
	Ok(match topology.r#type {
		TopologyType::Unknown      => Vec::new(),
		TopologyType::Single       => available().collect(),
		TopologyType::LoadBalanced => topology.servers_of_type(ServerType::LoadBalancer).collect(),
		TopologyType::Sharded      => topology.servers_of_type(ServerType::Mongos).collect(),
		TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => match criteria {
			SelectionCriteria::Writable => topology.primary().into_iter().collect(),
			SelectionCriteria::ReadPreference(read_preference) => {
				validate(topology, read_preference)
					.map_err(|reason| ServerSelectionError::InvalidCriteria { criteria: criteria.to_string(), reason })?;
				replica_set_servers(topology, read_preference)
			}
		}
	})
}

fn validate(topology: &TopologyDescription, read_preference: &ReadPreference) -> Result<(), String> {
	if read_preference.mode == ReadPreferenceMode::Primary {
		if read_preference.max_staleness.is_some() {
			return Err("maxStalenessSeconds can not be combined with mode primary".to_string());
		}
		if read_preference.tag_sets.iter().any(|tags| !tags.is_empty()) {
			return Err("tag sets can not be combined with mode primary".to_string());
		}
	}
	
	if let Some(max_staleness) = read_preference.max_staleness {
		let smallest = SMALLEST_MAX_STALENESS.max(topology.heartbeat_frequency + IDLE_WRITE_PERIOD);
		if max_staleness < smallest {
			return Err(format!("maxStalenessSeconds must be at least {}", smallest.as_secs()));
		}
	}
	
	Ok(())
}

fn replica_set_servers<'a>(topology: &'a TopologyDescription, read_preference: &ReadPreference) -> Vec<&'a ServerDescription> {
	let primary = || topology.primary().into_iter().collect::<Vec<_>>();
	let secondaries = || eligible(topology, topology.servers_of_type(ServerType::RSSecondary).collect(), read_preference);
	
	match read_preference.mode {
		ReadPreferenceMode::Primary            => primary(),
		ReadPreferenceMode::PrimaryPreferred   => match primary() {
			servers if servers.is_empty() => secondaries(),
			servers => servers
		},
		ReadPreferenceMode::Secondary          => secondaries(),
		ReadPreferenceMode::SecondaryPreferred => match secondaries() {
			servers if servers.is_empty() => primary(),
			servers => servers
		},
		ReadPreferenceMode::Nearest            => eligible(topology, topology.servers.values()
			.filter(|server| matches!(server.r#type, ServerType::RSPrimary | ServerType::RSSecondary))
			.collect(), read_preference)
	}
}

/// Applies the staleness and tag set filters.
fn eligible<'a>(
	topology:        &'a TopologyDescription,
	mut servers:     Vec<&'a ServerDescription>,
	read_preference: &ReadPreference
) -> Vec<&'a ServerDescription> {
	if let Some(max_staleness) = read_preference.max_staleness {
		servers.retain(|server| server.r#type == ServerType::RSPrimary
			|| staleness(topology, server).map_or(true, |staleness| staleness <= max_staleness));
	}
	filter_tag_sets(servers, &read_preference.tag_sets)
}

/// Keeps the servers matching the first tag set that matches any server.
fn filter_tag_sets<'a>(servers: Vec<&'a ServerDescription>, tag_sets: &[TagSet]) -> Vec<&'a ServerDescription> {
	if tag_sets.is_empty() {
		return servers;
	}
	
	tag_sets.iter()
		.map(|tags| servers.iter()
			.copied()
			.filter(|server| server.matches_tag_set(tags))
			.collect::<Vec<_>>())
		.find(|matching| !matching.is_empty())
		.unwrap_or_default()
}

/// Estimates how far `server` lags behind the primary, or behind the most recent secondary
/// if there is no primary. `None` if the write dates needed for the estimate are unknown.
pub fn staleness(topology: &TopologyDescription, server: &ServerDescription) -> Option<Duration> {
	fn millis(t: SystemTime) -> i128 {
		match t.duration_since(UNIX_EPOCH) {
			Ok(d) => d.as_millis() as i128,
			Err(e) => -(e.duration().as_millis() as i128)
		}
	}
	
	let heartbeat = topology.heartbeat_frequency.as_millis() as i128;
	let last_write = millis(server.last_write_date?);
	
	let staleness = match topology.primary() {
		Some(primary) => {
			let lag = millis(server.last_update_time?) - last_write;
			let primary_lag = millis(primary.last_update_time?) - millis(primary.last_write_date?);
			lag - primary_lag + heartbeat
		}
		None => {
			let max_write = topology.servers_of_type(ServerType::RSSecondary)
				.filter_map(|s| s.last_write_date)
				.map(millis)
				.max()?;
			max_write - last_write + heartbeat
		}
	};
	
	Some(Duration::from_millis(staleness.max(0) as u64))
}

/// Keeps the servers whose round trip time is within `local_threshold` of the fastest one.
pub fn in_latency_window(servers: Vec<&ServerDescription>, local_threshold: Duration) -> Vec<&ServerDescription> {
	let rtt = |server: &ServerDescription| server.rtt.unwrap_or_default();
	let fastest = match servers.iter().map(|server| rtt(server)).min() {
		Some(fastest) => fastest,
		None => return servers
	};
	
	servers.into_iter()
		.filter(|server| rtt(server) <= fastest + local_threshold)
		.collect()
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{common::ClusterOptions, server::ServerAddress},
		std::{collections::HashSet, str::FromStr}
	};
	
	const THRESHOLD: Duration = Duration::from_millis(15);
	
	fn address(s: &str) -> ServerAddress {
		s.parse().unwrap()
	}
	
	fn server(host: &str, r#type: ServerType, rtt_ms: u64) -> ServerDescription {
		ServerDescription {
			r#type,
			rtt:              Some(Duration::from_millis(rtt_ms)),
			max_wire_version: 21,
			set_name:         if r#type.is_replica_set_member() { Some("rs".to_string()) } else { None },
			..ServerDescription::new(address(host))
		}
	}
	
	fn tagged(mut server: ServerDescription, tags: &[(&str, &str)]) -> ServerDescription {
		server.tags = tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
		server
	}
	
	fn topology(r#type: TopologyType, servers: Vec<ServerDescription>) -> TopologyDescription {
		TopologyDescription {
			r#type,
			servers: servers.into_iter().map(|s| (s.address.clone(), s)).collect(),
			..TopologyDescription::default()
		}
	}
	
	fn read(mode: ReadPreferenceMode) -> SelectionCriteria {
		SelectionCriteria::ReadPreference(ReadPreference::new(mode))
	}
	
	fn hosts(servers: Vec<&ServerDescription>) -> Vec<String> {
		let mut hosts = servers.into_iter().map(|s| s.address.host.clone()).collect::<Vec<_>>();
		hosts.sort();
		hosts
	}
	
	fn replica_set() -> TopologyDescription {
		topology(TopologyType::ReplicaSetWithPrimary, vec![
			server("p", ServerType::RSPrimary, 5),
			tagged(server("s1", ServerType::RSSecondary, 5), &[("dc", "ny")]),
			tagged(server("s2", ServerType::RSSecondary, 8), &[("dc", "sf")]),
			server("arb", ServerType::RSArbiter, 1),
			server("u", ServerType::Unknown, 1)
		])
	}
	
	#[test]
	fn latency_window() {
		let t = topology(TopologyType::Sharded, vec![
			server("a", ServerType::Mongos, 5),
			server("b", ServerType::Mongos, 10),
			server("c", ServerType::Mongos, 25)
		]);
		
		let mut chosen = HashSet::new();
		for _ in 0..500 {
			let selected = select_server(&t, &read(ReadPreferenceMode::Nearest), THRESHOLD).unwrap().unwrap();
			assert_ne!(selected.address.host, "c");
			chosen.insert(selected.address.host.clone());
		}
		assert_eq!(chosen.len(), 2, "both servers in the window must be chosen eventually");
	}
	
	#[test]
	fn single_ignores_read_preference() {
		let t = topology(TopologyType::Single, vec![server("a", ServerType::Standalone, 50)]);
		for mode in &[ReadPreferenceMode::Primary, ReadPreferenceMode::Secondary, ReadPreferenceMode::Nearest] {
			assert_eq!(select_server(&t, &read(*mode), THRESHOLD).unwrap().unwrap().address, address("a"));
		}
		assert_eq!(select_server(&t, &SelectionCriteria::Writable, THRESHOLD).unwrap().unwrap().address, address("a"));
		
		let t = topology(TopologyType::Single, vec![server("a", ServerType::Unknown, 0)]);
		assert!(select_server(&t, &read(ReadPreferenceMode::Primary), THRESHOLD).unwrap().is_none());
	}
	
	#[test]
	fn replica_set_modes() {
		let t = replica_set();
		let suitable = |criteria: SelectionCriteria| hosts(suitable_servers(&t, &criteria).unwrap());
		
		assert_eq!(suitable(SelectionCriteria::Writable), vec!["p"]);
		assert_eq!(suitable(read(ReadPreferenceMode::Primary)), vec!["p"]);
		assert_eq!(suitable(read(ReadPreferenceMode::PrimaryPreferred)), vec!["p"]);
		assert_eq!(suitable(read(ReadPreferenceMode::Secondary)), vec!["s1", "s2"]);
		assert_eq!(suitable(read(ReadPreferenceMode::SecondaryPreferred)), vec!["s1", "s2"]);
		assert_eq!(suitable(read(ReadPreferenceMode::Nearest)), vec!["p", "s1", "s2"]);
	}
	
	#[test]
	fn replica_set_fallbacks() {
		let no_primary = topology(TopologyType::ReplicaSetNoPrimary, vec![
			server("s1", ServerType::RSSecondary, 5)
		]);
		assert_eq!(hosts(suitable_servers(&no_primary, &read(ReadPreferenceMode::PrimaryPreferred)).unwrap()), vec!["s1"]);
		assert!(suitable_servers(&no_primary, &SelectionCriteria::Writable).unwrap().is_empty());
		
		let no_secondary = topology(TopologyType::ReplicaSetWithPrimary, vec![
			server("p", ServerType::RSPrimary, 5)
		]);
		assert_eq!(hosts(suitable_servers(&no_secondary, &read(ReadPreferenceMode::SecondaryPreferred)).unwrap()), vec!["p"]);
		assert!(suitable_servers(&no_secondary, &read(ReadPreferenceMode::Secondary)).unwrap().is_empty());
	}
	
	#[test]
	fn tag_sets_are_tried_in_order() {
		let t = replica_set();
		let tags = |sets: &[&[(&str, &str)]]| sets.iter()
			.map(|set| set.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
			.collect::<Vec<TagSet>>();
		let select = |sets: Vec<TagSet>| hosts(suitable_servers(&t, &SelectionCriteria::ReadPreference(
			ReadPreference::new(ReadPreferenceMode::Secondary).with_tag_sets(sets))).unwrap());
		
		assert_eq!(select(tags(&[&[("dc", "sf")], &[("dc", "ny")]])), vec!["s2"]);
		assert_eq!(select(tags(&[&[("dc", "la")], &[("dc", "ny")]])), vec!["s1"]);
		assert_eq!(select(tags(&[&[("dc", "la")], &[]])), vec!["s1", "s2"]);
		assert!(select(tags(&[&[("dc", "la")]])).is_empty());
	}
	
	#[test]
	fn primary_with_tags_is_invalid() {
		let t = replica_set();
		let mut tags = TagSet::new();
		tags.insert("dc".to_string(), "ny".to_string());
		let criteria = SelectionCriteria::ReadPreference(ReadPreference::primary().with_tag_sets(vec![tags]));
		assert!(matches!(suitable_servers(&t, &criteria), Err(ServerSelectionError::InvalidCriteria { .. })));
	}
	
	#[test]
	fn max_staleness_with_primary() {
		let now = UNIX_EPOCH + Duration::from_secs(1_000_000);
		let with_write = |mut server: ServerDescription, lag: u64| {
			server.last_update_time = Some(now);
			server.last_write_date = Some(now - Duration::from_secs(lag));
			server
		};
		let t = TopologyDescription {
			heartbeat_frequency: Duration::from_secs(10),
			..topology(TopologyType::ReplicaSetWithPrimary, vec![
				with_write(server("p", ServerType::RSPrimary, 5), 0),
				with_write(server("fresh", ServerType::RSSecondary, 5), 20),
				with_write(server("stale", ServerType::RSSecondary, 5), 200)
			])
		};
		
		assert_eq!(staleness(&t, t.server(&address("fresh")).unwrap()), Some(Duration::from_secs(30)));
		assert_eq!(staleness(&t, t.server(&address("stale")).unwrap()), Some(Duration::from_secs(210)));
		
		let criteria = SelectionCriteria::ReadPreference(ReadPreference::new(ReadPreferenceMode::Nearest)
			.with_max_staleness(Duration::from_secs(100)));
		assert_eq!(hosts(suitable_servers(&t, &criteria).unwrap()), vec!["fresh", "p"]);
		
		let too_small = SelectionCriteria::ReadPreference(ReadPreference::new(ReadPreferenceMode::Secondary)
			.with_max_staleness(Duration::from_secs(15)));
		assert!(matches!(suitable_servers(&t, &too_small), Err(ServerSelectionError::InvalidCriteria { .. })));
	}
	
	#[test]
	fn max_staleness_without_primary() {
		let now = UNIX_EPOCH + Duration::from_secs(1_000_000);
		let with_write = |mut server: ServerDescription, lag: u64| {
			server.last_update_time = Some(now);
			server.last_write_date = Some(now - Duration::from_secs(lag));
			server
		};
		let t = topology(TopologyType::ReplicaSetNoPrimary, vec![
			with_write(server("a", ServerType::RSSecondary, 5), 0),
			with_write(server("b", ServerType::RSSecondary, 5), 100),
			with_write(server("c", ServerType::RSSecondary, 5), 30)
		]);
		
		let criteria = SelectionCriteria::ReadPreference(ReadPreference::new(ReadPreferenceMode::Secondary)
			.with_max_staleness(Duration::from_secs(90)));
		assert_eq!(hosts(suitable_servers(&t, &criteria).unwrap()), vec!["a", "c"]);
	}
	
	#[test]
	fn sharded_and_load_balanced() {
		let t = topology(TopologyType::Sharded, vec![
			server("m1", ServerType::Mongos, 5),
			server("u", ServerType::Unknown, 1)
		]);
		assert_eq!(hosts(suitable_servers(&t, &SelectionCriteria::Writable).unwrap()), vec!["m1"]);
		assert_eq!(hosts(suitable_servers(&t, &read(ReadPreferenceMode::Secondary)).unwrap()), vec!["m1"]);
		
		let mut lb = server("lb", ServerType::LoadBalancer, 0);
		lb.rtt = None;
		let t = topology(TopologyType::LoadBalanced, vec![lb]);
		assert_eq!(select_server(&t, &SelectionCriteria::Writable, THRESHOLD).unwrap().unwrap().address, address("lb"));
	}
	
	#[test]
	fn unknown_topology_selects_nothing() {
		let t = TopologyDescription::new(&ClusterOptions::from_str("mongodb://a,b").unwrap());
		assert!(select_server(&t, &read(ReadPreferenceMode::Nearest), THRESHOLD).unwrap().is_none());
	}
	
	#[test]
	fn incompatible_topology_fails() {
		let mut t = topology(TopologyType::Single, vec![server("a", ServerType::Standalone, 1)]);
		t.compatibility_error = Some(CompatibilityError::WireVersionTooOld { address: address("a"), max_wire_version: 2 });
		assert!(matches!(select_server(&t, &SelectionCriteria::Writable, THRESHOLD),
			Err(ServerSelectionError::Incompatible(_))));
	}
}

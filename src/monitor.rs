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

//! Server monitoring, see
//! https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-monitoring.rst

use {
	crate::{
		common::{ClusterOptions, Result, ServerSelectionConfig},
		apm::{Event, EventHandler},
		clock::Clock,
		pool::ConnectionPool,
		server::{RoundTripTime, ServerAddress, ServerDescription, ServerType, TopologyVersion},
		wire::{Connector, HandshakeReply, HandshakeRequest, Stream}
	},
	std::{
		fmt,
		str::FromStr,
		sync::{Arc, Mutex, Condvar, mpsc},
		time::{Duration, Instant}
	},
	log::{debug, info, warn}
};

/// Delay between checks after consecutive failed checks.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BackoffPolicy {
	/// Keep checking at the heartbeat frequency.
	Fixed,
	/// Double the delay with every failure, starting at `initial`, but never exceed `max`.
	Exponential { initial: Duration, max: Duration }
}

impl Default for BackoffPolicy {
	fn default() -> Self {
		Self::Fixed
	}
}

impl BackoffPolicy {
	pub fn delay(&self, heartbeat_frequency: Duration, consecutive_failures: u32) -> Duration {
		match *self {
			_ if consecutive_failures == 0 => heartbeat_frequency,
			Self::Fixed => heartbeat_frequency,
			Self::Exponential { initial, max } => {
				let factor = 1u32.checked_shl(consecutive_failures - 1).unwrap_or(u32::MAX);
				initial.checked_mul(factor).map_or(max, |delay| delay.min(max))
			}
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ServerMonitoringMode {
	Stream,
	Poll,
	/// Stream, unless running in a function-as-a-service environment.
	Auto
}

impl Default for ServerMonitoringMode {
	fn default() -> Self {
		Self::Auto
	}
}

impl FromStr for ServerMonitoringMode {
	type Err = ();
	
	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"stream" => Self::Stream,
			"poll"   => Self::Poll,
			"auto"   => Self::Auto,
			_ => return Err(())
		})
	}
}

impl fmt::Display for ServerMonitoringMode {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(match self {
			Self::Stream => "stream",
			Self::Poll   => "poll",
			Self::Auto   => "auto"
		})
	}
}

impl ServerMonitoringMode {
	pub fn is_streaming(self) -> bool {
		match self {
			Self::Stream => true,
			Self::Poll   => false,
			Self::Auto   => !is_faas()
		}
	}
}

fn is_faas() -> bool {
	let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
	var("AWS_EXECUTION_ENV").map_or(false, |v| v.starts_with("AWS_Lambda_"))
		|| ["AWS_LAMBDA_RUNTIME_API", "FUNCTIONS_WORKER_RUNTIME", "K_SERVICE", "FUNCTION_NAME", "VERCEL"]
			.iter()
			.any(|key| var(key).is_some())
}

/// Handle to the monitor threads of one server. The threads stop when the handle is stopped or dropped.
#[derive(Debug)]
pub struct Monitor(Arc<MonitorInner>);

#[derive(Debug)]
struct MonitorInner {
	address:         ServerAddress,
	config:          ServerSelectionConfig,
	connect_timeout: Duration,
	handshake:       HandshakeRequest,
	connector:       Arc<dyn Connector>,
	clock:           Arc<dyn Clock>,
	events:          EventHandler,
	pool:            Option<ConnectionPool>,
	signal:          Mutex<Signal>,
	wakeup:          Condvar,
	rtt:             Mutex<RoundTripTime>
}

#[derive(Debug, Default)]
struct Signal {
	check_requested: bool,
	stopped:         bool
}

impl Monitor {
	/// Spawns the monitor thread, which checks the server right away and sends every new
	/// description to `updates`.
	pub fn start(
		address:   ServerAddress,
		options:   &ClusterOptions,
		connector: Arc<dyn Connector>,
		clock:     Arc<dyn Clock>,
		events:    EventHandler,
		pool:      Option<ConnectionPool>,
		updates:   mpsc::Sender<ServerDescription>
	) -> Result<Self> {
		let inner = Arc::new(MonitorInner {
			config:          options.server_selection_config,
			connect_timeout: options.connect_timeout,
			handshake:       HandshakeRequest {
				appname: options.appname.clone(),
				..HandshakeRequest::default()
			},
			signal:          Mutex::new(Signal::default()),
			wakeup:          Condvar::new(),
			rtt:             Mutex::new(RoundTripTime::default()),
			address,
			connector,
			clock,
			events,
			pool
		});
		
		let cloned = inner.clone();
		std::thread::Builder::new()
			.name(format!("server-monitor-{}", inner.address))
			.spawn(move || cloned.run(updates))?;
		
		Ok(Self(inner))
	}
	
	/// Wakes up the monitor to check the server as soon as the min heartbeat frequency allows.
	pub fn request_check(&self) {
		if let Ok(mut signal) = self.0.signal.lock() {
			signal.check_requested = true;
			self.0.wakeup.notify_all();
		}
	}
	
	/// Signals the monitor threads to exit. A streaming check in progress is not interrupted;
	/// it returns within the heartbeat frequency.
	pub fn stop(&self) {
		let mut signal = match self.0.signal.lock() {
			Ok(signal) => signal,
			Err(poisoned) => poisoned.into_inner()
		};
		signal.stopped = true;
		self.0.wakeup.notify_all();
	}
	
	pub fn is_stopped(&self) -> bool {
		self.0.is_stopped()
	}
}

impl Drop for Monitor {
	fn drop(&mut self) {
		self.stop();
	}
}

impl MonitorInner {
	fn is_stopped(&self) -> bool {
		self.signal.lock().map_or(true, |signal| signal.stopped)
	}
	
	fn run(self: Arc<Self>, updates: mpsc::Sender<ServerDescription>) {
		let mut stream = None;
		let mut topology_version = None;
		let mut known = false;
		let mut failures = 0u32;
		let mut rtt_monitor_started = false;
		let streaming = self.config.monitoring_mode.is_streaming();
		
		while !self.is_stopped() {
			let start = self.clock.now();
			let mut description = self.check(&mut stream, if streaming { topology_version } else { None });
			
			if let Some(err) = &description.error {
				// a known server gets one immediate retry after a network error
				if known && err.is_network_error() && !self.is_stopped() {
					debug!("check of {} failed ({}), retrying", self.address, err);
					self.clear_pool();
					description = self.check(&mut stream, None);
				}
			}
			
			known = description.r#type != ServerType::Unknown;
			topology_version = description.topology_version;
			
			match &description.error {
				Some(err) => {
					failures += 1;
					info!("check of {} failed: {}", self.address, err);
					self.clear_pool();
				}
				None => failures = 0
			}
			
			if updates.send(description).is_err() {
				debug!("topology for {} is gone, stopping monitor", self.address);
				return;
			}
			
			if let (0, Some(pool)) = (failures, &self.pool) {
				if let Err(e) = pool.populate() {
					debug!("failed to populate pool for {}: {}", self.address, e);
				}
			}
			
			let streaming_active = streaming && stream.is_some() && topology_version.is_some();
			if streaming_active {
				if !rtt_monitor_started {
					rtt_monitor_started = true;
					self.start_rtt_monitor();
				}
				// the next awaitable check blocks on the server
				continue;
			}
			
			let interval = self.config.backoff.delay(self.config.heartbeat_frequency, failures);
			match self.wait(start, interval) {
				Ok(true) => (),
				Ok(false) => return,
				Err(e) => {
					warn!("monitor for {} died: {}", self.address, e);
					return;
				}
			}
		}
	}
	
	fn clear_pool(&self) {
		if let Some(pool) = &self.pool {
			if let Err(e) = pool.clear() {
				warn!("failed to clear pool for {}: {}", self.address, e);
			}
		}
	}
	
	/// Runs one check, opening a connection if there is none. With a topology version and an
	/// open connection, the check is an awaitable `hello`.
	fn check(&self, stream: &mut Option<Box<dyn Stream>>, topology_version: Option<TopologyVersion>) -> ServerDescription {
		let awaited = stream.is_some() && topology_version.is_some();
		self.events.dispatch(Event::ServerHeartbeatStarted { address: &self.address, awaited });
		
		let start = self.clock.now();
		let result = match (stream.as_mut(), topology_version) {
			(Some(stream), Some(version)) => stream.handshake(
				&self.handshake.awaitable(version, self.config.heartbeat_frequency)),
			(Some(stream), None) => stream.handshake(&self.handshake),
			(None, _) => self.connector.connect(&self.address, &self.handshake, self.connect_timeout)
				.map(|(new, reply)| {
					*stream = Some(new);
					reply
				})
		};
		let duration = self.clock.elapsed(start);
		
		match result {
			Ok(reply) => {
				self.events.dispatch(Event::ServerHeartbeatSucceeded { address: &self.address, duration, awaited });
				self.describe(reply, duration, awaited)
			}
			Err(e) => {
				self.events.dispatch(Event::ServerHeartbeatFailed {
					address: &self.address,
					failure: &e,
					duration,
					awaited
				});
				*stream = None;
				if let Ok(mut rtt) = self.rtt.lock() {
					rtt.reset();
				}
				ServerDescription::with_error(self.address.clone(), e, self.clock.system_time())
			}
		}
	}
	
	fn describe(&self, reply: HandshakeReply, duration: Duration, awaited: bool) -> ServerDescription {
		let rtt = match self.rtt.lock() {
			// the duration of an awaited check says nothing about the latency
			Ok(rtt) if awaited => rtt.average(),
			Ok(mut rtt) => Some(rtt.add_sample(duration)),
			Err(_) => Some(duration)
		};
		
		let now = self.clock.system_time();
		ServerDescription::from_reply(self.address.clone(), reply, rtt, now)
			.unwrap_or_else(|e| ServerDescription::with_error(self.address.clone(), e, now))
	}
	
	/// Blocks until `interval` after `last_check` passed, or until a requested check is allowed.
	/// Returns `false` if the monitor was stopped.
	fn wait(&self, last_check: Instant, interval: Duration) -> Result<bool> {
		let deadline = last_check + interval;
		let earliest = last_check + self.config.min_heartbeat_frequency;
		let mut signal = self.signal.lock()?;
		
		loop {
			if signal.stopped {
				return Ok(false);
			}
			
			let now = self.clock.now();
			if now >= deadline || (signal.check_requested && now >= earliest) {
				signal.check_requested = false;
				return Ok(true);
			}
			
			let until = if signal.check_requested { earliest.min(deadline) } else { deadline };
			signal = self.wakeup.wait_timeout(signal, until.saturating_duration_since(now))?.0;
		}
	}
	
	/// Spawns the thread measuring round trip times while checks are awaitable.
	fn start_rtt_monitor(self: &Arc<Self>) {
		let cloned = self.clone();
		if let Err(e) = std::thread::Builder::new()
			.name(format!("rtt-monitor-{}", self.address))
			.spawn(move || cloned.run_rtt_monitor()) {
			warn!("failed to start rtt monitor for {}: {}", self.address, e);
		}
	}
	
	fn run_rtt_monitor(self: Arc<Self>) {
		let mut stream: Option<Box<dyn Stream>> = None;
		
		while !self.is_stopped() {
			let start = self.clock.now();
			let result = match stream.as_mut() {
				Some(stream) => stream.handshake(&self.handshake),
				None => self.connector.connect(&self.address, &self.handshake, self.connect_timeout)
					.map(|(new, reply)| {
						stream = Some(new);
						reply
					})
			};
			
			match result {
				Ok(_) => if let Ok(mut rtt) = self.rtt.lock() {
					rtt.add_sample(self.clock.elapsed(start));
				},
				Err(e) => {
					debug!("rtt check of {} failed: {}", self.address, e);
					stream = None;
				}
			}
			
			match self.wait_stopped(start + self.config.heartbeat_frequency) {
				Ok(false) => (),
				_ => return
			}
		}
	}
	
	/// Blocks until `deadline` or until the monitor is stopped. Returns whether it was stopped.
	fn wait_stopped(&self, deadline: Instant) -> Result<bool> {
		let mut signal = self.signal.lock()?;
		loop {
			if signal.stopped {
				return Ok(true);
			}
			let now = self.clock.now();
			if now >= deadline {
				return Ok(false);
			}
			signal = self.wakeup.wait_timeout(signal, deadline - now)?.0;
		}
	}
}

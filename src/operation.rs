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

//! Running a command against the cluster: server selection, checkout, session bookkeeping and retries.

use {
	crate::{
		common::{ClusterOptions, Error, ReadPreference, Result, RETRYABLE_WRITE_ERROR, TRANSIENT_TRANSACTION_ERROR},
		clock::OperationContext,
		cluster::{Cluster, SelectedServer},
		select::SelectionCriteria,
		server::{ServerDescription, ServerType},
		session::{ClientSession, ClusterTime, SessionId, Timestamp, TransactionState},
		topology::TopologyType,
		wire::CommandReply
	},
	log::debug
};

/// What an operation does, which decides where it may run and whether it is retried.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OperationKind {
	Read(ReadPreference),
	Write,
	/// Part of the transaction of the session it runs on.
	Transactional(TransactionCommand)
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransactionCommand {
	/// A read or write in the transaction.
	Operation,
	Commit,
	Abort
}

impl OperationKind {
	pub fn criteria(&self) -> SelectionCriteria {
		match self {
			Self::Read(read_preference) => SelectionCriteria::ReadPreference(read_preference.clone()),
			Self::Write | Self::Transactional(_) => SelectionCriteria::Writable
		}
	}
	
	/// How often the operation may be attempted in total.
	pub fn max_attempts(&self, options: &ClusterOptions) -> usize {
		match self {
			Self::Read(_) if options.retry_reads => 2,
			Self::Write if options.retry_writes => 2,
			Self::Transactional(TransactionCommand::Commit) | Self::Transactional(TransactionCommand::Abort) => 2,
			_ => 1
		}
	}
	
	pub fn is_retryable_error(&self, error: &Error) -> bool {
		match self {
			Self::Read(_) => error.is_retryable(),
			Self::Write | Self::Transactional(_) => error.is_retryable() || error.has_label(RETRYABLE_WRITE_ERROR)
		}
	}
}

/// What the command encoder needs to know about an attempt.
#[derive(Debug)]
pub struct CommandContext<'a> {
	/// Starting at 1.
	pub attempt:            usize,
	pub server:             &'a ServerDescription,
	pub session_id:         Option<SessionId>,
	pub txn_number:         Option<i64>,
	/// The command is the first of a transaction.
	pub start_transaction:  bool,
	pub cluster_time:       Option<&'a ClusterTime>,
	pub after_cluster_time: Option<Timestamp>
}

/// Runs a command built by `encode` for every attempt.
///
/// Without a session, an implicit session is used if the deployment supports them. Writes
/// get a new transaction number once, which is reused by their retry. On a sharded or load
/// balanced deployment, the first operation of a transaction pins the session to its server,
/// and later operations of the transaction go to that server.
pub fn execute(
	cluster:    &Cluster,
	kind:       &OperationKind,
	session:    Option<&mut ClientSession>,
	ctx:        &OperationContext,
	mut encode: impl FnMut(&CommandContext) -> Vec<u8>
) -> Result<CommandReply> {
	let mut implicit;
	let session = match session {
		Some(session) => Some(session),
		None => {
			if let OperationKind::Transactional(_) = kind {
				return Err(Error::InvalidArgument("transactional operations require a session".to_string()));
			}
			implicit = cluster.start_implicit_session()?;
			implicit.as_mut()
		}
	};
	
	match (kind, session) {
		(OperationKind::Transactional(command @ TransactionCommand::Commit), Some(session))
		| (OperationKind::Transactional(command @ TransactionCommand::Abort), Some(session)) => {
			end_transaction(cluster, kind, *command, session, ctx, encode)
		}
		(kind, session) => run(cluster, kind, session, ctx, &mut encode)
	}
}

fn end_transaction(
	cluster:    &Cluster,
	kind:       &OperationKind,
	command:    TransactionCommand,
	session:    &mut ClientSession,
	ctx:        &OperationContext,
	mut encode: impl FnMut(&CommandContext) -> Vec<u8>
) -> Result<CommandReply> {
	let started = session.transaction_state() != TransactionState::Starting;
	match command {
		TransactionCommand::Commit => session.begin_commit()?,
		_ => session.begin_abort()?
	}
	
	// a transaction without operations was never sent to a server
	let result = if started {
		run(cluster, kind, Some(&mut *session), ctx, &mut encode)
	} else {
		Ok(CommandReply::default())
	};
	session.end_transaction();
	
	match (command, result) {
		(TransactionCommand::Abort, Err(e)) => {
			debug!("ignoring failure to abort transaction: {}", e);
			Ok(CommandReply::default())
		}
		(_, result) => result
	}
}

fn run(
	cluster:     &Cluster,
	kind:        &OperationKind,
	mut session: Option<&mut ClientSession>,
	ctx:         &OperationContext,
	encode:      &mut dyn FnMut(&CommandContext) -> Vec<u8>
) -> Result<CommandReply> {
	let mut max_attempts = kind.max_attempts(&cluster.options);
	let mut txn_number = match (kind, session.as_deref()) {
		(OperationKind::Transactional(_), Some(session)) => Some(session.txn_number()),
		_ => None
	};
	
	if let (OperationKind::Transactional(TransactionCommand::Operation), Some(session)) = (kind, session.as_deref()) {
		if !session.in_transaction() {
			return Err(Error::Transaction("no transaction started".to_string()));
		}
	}
	
	// a session is only pinned for the duration of a transaction
	if let Some(session) = session.as_deref_mut() {
		if !session.in_transaction() && session.transaction_state() == TransactionState::NoTransaction {
			session.unpin();
		}
	}
	
	let mut first_error = None;
	for attempt in 1..=max_attempts {
		ctx.check()?;
		
		let server = match cluster.select_server_for_session(&kind.criteria(), session.as_deref(), ctx) {
			Ok(server) => server,
			// a retry that finds no server reports the first error
			Err(e) => return Err(first_error.unwrap_or(e))
		};
		
		if let (1, OperationKind::Write) = (attempt, kind) {
			if let Some(session) = session.as_deref_mut() {
				if cluster.options.retry_writes && !session.in_transaction()
					&& supports_retryable_writes(&server.description) {
					txn_number = Some(session.next_txn_number());
				}
			}
			// only writes with a transaction number are retried
			if txn_number.is_none() {
				max_attempts = 1;
			}
		}
		
		let result = attempt_on(cluster, kind, &server, session.as_deref_mut(), ctx, attempt, txn_number, encode);
		match result {
			Ok(reply) => return Ok(reply),
			Err(e) if attempt < max_attempts && kind.is_retryable_error(&e) => {
				debug!("attempt {} on {} failed, retrying: {}", attempt, server.id, e);
				first_error.get_or_insert(e);
			}
			Err(e) => return Err(first_error.unwrap_or(e))
		}
	}
	
	Err(first_error.unwrap_or(Error::InvalidArgument("operation may not be attempted".to_string())))
}

/// Standalone servers do not accept transaction numbers.
fn supports_retryable_writes(server: &ServerDescription) -> bool {
	server.r#type != ServerType::Standalone && server.logical_session_timeout_minutes.is_some()
}

#[allow(clippy::too_many_arguments)]
fn attempt_on(
	cluster:     &Cluster,
	kind:        &OperationKind,
	server:      &SelectedServer,
	mut session: Option<&mut ClientSession>,
	ctx:         &OperationContext,
	attempt:     usize,
	txn_number:  Option<i64>,
	encode:      &mut dyn FnMut(&CommandContext) -> Vec<u8>
) -> Result<CommandReply> {
	let mut connection = cluster.checkout(server, ctx)?;
	let generation = connection.generation();
	
	let starting = matches!(kind, OperationKind::Transactional(_))
		&& session.as_deref().map_or(false, |s| s.transaction_state() == TransactionState::Starting);
	if let (true, Some(session)) = (starting, session.as_deref_mut()) {
		if matches!(cluster.description().r#type, TopologyType::Sharded | TopologyType::LoadBalanced) {
			session.pin(server.id.clone());
		}
	}
	
	let command = encode(&CommandContext {
		server:             &server.description,
		session_id:         session.as_deref().map(ClientSession::id),
		start_transaction:  starting,
		cluster_time:       session.as_deref().and_then(ClientSession::cluster_time),
		after_cluster_time: match kind {
			OperationKind::Read(_) => session.as_deref().and_then(ClientSession::after_cluster_time),
			_ => None
		},
		attempt,
		txn_number
	});
	
	let timeout = ctx.remaining(std::time::Instant::now());
	let result = connection.send_command(&command, timeout)
		.and_then(|reply| {
			if let Some(session) = session.as_deref_mut() {
				session.process_reply(&reply);
			}
			match &reply.error {
				Some(err) => Err(Error::Command(err.clone())),
				None => Ok(reply)
			}
		});
	drop(connection);
	
	match result {
		Ok(reply) => {
			if let (true, Some(session)) = (starting, session) {
				session.transaction_started();
			}
			Ok(reply)
		}
		Err(e) => {
			cluster.handle_application_error(&server.id.address, &e, generation, false)?;
			if let Some(session) = session {
				if e.is_network_error() || e.is_network_timeout() {
					session.mark_dirty();
				}
				if session.in_transaction() && e.has_label(TRANSIENT_TRANSACTION_ERROR) {
					session.unpin();
				}
			}
			Err(e)
		}
	}
}

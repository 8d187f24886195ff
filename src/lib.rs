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

//! Server discovery and monitoring, server selection and connection pooling for MongoDB deployments.
//!
//! A [`Cluster`] monitors every server of a deployment on a background thread per server, folds
//! the results into a [`topology::TopologyDescription`] and keeps a connection pool per server.
//! Operations select a server with [`Cluster::select_server`] and run through
//! [`operation::execute`], which takes care of sessions, transaction pinning and retries.
//! The wire protocol itself is provided by the user as a [`wire::Connector`].

#![warn(clippy::all)]
#![forbid(unsafe_code)]

pub use self::{
	common::*,
	cluster::{Cluster, ClusterKey, ClusterRegistry, SelectedServer},
	clock::OperationContext,
	operation::{execute, CommandContext, OperationKind, TransactionCommand},
	select::{SelectionCriteria, ServerSelectionError},
	server::{ServerAddress, ServerDescription, ServerType},
	session::{ClientSession, SessionOptions},
	topology::{TopologyDescription, TopologyType}
};

pub mod apm;
pub mod clock;
pub mod cluster;
pub mod common;
pub mod monitor;
pub mod operation;
pub mod pool;
pub mod select;
pub mod server;
pub mod session;
pub mod topology;
pub mod wire;

#[cfg(test)]
mod mock;

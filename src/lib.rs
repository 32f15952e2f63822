// soulseek-core - Network and concurrency substrate for a Soulseek peer-to-peer client
// Copyright (C) 2024  soulseek-core contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Network and concurrency substrate for a Soulseek peer-to-peer client:
//! server session, peer connection manager, distributed search mesh,
//! transfer engine, and the framed message dispatch tying them together.
//!
//! This crate deliberately stops short of a thin client facade
//! (method-per-operation) - that's glue a host application writes over
//! the managers below, wiring its own resolvers and diagnostic sink in.
//! What's exported here is everything those managers need: connection
//! primitives, the wire protocol, the waiter registry, and the
//! capability traits a host implements to answer browse/search/transfer
//! requests.

pub mod acceptor_loop;
pub mod callbacks;
pub mod config;
pub mod diagnostics;
pub mod distributed_manager;
pub mod error;
pub mod events;
pub mod handlers;
pub mod net;
pub mod peer_manager;
pub mod protocol;
pub mod server_session;
pub mod transfer;
pub mod util;
pub mod wait;

pub use acceptor_loop::run_acceptor_loop;
pub use callbacks::{DefaultCallbacks, DownloadEnqueueException};
pub use config::SlskOptions;
pub use diagnostics::{DiagnosticEvent, DiagnosticLevel, DiagnosticSink, LoggingDiagnosticSink};
pub use distributed_manager::{DistributedManager, DistributedManagerOptions};
pub use error::{SlskError, SlskResult};
pub use events::ClientEvent;
pub use net::{Acceptor, Accepted, Connection, ConnectionOptions, ConnectionType};
pub use peer_manager::PeerConnectionManager;
pub use server_session::{ServerSession, ServerSessionOptions};
pub use transfer::{TransferManager, TransferManagerOptions};
pub use wait::{WaitKey, WaiterRegistry};

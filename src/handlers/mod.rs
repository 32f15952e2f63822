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

//! Per-code dispatch for each connection class. Every demux loop that
//! owns a socket (server session, peer connections, distributed
//! connections) calls into exactly one of these modules per received
//! frame; none of them spawn fire-and-forget work.

pub mod distributed;
pub mod peer;
pub mod server;

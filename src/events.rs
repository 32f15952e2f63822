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

//! Events surfaced to the host application over a single multi-producer
//! channel supplied at construction.

use std::time::Duration;

#[derive(Debug, Clone)]
pub enum TransferState {
    Queued,
    Initializing,
    Transferring,
    Completed,
    Errored,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub username: String,
    pub filename: String,
    pub bytes_transferred: u64,
    pub elapsed: Duration,
    pub state: TransferState,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    PrivilegedUsersList(Vec<String>),
    PrivilegeNotification { id: u32 },
    RoomJoined { room: String },
    RoomLeft { room: String },
    RoomMessage { room: String, username: String, message: String },
    UserStatusChanged { username: String, status: i32, privileged: bool },
    PrivateMessageReceived { id: u32, username: String, message: String },
    KickedFromServer,
    Diagnostic(crate::diagnostics::DiagnosticEvent),
    TransferProgress(TransferProgress),
    ConnectionStateChanged {
        connection: &'static str,
        username: Option<String>,
        connected: bool,
        reason: Option<String>,
    },
    SearchResultReceived {
        username: String,
        token: i32,
        files: Vec<crate::protocol::FileEntry>,
        has_free_upload_slot: bool,
        upload_speed: u32,
    },
    TransferRequested {
        username: String,
        token: i32,
        filename: String,
        size: u64,
        direction: crate::protocol::peer::TransferDirection,
    },
    DownloadQueueFailed { username: String, filename: String, reason: String },
}

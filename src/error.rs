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

//! Crate-wide error taxonomy.
//!
//! One enum for every failure tag named in the design: protocol parsing,
//! transport, login, waiters, transfers and argument validation. Handlers
//! that operate on peer/distributed connections log and recover from these;
//! the server session treats its own connection errors as fatal to the
//! session (see `ServerSession`).

use crate::wait::WaitKey;

#[derive(Debug, thiserror::Error)]
pub enum SlskError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message")]
    MalformedMessage,

    #[error("unrecognised code {code} in scope {scope}")]
    UnrecognisedCode { scope: &'static str, code: u32 },

    #[error("unknown solicitation token")]
    UnknownSolicitation,

    #[error("unrecognised connection initialisation")]
    UnrecognisedInitialisation,

    #[error("connection timed out")]
    ConnectionTimeout,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("inactivity timeout")]
    InactivityTimeout,

    #[error("login failed: {reason}")]
    LoginFailed { reason: String },

    #[error("not logged in")]
    NotLoggedIn,

    #[error("wait timed out")]
    WaitTimeout,

    #[error("wait canceled")]
    WaitCanceled,

    #[error("wait key collision: {0:?}")]
    WaitKeyCollision(WaitKey),

    #[error("transfer rejected: {reason}")]
    TransferRejected { reason: String },

    #[error("transfer failed")]
    TransferFailed,

    #[error("invalid argument {name}: {constraint}")]
    InvalidArgument {
        name: &'static str,
        constraint: &'static str,
    },

    #[error("download enqueue failed: {message}")]
    DownloadEnqueueFailed { message: String },

    #[error("connection establishment failed")]
    ConnectionFailed,

    #[error("child limit reached")]
    ChildLimitReached,
}

pub type SlskResult<T> = std::result::Result<T, SlskError>;

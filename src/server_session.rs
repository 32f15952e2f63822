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

//! Server session: the single connection to the Soulseek server.
//! Owns the login handshake, the 30-second keepalive, status maintenance,
//! and the demux/drain loop pair that every other manager's outbound
//! traffic rides on through a shared `server_tx` channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::diagnostics::{DiagnosticEvent, DiagnosticLevel, DiagnosticSink};
use crate::distributed_manager::DistributedManager;
use crate::error::{SlskError, SlskResult};
use crate::events::ClientEvent;
use crate::handlers::server::{dispatch, ServerDispatchContext};
use crate::net::connection::{Connection, ConnectionOptions, ConnectionType, ConnectionReader, ConnectionWriter};
use crate::protocol::server::{
    HaveNoParent, LoginRequest, LoginResponse, ServerPing, SetListenPort, SetOnlineStatus,
};
use crate::wait::{WaitKey, WaiterRegistry};

pub struct ServerSessionOptions {
    pub username: String,
    pub password: String,
    pub client_version: u32,
    pub listen_port: u16,
    pub message_timeout: Duration,
    pub ping_interval: Duration,
    pub auto_acknowledge_private_messages: bool,
    pub auto_acknowledge_privilege_notifications: bool,
}

impl Default for ServerSessionOptions {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            client_version: 157,
            listen_port: 2234,
            message_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
            auto_acknowledge_private_messages: false,
            auto_acknowledge_privilege_notifications: false,
        }
    }
}

/// Handle to a logged-in server connection. Dropping it does not close the
/// connection - call [`ServerSession::shutdown`] explicitly, the same way
/// the managers that share its `server_tx` must be torn down explicitly.
pub struct ServerSession {
    server_tx: mpsc::UnboundedSender<Bytes>,
    waiters: Arc<WaiterRegistry>,
    cancel: CancellationToken,
}

impl ServerSession {
    /// Connects, logs in, and spawns the keepalive/read/write loops. The
    /// returned `JoinHandle` completes when the demux loop exits, i.e. when
    /// the connection drops or `shutdown` is called.
    pub async fn connect(
        endpoint: SocketAddr,
        options: ServerSessionOptions,
        connection_options: ConnectionOptions,
        distributed: Arc<DistributedManager>,
        events: mpsc::UnboundedSender<ClientEvent>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> SlskResult<(Arc<ServerSession>, JoinHandle<()>)> {
        let connection = Connection::connect(ConnectionType::Server, endpoint, connection_options).await?;
        let (reader, writer) = connection.split();

        let waiters = Arc::new(WaiterRegistry::new());
        let (server_tx, server_rx) = mpsc::unbounded_channel::<Bytes>();
        let cancel = CancellationToken::new();

        tokio::spawn(write_loop(writer, server_rx, cancel.clone()));

        let ctx = ServerDispatchContext {
            waiters: waiters.clone(),
            distributed,
            events: events.clone(),
            server_tx: server_tx.clone(),
            auto_acknowledge_private_messages: options.auto_acknowledge_private_messages,
            auto_acknowledge_privilege_notifications: options.auto_acknowledge_privilege_notifications,
        };
        let read_handle = tokio::spawn(read_loop(reader, ctx, cancel.clone(), diagnostics));

        let login_wait = waiters.wait::<LoginResponse>(WaitKey::Login, options.message_timeout)?;
        server_tx
            .send(
                LoginRequest {
                    username: &options.username,
                    password: &options.password,
                    client_version: options.client_version,
                }
                .to_bytes(),
            )
            .map_err(|_| SlskError::ConnectionFailed)?;

        match login_wait.await? {
            LoginResponse::Success { .. } => {}
            LoginResponse::Failure { reason } => {
                cancel.cancel();
                return Err(SlskError::LoginFailed { reason });
            }
        }

        let _ = server_tx.send(SetListenPort { port: options.listen_port as u32 }.to_bytes());
        let _ = server_tx.send(HaveNoParent { have_no_parent: true }.to_bytes());

        tokio::spawn(ping_loop(server_tx.clone(), options.ping_interval, cancel.clone()));

        Ok((
            Arc::new(Self {
                server_tx,
                waiters,
                cancel,
            }),
            read_handle,
        ))
    }

    pub fn server_tx(&self) -> mpsc::UnboundedSender<Bytes> {
        self.server_tx.clone()
    }

    pub fn waiters(&self) -> Arc<WaiterRegistry> {
        self.waiters.clone()
    }

    pub fn set_online_status(&self, status: i32) -> SlskResult<()> {
        self.server_tx
            .send(SetOnlineStatus { status }.to_bytes())
            .map_err(|_| SlskError::ConnectionFailed)
    }

    /// Stops the read/write/ping loops and fails every outstanding waiter.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.waiters.cancel_all();
    }
}

async fn ping_loop(server_tx: mpsc::UnboundedSender<Bytes>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; skip it
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if server_tx.send(ServerPing.to_bytes()).is_err() {
                    return;
                }
            }
        }
    }
}

async fn write_loop(mut writer: ConnectionWriter, mut rx: mpsc::UnboundedReceiver<Bytes>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            frame = rx.recv() => {
                let Some(frame) = frame else { return };
                if writer.write_frame(frame.slice(4..)).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn read_loop(
    mut reader: ConnectionReader,
    ctx: ServerDispatchContext,
    cancel: CancellationToken,
    diagnostics: Arc<dyn DiagnosticSink>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            frame = reader.read_frame() => {
                let bytes = match frame {
                    Ok(bytes) => bytes,
                    Err(_) => {
                        ctx.waiters.cancel_all();
                        return;
                    }
                };
                let Ok((code, body)) = crate::protocol::decode_frame(&bytes) else { continue };
                if let Err(e) = dispatch(code, body, &ctx, &cancel).await {
                    diagnostics.emit(DiagnosticEvent::new(
                        DiagnosticLevel::Warning,
                        format!("server dispatch failed for code {code}: {e}"),
                    ));
                }
            }
        }
    }
}

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

//! Peer connection manager: solicits and accepts peer message and
//! transfer connections, keyed by username, coalescing concurrent callers
//! onto one establishment attempt per peer via a per-username lock -
//! scoped per key rather than globally, since establishment genuinely is
//! per-user work.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::callbacks::UserEndPointCache;
use crate::error::{SlskError, SlskResult};
use crate::events::ClientEvent;
use crate::net::connection::{Connection, ConnectionOptions, ConnectionType, TransferConnection};
use crate::protocol::peer::PeerInit;
use crate::protocol::server::{ConnectToPeer, GetPeerAddress};
use crate::util::TokenCounter;
use crate::wait::{WaitKey, WaiterRegistry};

/// Solicitation payload delivered by the listener/acceptor once an
/// indirect `PierceFirewall` connection arrives.
pub type PierceFirewallPayload = (TcpStream, SocketAddr);

/// How long a resolved endpoint is trusted before `send_message` asks the
/// server again, via `UserEndPointCache::set`.
const ENDPOINT_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

pub struct PeerConnectionManager {
    self_username: String,
    tokens: Arc<TokenCounter>,
    waiters: Arc<WaiterRegistry>,
    server_tx: mpsc::UnboundedSender<Bytes>,
    endpoint_cache: Arc<dyn UserEndPointCache>,
    message_connections: Arc<AsyncMutex<HashMap<String, Connection>>>,
    establishment_locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    transfer_connections: AsyncMutex<HashMap<(String, i32), TransferConnection>>,
    peer_options: ConnectionOptions,
    message_timeout: Duration,
    /// Fed to every `Connection` this manager constructs, so a disconnect
    /// anywhere in `message_connections` is noticed here, not just on the
    /// next opportunistic write.
    connection_events: mpsc::UnboundedSender<ClientEvent>,
}

impl PeerConnectionManager {
    pub fn new(
        self_username: String,
        tokens: Arc<TokenCounter>,
        waiters: Arc<WaiterRegistry>,
        server_tx: mpsc::UnboundedSender<Bytes>,
        endpoint_cache: Arc<dyn UserEndPointCache>,
        events: mpsc::UnboundedSender<ClientEvent>,
        peer_options: ConnectionOptions,
        message_timeout: Duration,
    ) -> Self {
        let message_connections = Arc::new(AsyncMutex::new(HashMap::new()));
        let connection_events = spawn_disconnect_purge(message_connections.clone(), events);
        Self {
            self_username,
            tokens,
            waiters,
            server_tx,
            endpoint_cache,
            message_connections,
            establishment_locks: AsyncMutex::new(HashMap::new()),
            transfer_connections: AsyncMutex::new(HashMap::new()),
            peer_options,
            message_timeout,
            connection_events,
        }
    }

    async fn lock_for(&self, username: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.establishment_locks.lock().await;
        locks
            .entry(username.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn has_message_connection(&self, username: &str) -> bool {
        self.message_connections.lock().await.contains_key(username)
    }

    /// Resolves `username`'s endpoint: the caller's value if given,
    /// otherwise the endpoint cache, otherwise a `GetPeerAddress` round
    /// trip to the server (cached afterward so repeat sends skip it).
    async fn resolve_endpoint(&self, username: &str, endpoint: Option<SocketAddr>) -> SlskResult<SocketAddr> {
        if let Some(endpoint) = endpoint {
            return Ok(endpoint);
        }
        if let Some(cached) = self.endpoint_cache.get(username).await {
            return Ok(cached);
        }

        let key = WaitKey::GetPeerAddress(username.to_string());
        let wait = self.waiters.wait::<SocketAddr>(key, self.message_timeout)?;
        self.server_tx
            .send(GetPeerAddress { username }.to_bytes())
            .map_err(|_| SlskError::ConnectionFailed)?;
        let resolved = wait.await?;
        self.endpoint_cache.set(username, resolved, ENDPOINT_CACHE_TTL).await;
        Ok(resolved)
    }

    /// Ensures a healthy message connection exists for `username`, racing a
    /// direct dial against an indirect `ConnectToPeer` solicitation, and
    /// sends `bytes` over it. `endpoint` is a hint; when absent it is
    /// resolved via the endpoint cache or a server round trip.
    pub async fn send_message(
        &self,
        username: &str,
        endpoint: Option<SocketAddr>,
        bytes: Bytes,
        cancel: &CancellationToken,
    ) -> SlskResult<()> {
        let per_user_lock = self.lock_for(username).await;
        let _guard = per_user_lock.lock().await;

        if !self.has_message_connection(username).await {
            let endpoint = self.resolve_endpoint(username, endpoint).await?;
            let conn = self.establish(username, endpoint, cancel).await?;
            self.message_connections
                .lock()
                .await
                .insert(username.to_string(), conn);
        }

        let mut table = self.message_connections.lock().await;
        let Some(conn) = table.get_mut(username) else {
            return Err(SlskError::ConnectionFailed);
        };
        if let Err(e) = conn.write_frame(bytes).await {
            table.remove(username);
            return Err(e);
        }
        Ok(())
    }

    async fn establish(
        &self,
        username: &str,
        endpoint: SocketAddr,
        cancel: &CancellationToken,
    ) -> SlskResult<Connection> {
        let token = self.tokens.next();

        let direct = {
            let username = username.to_string();
            let self_username = self.self_username.clone();
            let options = self.peer_options.clone();
            let events = self.connection_events.clone();
            tokio::spawn(async move {
                let mut conn =
                    Connection::connect(ConnectionType::PeerMessage, endpoint, options).await?;
                conn.set_username(username);
                let mut conn = conn.with_events(events);
                let init = PeerInit {
                    username: &self_username,
                    connection_type: "P",
                    token,
                }
                .to_bytes();
                conn.write_frame(init.slice(4..)).await?;
                Ok::<Connection, SlskError>(conn)
            })
        };

        let indirect = {
            let username = username.to_string();
            let server_tx = self.server_tx.clone();
            let waiters = self.waiters.clone();
            let options = self.peer_options.clone();
            let timeout = self.message_timeout;
            let events = self.connection_events.clone();
            tokio::spawn(async move {
                let request = ConnectToPeer {
                    token,
                    username: &username,
                    connection_type: "P",
                }
                .to_bytes();
                server_tx
                    .send(request)
                    .map_err(|_| SlskError::ConnectionFailed)?;

                let key = WaitKey::SolicitedPeerConnection(username.clone(), token);
                let (stream, remote) = waiters
                    .wait::<PierceFirewallPayload>(key, timeout)?
                    .await?;
                let conn =
                    Connection::from_stream(ConnectionType::PeerMessage, stream, remote, Some(username), options)
                        .with_events(events);
                Ok::<Connection, SlskError>(conn)
            })
        };

        tokio::pin!(direct);
        tokio::pin!(indirect);

        let mut direct_failed = false;
        let mut indirect_failed = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    direct.abort();
                    indirect.abort();
                    return Err(SlskError::WaitCanceled);
                }
                d = &mut direct, if !direct_failed => {
                    match d {
                        Ok(Ok(conn)) => { indirect.abort(); return Ok(conn); }
                        _ if indirect_failed => return Err(SlskError::ConnectionFailed),
                        _ => direct_failed = true,
                    }
                }
                i = &mut indirect, if !indirect_failed => {
                    match i {
                        Ok(Ok(conn)) => { direct.abort(); return Ok(conn); }
                        _ if direct_failed => return Err(SlskError::ConnectionFailed),
                        _ => indirect_failed = true,
                    }
                }
            }
        }
    }

    /// Adopts an incoming socket as the message connection for `username`,
    /// replacing any existing entry atomically.
    pub async fn add_message_connection(&self, username: String, stream: TcpStream, remote: SocketAddr) {
        let conn = Connection::from_stream(
            ConnectionType::Incoming,
            stream,
            remote,
            Some(username.clone()),
            self.peer_options.clone(),
        )
        .with_events(self.connection_events.clone());
        self.message_connections.lock().await.insert(username, conn);
    }

    /// Completes `WaitKey(IncomingTransfer, username, token)` for a caller
    /// blocked in `await_transfer_connection`.
    pub fn add_transfer_connection(&self, username: &str, token: i32, stream: TcpStream, remote: SocketAddr) {
        self.waiters.complete(
            &WaitKey::IncomingTransfer(username.to_string(), token),
            (stream, remote),
        );
    }

    pub async fn await_transfer_connection(
        &self,
        username: &str,
        token: i32,
        timeout: Duration,
    ) -> SlskResult<TransferConnection> {
        let key = WaitKey::IncomingTransfer(username.to_string(), token);
        let (stream, remote) = self
            .waiters
            .wait::<PierceFirewallPayload>(key, timeout)?
            .await?;
        let raw = crate::net::connection::RawConnection::from_stream(
            stream,
            remote,
            self.peer_options.clone(),
        )
        .with_events(self.connection_events.clone());
        Ok(raw.into_transfer(token))
    }

    pub async fn remove_and_dispose(&self, username: &str) {
        if let Some(mut conn) = self.message_connections.lock().await.remove(username) {
            conn.disconnect();
        }
    }
}

/// Spawns the background task that turns a connection's own
/// `ConnectionStateChanged` report into a synchronous table purge,
/// rather than leaving a disconnected peer's entry in `message_connections`
/// until the next opportunistic write notices it. Forwards every event on
/// to `events` afterward so the host still observes it.
fn spawn_disconnect_purge(
    message_connections: Arc<AsyncMutex<HashMap<String, Connection>>>,
    events: mpsc::UnboundedSender<ClientEvent>,
) -> mpsc::UnboundedSender<ClientEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ClientEvent>();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let ClientEvent::ConnectionStateChanged {
                username: Some(username),
                connected: false,
                ..
            } = &event
            {
                message_connections.lock().await.remove(username);
            }
            let _ = events.send(event);
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::DefaultCallbacks;
    use crate::util::TokenCounter;
    use bytes::Buf;

    fn manager() -> PeerConnectionManager {
        let (server_tx, _server_rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        PeerConnectionManager::new(
            "self".into(),
            Arc::new(TokenCounter::starting_at(0)),
            Arc::new(WaiterRegistry::new()),
            server_tx,
            Arc::new(DefaultCallbacks),
            events_tx,
            ConnectionOptions::default(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn no_message_connection_initially() {
        let mgr = manager();
        assert!(!mgr.has_message_connection("alice").await);
    }

    #[tokio::test]
    async fn incoming_connection_is_adopted_and_replaces_existing() {
        let mgr = manager();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        let (stream, remote) = accept.unwrap();
        let _client = connect.unwrap();

        mgr.add_message_connection("alice".into(), stream, remote).await;
        assert!(mgr.has_message_connection("alice").await);

        mgr.remove_and_dispose("alice").await;
        assert!(!mgr.has_message_connection("alice").await);
    }

    #[tokio::test]
    async fn send_message_survives_a_fast_direct_refusal_via_indirect_path() {
        // Bind then drop a listener so the direct dial fails with an
        // immediate ECONNREFUSED; the indirect ConnectToPeer/PierceFirewall
        // path must still be given a chance to complete the connection.
        let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let unreachable = dead.local_addr().unwrap();
        drop(dead);

        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let waiters = Arc::new(WaiterRegistry::new());
        let mgr = Arc::new(PeerConnectionManager::new(
            "self".into(),
            Arc::new(TokenCounter::starting_at(0)),
            waiters.clone(),
            server_tx,
            Arc::new(DefaultCallbacks),
            events_tx,
            ConnectionOptions::default(),
            Duration::from_secs(5),
        ));

        let cancel = CancellationToken::new();
        let send = tokio::spawn({
            let mgr = mgr.clone();
            let cancel = cancel.clone();
            async move {
                mgr.send_message("dave", Some(unreachable), Bytes::from_static(b"hi"), &cancel)
                    .await
            }
        });

        let solicitation = server_rx.recv().await.unwrap();
        let (_code, mut body) = crate::protocol::decode_frame(&solicitation).unwrap();
        let token = body.get_i32_le();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        let (inbound_stream, inbound_remote) = accept.unwrap();
        drop(connect.unwrap());

        waiters.complete(
            &WaitKey::SolicitedPeerConnection("dave".into(), token),
            (inbound_stream, inbound_remote),
        );

        send.await.unwrap().unwrap();
        assert!(mgr.has_message_connection("dave").await);
    }
}

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

//! Distributed manager: parent link, child set, branch bookkeeping,
//! and search-request forwarding across the mesh.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::callbacks::{SearchResponseCache, SearchResponseResolver};
use crate::error::{SlskError, SlskResult};
use crate::events::ClientEvent;
use crate::net::connection::{Connection, ConnectionOptions, ConnectionType};
use crate::peer_manager::PeerConnectionManager;
use crate::protocol::distributed::{BranchLevel, BranchRoot, SearchRequestMessage};
use crate::protocol::peer::PeerInit;
use crate::protocol::server::{BranchLevel as ServerBranchLevel, BranchRoot as ServerBranchRoot, ConnectToPeer, HaveNoParent, ParentIp};
use crate::util::{LastSeenHash, TokenCounter};
use crate::wait::{WaitKey, WaiterRegistry};

struct ParentLink {
    username: String,
    connection: Connection,
}

struct ChildEntry {
    connection: Connection,
    last_seen: LastSeenHash,
    depth: u32,
}

pub struct DistributedManagerOptions {
    pub accept_children: bool,
    pub child_limit: usize,
    pub deduplicate_search_requests: bool,
    pub message_timeout: Duration,
}

pub struct DistributedManager {
    self_username: String,
    tokens: Arc<TokenCounter>,
    waiters: Arc<WaiterRegistry>,
    server_tx: mpsc::UnboundedSender<Bytes>,
    peer_manager: Arc<PeerConnectionManager>,
    search_resolver: Arc<dyn SearchResponseResolver>,
    search_response_cache: Arc<dyn SearchResponseCache>,
    connection_options: ConnectionOptions,
    opts: DistributedManagerOptions,

    parent: Arc<AsyncMutex<Option<ParentLink>>>,
    parent_dedup: AsyncMutex<LastSeenHash>,
    children: Arc<AsyncMutex<HashMap<String, ChildEntry>>>,
    branch_level: AtomicI32,
    branch_root: AsyncMutex<String>,
    /// Fed to every parent/child `Connection` this manager constructs, so a
    /// disconnect is noticed here rather than only on the next write that
    /// happens to touch that entry.
    connection_events: mpsc::UnboundedSender<ClientEvent>,
}

impl DistributedManager {
    pub fn new(
        self_username: String,
        tokens: Arc<TokenCounter>,
        waiters: Arc<WaiterRegistry>,
        server_tx: mpsc::UnboundedSender<Bytes>,
        peer_manager: Arc<PeerConnectionManager>,
        search_resolver: Arc<dyn SearchResponseResolver>,
        search_response_cache: Arc<dyn SearchResponseCache>,
        events: mpsc::UnboundedSender<ClientEvent>,
        connection_options: ConnectionOptions,
        opts: DistributedManagerOptions,
    ) -> Self {
        let branch_root = AsyncMutex::new(self_username.clone());
        let parent = Arc::new(AsyncMutex::new(None));
        let children = Arc::new(AsyncMutex::new(HashMap::new()));
        let connection_events = spawn_disconnect_purge(parent.clone(), children.clone(), events);
        Self {
            self_username,
            tokens,
            waiters,
            server_tx,
            peer_manager,
            search_resolver,
            search_response_cache,
            connection_options,
            opts,
            parent,
            parent_dedup: AsyncMutex::new(LastSeenHash::default()),
            children,
            branch_level: AtomicI32::new(0),
            branch_root,
            connection_events,
        }
    }

    pub fn branch_level(&self) -> i32 {
        self.branch_level.load(Ordering::Relaxed)
    }

    pub async fn branch_root(&self) -> String {
        self.branch_root.lock().await.clone()
    }

    pub async fn child_count(&self) -> usize {
        self.children.lock().await.len()
    }

    pub async fn has_parent(&self) -> bool {
        self.parent.lock().await.is_some()
    }

    /// Attempts candidates in order (the server's `NetInfo` list) until one
    /// succeeds; falls back to self-promotion as root if none do.
    pub async fn select_parent(&self, candidates: &[(String, SocketAddr)], cancel: &CancellationToken) {
        let _ = self.server_tx.send(HaveNoParent { have_no_parent: true }.to_bytes());

        for (username, endpoint) in candidates {
            if cancel.is_cancelled() {
                break;
            }
            match self.try_parent(username, *endpoint, cancel).await {
                Ok(()) => return,
                Err(_) => continue,
            }
        }

        self.promote_self_as_root().await;
    }

    async fn try_parent(
        &self,
        username: &str,
        endpoint: SocketAddr,
        cancel: &CancellationToken,
    ) -> SlskResult<()> {
        let token = self.tokens.next();

        let direct = {
            let username = username.to_string();
            let self_username = self.self_username.clone();
            let options = self.connection_options.clone();
            let events = self.connection_events.clone();
            tokio::spawn(async move {
                let mut conn =
                    Connection::connect(ConnectionType::DistributedMessage, endpoint, options).await?;
                conn.set_username(username);
                let mut conn = conn.with_events(events);
                let init = PeerInit {
                    username: &self_username,
                    connection_type: "D",
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
            let options = self.connection_options.clone();
            let timeout = self.opts.message_timeout;
            let events = self.connection_events.clone();
            tokio::spawn(async move {
                let request = ConnectToPeer {
                    token,
                    username: &username,
                    connection_type: "D",
                }
                .to_bytes();
                server_tx.send(request).map_err(|_| SlskError::ConnectionFailed)?;

                let key = WaitKey::SolicitedDistributedConnection(username.clone(), token);
                let (stream, remote) = waiters
                    .wait::<(TcpStream, SocketAddr)>(key, timeout)?
                    .await?;
                let conn = Connection::from_stream(
                    ConnectionType::DistributedMessage,
                    stream,
                    remote,
                    Some(username),
                    options,
                )
                .with_events(events);
                Ok::<Connection, SlskError>(conn)
            })
        };

        tokio::pin!(direct);
        tokio::pin!(indirect);

        let mut direct_failed = false;
        let mut indirect_failed = false;

        let connection = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    direct.abort();
                    indirect.abort();
                    return Err(SlskError::WaitCanceled);
                }
                d = &mut direct, if !direct_failed => {
                    match d {
                        Ok(Ok(conn)) => { indirect.abort(); break conn; }
                        _ if indirect_failed => return Err(SlskError::ConnectionFailed),
                        _ => direct_failed = true,
                    }
                }
                i = &mut indirect, if !indirect_failed => {
                    match i {
                        Ok(Ok(conn)) => { direct.abort(); break conn; }
                        _ if direct_failed => return Err(SlskError::ConnectionFailed),
                        _ => indirect_failed = true,
                    }
                }
            }
        };

        self.adopt_parent(username.to_string(), endpoint, connection).await;
        Ok(())
    }

    async fn adopt_parent(&self, username: String, endpoint: SocketAddr, connection: Connection) {
        let parent_level = self.branch_level.load(Ordering::Relaxed);
        let new_level = parent_level + 1;
        self.branch_level.store(new_level, Ordering::Relaxed);
        *self.branch_root.lock().await = username.clone();

        *self.parent.lock().await = Some(ParentLink { username, connection });
        *self.parent_dedup.lock().await = LastSeenHash::default();

        let _ = self.server_tx.send(HaveNoParent { have_no_parent: false }.to_bytes());
        if let std::net::IpAddr::V4(ip) = endpoint.ip() {
            let _ = self.server_tx.send(ParentIp { ip }.to_bytes());
        }
        let root = self.branch_root.lock().await.clone();
        let _ = self.server_tx.send(ServerBranchLevel { level: new_level }.to_bytes());
        let _ = self.server_tx.send(ServerBranchRoot { root }.to_bytes());
        self.broadcast_branch_state().await;
    }

    async fn broadcast_branch_state(&self) {
        let level = self.branch_level();
        let root = self.branch_root().await;
        let level_frame = BranchLevel { level }.to_bytes();
        let root_frame = BranchRoot { username: &root }.to_bytes();

        let mut children = self.children.lock().await;
        for child in children.values_mut() {
            let _ = child.connection.write_frame(level_frame.slice(4..)).await;
            let _ = child.connection.write_frame(root_frame.slice(4..)).await;
        }
    }

    /// No parent candidate succeeded: this node becomes the root of its
    /// own subtree.
    pub async fn promote_self_as_root(&self) {
        self.branch_level.store(0, Ordering::Relaxed);
        *self.branch_root.lock().await = self.self_username.clone();
        *self.parent.lock().await = None;
        *self.parent_dedup.lock().await = LastSeenHash::default();
        let _ = self.server_tx.send(ServerBranchLevel { level: 0 }.to_bytes());
        let _ = self
            .server_tx
            .send(ServerBranchRoot { root: self.self_username.clone() }.to_bytes());
        self.broadcast_branch_state().await;
    }

    /// Rejects when at capacity or when children are disabled, closing the
    /// offered socket. On success the child immediately receives the
    /// current branch state.
    pub async fn add_child_connection(
        &self,
        username: String,
        stream: TcpStream,
        remote: SocketAddr,
    ) -> SlskResult<()> {
        if !self.opts.accept_children {
            return Err(SlskError::ChildLimitReached);
        }

        let mut children = self.children.lock().await;
        if children.len() >= self.opts.child_limit {
            return Err(SlskError::ChildLimitReached);
        }

        let mut connection = Connection::from_stream(
            ConnectionType::DistributedMessage,
            stream,
            remote,
            Some(username.clone()),
            self.connection_options.clone(),
        )
        .with_events(self.connection_events.clone());

        let level_frame = BranchLevel { level: self.branch_level() }.to_bytes();
        let root = self.branch_root().await;
        let root_frame = BranchRoot { username: &root }.to_bytes();
        let _ = connection.write_frame(level_frame.slice(4..)).await;
        let _ = connection.write_frame(root_frame.slice(4..)).await;

        children.insert(
            username,
            ChildEntry {
                connection,
                last_seen: LastSeenHash::default(),
                depth: 0,
            },
        );
        Ok(())
    }

    /// Applies branch level/root as announced by the parent connection
    /// itself, distinct from the level/root this node computes for its own
    /// children when it holds the parent role.
    pub async fn receive_parent_branch_info(&self, level: i32, root: String) {
        self.branch_level.store(level, Ordering::Relaxed);
        *self.branch_root.lock().await = root;
        let _ = self.server_tx.send(ServerBranchLevel { level }.to_bytes());
        let root = self.branch_root.lock().await.clone();
        let _ = self.server_tx.send(ServerBranchRoot { root }.to_bytes());
        self.broadcast_branch_state().await;
    }

    /// Records the subtree depth a child last announced via `ChildDepth`.
    pub async fn record_child_depth(&self, username: &str, depth: u32) {
        if let Some(entry) = self.children.lock().await.get_mut(username) {
            entry.depth = depth;
        }
    }

    /// Sends a keepalive `Ping` down to every child.
    pub async fn ping_children(&self) {
        let frame = crate::protocol::distributed::Ping.to_bytes();
        let mut children = self.children.lock().await;
        for child in children.values_mut() {
            let _ = child.connection.write_frame(frame.slice(4..)).await;
        }
    }

    /// Removes a child whose connection has dropped.
    pub async fn remove_child(&self, username: &str) {
        self.children.lock().await.remove(username);
    }

    /// Drops the parent link, e.g. after the connection closes.
    pub async fn clear_parent(&self) {
        *self.parent.lock().await = None;
        *self.parent_dedup.lock().await = LastSeenHash::default();
    }

    /// Forwards a search request to every child, deduplicating
    /// back-to-back repeats on `from_connection`, then resolves a local
    /// response and routes it to the requester's peer message connection.
    pub async fn handle_search_request(&self, from_connection: &str, raw_frame: &[u8], request: SearchRequestMessage) {
        if self.opts.deduplicate_search_requests {
            let duplicate = if from_connection == "parent" {
                self.parent_dedup.lock().await.observe(raw_frame)
            } else {
                let mut children = self.children.lock().await;
                match children.get_mut(from_connection) {
                    Some(entry) => entry.last_seen.observe(raw_frame),
                    None => false,
                }
            };
            if duplicate {
                return;
            }
        }

        self.forward_to_children(from_connection, &request).await;

        if let Some(response) = self
            .search_resolver
            .resolve(&request.username, request.token, &request.query)
            .await
        {
            if !response.files.is_empty() {
                let cached_on_failure = response.clone();
                let search_response = crate::protocol::peer::SearchResponse {
                    username: self.self_username.clone(),
                    token: request.token,
                    files: response.files,
                    has_free_upload_slot: response.has_free_upload_slot,
                    upload_speed: response.upload_speed,
                };
                let sent = self
                    .peer_manager
                    .send_message(
                        &request.username,
                        None,
                        search_response.to_bytes().slice(4..),
                        &CancellationToken::new(),
                    )
                    .await;
                if sent.is_err() {
                    self.search_response_cache
                        .hold(&request.username, cached_on_failure)
                        .await;
                }
            }
        }
    }

    async fn forward_to_children(&self, from_connection: &str, request: &SearchRequestMessage) {
        let frame = request.to_bytes();
        let mut children = self.children.lock().await;
        for (username, entry) in children.iter_mut() {
            if username == from_connection {
                continue;
            }
            let _ = entry.connection.write_frame(frame.slice(4..)).await;
        }
    }
}

/// Spawns the background task that turns a parent/child connection's own
/// `ConnectionStateChanged` report into a table purge: clears the parent
/// link when it is the one that dropped, removes a child by username
/// otherwise. Forwards every event on to `events` afterward.
fn spawn_disconnect_purge(
    parent: Arc<AsyncMutex<Option<ParentLink>>>,
    children: Arc<AsyncMutex<HashMap<String, ChildEntry>>>,
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
                let mut parent_guard = parent.lock().await;
                let is_parent = parent_guard.as_ref().is_some_and(|p| &p.username == username);
                if is_parent {
                    *parent_guard = None;
                }
                drop(parent_guard);
                children.lock().await.remove(username);
            }
            let _ = events.send(event);
        }
    });
    tx
}

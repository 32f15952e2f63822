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

//! Routes what `Acceptor::run` classifies to whichever table or
//! solicitation wait it belongs to. The acceptor itself never touches
//! manager state; this is the consumer that does, sitting between the
//! listener's channel and the peer/distributed managers.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::distributed_manager::DistributedManager;
use crate::net::listener::Accepted;
use crate::peer_manager::PeerConnectionManager;
use crate::wait::WaiterRegistry;

/// Drains `rx` until `cancel` fires, routing every classified connection.
///
/// A direct `PeerInit` is routed by `connection_type`: `"P"` becomes a
/// message connection, `"F"` completes the transfer connection a download
/// or upload is waiting on, `"D"` is offered to the distributed manager as
/// a child. An indirect `PierceFirewall` carries only a token, so it is
/// resolved against the peer solicitation table before the distributed
/// one - the same order a direct handshake would have used, since a
/// username is only ever soliciting one connection at a time in practice
/// but the token namespaces are otherwise indistinguishable.
pub async fn run_acceptor_loop(
    mut rx: mpsc::UnboundedReceiver<Accepted>,
    peer_manager: Arc<PeerConnectionManager>,
    distributed: Arc<DistributedManager>,
    waiters: Arc<WaiterRegistry>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = rx.recv() => {
                let Some(accepted) = accepted else { return };
                route(accepted, &peer_manager, &distributed, &waiters).await;
            }
        }
    }
}

async fn route(
    accepted: Accepted,
    peer_manager: &Arc<PeerConnectionManager>,
    distributed: &Arc<DistributedManager>,
    waiters: &Arc<WaiterRegistry>,
) {
    match accepted {
        Accepted::PeerInit { stream, remote, init } => match init.connection_type.as_str() {
            "P" => {
                peer_manager
                    .add_message_connection(init.username, stream, remote)
                    .await;
            }
            "F" => {
                peer_manager.add_transfer_connection(&init.username, init.token, stream, remote);
            }
            "D" => {
                let _ = distributed.add_child_connection(init.username, stream, remote).await;
            }
            _ => {}
        },
        Accepted::PierceFirewall { stream, remote, token } => {
            waiters.complete_by_token(token, (stream, remote));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::DefaultCallbacks;
    use crate::distributed_manager::DistributedManagerOptions;
    use crate::net::connection::ConnectionOptions;
    use crate::protocol::peer::PeerInitMessage;
    use crate::util::TokenCounter;
    use crate::wait::WaitKey;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpStream;

    fn peer_manager() -> Arc<PeerConnectionManager> {
        let (server_tx, _rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        Arc::new(PeerConnectionManager::new(
            "self".into(),
            Arc::new(TokenCounter::starting_at(0)),
            Arc::new(WaiterRegistry::new()),
            server_tx,
            Arc::new(DefaultCallbacks),
            events_tx,
            ConnectionOptions::default(),
            Duration::from_secs(5),
        ))
    }

    fn distributed_manager(peer_manager: Arc<PeerConnectionManager>, waiters: Arc<WaiterRegistry>) -> Arc<DistributedManager> {
        let (server_tx, _rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        Arc::new(DistributedManager::new(
            "self".into(),
            Arc::new(TokenCounter::starting_at(0)),
            waiters,
            server_tx,
            peer_manager,
            Arc::new(DefaultCallbacks),
            Arc::new(DefaultCallbacks),
            events_tx,
            ConnectionOptions::default(),
            DistributedManagerOptions {
                accept_children: true,
                child_limit: 4,
                deduplicate_search_requests: true,
                message_timeout: Duration::from_secs(5),
            },
        ))
    }

    async fn loopback_pair() -> (TcpStream, SocketAddr, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        let (server_stream, remote) = accept.unwrap();
        (server_stream, remote, connect.unwrap())
    }

    #[tokio::test]
    async fn peer_init_with_p_is_adopted_as_a_message_connection() {
        let peers = peer_manager();
        let waiters = Arc::new(WaiterRegistry::new());
        let distributed = distributed_manager(peers.clone(), waiters.clone());

        let (server_stream, remote, _client) = loopback_pair().await;
        route(
            Accepted::PeerInit {
                stream: server_stream,
                remote,
                init: PeerInitMessage {
                    username: "alice".into(),
                    connection_type: "P".into(),
                    token: 0,
                },
            },
            &peers,
            &distributed,
            &waiters,
        )
        .await;

        assert!(peers.has_message_connection("alice").await);
    }

    #[tokio::test]
    async fn peer_init_with_d_is_offered_to_the_distributed_manager() {
        let peers = peer_manager();
        let waiters = Arc::new(WaiterRegistry::new());
        let distributed = distributed_manager(peers.clone(), waiters.clone());

        let (server_stream, remote, _client) = loopback_pair().await;
        route(
            Accepted::PeerInit {
                stream: server_stream,
                remote,
                init: PeerInitMessage {
                    username: "child-one".into(),
                    connection_type: "D".into(),
                    token: 0,
                },
            },
            &peers,
            &distributed,
            &waiters,
        )
        .await;

        assert_eq!(distributed.child_count().await, 1);
    }

    #[tokio::test]
    async fn pierce_firewall_resolves_the_peer_solicitation_first() {
        let peers = peer_manager();
        let waiters = Arc::new(WaiterRegistry::new());
        let distributed = distributed_manager(peers.clone(), waiters.clone());

        let wait = waiters
            .wait::<(TcpStream, SocketAddr)>(
                WaitKey::SolicitedPeerConnection("bob".into(), 7),
                Duration::from_secs(1),
            )
            .unwrap();

        let (server_stream, remote, _client) = loopback_pair().await;
        route(
            Accepted::PierceFirewall {
                stream: server_stream,
                remote,
                token: 7,
            },
            &peers,
            &distributed,
            &waiters,
        )
        .await;

        let (_stream, resolved_remote) = wait.await.unwrap();
        assert_eq!(resolved_remote, remote);
    }

    #[tokio::test]
    async fn acceptor_loop_exits_when_cancelled() {
        let peers = peer_manager();
        let waiters = Arc::new(WaiterRegistry::new());
        let distributed = distributed_manager(peers.clone(), waiters.clone());
        let (_tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        run_acceptor_loop(rx, peers, distributed, waiters, cancel).await;
    }
}

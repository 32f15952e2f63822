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

//! Cross-module scenarios that a single unit test can't exercise: the
//! listener handing a classified socket through the acceptor loop to the
//! peer manager, and a message connection resolving through the indirect
//! `ConnectToPeer` / `PierceFirewall` race rather than a direct dial.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use soulseek_core::distributed_manager::{DistributedManager, DistributedManagerOptions};
use soulseek_core::net::{Acceptor, ConnectionOptions};
use soulseek_core::protocol::peer::PeerInit;
use soulseek_core::protocol::server::ServerCode;
use soulseek_core::util::TokenCounter;
use soulseek_core::wait::{WaitKey, WaiterRegistry};
use soulseek_core::{run_acceptor_loop, DefaultCallbacks, PeerConnectionManager};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn listener_classifies_incoming_peer_init_and_acceptor_loop_adopts_it() {
    let acceptor = Acceptor::bind(0).await.unwrap();
    let addr = acceptor.local_addr().unwrap();
    let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    tokio::spawn(acceptor.run(accepted_tx, cancel.clone()));

    let waiters = Arc::new(WaiterRegistry::new());
    let (peer_server_tx, _peer_server_rx) = mpsc::unbounded_channel();
    let (peer_events_tx, _peer_events_rx) = mpsc::unbounded_channel();
    let peer_manager = Arc::new(PeerConnectionManager::new(
        "self".into(),
        Arc::new(TokenCounter::starting_at(0)),
        waiters.clone(),
        peer_server_tx,
        Arc::new(DefaultCallbacks),
        peer_events_tx,
        ConnectionOptions::default(),
        Duration::from_secs(5),
    ));
    let (distributed_server_tx, _distributed_server_rx) = mpsc::unbounded_channel();
    let (distributed_events_tx, _distributed_events_rx) = mpsc::unbounded_channel();
    let distributed = Arc::new(DistributedManager::new(
        "self".into(),
        Arc::new(TokenCounter::starting_at(0)),
        waiters.clone(),
        distributed_server_tx,
        peer_manager.clone(),
        Arc::new(DefaultCallbacks),
        Arc::new(DefaultCallbacks),
        distributed_events_tx,
        ConnectionOptions::default(),
        DistributedManagerOptions {
            accept_children: true,
            child_limit: 4,
            deduplicate_search_requests: true,
            message_timeout: Duration::from_secs(5),
        },
    ));

    tokio::spawn(run_acceptor_loop(
        accepted_rx,
        peer_manager.clone(),
        distributed,
        waiters,
        cancel.clone(),
    ));

    assert!(!peer_manager.has_message_connection("alice").await);

    let mut client = TcpStream::connect(addr).await.unwrap();
    let frame = PeerInit {
        username: "alice",
        connection_type: "P",
        token: 0,
    }
    .to_bytes();
    client.write_all(&frame).await.unwrap();

    for _ in 0..200 {
        if peer_manager.has_message_connection("alice").await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(peer_manager.has_message_connection("alice").await);

    cancel.cancel();
}

#[tokio::test]
async fn send_message_resolves_via_indirect_pierce_firewall_connection() {
    // Bind and immediately drop a listener so the direct dial to this
    // address is refused right away, forcing the indirect race branch to
    // win.
    let dead_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let unreachable = dead_listener.local_addr().unwrap();
    drop(dead_listener);

    let waiters = Arc::new(WaiterRegistry::new());
    let (server_tx, mut server_rx) = mpsc::unbounded_channel();
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let manager = Arc::new(PeerConnectionManager::new(
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
        let manager = manager.clone();
        let cancel = cancel.clone();
        async move {
            manager
                .send_message("carol", Some(unreachable), Bytes::from_static(b"hello"), &cancel)
                .await
        }
    });

    let solicitation = server_rx.recv().await.unwrap();
    let (code, mut body) = soulseek_core::protocol::decode_frame(&solicitation).unwrap();
    assert_eq!(code, ServerCode::ConnectToPeer as u32);
    let token = body.get_i32_le();

    let pierce_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let pierce_addr = pierce_listener.local_addr().unwrap();
    let connect = TcpStream::connect(pierce_addr);
    let (accept, connect) = tokio::join!(pierce_listener.accept(), connect);
    let (inbound_stream, inbound_remote) = accept.unwrap();
    drop(connect.unwrap());

    waiters.complete(
        &WaitKey::SolicitedPeerConnection("carol".into(), token),
        (inbound_stream, inbound_remote),
    );

    send.await.unwrap().unwrap();
    assert!(manager.has_message_connection("carol").await);
}

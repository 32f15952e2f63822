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

//! Connection state machine: a single TCP socket wrapped either as a
//! raw byte stream (used during handshake classification), a message-framed
//! stream (used by the server, peer-message, and distributed connections),
//! or a transfer stream (raw bytes, externally rate-limited).
//!
//! Framing reuses the protocol's own `u32 length || body` layout via
//! `tokio_util::codec::LengthDelimitedCodec` configured little-endian with a
//! 4-byte length field, wrapping the socket in a `Framed` so the codec owns
//! chunk boundaries instead of hand-rolled buffering.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use uuid::Uuid;

use crate::error::{SlskError, SlskResult};
use crate::events::ClientEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    /// Transitions are monotonic toward `Disconnected`; once there, the
    /// instance is terminal.
    fn can_move_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Pending, Connecting)
                | (Pending, Connected)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Disconnecting, Disconnected)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Server,
    PeerMessage,
    PeerTransfer,
    DistributedMessage,
    Incoming,
}

impl ConnectionType {
    /// Tag attached to the `ConnectionStateChanged` event so a subscriber
    /// can tell which table the disconnecting username belongs in.
    fn label(self) -> &'static str {
        match self {
            ConnectionType::Server => "server",
            ConnectionType::PeerMessage => "peer_message",
            ConnectionType::PeerTransfer => "peer_transfer",
            ConnectionType::DistributedMessage => "distributed_message",
            ConnectionType::Incoming => "incoming",
        }
    }
}

fn emit_disconnected(
    events: &Option<mpsc::UnboundedSender<ClientEvent>>,
    connection: &'static str,
    username: Option<String>,
    reason: Option<&str>,
) {
    if let Some(tx) = events {
        let _ = tx.send(ClientEvent::ConnectionStateChanged {
            connection,
            username,
            connected: false,
            reason: reason.map(str::to_string),
        });
    }
}

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub host: String,
    pub port: u16,
    pub auth: Option<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub connect_timeout: Duration,
    pub inactivity_timeout: Option<Duration>,
    pub proxy: Option<ProxyOptions>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: 16 * 1024,
            write_buffer_size: 16 * 1024,
            connect_timeout: Duration::from_secs(10),
            inactivity_timeout: Some(Duration::from_secs(60)),
            proxy: None,
        }
    }
}

impl ConnectionOptions {
    /// Server and transfer connections always run with inactivity detection
    /// suppressed, per the component contract.
    pub fn without_inactivity_timeout(mut self) -> Self {
        self.inactivity_timeout = None;
        self
    }
}

fn framed_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .little_endian()
        .length_field_length(4)
        .new_codec()
}

/// Message-framed connection: the flavour used by the server session, peer
/// message connections, and distributed connections. Frames are handed to
/// the caller with the length prefix already stripped, ready for
/// `protocol::decode_frame`.
pub struct Connection {
    id: Uuid,
    kind: ConnectionType,
    remote: SocketAddr,
    username: Option<String>,
    state: ConnectionState,
    options: ConnectionOptions,
    io: Framed<TcpStream, LengthDelimitedCodec>,
    events: Option<mpsc::UnboundedSender<ClientEvent>>,
}

impl Connection {
    pub async fn connect(
        kind: ConnectionType,
        remote: SocketAddr,
        options: ConnectionOptions,
    ) -> SlskResult<Self> {
        let stream = match timeout(options.connect_timeout, TcpStream::connect(remote)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(_)) => return Err(SlskError::ConnectionRefused),
            Err(_) => return Err(SlskError::ConnectionTimeout),
        };
        Ok(Self::from_stream(kind, stream, remote, None, options))
    }

    pub fn from_stream(
        kind: ConnectionType,
        stream: TcpStream,
        remote: SocketAddr,
        username: Option<String>,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            remote,
            username,
            state: ConnectionState::Connected,
            io: Framed::new(stream, framed_codec()),
            options,
            events: None,
        }
    }

    /// Attaches the sink that `disconnect()` and the auto-disconnect paths
    /// report through. Optional: connections built without one simply
    /// transition state silently, as they always did before.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> ConnectionType {
        self.kind
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn set_username(&mut self, username: String) {
        self.username = Some(username);
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        self.transition_with_reason(next, None)
    }

    /// As `transition`, additionally reporting `reason` on the
    /// `ConnectionStateChanged` event fired when `next` is `Disconnected`.
    /// `can_move_to` makes this fire at most once per connection, since
    /// `Disconnected -> Disconnected` is not itself a legal transition.
    fn transition_with_reason(&mut self, next: ConnectionState, reason: Option<&str>) {
        if self.state.can_move_to(next) {
            self.state = next;
            if next == ConnectionState::Disconnected {
                emit_disconnected(&self.events, self.kind.label(), self.username.clone(), reason);
            }
        }
    }

    /// Read one frame, applying the connection's inactivity timeout if
    /// configured. Returns `ConnectionClosed` on a clean EOF and
    /// `InactivityTimeout` if no frame arrives in time, transitioning to
    /// `Disconnected` in either case.
    pub async fn read_frame(&mut self) -> SlskResult<BytesMut> {
        if self.state != ConnectionState::Connected {
            return Err(SlskError::ConnectionClosed);
        }

        let next = match self.options.inactivity_timeout {
            Some(dur) => match timeout(dur, self.io.next()).await {
                Ok(frame) => frame,
                Err(_) => {
                    self.transition_with_reason(ConnectionState::Disconnected, Some("inactivity timeout"));
                    return Err(SlskError::InactivityTimeout);
                }
            },
            None => self.io.next().await,
        };

        match next {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(e)) => {
                self.transition_with_reason(ConnectionState::Disconnected, Some("read error"));
                Err(SlskError::Io(e))
            }
            None => {
                self.transition_with_reason(ConnectionState::Disconnected, Some("connection closed"));
                Err(SlskError::ConnectionClosed)
            }
        }
    }

    pub async fn write_frame(&mut self, bytes: Bytes) -> SlskResult<()> {
        if self.state != ConnectionState::Connected {
            return Err(SlskError::ConnectionClosed);
        }
        use futures::SinkExt;
        self.io.send(bytes).await.map_err(|e| {
            self.transition_with_reason(ConnectionState::Disconnected, Some("write error"));
            SlskError::Io(e)
        })
    }

    /// Idempotent; transitions to `Disconnected` at most once, firing
    /// `ConnectionStateChanged` on the transition that actually does so.
    pub fn disconnect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            self.transition(ConnectionState::Disconnecting);
            self.transition_with_reason(ConnectionState::Disconnected, Some("explicit disconnect"));
        }
    }

    /// Yields the underlying socket to another owner (the peer/distributed
    /// manager after classification); this instance is consumed.
    pub fn handoff(self) -> TcpStream {
        self.io.into_inner()
    }

    /// Splits into independent read/write halves so a session can run its
    /// demux loop and its outbound drain loop concurrently without sharing
    /// a single `&mut self`.
    pub fn split(self) -> (ConnectionReader, ConnectionWriter) {
        use futures::StreamExt;
        let (sink, stream) = self.io.split();
        (
            ConnectionReader {
                remote: self.remote,
                username: self.username.clone(),
                kind: self.kind,
                inactivity_timeout: self.options.inactivity_timeout,
                io: stream,
                events: self.events.clone(),
                reported: false,
            },
            ConnectionWriter {
                username: self.username,
                kind: self.kind,
                io: sink,
                events: self.events,
                reported: false,
            },
        )
    }
}

/// Read half of a split [`Connection`]. Tracks only enough state to report
/// a terminal error exactly once; the owning demux loop is expected to stop
/// calling `read_frame` after the first error.
pub struct ConnectionReader {
    remote: SocketAddr,
    username: Option<String>,
    kind: ConnectionType,
    inactivity_timeout: Option<Duration>,
    io: futures::stream::SplitStream<Framed<TcpStream, LengthDelimitedCodec>>,
    events: Option<mpsc::UnboundedSender<ClientEvent>>,
    reported: bool,
}

pub struct ConnectionWriter {
    username: Option<String>,
    kind: ConnectionType,
    io: futures::stream::SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>,
    events: Option<mpsc::UnboundedSender<ClientEvent>>,
    reported: bool,
}

impl ConnectionReader {
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub async fn read_frame(&mut self) -> SlskResult<BytesMut> {
        use tokio_stream::StreamExt as _;
        let next = match self.inactivity_timeout {
            Some(dur) => match timeout(dur, self.io.next()).await {
                Ok(frame) => frame,
                Err(_) => {
                    self.report_once("inactivity timeout");
                    return Err(SlskError::InactivityTimeout);
                }
            },
            None => self.io.next().await,
        };

        match next {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(e)) => {
                self.report_once("read error");
                Err(SlskError::Io(e))
            }
            None => {
                self.report_once("connection closed");
                Err(SlskError::ConnectionClosed)
            }
        }
    }

    fn report_once(&mut self, reason: &str) {
        if !self.reported {
            self.reported = true;
            emit_disconnected(&self.events, self.kind.label(), self.username.clone(), Some(reason));
        }
    }
}

impl ConnectionWriter {
    pub async fn write_frame(&mut self, bytes: Bytes) -> SlskResult<()> {
        use futures::SinkExt;
        self.io.send(bytes).await.map_err(|e| {
            if !self.reported {
                self.reported = true;
                emit_disconnected(&self.events, self.kind.label(), self.username.clone(), Some("write error"));
            }
            SlskError::Io(e)
        })
    }
}

/// Raw byte-stream connection used by the listener before a connection has
/// been classified, and as the basis of transfer connections.
pub struct RawConnection {
    id: Uuid,
    remote: SocketAddr,
    state: ConnectionState,
    options: ConnectionOptions,
    stream: TcpStream,
    events: Option<mpsc::UnboundedSender<ClientEvent>>,
}

impl RawConnection {
    pub async fn connect(remote: SocketAddr, options: ConnectionOptions) -> SlskResult<Self> {
        let stream = match timeout(options.connect_timeout, TcpStream::connect(remote)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(_)) => return Err(SlskError::ConnectionRefused),
            Err(_) => return Err(SlskError::ConnectionTimeout),
        };
        Ok(Self::from_stream(stream, remote, options))
    }

    pub fn from_stream(stream: TcpStream, remote: SocketAddr, options: ConnectionOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote,
            state: ConnectionState::Connected,
            options,
            stream,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn mark_disconnected(&mut self, reason: &str) {
        let was_connected = self.state != ConnectionState::Disconnected;
        self.state = ConnectionState::Disconnected;
        if was_connected {
            emit_disconnected(&self.events, "raw", None, Some(reason));
        }
    }

    pub async fn read_exact(&mut self, n: usize) -> SlskResult<Bytes> {
        let mut buf = vec![0u8; n];
        let read = match self.options.inactivity_timeout {
            Some(dur) => timeout(dur, self.stream.read_exact(&mut buf))
                .await
                .map_err(|_| SlskError::InactivityTimeout)?,
            None => self.stream.read_exact(&mut buf).await,
        };
        match read {
            Ok(_) => Ok(Bytes::from(buf)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.mark_disconnected("connection closed");
                Err(SlskError::ConnectionClosed)
            }
            Err(e) => {
                self.mark_disconnected("read error");
                Err(SlskError::Io(e))
            }
        }
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> SlskResult<()> {
        self.stream.write_all(bytes).await.map_err(|e| {
            self.mark_disconnected("write error");
            SlskError::Io(e)
        })
    }

    pub fn disconnect(&mut self) {
        self.mark_disconnected("explicit disconnect");
    }

    /// Consumes this instance and promotes it to a message-framed
    /// `Connection` once classification is complete.
    pub fn into_framed(self, kind: ConnectionType, username: Option<String>) -> Connection {
        let mut connection = Connection::from_stream(kind, self.stream, self.remote, username, self.options);
        if let Some(events) = self.events {
            connection = connection.with_events(events);
        }
        connection
    }

    /// Hands the raw socket to a transfer connection.
    pub fn into_transfer(self, token_i32: i32) -> TransferConnection {
        TransferConnection {
            id: self.id,
            remote: self.remote,
            token: token_i32,
            stream: self.stream,
            state: ConnectionState::Connected,
            events: self.events,
        }
    }
}

/// Transfer flavour: exposes raw byte read/write; throughput pacing is
/// applied by the caller via a shared `TokenBucket`, not owned here.
pub struct TransferConnection {
    id: Uuid,
    remote: SocketAddr,
    token: i32,
    state: ConnectionState,
    stream: TcpStream,
    events: Option<mpsc::UnboundedSender<ClientEvent>>,
}

impl TransferConnection {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn token(&self) -> i32 {
        self.token
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn mark_disconnected(&mut self, reason: &str) {
        let was_connected = self.state != ConnectionState::Disconnected;
        self.state = ConnectionState::Disconnected;
        if was_connected {
            emit_disconnected(&self.events, "peer_transfer", None, Some(reason));
        }
    }

    pub async fn read_chunk(&mut self, max: usize) -> SlskResult<Bytes> {
        let mut buf = vec![0u8; max];
        let n = self.stream.read(&mut buf).await.map_err(|e| {
            self.mark_disconnected("read error");
            SlskError::Io(e)
        })?;
        if n == 0 {
            self.mark_disconnected("connection closed");
            return Err(SlskError::ConnectionClosed);
        }
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    pub async fn write_chunk(&mut self, bytes: &[u8]) -> SlskResult<()> {
        self.stream.write_all(bytes).await.map_err(|e| {
            self.mark_disconnected("write error");
            SlskError::Io(e)
        })
    }

    pub fn disconnect(&mut self) {
        self.mark_disconnected("explicit disconnect");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    #[tokio::test]
    async fn framed_connection_round_trips_a_message() {
        let (server_stream, client_stream) = loopback_pair().await;
        let addr = "127.0.0.1:1".parse().unwrap();

        let mut server = Connection::from_stream(
            ConnectionType::Incoming,
            server_stream,
            addr,
            None,
            ConnectionOptions::default().without_inactivity_timeout(),
        );
        let mut client = Connection::from_stream(
            ConnectionType::PeerMessage,
            client_stream,
            addr,
            None,
            ConnectionOptions::default().without_inactivity_timeout(),
        );

        let frame = crate::protocol::encode_frame(7, b"hello");
        client.write_frame(frame.slice(4..)).await.unwrap();

        let received = server.read_frame().await.unwrap();
        let (code, body) = crate::protocol::decode_frame(&received).unwrap();
        assert_eq!(code, 7);
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_terminal() {
        let (server_stream, _client_stream) = loopback_pair().await;
        let addr = "127.0.0.1:1".parse().unwrap();
        let mut conn = Connection::from_stream(
            ConnectionType::Incoming,
            server_stream,
            addr,
            None,
            ConnectionOptions::default(),
        );

        conn.disconnect();
        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn read_after_disconnect_fails_with_connection_closed() {
        let (server_stream, _client_stream) = loopback_pair().await;
        let addr = "127.0.0.1:1".parse().unwrap();
        let mut conn = Connection::from_stream(
            ConnectionType::Incoming,
            server_stream,
            addr,
            None,
            ConnectionOptions::default(),
        );

        conn.disconnect();
        assert!(matches!(
            conn.read_frame().await,
            Err(SlskError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn split_halves_round_trip_independently() {
        let (server_stream, client_stream) = loopback_pair().await;
        let addr = "127.0.0.1:1".parse().unwrap();

        let server = Connection::from_stream(
            ConnectionType::Incoming,
            server_stream,
            addr,
            None,
            ConnectionOptions::default().without_inactivity_timeout(),
        );
        let mut client = Connection::from_stream(
            ConnectionType::PeerMessage,
            client_stream,
            addr,
            None,
            ConnectionOptions::default().without_inactivity_timeout(),
        );

        let (mut reader, mut writer) = server.split();

        let frame = crate::protocol::encode_frame(9, b"ping");
        client.write_frame(frame.slice(4..)).await.unwrap();
        let received = reader.read_frame().await.unwrap();
        let (code, body) = crate::protocol::decode_frame(&received).unwrap();
        assert_eq!(code, 9);
        assert_eq!(body, b"ping");

        let reply = crate::protocol::encode_frame(10, b"pong");
        writer.write_frame(reply.slice(4..)).await.unwrap();
        let received = client.read_frame().await.unwrap();
        let (code, _) = crate::protocol::decode_frame(&received).unwrap();
        assert_eq!(code, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_timeout_disconnects_and_reports() {
        let (server_stream, _client_stream) = loopback_pair().await;
        let addr = "127.0.0.1:1".parse().unwrap();
        let mut options = ConnectionOptions::default();
        options.inactivity_timeout = Some(Duration::from_millis(50));
        let mut conn =
            Connection::from_stream(ConnectionType::Incoming, server_stream, addr, None, options);

        let result = conn.read_frame().await;
        assert!(matches!(result, Err(SlskError::InactivityTimeout)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_fires_connection_state_changed_exactly_once() {
        let (server_stream, _client_stream) = loopback_pair().await;
        let addr = "127.0.0.1:1".parse().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut conn = Connection::from_stream(
            ConnectionType::PeerMessage,
            server_stream,
            addr,
            Some("alice".into()),
            ConnectionOptions::default(),
        )
        .with_events(tx);

        conn.disconnect();
        conn.disconnect();

        let event = rx.recv().await.unwrap();
        match event {
            ClientEvent::ConnectionStateChanged { connection, username, connected, .. } => {
                assert_eq!(connection, "peer_message");
                assert_eq!(username.as_deref(), Some("alice"));
                assert!(!connected);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err(), "disconnect reported more than once");
    }

    #[tokio::test]
    async fn split_halves_report_disconnect_independently() {
        let (server_stream, client_stream) = loopback_pair().await;
        let addr = "127.0.0.1:1".parse().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let server = Connection::from_stream(
            ConnectionType::Incoming,
            server_stream,
            addr,
            Some("bob".into()),
            ConnectionOptions::default().without_inactivity_timeout(),
        )
        .with_events(tx);
        drop(client_stream);

        let (mut reader, _writer) = server.split();
        assert!(reader.read_frame().await.is_err());

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            ClientEvent::ConnectionStateChanged { connection: "incoming", connected: false, .. }
        ));
    }
}

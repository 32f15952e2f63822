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

//! Listener + acceptor: binds `ListenPort`, classifies the first
//! framed message of each inbound connection, and forwards the classified,
//! still-raw socket to whichever consumer owns the matching solicitation
//! table or message-connection cache. Classification itself never touches
//! manager state - that stays with the consumer, keeping the accept loop
//! separate from per-connection dispatch.

use std::convert::TryFrom;
use std::net::SocketAddr;

use bytes::{Buf, Bytes};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{SlskError, SlskResult};
use crate::protocol::peer::{PeerCode, PeerInitMessage, PierceFirewall};

/// The minimum and maximum `listenPort` values the protocol allows.
pub const LISTEN_PORT_RANGE: std::ops::RangeInclusive<u16> = 1024..=65535;

#[derive(Debug)]
pub enum Accepted {
    /// A direct `PeerInit` handshake; the consumer inspects
    /// `init.connection_type` ("P"/"F"/"D") to route it.
    PeerInit {
        stream: TcpStream,
        remote: SocketAddr,
        init: PeerInitMessage,
    },
    /// A `PierceFirewall` handshake satisfying an outstanding solicitation,
    /// scope (peer vs. distributed) undetermined until the consumer checks
    /// its solicitation tables.
    PierceFirewall {
        stream: TcpStream,
        remote: SocketAddr,
        token: i32,
    },
}

pub struct Acceptor {
    listener: TcpListener,
}

impl Acceptor {
    pub async fn bind(port: u16) -> SlskResult<Self> {
        if !LISTEN_PORT_RANGE.contains(&port) {
            return Err(SlskError::InvalidArgument {
                name: "listen_port",
                constraint: "must be in 1024..=65535",
            });
        }
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> SlskResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs until `cancel` fires. Each accepted connection is classified
    /// inline (cheap: one frame read) before being forwarded; a connection
    /// that fails classification is dropped and never reaches `tx`.
    pub async fn run(self, tx: mpsc::UnboundedSender<Accepted>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = self.listener.accept() => {
                    let Ok((stream, remote)) = accepted else { continue };
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if let Ok(Some(classified)) = classify(stream, remote).await {
                            let _ = tx.send(classified);
                        }
                    });
                }
            }
        }
    }
}

async fn read_length_prefixed(stream: &mut TcpStream) -> SlskResult<Bytes> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

async fn classify(mut stream: TcpStream, remote: SocketAddr) -> SlskResult<Option<Accepted>> {
    let mut body = read_length_prefixed(&mut stream).await?;
    if body.remaining() < 4 {
        return Err(SlskError::MalformedMessage);
    }
    let code = body.get_u32_le();

    if code == PeerCode::PeerInit as u32 {
        if let Ok((_, init)) = PeerInitMessage::parse(&body) {
            return Ok(Some(Accepted::PeerInit {
                stream,
                remote,
                init,
            }));
        }
    } else if code == PeerCode::PierceFirewall as u32 {
        if let Ok((_, pierce)) = PierceFirewall::parse(&body) {
            return Ok(Some(Accepted::PierceFirewall {
                stream,
                remote,
                token: pierce.token,
            }));
        }
    }

    let _ = PeerCode::try_from(code);
    Err(SlskError::UnrecognisedInitialisation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::peer::PeerInit;
    use tokio::net::TcpStream as ClientStream;

    #[tokio::test]
    async fn rejects_out_of_range_listen_port() {
        let result = Acceptor::bind(80).await;
        assert!(matches!(
            result,
            Err(SlskError::InvalidArgument { name: "listen_port", .. })
        ));
    }

    #[tokio::test]
    async fn classifies_incoming_peer_init() {
        let acceptor = Acceptor::bind(0).await.unwrap();
        let addr = acceptor.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(acceptor.run(tx, cancel_clone));

        let mut client = ClientStream::connect(addr).await.unwrap();
        let frame = PeerInit {
            username: "alice",
            connection_type: "P",
            token: 0,
        }
        .to_bytes();
        use tokio::io::AsyncWriteExt;
        client.write_all(&frame).await.unwrap();

        let accepted = rx.recv().await.unwrap();
        match accepted {
            Accepted::PeerInit { init, .. } => {
                assert_eq!(init.username, "alice");
                assert_eq!(init.connection_type, "P");
            }
            _ => panic!("expected PeerInit"),
        }
        cancel.cancel();
    }
}

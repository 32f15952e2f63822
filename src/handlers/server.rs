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

use std::convert::TryFrom;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::distributed_manager::DistributedManager;
use crate::error::SlskResult;
use crate::events::ClientEvent;
use crate::protocol::server::{
    ConnectToPeerRequest, NetInfo, PrivateMessage, PrivilegedUsersList, RoomMessage, ServerCode, UserStatus,
};
use crate::wait::{WaitKey, WaiterRegistry};

pub struct ServerDispatchContext {
    pub waiters: Arc<WaiterRegistry>,
    pub distributed: Arc<DistributedManager>,
    pub events: mpsc::UnboundedSender<ClientEvent>,
    pub server_tx: mpsc::UnboundedSender<Bytes>,
    pub auto_acknowledge_private_messages: bool,
    pub auto_acknowledge_privilege_notifications: bool,
}

/// Decodes `body` under `code` and reacts; protocol errors here are logged
/// by the caller and never panic the demux loop.
pub async fn dispatch(code: u32, body: &[u8], ctx: &ServerDispatchContext, cancel: &CancellationToken) -> SlskResult<()> {
    let server_code = ServerCode::try_from(code)?;

    match server_code {
        ServerCode::ConnectToPeer => {
            let (_, request) = ConnectToPeerRequest::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
            log::debug!("server requested we connect to {}", request.username);
            // The peer manager's own solicitation path completes pending
            // waiters when the resulting PierceFirewall/PeerInit arrives on
            // the listener; this notification alone carries no action here
            // beyond the diagnostic trail.
        }
        ServerCode::NetInfo => {
            let (_, net_info) = NetInfo::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
            let candidates: Vec<(String, SocketAddr)> = net_info
                .candidates
                .into_iter()
                .map(|c| (c.username, SocketAddr::new(c.ip.into(), c.port as u16)))
                .collect();
            ctx.distributed.select_parent(&candidates, cancel).await;
        }
        ServerCode::PrivilegedUsers => {
            let (_, list) = PrivilegedUsersList::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
            let _ = ctx.events.send(ClientEvent::PrivilegedUsersList(list.usernames));
        }
        ServerCode::GetUserStatus => {
            let (_, status) = UserStatus::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
            let _ = ctx.events.send(ClientEvent::UserStatusChanged {
                username: status.username,
                status: status.status,
                privileged: status.privileged,
            });
        }
        ServerCode::SayInChatRoom => {
            let (_, room_message) = RoomMessage::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
            let _ = ctx.events.send(ClientEvent::RoomMessage {
                room: room_message.room,
                username: room_message.username,
                message: room_message.message,
            });
        }
        ServerCode::MessageUser => {
            let (_, private_message) = PrivateMessage::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
            let id = private_message.id;
            let _ = ctx.events.send(ClientEvent::PrivateMessageReceived {
                id,
                username: private_message.username,
                message: private_message.message,
            });
            if ctx.auto_acknowledge_private_messages {
                let frame = crate::protocol::server::MessageAcked { id }.to_bytes();
                let _ = ctx.server_tx.send(frame);
            }
        }
        ServerCode::PrivilegeNotification => {
            if body.len() >= 4 {
                let id = u32::from_le_bytes(body[..4].try_into().unwrap());
                let _ = ctx.events.send(ClientEvent::PrivilegeNotification { id });
                if ctx.auto_acknowledge_privilege_notifications {
                    let frame = crate::protocol::encode_frame(ServerCode::AckPrivilegeNotification as u32, &body[..4]);
                    let _ = ctx.server_tx.send(frame);
                }
            }
        }
        ServerCode::EmbeddedMessage => {
            let (_, (distributed_code, distributed_body)) =
                crate::protocol::server::EmbeddedMessage::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
            crate::handlers::distributed::dispatch_embedded(distributed_code, distributed_body, &ctx.distributed).await?;
        }
        ServerCode::Login => {
            let (_, response) = crate::protocol::server::LoginResponse::parse(body)
                .map_err(|_| crate::error::SlskError::MalformedMessage)?;
            ctx.waiters.complete(&WaitKey::Login, response);
        }
        ServerCode::GetPeerAddress => {
            let (_, address) = crate::protocol::server::PeerAddress::parse(body)
                .map_err(|_| crate::error::SlskError::MalformedMessage)?;
            ctx.waiters.complete(
                &WaitKey::GetPeerAddress(address.username.clone()),
                SocketAddr::new(address.ip.into(), address.port as u16),
            );
        }
        _ => {}
    }

    Ok(())
}

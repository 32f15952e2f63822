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

use tokio::sync::mpsc;

use crate::callbacks::{
    BrowseResponseResolver, DirectoryContentsResolver, EnqueueDownloadAction, PlaceInQueueResponseResolver,
    UserInfoResponseResolver,
};
use crate::error::SlskResult;
use crate::events::ClientEvent;
use crate::net::connection::Connection;
use crate::protocol::peer::{
    FolderContentsRequest, FolderContentsResponse, PeerCode, PlaceInQueueRequest, PlaceInQueueResponse,
    QueueDownload, QueueFailed, SearchResponse, SharesResponse, TransferRequest, TransferResponse,
    UserInfoResponse,
};
use crate::wait::{WaitKey, WaiterRegistry};

pub struct PeerDispatchContext {
    pub waiters: Arc<WaiterRegistry>,
    pub events: mpsc::UnboundedSender<ClientEvent>,
    pub browse_resolver: Arc<dyn BrowseResponseResolver>,
    pub directory_resolver: Arc<dyn DirectoryContentsResolver>,
    pub user_info_resolver: Arc<dyn UserInfoResponseResolver>,
    pub enqueue_action: Arc<dyn EnqueueDownloadAction>,
    pub place_in_queue_resolver: Arc<dyn PlaceInQueueResponseResolver>,
}

/// Dispatches a frame that arrived on an established peer message
/// connection. `connection` is borrowed rather than consumed, since the
/// demux loop that owns it keeps reading frames from the same socket after
/// each call returns.
pub async fn dispatch(
    code: u32,
    body: &[u8],
    username: &str,
    remote: SocketAddr,
    connection: &mut Connection,
    ctx: &PeerDispatchContext,
) -> SlskResult<()> {
    let peer_code = PeerCode::try_from(code)?;

    match peer_code {
        PeerCode::SharesRequest => {
            let shares = ctx.browse_resolver.resolve(username, remote).await;
            let frame = SharesResponse { files: shares.files }.to_bytes();
            connection.write_frame(frame.slice(4..)).await?;
        }
        PeerCode::SharesResponse => {
            let (_, response) = SharesResponse::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
            ctx.waiters.complete(&WaitKey::BrowseResponse(username.to_string()), response);
        }
        PeerCode::SearchResponse => {
            let (_, response) = SearchResponse::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
            let _ = ctx.events.send(ClientEvent::SearchResultReceived {
                username: response.username,
                token: response.token,
                files: response.files,
                has_free_upload_slot: response.has_free_upload_slot,
                upload_speed: response.upload_speed,
            });
        }
        PeerCode::UserInfoRequest => {
            let info = ctx.user_info_resolver.resolve(username, remote).await;
            let frame = UserInfoResponse {
                description: info.description,
                has_picture: info.has_picture,
                upload_slots: info.upload_slots,
                queue_length: info.queue_length,
                free_upload_slots: info.free_upload_slots,
            }
            .to_bytes();
            connection.write_frame(frame.slice(4..)).await?;
        }
        PeerCode::UserInfoResponse => {
            let (_, response) =
                UserInfoResponse::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
            ctx.waiters
                .complete(&WaitKey::UserInfoResponse(username.to_string()), response);
        }
        PeerCode::FolderContentsRequest => {
            let (_, request) =
                FolderContentsRequest::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
            let listing = ctx
                .directory_resolver
                .resolve(username, remote, request.token, &request.directory)
                .await;
            let frame = FolderContentsResponse {
                token: request.token,
                directory: &listing.path,
                entries: &listing.entries,
            }
            .to_bytes();
            connection.write_frame(frame.slice(4..)).await?;
        }
        PeerCode::FolderContentsResponse => {
            let (_, response) =
                FolderContentsResponse::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
            ctx.waiters.complete(
                &WaitKey::FolderContentsResponse(username.to_string(), response.token),
                response,
            );
        }
        PeerCode::TransferRequest => {
            let (_, request) =
                TransferRequest::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
            let _ = ctx.events.send(ClientEvent::TransferRequested {
                username: username.to_string(),
                token: request.token,
                filename: request.filename,
                size: request.size,
                direction: request.direction,
            });
        }
        PeerCode::TransferResponse => {
            let (_, response) =
                TransferResponse::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
            let token = response.token;
            ctx.waiters
                .complete(&WaitKey::TransferResponse(username.to_string(), token), response);
        }
        PeerCode::QueueDownload => {
            let (_, request) = QueueDownload::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
            if let Err(exception) = ctx.enqueue_action.enqueue(username, remote, &request.filename).await {
                let frame = QueueFailed {
                    filename: &request.filename,
                    reason: exception.0.as_str(),
                }
                .to_bytes();
                connection.write_frame(frame.slice(4..)).await?;
            }
        }
        PeerCode::PlaceInQueueRequest => {
            let (_, request) =
                PlaceInQueueRequest::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
            if let Some(place) = ctx
                .place_in_queue_resolver
                .resolve(username, remote, &request.filename)
                .await
            {
                let frame = PlaceInQueueResponse {
                    filename: &request.filename,
                    place,
                }
                .to_bytes();
                connection.write_frame(frame.slice(4..)).await?;
            }
        }
        PeerCode::PlaceInQueueResponse => {
            let (_, response) =
                PlaceInQueueResponse::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
            ctx.waiters.complete(
                &WaitKey::PlaceInQueueResponse(username.to_string(), response.filename.clone()),
                response,
            );
        }
        PeerCode::QueueFailed => {
            let (_, failed) = QueueFailed::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
            let _ = ctx.events.send(ClientEvent::DownloadQueueFailed {
                username: username.to_string(),
                filename: failed.filename,
                reason: failed.reason,
            });
        }
        PeerCode::PeerInit | PeerCode::PierceFirewall => {
            // Handled by the listener/manager before a connection reaches
            // this per-message dispatch loop.
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::DefaultCallbacks;
    use crate::net::connection::{ConnectionOptions, ConnectionType};
    use tokio::net::{TcpListener, TcpStream};

    fn ctx() -> (PeerDispatchContext, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let callbacks = Arc::new(DefaultCallbacks);
        (
            PeerDispatchContext {
                waiters: Arc::new(WaiterRegistry::new()),
                events,
                browse_resolver: callbacks.clone(),
                directory_resolver: callbacks.clone(),
                user_info_resolver: callbacks.clone(),
                enqueue_action: callbacks.clone(),
                place_in_queue_resolver: callbacks,
            },
            rx,
        )
    }

    async fn loopback() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        let (server_stream, remote) = accept.unwrap();
        let client_stream = connect.unwrap();
        (
            Connection::from_stream(
                ConnectionType::Incoming,
                server_stream,
                remote,
                None,
                ConnectionOptions::default().without_inactivity_timeout(),
            ),
            Connection::from_stream(
                ConnectionType::PeerMessage,
                client_stream,
                remote,
                None,
                ConnectionOptions::default().without_inactivity_timeout(),
            ),
        )
    }

    #[tokio::test]
    async fn shares_request_replies_with_default_empty_response() {
        let (ctx, _rx) = ctx();
        let (mut server, mut client) = loopback().await;
        let remote = "127.0.0.1:1".parse().unwrap();

        dispatch(PeerCode::SharesRequest as u32, &[], "alice", remote, &mut server, &ctx)
            .await
            .unwrap();

        let frame = client.read_frame().await.unwrap();
        let (code, body) = crate::protocol::decode_frame(&frame).unwrap();
        assert_eq!(code, PeerCode::SharesResponse as u32);
        let (_, parsed) = SharesResponse::parse(body).unwrap();
        assert!(parsed.files.is_empty());
    }

    #[tokio::test]
    async fn queue_download_failure_sends_queue_failed() {
        struct AlwaysFails;
        #[async_trait::async_trait]
        impl EnqueueDownloadAction for AlwaysFails {
            async fn enqueue(
                &self,
                _username: &str,
                _endpoint: SocketAddr,
                _filename: &str,
            ) -> Result<(), crate::callbacks::DownloadEnqueueException> {
                Err(crate::callbacks::DownloadEnqueueException("no such file".into()))
            }
        }

        let (mut ctx, _rx) = ctx();
        ctx.enqueue_action = Arc::new(AlwaysFails);
        let (mut server, mut client) = loopback().await;
        let remote = "127.0.0.1:1".parse().unwrap();

        let body = QueueDownload { filename: "song.flac" }.to_bytes();
        let (_, body) = crate::protocol::decode_frame(&body[4..]).unwrap();
        dispatch(PeerCode::QueueDownload as u32, body, "alice", remote, &mut server, &ctx)
            .await
            .unwrap();

        let frame = client.read_frame().await.unwrap();
        let (code, body) = crate::protocol::decode_frame(&frame).unwrap();
        assert_eq!(code, PeerCode::QueueFailed as u32);
        let (_, parsed) = QueueFailed::parse(body).unwrap();
        assert_eq!(parsed.filename, "song.flac");
        assert_eq!(parsed.reason, "no such file");
    }

    #[tokio::test]
    async fn search_response_is_forwarded_as_event() {
        let (ctx, mut rx) = ctx();
        let (mut server, _client) = loopback().await;
        let remote = "127.0.0.1:1".parse().unwrap();

        let frame = SearchResponse {
            username: "bob".into(),
            token: 5,
            files: vec![],
            has_free_upload_slot: true,
            upload_speed: 10,
        }
        .to_bytes();
        let (_, body) = crate::protocol::decode_frame(&frame[4..]).unwrap();

        dispatch(PeerCode::SearchResponse as u32, body, "bob", remote, &mut server, &ctx)
            .await
            .unwrap();

        match rx.try_recv().unwrap() {
            ClientEvent::SearchResultReceived { username, token, .. } => {
                assert_eq!(username, "bob");
                assert_eq!(token, 5);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

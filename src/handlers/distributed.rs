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
use std::sync::Arc;

use crate::distributed_manager::DistributedManager;
use crate::error::SlskResult;
use crate::protocol::distributed::{BranchLevel, BranchRoot, ChildDepth, DistributedCode, SearchRequest};

/// Dispatches a frame arriving on an established distributed connection,
/// whether that connection is our parent or one of our children.
///
/// `from` identifies the sender: `"parent"` for the single parent link, or
/// the child's username for a connection in the child set. This lets
/// search-request deduplication and branch-info updates tell the two roles
/// apart without the caller threading a separate enum through.
pub async fn dispatch(
    code: u32,
    body: &[u8],
    from: &str,
    raw_frame: &[u8],
    distributed: &Arc<DistributedManager>,
) -> SlskResult<()> {
    let distributed_code = DistributedCode::try_from(code)?;

    match distributed_code {
        DistributedCode::Ping => {
            // No payload; presence on the wire is the whole signal.
        }
        DistributedCode::SearchRequest => {
            let (_, request) = SearchRequest::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
            distributed.handle_search_request(from, raw_frame, request).await;
        }
        DistributedCode::BranchLevel => {
            if from == "parent" {
                let (_, level) = BranchLevel::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
                let root = distributed.branch_root().await;
                distributed.receive_parent_branch_info(level.level, root).await;
            }
        }
        DistributedCode::BranchRoot => {
            if from == "parent" {
                let (_, root) = BranchRoot::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
                let level = distributed.branch_level();
                distributed.receive_parent_branch_info(level, root.username).await;
            }
        }
        DistributedCode::ChildDepth => {
            let (_, child_depth) = ChildDepth::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
            distributed.record_child_depth(from, child_depth.depth).await;
        }
    }

    Ok(())
}

/// Dispatches a distributed sub-message that arrived wrapped in the
/// server's `EmbeddedMessage` envelope, i.e. this node is acting as branch
/// root and the server is relaying a search request on the mesh's behalf.
/// The server is never a real mesh participant, so there is no `from`
/// child/parent identity to deduplicate against.
pub async fn dispatch_embedded(code: u32, body: &[u8], distributed: &Arc<DistributedManager>) -> SlskResult<()> {
    let distributed_code = DistributedCode::try_from(code)?;

    if let DistributedCode::SearchRequest = distributed_code {
        let (_, request) = SearchRequest::parse(body).map_err(|_| crate::error::SlskError::MalformedMessage)?;
        let frame = crate::protocol::encode_frame(code, body);
        distributed.handle_search_request("server", &frame, request).await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::DefaultCallbacks;
    use crate::net::connection::ConnectionOptions;
    use crate::peer_manager::PeerConnectionManager;
    use crate::util::TokenCounter;
    use crate::wait::WaiterRegistry;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn manager() -> Arc<DistributedManager> {
        let (server_tx, _rx) = mpsc::unbounded_channel();
        let (peer_server_tx, _peer_rx) = mpsc::unbounded_channel();
        let (peer_events_tx, _peer_events_rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let waiters = Arc::new(WaiterRegistry::new());
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
            crate::distributed_manager::DistributedManagerOptions {
                accept_children: true,
                child_limit: 2,
                deduplicate_search_requests: true,
                message_timeout: Duration::from_secs(5),
            },
        ))
    }

    #[tokio::test]
    async fn branch_level_from_parent_updates_state() {
        let mgr = manager();
        let frame = BranchLevel { level: 2 }.to_bytes();
        let (_, body) = crate::protocol::decode_frame(&frame[4..]).unwrap();
        dispatch(DistributedCode::BranchLevel as u32, body, "parent", &frame, &mgr)
            .await
            .unwrap();
        assert_eq!(mgr.branch_level(), 2);
    }

    #[tokio::test]
    async fn branch_level_from_child_is_ignored() {
        let mgr = manager();
        let frame = BranchLevel { level: 9 }.to_bytes();
        let (_, body) = crate::protocol::decode_frame(&frame[4..]).unwrap();
        dispatch(DistributedCode::BranchLevel as u32, body, "some-child", &frame, &mgr)
            .await
            .unwrap();
        assert_eq!(mgr.branch_level(), 0);
    }

    #[tokio::test]
    async fn unrecognised_code_errors() {
        let mgr = manager();
        let result = dispatch(200, &[], "parent", &[], &mgr).await;
        assert!(result.is_err());
    }
}

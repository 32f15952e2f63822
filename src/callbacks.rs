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

//! Capability traits for the extension points the host application
//! supplies. The host's file I/O, browse/search indexing, and endpoint
//! caching live behind these; this crate never touches disk or UI state
//! directly. Defaults are the constant no-op implementations the design
//! calls for, wired in unless the host overrides them.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::protocol::FileEntry;

#[derive(Debug, Clone, Default)]
pub struct UserInfo {
    pub description: String,
    pub has_picture: bool,
    pub upload_slots: u32,
    pub queue_length: u32,
    pub free_upload_slots: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SharesResponseData {
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResponseData {
    pub files: Vec<FileEntry>,
    pub has_free_upload_slot: bool,
    pub upload_speed: u32,
}

#[derive(Debug, Clone)]
pub struct DirectoryListing {
    pub path: String,
    pub entries: Vec<FileEntry>,
}

/// Returned by a failed enqueue attempt; carried verbatim into the
/// `QueueFailed` frame sent back to the requesting peer.
#[derive(Debug, Clone, thiserror::Error)]
#[error("enqueue rejected: {0}")]
pub struct DownloadEnqueueException(pub String);

#[async_trait]
pub trait SearchResponseResolver: Send + Sync {
    async fn resolve(&self, username: &str, token: i32, query: &str) -> Option<SearchResponseData>;
}

#[async_trait]
pub trait BrowseResponseResolver: Send + Sync {
    async fn resolve(&self, username: &str, endpoint: SocketAddr) -> SharesResponseData;
}

#[async_trait]
pub trait DirectoryContentsResolver: Send + Sync {
    async fn resolve(
        &self,
        username: &str,
        endpoint: SocketAddr,
        token: i32,
        directory: &str,
    ) -> DirectoryListing;
}

#[async_trait]
pub trait UserInfoResponseResolver: Send + Sync {
    async fn resolve(&self, username: &str, endpoint: SocketAddr) -> UserInfo;
}

#[async_trait]
pub trait EnqueueDownloadAction: Send + Sync {
    async fn enqueue(
        &self,
        username: &str,
        endpoint: SocketAddr,
        filename: &str,
    ) -> Result<(), DownloadEnqueueException>;
}

#[async_trait]
pub trait PlaceInQueueResponseResolver: Send + Sync {
    async fn resolve(&self, username: &str, endpoint: SocketAddr, filename: &str) -> Option<u32>;
}

#[async_trait]
pub trait UserEndPointCache: Send + Sync {
    async fn get(&self, username: &str) -> Option<SocketAddr>;
    async fn set(&self, username: &str, endpoint: SocketAddr, ttl: Duration);
}

#[async_trait]
pub trait SearchResponseCache: Send + Sync {
    async fn hold(&self, username: &str, response: SearchResponseData);
    async fn take_pending(&self, username: &str) -> Vec<SearchResponseData>;
}

/// No-op implementation of every capability trait, used for whichever
/// ones a host does not wire up: empty search results, zero `fileCount`
/// browse responses, and so on.
pub struct DefaultCallbacks;

#[async_trait]
impl SearchResponseResolver for DefaultCallbacks {
    async fn resolve(&self, _username: &str, _token: i32, _query: &str) -> Option<SearchResponseData> {
        None
    }
}

#[async_trait]
impl BrowseResponseResolver for DefaultCallbacks {
    async fn resolve(&self, _username: &str, _endpoint: SocketAddr) -> SharesResponseData {
        SharesResponseData::default()
    }
}

#[async_trait]
impl DirectoryContentsResolver for DefaultCallbacks {
    async fn resolve(
        &self,
        _username: &str,
        _endpoint: SocketAddr,
        _token: i32,
        directory: &str,
    ) -> DirectoryListing {
        DirectoryListing {
            path: directory.to_string(),
            entries: Vec::new(),
        }
    }
}

#[async_trait]
impl UserInfoResponseResolver for DefaultCallbacks {
    async fn resolve(&self, _username: &str, _endpoint: SocketAddr) -> UserInfo {
        UserInfo::default()
    }
}

#[async_trait]
impl EnqueueDownloadAction for DefaultCallbacks {
    async fn enqueue(
        &self,
        _username: &str,
        _endpoint: SocketAddr,
        _filename: &str,
    ) -> Result<(), DownloadEnqueueException> {
        Ok(())
    }
}

#[async_trait]
impl PlaceInQueueResponseResolver for DefaultCallbacks {
    async fn resolve(&self, _username: &str, _endpoint: SocketAddr, _filename: &str) -> Option<u32> {
        None
    }
}

#[async_trait]
impl UserEndPointCache for DefaultCallbacks {
    async fn get(&self, _username: &str) -> Option<SocketAddr> {
        None
    }

    async fn set(&self, _username: &str, _endpoint: SocketAddr, _ttl: Duration) {}
}

#[async_trait]
impl SearchResponseCache for DefaultCallbacks {
    async fn hold(&self, _username: &str, _response: SearchResponseData) {}

    async fn take_pending(&self, _username: &str) -> Vec<SearchResponseData> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_search_resolver_returns_none() {
        let resolved = SearchResponseResolver::resolve(&DefaultCallbacks, "bob", 1, "query").await;
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn default_enqueue_action_succeeds() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = DefaultCallbacks.enqueue("bob", addr, "file.flac").await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn default_place_in_queue_resolver_returns_none() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(PlaceInQueueResponseResolver::resolve(&DefaultCallbacks, "bob", addr, "file.flac")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn default_endpoint_cache_never_has_an_answer() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        DefaultCallbacks.set("bob", addr, Duration::from_secs(60)).await;
        assert!(UserEndPointCache::get(&DefaultCallbacks, "bob").await.is_none());
    }

    #[tokio::test]
    async fn default_search_response_cache_holds_nothing() {
        DefaultCallbacks.hold("bob", SearchResponseData::default()).await;
        assert!(SearchResponseCache::take_pending(&DefaultCallbacks, "bob").await.is_empty());
    }
}

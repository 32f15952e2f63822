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

//! Per-transfer state machines plus the slot and throughput bookkeeping
//! they share. `maximum_concurrent_uploads` is the caller-facing knob;
//! the per-user cap is an internal fairness measure only, so it has no
//! corresponding field in [`crate::config::SlskOptions`].

pub mod download;
pub mod upload;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};

use crate::events::{ClientEvent, TransferProgress};
use crate::util::TokenBucket;

pub struct TransferManagerOptions {
    pub maximum_concurrent_uploads: usize,
    pub maximum_concurrent_uploads_per_user: usize,
    pub progress_interval: Duration,
    pub upload_rate_limit: Option<(u32, Duration)>,
}

impl Default for TransferManagerOptions {
    fn default() -> Self {
        Self {
            maximum_concurrent_uploads: 4,
            maximum_concurrent_uploads_per_user: 1,
            progress_interval: Duration::from_millis(100),
            upload_rate_limit: None,
        }
    }
}

/// Shared slot accounting and throttling for every upload/download this
/// node drives. Per-transfer wire sequencing lives in [`upload`]/[`download`];
/// this struct only arbitrates who gets to run concurrently and how fast.
pub struct TransferManager {
    events: mpsc::UnboundedSender<ClientEvent>,
    global_upload_slots: Arc<Semaphore>,
    per_user_upload_slots: AsyncMutex<HashMap<String, Arc<Semaphore>>>,
    per_user_limit: usize,
    upload_bucket: Option<Arc<TokenBucket>>,
    progress_interval: Duration,
}

impl TransferManager {
    pub fn new(events: mpsc::UnboundedSender<ClientEvent>, options: TransferManagerOptions) -> Self {
        let upload_bucket = options
            .upload_rate_limit
            .map(|(capacity, interval)| TokenBucket::spawn(capacity, interval));
        Self {
            events,
            global_upload_slots: Arc::new(Semaphore::new(options.maximum_concurrent_uploads)),
            per_user_upload_slots: AsyncMutex::new(HashMap::new()),
            per_user_limit: options.maximum_concurrent_uploads_per_user.max(1),
            upload_bucket,
            progress_interval: options.progress_interval,
        }
    }

    async fn upload_slot_for(&self, username: &str) -> Arc<Semaphore> {
        let mut table = self.per_user_upload_slots.lock().await;
        table
            .entry(username.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_user_limit)))
            .clone()
    }

    /// Blocks until both the global and the per-user upload slot are free.
    /// Holding the returned permits for the lifetime of the transfer is
    /// what enforces both caps; releasing either early would defeat it.
    pub async fn acquire_upload_slots(&self, username: &str) -> (OwnedSemaphorePermit, OwnedSemaphorePermit) {
        let global = self
            .global_upload_slots
            .clone()
            .acquire_owned()
            .await
            .expect("upload slot semaphore is never closed");
        let per_user = self
            .upload_slot_for(username)
            .await
            .acquire_owned()
            .await
            .expect("upload slot semaphore is never closed");
        (global, per_user)
    }

    pub fn emit_progress(&self, progress: TransferProgress) {
        let _ = self.events.send(ClientEvent::TransferProgress(progress));
    }

    pub fn progress_interval(&self) -> Duration {
        self.progress_interval
    }

    pub fn upload_bucket(&self) -> Option<Arc<TokenBucket>> {
        self.upload_bucket.clone()
    }
}

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

pub mod token_bucket;

use std::sync::atomic::{AtomicI32, Ordering};

pub use token_bucket::TokenBucket;

/// Monotonically increasing `i32` token source shared by the peer and
/// distributed managers' solicitation tables.
pub struct TokenCounter(AtomicI32);

impl TokenCounter {
    pub fn starting_at(start: i32) -> Self {
        Self(AtomicI32::new(start))
    }

    pub fn next(&self) -> i32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Per-connection last-seen hash used by the distributed manager's search
/// request deduplication. Keeps a single slot per connection, so
/// interleaved requests from different originators on the same connection
/// only dedupe consecutive repeats, not every duplicate regardless of
/// position - matches the wire protocol's retransmission pattern of
/// immediate back-to-back resends.
#[derive(Default)]
pub struct LastSeenHash(Option<Vec<u8>>);

impl LastSeenHash {
    /// Returns `true` if `bytes` duplicates the previously observed frame,
    /// and records `bytes` as the new last-seen value either way.
    pub fn observe(&mut self, bytes: &[u8]) -> bool {
        let duplicate = self.0.as_deref() == Some(bytes);
        self.0 = Some(bytes.to_vec());
        duplicate
    }
}

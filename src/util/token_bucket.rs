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

//! Periodic (not leaky) token bucket used to throttle transfer throughput.
//!
//! Every `interval`, the counter is *reset* to `capacity` rather than
//! incremented - this matches the protocol's transfer pacing semantics,
//! not a continuous refill. A background task drives the tick, the same
//! way a repeating sweep timer gets its own dedicated `tokio::spawn` loop
//! elsewhere in this crate.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::error::{SlskError, SlskResult};

struct State {
    capacity: u32,
    current: u32,
}

pub struct TokenBucket {
    state: Mutex<State>,
    next_capacity: AtomicU32,
    notify: Notify,
}

const NO_PENDING_CAPACITY: u32 = u32::MAX;

impl TokenBucket {
    /// Spawns the refill task and returns a handle shared between however
    /// many concurrent `get` callers need throttling against it.
    pub fn spawn(capacity: u32, refill_interval: Duration) -> Arc<Self> {
        let bucket = Arc::new(Self {
            state: Mutex::new(State {
                capacity,
                current: capacity,
            }),
            next_capacity: AtomicU32::new(NO_PENDING_CAPACITY),
            notify: Notify::new(),
        });

        let weak = Arc::downgrade(&bucket);
        tokio::spawn(async move {
            let mut ticker = interval(refill_interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let Some(bucket) = weak.upgrade() else {
                    return;
                };
                bucket.refill();
            }
        });

        bucket
    }

    fn refill(&self) {
        let mut state = self.state.lock().unwrap();
        let pending = self.next_capacity.swap(NO_PENDING_CAPACITY, Ordering::AcqRel);
        if pending != NO_PENDING_CAPACITY {
            state.capacity = pending;
        }
        state.current = state.capacity;
        drop(state);
        self.notify.notify_waiters();
    }

    /// `setCapacity` takes effect at the next refill tick, never mid-window.
    pub fn set_capacity(&self, capacity: u32) {
        self.next_capacity.store(capacity, Ordering::Release);
    }

    /// Clamp `n` to capacity, grant what's available, or wait for the next
    /// refill and retry. Cancellable at every suspension point.
    pub async fn get(&self, n: u32, cancel: &CancellationToken) -> SlskResult<u32> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().unwrap();
                let clamped = n.min(state.capacity);
                if state.current >= clamped {
                    state.current -= clamped;
                    return Ok(clamped);
                } else if state.current > 0 {
                    let granted = state.current;
                    state.current = 0;
                    return Ok(granted);
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Err(SlskError::WaitCanceled),
            }
        }
    }

    pub fn capacity(&self) -> u32 {
        self.state.lock().unwrap().capacity
    }

    pub fn current(&self) -> u32 {
        self.state.lock().unwrap().current
    }
}

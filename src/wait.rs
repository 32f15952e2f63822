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

//! Promise table keyed by structural [`WaitKey`]s.
//!
//! Correlates an asynchronous response arriving on a demultiplexed
//! connection with the caller that is awaiting it. Handlers call
//! [`WaiterRegistry::complete`] as soon as a matching message arrives;
//! callers register a wait *before* sending the request that will produce
//! the response, so a reply racing ahead of registration is never lost.
//! Registration is synchronous (`wait` inserts into the table before it
//! returns a future) precisely so that "register, then send" is safe even
//! if the caller never polls the returned future immediately.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{SlskError, SlskResult};

/// Structural key identifying a single outstanding wait.
///
/// Namespaces mirror the message codes that can complete a wait, plus a
/// handful of synthetic namespaces used by the connection-establishment
/// races and the distributed mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WaitKey {
    Login,
    GetPeerAddress(String),
    GetUserStatus(String),
    UserInfoResponse(String),
    BrowseResponse(String),
    FolderContentsResponse(String, i32),
    PlaceInQueueResponse(String, String),
    TransferResponse(String, i32),
    SolicitedPeerConnection(String, i32),
    SolicitedDistributedConnection(String, i32),
    IncomingTransfer(String, i32),
    ChildDepthMessage(String),
    IndirectConnection(String, i32),
}

type AnyValue = Box<dyn Any + Send>;

struct Pending {
    tx: oneshot::Sender<SlskResult<AnyValue>>,
}

/// Thread-safe `WaitKey -> Promise<T>` table.
///
/// `complete`/`wait` may race freely; at most one waiter observes a given
/// completion. A second concurrent `wait` on a key already pending is a
/// programming error and fails immediately (synchronously) with
/// `WaitKeyCollision`, it does not queue behind the first.
#[derive(Default)]
pub struct WaiterRegistry {
    pending: Mutex<HashMap<WaitKey, Pending>>,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register `key` synchronously and return a future that resolves when
    /// `complete`/`cancel`/`throw` is called for it, or when `timeout`
    /// elapses. Fails immediately, without registering, if `key` already
    /// has a pending waiter.
    pub fn wait<T: 'static + Send>(
        &self,
        key: WaitKey,
        timeout: Duration,
    ) -> SlskResult<impl Future<Output = SlskResult<T>> + '_> {
        let rx = {
            let mut pending = self.pending.lock().unwrap();
            if pending.contains_key(&key) {
                return Err(SlskError::WaitKeyCollision(key));
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(key.clone(), Pending { tx });
            rx
        };

        Ok(async move {
            let result = match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(SlskError::WaitCanceled),
                Err(_) => {
                    self.pending.lock().unwrap().remove(&key);
                    Err(SlskError::WaitTimeout)
                }
            };

            result.and_then(|boxed| {
                boxed
                    .downcast::<T>()
                    .map(|b| *b)
                    .map_err(|_| SlskError::MalformedMessage)
            })
        })
    }

    /// Resolve the waiter registered under `key`, if any. Silently dropped
    /// when nobody is waiting - a handler racing ahead of registration is
    /// expected, not an error.
    pub fn complete<T: 'static + Send>(&self, key: &WaitKey, value: T) {
        if let Some(pending) = self.pending.lock().unwrap().remove(key) {
            let _ = pending.tx.send(Ok(Box::new(value)));
        }
    }

    /// Resolves whichever pending solicited-connection waiter carries
    /// `token`, trying the peer namespace before the distributed one.
    /// Used by the acceptor's `PierceFirewall` hand-off, which only knows
    /// the token and must discover which table it belongs to. Returns the
    /// key it completed, or `None` if nothing was waiting on that token.
    pub fn complete_by_token<T: 'static + Send>(&self, token: i32, value: T) -> Option<WaitKey> {
        let mut pending = self.pending.lock().unwrap();
        let key = pending
            .keys()
            .find(|key| matches!(key, WaitKey::SolicitedPeerConnection(_, t) if *t == token))
            .or_else(|| {
                pending
                    .keys()
                    .find(|key| matches!(key, WaitKey::SolicitedDistributedConnection(_, t) if *t == token))
            })
            .cloned()?;

        let entry = pending.remove(&key)?;
        let _ = entry.tx.send(Ok(Box::new(value)));
        Some(key)
    }

    pub fn cancel(&self, key: &WaitKey) {
        if let Some(pending) = self.pending.lock().unwrap().remove(key) {
            let _ = pending.tx.send(Err(SlskError::WaitCanceled));
        }
    }

    pub fn throw(&self, key: &WaitKey, err: SlskError) {
        if let Some(pending) = self.pending.lock().unwrap().remove(key) {
            let _ = pending.tx.send(Err(err));
        }
    }

    /// Fail every outstanding waiter with `WaitCanceled`. Called on
    /// disconnect/shutdown.
    pub fn cancel_all(&self) {
        let mut pending = self.pending.lock().unwrap();
        for (_, p) in pending.drain() {
            let _ = p.tx.send(Err(SlskError::WaitCanceled));
        }
    }

    pub fn is_pending(&self, key: &WaitKey) -> bool {
        self.pending.lock().unwrap().contains_key(key)
    }
}

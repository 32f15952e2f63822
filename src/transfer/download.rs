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

//! Download state machine, the receiving counterpart of [`super::upload`].
//! Downloads are not subject to a concurrency cap - the remote peer's
//! uploader slots already gate them - so `run_download` never touches
//! [`super::TransferManager::acquire_upload_slots`]; it only uses the
//! manager for progress reporting.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{SlskError, SlskResult};
use crate::events::{TransferProgress, TransferState};
use crate::net::connection::TransferConnection;

use super::TransferManager;

const CHUNK_SIZE: usize = 16 * 1024;

pub struct DownloadRequest {
    pub username: String,
    pub filename: String,
    pub size: u64,
    /// Byte offset to resume from; `0` for a fresh download. The caller is
    /// responsible for having already negotiated this offset with the peer
    /// (`TransferRequest`/`TransferResponse` exchange), since resumption is
    /// a wire-level concern this module has no visibility into.
    pub resume_from: u64,
}

/// Drives a single download to completion over an already-negotiated
/// [`TransferConnection`]. `write_chunk` hands received bytes to the host's
/// file sink; returning `Err` aborts the download with [`SlskError::TransferFailed`].
pub async fn run_download(
    manager: &TransferManager,
    request: DownloadRequest,
    mut connection: TransferConnection,
    mut write_chunk: impl FnMut(&[u8]) -> SlskResult<()> + Send,
    cancel: &CancellationToken,
) -> SlskResult<()> {
    let report = |state: TransferState, bytes_transferred: u64, elapsed: Duration| {
        manager.emit_progress(TransferProgress {
            username: request.username.clone(),
            filename: request.filename.clone(),
            bytes_transferred,
            elapsed,
            state,
        });
    };

    report(TransferState::Initializing, request.resume_from, Duration::ZERO);

    let started = Instant::now();
    let mut received = request.resume_from;
    let mut last_report = Instant::now();

    report(TransferState::Transferring, received, Duration::ZERO);

    let result: SlskResult<()> = async {
        while received < request.size {
            if cancel.is_cancelled() {
                return Err(SlskError::WaitCanceled);
            }

            let remaining = (request.size - received) as usize;
            let want = CHUNK_SIZE.min(remaining);
            let chunk = tokio::select! {
                chunk = connection.read_chunk(want) => chunk?,
                _ = cancel.cancelled() => return Err(SlskError::WaitCanceled),
            };
            write_chunk(&chunk).map_err(|_| SlskError::TransferFailed)?;
            received += chunk.len() as u64;

            if last_report.elapsed() >= manager.progress_interval() {
                report(TransferState::Transferring, received, started.elapsed());
                last_report = Instant::now();
            }
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            report(TransferState::Completed, received, started.elapsed());
            Ok(())
        }
        Err(SlskError::WaitCanceled) => {
            report(TransferState::Cancelled, received, started.elapsed());
            Err(SlskError::WaitCanceled)
        }
        Err(e) => {
            report(TransferState::Errored, received, started.elapsed());
            Err(e)
        }
    }
}

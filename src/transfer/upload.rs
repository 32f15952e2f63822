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

//! Upload state machine: `Queued -> Initializing -> Transferring ->
//! Completed | Errored | Cancelled`. A queued upload does not hold a slot;
//! [`run_upload`] only blocks on [`TransferManager::acquire_upload_slots`]
//! once the caller is ready to move it into `Initializing`.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{SlskError, SlskResult};
use crate::events::{TransferProgress, TransferState};
use crate::net::connection::TransferConnection;

use super::TransferManager;

const CHUNK_SIZE: usize = 16 * 1024;

pub struct UploadRequest {
    pub username: String,
    pub filename: String,
    pub size: u64,
}

/// Drives a single upload to completion over an already-negotiated
/// [`TransferConnection`]. `read_chunk` pulls up to `buf.len()` bytes from
/// the host's file source into `buf` and returns how many were read; `0`
/// means end of file. Progress is reported at most once per
/// `manager.progress_interval()`, plus once at start and once at the end.
pub async fn run_upload(
    manager: &TransferManager,
    request: UploadRequest,
    mut connection: TransferConnection,
    mut read_chunk: impl FnMut(&mut [u8]) -> SlskResult<usize> + Send,
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

    report(TransferState::Initializing, 0, Duration::ZERO);
    let (_global_permit, _user_permit) = manager.acquire_upload_slots(&request.username).await;

    let started = Instant::now();
    let mut sent: u64 = 0;
    let mut last_report = Instant::now();
    let mut buf = vec![0u8; CHUNK_SIZE];

    report(TransferState::Transferring, 0, Duration::ZERO);

    let result: SlskResult<()> = async {
        while sent < request.size {
            if cancel.is_cancelled() {
                return Err(SlskError::WaitCanceled);
            }

            let remaining = (request.size - sent) as usize;
            let want = buf.len().min(remaining) as u32;
            let granted = match manager.upload_bucket() {
                Some(bucket) => bucket.get(want, cancel).await?,
                None => want,
            };
            if granted == 0 {
                continue;
            }

            let n = read_chunk(&mut buf[..granted as usize])?;
            if n == 0 {
                return Err(SlskError::TransferFailed);
            }
            connection.write_chunk(&buf[..n]).await?;
            sent += n as u64;

            if last_report.elapsed() >= manager.progress_interval() {
                report(TransferState::Transferring, sent, started.elapsed());
                last_report = Instant::now();
            }
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            report(TransferState::Completed, sent, started.elapsed());
            Ok(())
        }
        Err(SlskError::WaitCanceled) => {
            report(TransferState::Cancelled, sent, started.elapsed());
            Err(SlskError::WaitCanceled)
        }
        Err(e) => {
            report(TransferState::Errored, sent, started.elapsed());
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ClientEvent;
    use crate::net::connection::{ConnectionOptions, RawConnection};
    use crate::transfer::TransferManagerOptions;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    async fn loopback_transfer_pair() -> (TransferConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        let (server_stream, remote) = accept.unwrap();
        let client_stream = connect.unwrap();

        let uploader = RawConnection::from_stream(
            server_stream,
            remote,
            ConnectionOptions::default().without_inactivity_timeout(),
        )
        .into_transfer(7);

        (uploader, client_stream)
    }

    #[tokio::test]
    async fn upload_streams_all_bytes_and_reports_completion() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = TransferManager::new(tx, TransferManagerOptions::default());
        let (uploader, mut reader) = loopback_transfer_pair().await;

        let payload = vec![0xABu8; 40_000];
        let to_send = payload.clone();
        let mut offset = 0usize;
        let cancel = CancellationToken::new();

        let reader_task = tokio::spawn(async move {
            let mut received = vec![0u8; 40_000];
            reader.read_exact(&mut received).await.unwrap();
            received
        });

        run_upload(
            &manager,
            UploadRequest {
                username: "alice".into(),
                filename: "song.flac".into(),
                size: 40_000,
            },
            uploader,
            |buf| {
                let n = buf.len().min(to_send.len() - offset);
                buf[..n].copy_from_slice(&to_send[offset..offset + n]);
                offset += n;
                Ok(n)
            },
            &cancel,
        )
        .await
        .unwrap();

        let received = reader_task.await.unwrap();
        assert_eq!(received, payload);

        let mut saw_completed = false;
        while let Ok(ClientEvent::TransferProgress(progress)) = rx.try_recv() {
            if matches!(progress.state, TransferState::Completed) {
                saw_completed = true;
                assert_eq!(progress.bytes_transferred, 40_000);
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn cancellation_reports_cancelled_state() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = TransferManager::new(tx, TransferManagerOptions::default());
        let (uploader, _reader) = loopback_transfer_pair().await;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = run_upload(
            &manager,
            UploadRequest {
                username: "alice".into(),
                filename: "song.flac".into(),
                size: 10,
            },
            uploader,
            |_buf| Ok(0),
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(SlskError::WaitCanceled)));
        let mut saw_cancelled = false;
        while let Ok(ClientEvent::TransferProgress(progress)) = rx.try_recv() {
            if matches!(progress.state, TransferState::Cancelled) {
                saw_cancelled = true;
            }
        }
        assert!(saw_cancelled);
    }
}

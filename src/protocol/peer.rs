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

//! Peer scope message codes and message bodies (per-peer connections).

use bytes::{BufMut, Bytes, BytesMut};
use nom::multi::count;
use nom::IResult;
use std::convert::TryFrom;

use super::{parse_bool, parse_i32, parse_string, parse_u32, parse_u64, put_string, FileEntry};
use crate::error::SlskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCode {
    PierceFirewall = 0,
    PeerInit = 1,
    SharesRequest = 4,
    SharesResponse = 5,
    SearchResponse = 9,
    UserInfoRequest = 15,
    UserInfoResponse = 16,
    FolderContentsRequest = 36,
    FolderContentsResponse = 37,
    TransferRequest = 40,
    TransferResponse = 41,
    QueueDownload = 43,
    PlaceInQueueResponse = 44,
    QueueFailed = 46,
    PlaceInQueueRequest = 51,
}

impl TryFrom<u32> for PeerCode {
    type Error = SlskError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use PeerCode::*;
        Ok(match value {
            0 => PierceFirewall,
            1 => PeerInit,
            4 => SharesRequest,
            5 => SharesResponse,
            9 => SearchResponse,
            15 => UserInfoRequest,
            16 => UserInfoResponse,
            36 => FolderContentsRequest,
            37 => FolderContentsResponse,
            40 => TransferRequest,
            41 => TransferResponse,
            43 => QueueDownload,
            44 => PlaceInQueueResponse,
            46 => QueueFailed,
            51 => PlaceInQueueRequest,
            other => {
                return Err(SlskError::UnrecognisedCode {
                    scope: "peer",
                    code: other,
                })
            }
        })
    }
}

/// First message sent on a direct outbound peer connection.
pub struct PeerInit<'a> {
    pub username: &'a str,
    pub connection_type: &'a str,
    pub token: i32,
}

impl<'a> PeerInit<'a> {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, self.username);
        put_string(&mut buf, self.connection_type);
        buf.put_i32_le(self.token);
        super::encode_frame(PeerCode::PeerInit as u32, &buf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInitMessage {
    pub username: String,
    pub connection_type: String,
    pub token: i32,
}

impl PeerInitMessage {
    pub fn parse(input: &[u8]) -> IResult<&[u8], PeerInitMessage> {
        let (input, username) = parse_string(input)?;
        let (input, connection_type) = parse_string(input)?;
        let (input, token) = parse_i32(input)?;
        Ok((
            input,
            PeerInitMessage {
                username,
                connection_type,
                token,
            },
        ))
    }
}

/// First message sent on an indirect (firewall-pierced) connection,
/// carrying the token that identifies the pending solicitation it
/// satisfies.
pub struct PierceFirewall {
    pub token: i32,
}

impl PierceFirewall {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_i32_le(self.token);
        super::encode_frame(PeerCode::PierceFirewall as u32, &buf)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], PierceFirewall> {
        let (input, token) = parse_i32(input)?;
        Ok((input, PierceFirewall { token }))
    }
}

pub struct SharesRequest;

impl SharesRequest {
    pub fn to_bytes(&self) -> Bytes {
        super::encode_frame(PeerCode::SharesRequest as u32, &[])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharesResponse {
    pub files: Vec<FileEntry>,
}

impl SharesResponse {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.files.len() as u32);
        for file in &self.files {
            file.write(&mut buf);
        }
        super::encode_frame(PeerCode::SharesResponse as u32, &buf)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], SharesResponse> {
        let (input, n) = parse_u32(input)?;
        let (input, files) = count(FileEntry::parse, n as usize)(input)?;
        Ok((input, SharesResponse { files }))
    }
}

pub struct SearchResponse {
    pub username: String,
    pub token: i32,
    pub files: Vec<FileEntry>,
    pub has_free_upload_slot: bool,
    pub upload_speed: u32,
}

impl SearchResponse {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.username);
        buf.put_i32_le(self.token);
        buf.put_u32_le(self.files.len() as u32);
        for file in &self.files {
            file.write(&mut buf);
        }
        buf.put_u8(self.has_free_upload_slot as u8);
        buf.put_u32_le(self.upload_speed);
        super::encode_frame(PeerCode::SearchResponse as u32, &buf)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], SearchResponse> {
        let (input, username) = parse_string(input)?;
        let (input, token) = parse_i32(input)?;
        let (input, n) = parse_u32(input)?;
        let (input, files) = count(FileEntry::parse, n as usize)(input)?;
        let (input, has_free_upload_slot) = parse_bool(input)?;
        let (input, upload_speed) = parse_u32(input)?;
        Ok((
            input,
            SearchResponse {
                username,
                token,
                files,
                has_free_upload_slot,
                upload_speed,
            },
        ))
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

pub struct UserInfoRequest;

impl UserInfoRequest {
    pub fn to_bytes(&self) -> Bytes {
        super::encode_frame(PeerCode::UserInfoRequest as u32, &[])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfoResponse {
    pub description: String,
    pub has_picture: bool,
    pub upload_slots: u32,
    pub queue_length: u32,
    pub free_upload_slots: bool,
}

impl UserInfoResponse {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.description);
        buf.put_u8(self.has_picture as u8);
        buf.put_u32_le(self.upload_slots);
        buf.put_u32_le(self.queue_length);
        buf.put_u8(self.free_upload_slots as u8);
        super::encode_frame(PeerCode::UserInfoResponse as u32, &buf)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], UserInfoResponse> {
        let (input, description) = parse_string(input)?;
        let (input, has_picture) = parse_bool(input)?;
        let (input, upload_slots) = parse_u32(input)?;
        let (input, queue_length) = parse_u32(input)?;
        let (input, free_upload_slots) = parse_bool(input)?;
        Ok((
            input,
            UserInfoResponse {
                description,
                has_picture,
                upload_slots,
                queue_length,
                free_upload_slots,
            },
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Download = 0,
    Upload = 1,
}

pub struct FolderContentsRequest<'a> {
    pub token: i32,
    pub directory: &'a str,
}

impl<'a> FolderContentsRequest<'a> {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_i32_le(self.token);
        put_string(&mut buf, self.directory);
        super::encode_frame(PeerCode::FolderContentsRequest as u32, &buf)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], FolderContentsRequestMessage> {
        let (input, token) = parse_i32(input)?;
        let (input, directory) = parse_string(input)?;
        Ok((input, FolderContentsRequestMessage { token, directory }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderContentsRequestMessage {
    pub token: i32,
    pub directory: String,
}

pub struct FolderContentsResponse<'a> {
    pub token: i32,
    pub directory: &'a str,
    pub entries: &'a [FileEntry],
}

impl<'a> FolderContentsResponse<'a> {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_i32_le(self.token);
        put_string(&mut buf, self.directory);
        buf.put_u32_le(self.entries.len() as u32);
        for entry in self.entries {
            entry.write(&mut buf);
        }
        super::encode_frame(PeerCode::FolderContentsResponse as u32, &buf)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], FolderContentsResponseMessage> {
        let (input, token) = parse_i32(input)?;
        let (input, directory) = parse_string(input)?;
        let (input, n) = parse_u32(input)?;
        let (input, entries) = count(FileEntry::parse, n as usize)(input)?;
        Ok((
            input,
            FolderContentsResponseMessage {
                token,
                directory,
                entries,
            },
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderContentsResponseMessage {
    pub token: i32,
    pub directory: String,
    pub entries: Vec<FileEntry>,
}

pub struct TransferRequest<'a> {
    pub direction: TransferDirection,
    pub token: i32,
    pub filename: &'a str,
    pub size: u64,
}

impl<'a> TransferRequest<'a> {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.direction as u32);
        buf.put_i32_le(self.token);
        put_string(&mut buf, self.filename);
        buf.put_u64_le(self.size);
        super::encode_frame(PeerCode::TransferRequest as u32, &buf)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], TransferRequestMessage> {
        let (input, direction) = parse_u32(input)?;
        let (input, token) = parse_i32(input)?;
        let (input, filename) = parse_string(input)?;
        let (input, size) = parse_u64(input)?;
        let direction = if direction == 1 {
            TransferDirection::Upload
        } else {
            TransferDirection::Download
        };
        Ok((
            input,
            TransferRequestMessage {
                direction,
                token,
                filename,
                size,
            },
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequestMessage {
    pub direction: TransferDirection,
    pub token: i32,
    pub filename: String,
    pub size: u64,
}

pub struct TransferResponse {
    pub token: i32,
    pub allowed: bool,
    pub reason: Option<String>,
}

impl TransferResponse {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_i32_le(self.token);
        buf.put_u8(self.allowed as u8);
        if !self.allowed {
            put_string(&mut buf, self.reason.as_deref().unwrap_or("rejected"));
        }
        super::encode_frame(PeerCode::TransferResponse as u32, &buf)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], TransferResponse> {
        let (input, token) = parse_i32(input)?;
        let (input, allowed) = parse_bool(input)?;
        if allowed {
            Ok((
                input,
                TransferResponse {
                    token,
                    allowed,
                    reason: None,
                },
            ))
        } else {
            let (input, reason) = parse_string(input)?;
            Ok((
                input,
                TransferResponse {
                    token,
                    allowed,
                    reason: Some(reason),
                },
            ))
        }
    }
}

pub struct QueueDownload<'a> {
    pub filename: &'a str,
}

impl<'a> QueueDownload<'a> {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, self.filename);
        super::encode_frame(PeerCode::QueueDownload as u32, &buf)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], QueueDownloadMessage> {
        let (input, filename) = parse_string(input)?;
        Ok((input, QueueDownloadMessage { filename }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDownloadMessage {
    pub filename: String,
}

pub struct QueueFailed<'a> {
    pub filename: &'a str,
    pub reason: &'a str,
}

impl<'a> QueueFailed<'a> {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, self.filename);
        put_string(&mut buf, self.reason);
        super::encode_frame(PeerCode::QueueFailed as u32, &buf)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], QueueFailedMessage> {
        let (input, filename) = parse_string(input)?;
        let (input, reason) = parse_string(input)?;
        Ok((
            input,
            QueueFailedMessage { filename, reason },
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFailedMessage {
    pub filename: String,
    pub reason: String,
}

pub struct PlaceInQueueRequest<'a> {
    pub filename: &'a str,
}

impl<'a> PlaceInQueueRequest<'a> {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, self.filename);
        super::encode_frame(PeerCode::PlaceInQueueRequest as u32, &buf)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], PlaceInQueueRequestMessage> {
        let (input, filename) = parse_string(input)?;
        Ok((input, PlaceInQueueRequestMessage { filename }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceInQueueRequestMessage {
    pub filename: String,
}

pub struct PlaceInQueueResponse<'a> {
    pub filename: &'a str,
    pub place: u32,
}

impl<'a> PlaceInQueueResponse<'a> {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, self.filename);
        buf.put_u32_le(self.place);
        super::encode_frame(PeerCode::PlaceInQueueResponse as u32, &buf)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], PlaceInQueueResponseMessage> {
        let (input, filename) = parse_string(input)?;
        let (input, place) = parse_u32(input)?;
        Ok((
            input,
            PlaceInQueueResponseMessage { filename, place },
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceInQueueResponseMessage {
    pub filename: String,
    pub place: u32,
}

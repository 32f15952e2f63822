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

//! Distributed scope message codes: the search-mesh tree between
//! branch parents, children, and the server-designated root.

use bytes::{BufMut, Bytes, BytesMut};
use nom::IResult;
use std::convert::TryFrom;

use super::{parse_i32, parse_string, parse_u32, put_string};
use crate::error::SlskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributedCode {
    Ping = 0,
    SearchRequest = 3,
    BranchLevel = 4,
    BranchRoot = 5,
    ChildDepth = 7,
}

impl TryFrom<u32> for DistributedCode {
    type Error = SlskError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use DistributedCode::*;
        Ok(match value {
            0 => Ping,
            3 => SearchRequest,
            4 => BranchLevel,
            5 => BranchRoot,
            7 => ChildDepth,
            other => {
                return Err(SlskError::UnrecognisedCode {
                    scope: "distributed",
                    code: other,
                })
            }
        })
    }
}

/// Keepalive sent down the branch tree; carries no payload beyond the code.
pub struct Ping;

impl Ping {
    pub fn to_bytes(&self) -> Bytes {
        super::encode_frame(DistributedCode::Ping as u32, &[])
    }
}

/// A search request forwarded down the distributed mesh. `username` is the
/// original searcher, not the forwarding peer.
pub struct SearchRequest<'a> {
    pub unknown: i32,
    pub username: &'a str,
    pub token: i32,
    pub query: &'a str,
}

impl<'a> SearchRequest<'a> {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_i32_le(self.unknown);
        put_string(&mut buf, self.username);
        buf.put_i32_le(self.token);
        put_string(&mut buf, self.query);
        super::encode_frame(DistributedCode::SearchRequest as u32, &buf)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], SearchRequestMessage> {
        let (input, unknown) = parse_i32(input)?;
        let (input, username) = parse_string(input)?;
        let (input, token) = parse_i32(input)?;
        let (input, query) = parse_string(input)?;
        Ok((
            input,
            SearchRequestMessage {
                unknown,
                username,
                token,
                query,
            },
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequestMessage {
    pub unknown: i32,
    pub username: String,
    pub token: i32,
    pub query: String,
}

impl SearchRequestMessage {
    /// Re-encode for forwarding to this node's own children, unchanged
    /// except for whatever the caller chooses to rewrite.
    pub fn to_bytes(&self) -> Bytes {
        SearchRequest {
            unknown: self.unknown,
            username: &self.username,
            token: self.token,
            query: &self.query,
        }
        .to_bytes()
    }
}

/// This node's depth in the branch tree, announced to children and to the
/// server (0 means this node is itself the root).
pub struct BranchLevel {
    pub level: i32,
}

impl BranchLevel {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_i32_le(self.level);
        super::encode_frame(DistributedCode::BranchLevel as u32, &buf)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], BranchLevel> {
        let (input, level) = parse_i32(input)?;
        Ok((input, BranchLevel { level }))
    }
}

/// Username of the user at the root of this node's branch.
pub struct BranchRoot<'a> {
    pub username: &'a str,
}

impl<'a> BranchRoot<'a> {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, self.username);
        super::encode_frame(DistributedCode::BranchRoot as u32, &buf)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], BranchRootMessage> {
        let (input, username) = parse_string(input)?;
        Ok((input, BranchRootMessage { username }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRootMessage {
    pub username: String,
}

/// Number of accepted children this node currently carries, announced
/// upward so a parent can judge how much of the tree sits beneath it.
pub struct ChildDepth {
    pub depth: u32,
}

impl ChildDepth {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.depth);
        super::encode_frame(DistributedCode::ChildDepth as u32, &buf)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ChildDepth> {
        let (input, depth) = parse_u32(input)?;
        Ok((input, ChildDepth { depth }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_has_empty_body() {
        let frame = Ping.to_bytes();
        let (_, body) = super::super::decode_frame(&frame[4..]).unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn search_request_round_trips() {
        let frame = SearchRequest {
            unknown: 1,
            username: "carol",
            token: 55,
            query: "flac album",
        }
        .to_bytes();
        let (code, body) = super::super::decode_frame(&frame[4..]).unwrap();
        assert_eq!(code, DistributedCode::SearchRequest as u32);

        let (_, parsed) = SearchRequest::parse(body).unwrap();
        assert_eq!(parsed.username, "carol");
        assert_eq!(parsed.token, 55);
        assert_eq!(parsed.query, "flac album");
    }

    #[test]
    fn search_request_message_reencodes_for_forwarding() {
        let original = SearchRequestMessage {
            unknown: 1,
            username: "carol".into(),
            token: 55,
            query: "flac album".into(),
        };
        let frame = original.to_bytes();
        let (_, body) = super::super::decode_frame(&frame[4..]).unwrap();
        let (_, reparsed) = SearchRequest::parse(body).unwrap();
        assert_eq!(reparsed.username, original.username);
        assert_eq!(reparsed.query, original.query);
    }

    #[test]
    fn branch_level_and_root_round_trip() {
        let frame = BranchLevel { level: 3 }.to_bytes();
        let (_, body) = super::super::decode_frame(&frame[4..]).unwrap();
        assert_eq!(BranchLevel::parse(body).unwrap().1.level, 3);

        let frame = BranchRoot { username: "root-user" }.to_bytes();
        let (_, body) = super::super::decode_frame(&frame[4..]).unwrap();
        assert_eq!(BranchRoot::parse(body).unwrap().1.username, "root-user");
    }

    #[test]
    fn unrecognised_code_is_reported_with_distributed_scope() {
        let err = DistributedCode::try_from(200).unwrap_err();
        assert!(matches!(
            err,
            SlskError::UnrecognisedCode { scope: "distributed", code: 200 }
        ));
    }
}

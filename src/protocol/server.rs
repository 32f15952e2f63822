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

//! Server scope message codes and message bodies.

use bytes::{BufMut, Bytes, BytesMut};
use nom::multi::count;
use nom::IResult;
use std::convert::TryFrom;
use std::net::Ipv4Addr;

use super::{parse_bool, parse_i32, parse_ip, parse_string, parse_u32, put_ip, put_string};
use crate::error::SlskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCode {
    Login = 1,
    SetListenPort = 2,
    GetPeerAddress = 3,
    WatchUser = 5,
    GetUserStatus = 7,
    SayInChatRoom = 13,
    JoinRoom = 14,
    LeaveRoom = 15,
    ConnectToPeer = 18,
    MessageUser = 22,
    MessageAcked = 23,
    FileSearch = 26,
    SetOnlineStatus = 28,
    ServerPing = 32,
    PrivilegedUsers = 69,
    HaveNoParent = 71,
    ParentIp = 73,
    CheckPrivileges = 92,
    EmbeddedMessage = 93,
    AcceptChildren = 100,
    NetInfo = 102,
    BranchLevel = 126,
    BranchRoot = 127,
    PrivilegeNotification = 124,
    AckPrivilegeNotification = 125,
}

impl TryFrom<u32> for ServerCode {
    type Error = SlskError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use ServerCode::*;
        Ok(match value {
            1 => Login,
            2 => SetListenPort,
            3 => GetPeerAddress,
            5 => WatchUser,
            7 => GetUserStatus,
            13 => SayInChatRoom,
            14 => JoinRoom,
            15 => LeaveRoom,
            18 => ConnectToPeer,
            22 => MessageUser,
            23 => MessageAcked,
            26 => FileSearch,
            28 => SetOnlineStatus,
            32 => ServerPing,
            69 => PrivilegedUsers,
            71 => HaveNoParent,
            73 => ParentIp,
            92 => CheckPrivileges,
            93 => EmbeddedMessage,
            100 => AcceptChildren,
            102 => NetInfo,
            124 => PrivilegeNotification,
            125 => AckPrivilegeNotification,
            126 => BranchLevel,
            127 => BranchRoot,
            other => {
                return Err(SlskError::UnrecognisedCode {
                    scope: "server",
                    code: other,
                })
            }
        })
    }
}

/// Outbound `Login` request: `username || password || version || md5(username+password) || minor_version`.
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub client_version: u32,
}

impl<'a> LoginRequest<'a> {
    pub fn to_bytes(&self) -> Bytes {
        let digest = format!(
            "{:x}",
            md5::Md5Digest::compute(format!("{}{}", self.username, self.password).as_bytes())
        );
        let mut buf = BytesMut::new();
        put_string(&mut buf, self.username);
        put_string(&mut buf, self.password);
        buf.put_u32_le(self.client_version);
        put_string(&mut buf, &digest);
        buf.put_u32_le(0); // minor version, unused beyond the handshake
        super::encode_frame(ServerCode::Login as u32, &buf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginResponse {
    Success { motd: String },
    Failure { reason: String },
}

impl LoginResponse {
    pub fn parse(input: &[u8]) -> IResult<&[u8], LoginResponse> {
        let (input, ok) = parse_bool(input)?;
        if ok {
            let (input, motd) = parse_string(input)?;
            Ok((input, LoginResponse::Success { motd }))
        } else {
            let (input, reason) = parse_string(input)?;
            Ok((input, LoginResponse::Failure { reason }))
        }
    }
}

pub struct SetListenPort {
    pub port: u32,
}

impl SetListenPort {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.port);
        super::encode_frame(ServerCode::SetListenPort as u32, &buf)
    }
}

pub struct SetOnlineStatus {
    pub status: i32,
}

impl SetOnlineStatus {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_i32_le(self.status);
        super::encode_frame(ServerCode::SetOnlineStatus as u32, &buf)
    }
}

/// No body: a bare keepalive frame sent every 30 seconds.
pub struct ServerPing;

impl ServerPing {
    pub fn to_bytes(&self) -> Bytes {
        super::encode_frame(ServerCode::ServerPing as u32, &[])
    }
}

pub struct HaveNoParent {
    pub have_no_parent: bool,
}

impl HaveNoParent {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.have_no_parent as u8);
        super::encode_frame(ServerCode::HaveNoParent as u32, &buf)
    }
}

pub struct ParentIp {
    pub ip: Ipv4Addr,
}

impl ParentIp {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_ip(&mut buf, self.ip);
        super::encode_frame(ServerCode::ParentIp as u32, &buf)
    }
}

pub struct BranchLevel {
    pub level: i32,
}

impl BranchLevel {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_i32_le(self.level);
        super::encode_frame(ServerCode::BranchLevel as u32, &buf)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], BranchLevel> {
        let (input, level) = parse_i32(input)?;
        Ok((input, BranchLevel { level }))
    }
}

pub struct BranchRoot {
    pub root: String,
}

impl BranchRoot {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.root);
        super::encode_frame(ServerCode::BranchRoot as u32, &buf)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], BranchRoot> {
        let (input, root) = parse_string(input)?;
        Ok((input, BranchRoot { root }))
    }
}

pub struct AcceptChildren {
    pub accept: bool,
}

impl AcceptChildren {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.accept as u8);
        super::encode_frame(ServerCode::AcceptChildren as u32, &buf)
    }
}

/// One candidate parent offered by the server in a `NetInfo` broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInfoEntry {
    pub username: String,
    pub ip: Ipv4Addr,
    pub port: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInfo {
    pub candidates: Vec<NetInfoEntry>,
}

impl NetInfo {
    pub fn parse(input: &[u8]) -> IResult<&[u8], NetInfo> {
        let (input, n) = parse_u32(input)?;
        let (input, candidates) = count(
            nom::combinator::map(
                nom::sequence::tuple((parse_string, parse_ip, parse_u32)),
                |(username, ip, port)| NetInfoEntry { username, ip, port },
            ),
            n as usize,
        )(input)?;
        Ok((input, NetInfo { candidates }))
    }
}

pub struct ConnectToPeer<'a> {
    pub token: i32,
    pub username: &'a str,
    pub connection_type: &'a str,
}

impl<'a> ConnectToPeer<'a> {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_i32_le(self.token);
        put_string(&mut buf, self.username);
        put_string(&mut buf, self.connection_type);
        super::encode_frame(ServerCode::ConnectToPeer as u32, &buf)
    }
}

/// Incoming `ConnectToPeer`, the version decoded off the wire when the
/// server asks us to dial someone (indirect connection request targeted
/// at the local client, not the one we issued).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectToPeerRequest {
    pub username: String,
    pub connection_type: String,
    pub ip: Ipv4Addr,
    pub port: u32,
    pub token: i32,
}

impl ConnectToPeerRequest {
    pub fn parse(input: &[u8]) -> IResult<&[u8], ConnectToPeerRequest> {
        let (input, username) = parse_string(input)?;
        let (input, connection_type) = parse_string(input)?;
        let (input, ip) = parse_ip(input)?;
        let (input, port) = parse_u32(input)?;
        let (input, token) = parse_i32(input)?;
        Ok((
            input,
            ConnectToPeerRequest {
                username,
                connection_type,
                ip,
                port,
                token,
            },
        ))
    }
}

pub struct GetPeerAddress<'a> {
    pub username: &'a str,
}

impl<'a> GetPeerAddress<'a> {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, self.username);
        super::encode_frame(ServerCode::GetPeerAddress as u32, &buf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub username: String,
    pub ip: Ipv4Addr,
    pub port: u32,
}

impl PeerAddress {
    pub fn parse(input: &[u8]) -> IResult<&[u8], PeerAddress> {
        let (input, username) = parse_string(input)?;
        let (input, ip) = parse_ip(input)?;
        let (input, port) = parse_u32(input)?;
        Ok((input, PeerAddress { username, ip, port }))
    }
}

/// Acknowledges a private message by id so the server stops redelivering
/// it on reconnect. Distinct from `AckPrivilegeNotification`, which
/// acknowledges an unrelated message class under a different code.
pub struct MessageAcked {
    pub id: u32,
}

impl MessageAcked {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.id);
        super::encode_frame(ServerCode::MessageAcked as u32, &buf)
    }
}

pub struct FileSearch<'a> {
    pub token: i32,
    pub query: &'a str,
}

impl<'a> FileSearch<'a> {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_i32_le(self.token);
        put_string(&mut buf, self.query);
        super::encode_frame(ServerCode::FileSearch as u32, &buf)
    }
}

/// Envelope for a distributed sub-message relayed by the server when this
/// client is acting as branch root. The distributed handler decodes
/// `distributed_body` the same way it would for a message arriving
/// directly on a distributed connection.
pub struct EmbeddedMessage {
    pub distributed_code: u32,
    pub distributed_body: Bytes,
}

impl EmbeddedMessage {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.distributed_code);
        buf.put_slice(&self.distributed_body);
        super::encode_frame(ServerCode::EmbeddedMessage as u32, &buf)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], (u32, &[u8])> {
        let (input, code) = super::parse_u32(input)?;
        Ok((&[], (code, input)))
    }
}

pub struct PrivilegedUsersRequest;

impl PrivilegedUsersRequest {
    pub fn to_bytes(&self) -> Bytes {
        super::encode_frame(ServerCode::PrivilegedUsers as u32, &[])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegedUsersList {
    pub usernames: Vec<String>,
}

impl PrivilegedUsersList {
    pub fn parse(input: &[u8]) -> IResult<&[u8], PrivilegedUsersList> {
        let (input, n) = parse_u32(input)?;
        let (input, usernames) = count(parse_string, n as usize)(input)?;
        Ok((input, PrivilegedUsersList { usernames }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStatus {
    pub username: String,
    pub status: i32,
    pub privileged: bool,
}

impl UserStatus {
    pub fn parse(input: &[u8]) -> IResult<&[u8], UserStatus> {
        let (input, username) = parse_string(input)?;
        let (input, status) = parse_i32(input)?;
        let (input, privileged) = parse_bool(input)?;
        Ok((
            input,
            UserStatus {
                username,
                status,
                privileged,
            },
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMessage {
    pub room: String,
    pub username: String,
    pub message: String,
}

impl RoomMessage {
    pub fn parse(input: &[u8]) -> IResult<&[u8], RoomMessage> {
        let (input, room) = parse_string(input)?;
        let (input, username) = parse_string(input)?;
        let (input, message) = parse_string(input)?;
        Ok((
            input,
            RoomMessage {
                room,
                username,
                message,
            },
        ))
    }
}

pub struct MessageUser<'a> {
    pub username: &'a str,
    pub message: &'a str,
}

impl<'a> MessageUser<'a> {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, self.username);
        put_string(&mut buf, self.message);
        super::encode_frame(ServerCode::MessageUser as u32, &buf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessage {
    pub id: u32,
    pub timestamp: u32,
    pub username: String,
    pub message: String,
}

impl PrivateMessage {
    pub fn parse(input: &[u8]) -> IResult<&[u8], PrivateMessage> {
        let (input, id) = parse_u32(input)?;
        let (input, timestamp) = parse_u32(input)?;
        let (input, username) = parse_string(input)?;
        let (input, message) = parse_string(input)?;
        Ok((
            input,
            PrivateMessage {
                id,
                timestamp,
                username,
                message,
            },
        ))
    }
}

mod md5 {
    //! Thin wrapper so callers write `md5::Md5Digest::compute(..)` the way
    //! the rest of this module writes `parse_x`/`put_x` helpers, without
    //! leaking the `md-5` crate's `Digest` trait import everywhere.
    use md5::{Digest, Md5};

    pub struct Md5Digest([u8; 16]);

    impl Md5Digest {
        pub fn compute(bytes: &[u8]) -> Self {
            let mut hasher = Md5::new();
            hasher.update(bytes);
            Md5Digest(hasher.finalize().into())
        }
    }

    impl std::fmt::LowerHex for Md5Digest {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            for byte in self.0 {
                write!(f, "{:02x}", byte)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_request_wire_shape_matches_protocol() {
        let req = LoginRequest {
            username: "u",
            password: "p",
            client_version: 157,
        };
        let frame = req.to_bytes();

        let mut expected = BytesMut::new();
        expected.put_u32_le(1); // code: Login
        put_string(&mut expected, "u");
        put_string(&mut expected, "p");
        expected.put_u32_le(157);
        put_string(&mut expected, &format!("{:x}", md5::Md5Digest::compute(b"up")));
        expected.put_u32_le(0);

        let declared_len = u32::from_le_bytes(frame[0..4].try_into().unwrap());
        assert_eq!(declared_len as usize, expected.len());
        assert_eq!(&frame[4..], &expected[..]);
    }

    #[test]
    fn login_response_parses_success_and_failure() {
        let mut success = BytesMut::new();
        success.put_u8(1);
        put_string(&mut success, "welcome");
        let (_, parsed) = LoginResponse::parse(&success).unwrap();
        assert_eq!(parsed, LoginResponse::Success { motd: "welcome".into() });

        let mut failure = BytesMut::new();
        failure.put_u8(0);
        put_string(&mut failure, "invalid password");
        let (_, parsed) = LoginResponse::parse(&failure).unwrap();
        assert_eq!(
            parsed,
            LoginResponse::Failure {
                reason: "invalid password".into()
            }
        );
    }

    #[test]
    fn server_ping_has_code_32_and_empty_body() {
        let frame = ServerPing.to_bytes();
        let declared_len = u32::from_le_bytes(frame[0..4].try_into().unwrap());
        assert_eq!(declared_len, 4);
        let (code, rest) = super::super::decode_frame(&frame[4..]).unwrap();
        assert_eq!(code, 32);
        assert!(rest.is_empty());
    }

    #[test]
    fn net_info_parses_candidate_list() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(2);
        put_string(&mut buf, "alice");
        put_ip(&mut buf, Ipv4Addr::new(10, 0, 0, 1));
        buf.put_u32_le(2234);
        put_string(&mut buf, "bob");
        put_ip(&mut buf, Ipv4Addr::new(10, 0, 0, 2));
        buf.put_u32_le(2235);

        let (_, net_info) = NetInfo::parse(&buf).unwrap();
        assert_eq!(net_info.candidates.len(), 2);
        assert_eq!(net_info.candidates[0].username, "alice");
        assert_eq!(net_info.candidates[1].port, 2235);
    }
}

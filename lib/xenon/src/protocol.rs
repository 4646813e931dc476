//! The XRootD wire format. All multi-byte fields travel big-endian.
//!
//! After the 20/16 byte initial handshake, every client request starts with
//! a 24-byte header (`streamid[2] | requestid[2] | params[16] | dlen[4]`)
//! and every server response with an 8-byte header
//! (`streamid[2] | status[2] | dlen[4]`). The initial server handshake
//! deliberately frames like a response (zero stream id, body length 8) so a
//! single header/body pump reads everything.

use crate::message::Message;
use byteorder::{BigEndian, ByteOrder};
use photon::status::{Code, Status};

/// Protocol version 3.0.0, the final four bytes of the client handshake.
pub const PROTOCOL_VERSION: u32 = 0x0000_0300;

pub const CLIENT_HANDSHAKE_LEN: usize = 20;
pub const SERVER_HANDSHAKE_LEN: usize = 16;
pub const REQUEST_HEADER_LEN: usize = 24;
pub const RESPONSE_HEADER_LEN: usize = 8;
pub const SESSION_ID_LEN: usize = 16;

/// Upper bound on a response body; anything larger is a framing error.
pub const MAX_BODY_LEN: u32 = 0x4000_0000;

/// Request codes.
pub mod reqid {
    pub const AUTH: u16 = 3000;
    pub const PROTOCOL: u16 = 3006;
    pub const LOGIN: u16 = 3007;
    pub const PING: u16 = 3011;
}

/// Response status codes.
pub mod respstat {
    pub const OK: u16 = 0;
    pub const OKSOFAR: u16 = 4000;
    pub const ATTN: u16 = 4001;
    pub const AUTHMORE: u16 = 4002;
    pub const ERROR: u16 = 4003;
    pub const REDIRECT: u16 = 4004;
    pub const WAIT: u16 = 4005;
}

/// Server type reported in the initial handshake.
pub mod server_type {
    pub const LOAD_BALANCER: u32 = 0;
    pub const DATA_SERVER: u32 = 1;
}

/// Flags reported in the protocol response.
pub mod protocol_flags {
    pub const IS_SERVER: u32 = 0x0000_0001;
    pub const IS_MANAGER: u32 = 0x0000_0002;
}

/// The parsed 16-byte server handshake.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ServerHandShake {
    pub protocol_version: u32,
    pub server_type: u32,
}

/// The parsed protocol response body.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ProtocolInfo {
    pub protocol_version: u32,
    pub flags: u32,
}

/// The parsed login response body.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LoginInfo {
    pub session_id: [u8; SESSION_ID_LEN],
    pub sec_token: Vec<u8>,
}

/// The 20-byte client handshake: all zero except the trailing version magic.
pub fn build_initial_handshake() -> Message {
    let mut msg = Message::with_capacity(CLIENT_HANDSHAKE_LEN);
    msg.write_u32_at(CLIENT_HANDSHAKE_LEN - 4, PROTOCOL_VERSION);
    msg.set_description("initial handshake");
    msg
}

/// Parse the 16-byte server handshake: 4-byte pad, 4-byte length (must be
/// 8), protocol version, server type.
pub fn parse_server_handshake(msg: &Message) -> Result<ServerHandShake, Status> {
    if msg.len() != SERVER_HANDSHAKE_LEN {
        return Err(Status::error(Code::InvalidResponse));
    }

    if msg.read_u32_at(4) != 8 {
        return Err(Status::error(Code::HandshakeFailed));
    }

    Ok(ServerHandShake {
        protocol_version: msg.read_u32_at(8),
        server_type: msg.read_u32_at(12),
    })
}

fn build_request(request_id: u16, body_len: usize) -> Message {
    let mut msg = Message::with_capacity(REQUEST_HEADER_LEN + body_len);
    msg.write_u16_at(2, request_id);
    msg.write_u32_at(REQUEST_HEADER_LEN - 4, body_len as u32);
    msg
}

/// `kXR_protocol`: ask the server for its protocol version and role. The
/// client version rides in the first parameter word.
pub fn build_protocol_request() -> Message {
    let mut msg = build_request(reqid::PROTOCOL, 0);
    msg.write_u32_at(4, PROTOCOL_VERSION);
    msg.set_description("kXR_protocol");
    msg
}

pub fn parse_protocol_response(msg: &Message) -> Result<ProtocolInfo, Status> {
    check_response(msg)?;

    if response_dlen(msg) < 8 {
        return Err(Status::error(Code::InvalidResponse));
    }

    Ok(ProtocolInfo {
        protocol_version: msg.read_u32_at(RESPONSE_HEADER_LEN),
        flags: msg.read_u32_at(RESPONSE_HEADER_LEN + 4),
    })
}

/// `kXR_login`: process id, the first eight bytes of the user name, and the
/// capability/role bytes.
pub fn build_login_request(username: &str, pid: u32) -> Message {
    let mut msg = build_request(reqid::LOGIN, 0);

    msg.write_u32_at(4, pid);

    let name = username.as_bytes();
    let count = name.len().min(8);
    msg.data_mut()[8..8 + count].copy_from_slice(&name[..count]);

    // reserved, ability, capver, role
    msg.data_mut()[16] = 0;
    msg.data_mut()[17] = 0;
    msg.data_mut()[18] = 0;
    msg.data_mut()[19] = 0;

    msg.set_description("kXR_login");
    msg
}

pub fn parse_login_response(msg: &Message) -> Result<LoginInfo, Status> {
    check_response(msg)?;

    let dlen = response_dlen(msg) as usize;
    let mut info = LoginInfo {
        session_id: [0; SESSION_ID_LEN],
        sec_token: Vec::new(),
    };

    if dlen >= SESSION_ID_LEN {
        info.session_id
            .copy_from_slice(&msg.data()[RESPONSE_HEADER_LEN..RESPONSE_HEADER_LEN + SESSION_ID_LEN]);
    }

    if dlen > SESSION_ID_LEN {
        info.sec_token
            .extend_from_slice(&msg.data()[RESPONSE_HEADER_LEN + SESSION_ID_LEN..RESPONSE_HEADER_LEN + dlen]);
    }

    Ok(info)
}

/// `kXR_ping`: an empty request carrying just the stream id.
pub fn build_ping_request(stream_id: [u8; 2]) -> Message {
    let mut msg = build_request(reqid::PING, 0);
    set_request_stream_id(&mut msg, stream_id);
    msg.set_description("kXR_ping");
    msg
}

fn check_response(msg: &Message) -> Result<(), Status> {
    if msg.len() < RESPONSE_HEADER_LEN {
        return Err(Status::error(Code::InvalidResponse));
    }

    match response_status(msg) {
        respstat::OK => Ok(()),
        respstat::REDIRECT => Err(Status::error(Code::HandshakeFailed)),
        respstat::AUTHMORE => Err(Status::error(Code::AuthFailed)),
        _ => Err(Status::error(Code::InvalidResponse)),
    }
}

#[inline]
pub fn request_stream_id(msg: &Message) -> [u8; 2] {
    [msg.data()[0], msg.data()[1]]
}

#[inline]
pub fn set_request_stream_id(msg: &mut Message, stream_id: [u8; 2]) {
    msg.data_mut()[0] = stream_id[0];
    msg.data_mut()[1] = stream_id[1];
}

#[inline]
pub fn request_id(msg: &Message) -> u16 {
    msg.read_u16_at(2)
}

#[inline]
pub fn response_stream_id(msg: &Message) -> [u8; 2] {
    [msg.data()[0], msg.data()[1]]
}

#[inline]
pub fn response_status(msg: &Message) -> u16 {
    msg.read_u16_at(2)
}

#[inline]
pub fn response_dlen(msg: &Message) -> u32 {
    msg.read_u32_at(4)
}

/// Body length of a response header held in a plain byte slice.
#[inline]
pub fn header_dlen(header: &[u8]) -> u32 {
    BigEndian::read_u32(&header[4..8])
}

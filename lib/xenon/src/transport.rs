use crate::any::AnyObject;
use crate::message::Message;
use crate::protocol;
use crate::url::URL;
use photon::env::Env;
use photon::logging::{self, Logger};
use photon::status::{Code, Status};
use photon::time::timestamp_secs;
use std::io;
use std::sync::Arc;

/// Handshake state threaded between the socket handler and the transport.
/// The transport consumes `in_msg` and leaves the next outgoing message in
/// `out`.
pub struct HandShakeData {
    pub step: u16,
    pub out: Option<Message>,
    pub in_msg: Option<Message>,
    pub url: URL,
    pub stream_id: u16,
    pub substream_id: u16,
    pub start_time: u64,
}

impl HandShakeData {
    pub fn new(url: &URL, stream_id: u16, substream_id: u16) -> HandShakeData {
        HandShakeData {
            step: 0,
            out: None,
            in_msg: None,
            url: url.clone(),
            stream_id,
            substream_id,
            start_time: timestamp_secs(),
        }
    }
}

/// Which substream a request goes up and where its answer comes down.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct PathID {
    pub up: u16,
    pub down: u16,
}

impl PathID {
    pub fn new(up: u16, down: u16) -> PathID {
        PathID { up, down }
    }
}

/// Queries answered by `TransportHandler::query`. Transports may support
/// additional private queries with ids above 1000.
pub mod query {
    /// Transport name; the result carries a `String`.
    pub const NAME: u16 = 1;
    /// Server flags learned during the handshake; the result carries a `u32`.
    pub const SERVER_FLAGS: u16 = 2;
    /// Negotiated protocol version; the result carries a `u32`.
    pub const PROTOCOL_VERSION: u16 = 3;
}

/// The framing and handshake policy of a channel. Implementations keep all
/// their per-channel state in the channel-scratch `AnyObject`.
pub trait TransportHandler: Send + Sync {
    /// Allocate the channel scratch.
    fn initialize_channel(&self, channel_data: &mut AnyObject);

    /// Free the channel scratch.
    fn finalize_channel(&self, channel_data: &mut AnyObject);

    /// Advance the handshake by one step. Consumes `hs.in_msg`, may leave a
    /// message to send in `hs.out`. Returns plain success when the
    /// handshake is done, the continue outcome when more rounds are needed
    /// and an error otherwise.
    fn handshake(&self, hs: &mut HandShakeData, channel_data: &mut AnyObject) -> Status;

    /// Pump the fixed-size message header out of a non-blocking socket.
    /// Returns the retry outcome on a short read; the message cursor marks
    /// the resume point.
    fn get_header(&self, msg: &mut Message, socket: &mut dyn io::Read) -> Status;

    /// Pump the message body; length taken from the header. Same retry
    /// contract as `get_header`.
    fn get_body(&self, msg: &mut Message, socket: &mut dyn io::Read) -> Status;

    /// Pick the logical stream for a message, and the stream its answer
    /// will arrive on. A hint pins the answer path; the transport may
    /// rewrite the message to make that happen.
    fn multiplex(&self, msg: &mut Message, channel_data: &mut AnyObject, hint: Option<PathID>)
        -> PathID;

    /// Pick the physical substream within a stream, hint semantics as in
    /// `multiplex`.
    fn multiplex_substream(
        &self,
        msg: &mut Message,
        channel_data: &mut AnyObject,
        hint: Option<PathID>,
    ) -> PathID;

    /// How many logical streams a channel should run.
    fn stream_number(&self, channel_data: &mut AnyObject) -> u16;

    /// How many physical substreams per stream.
    fn sub_stream_number(&self, channel_data: &mut AnyObject) -> u16;

    /// Should an idle substream be torn down.
    fn is_stream_ttl_elapsed(&self, inactive_secs: u64, channel_data: &mut AnyObject) -> bool;

    /// Whether the first substream must be fully up before the others are
    /// started.
    fn need_control_connection(&self) -> bool;

    /// A substream went away; drop the dependent session state.
    fn disconnect(&self, channel_data: &mut AnyObject, stream_id: u16, substream_id: u16);

    /// Answer a transport query into the result carrier.
    fn query(&self, kind: u16, result: &mut AnyObject, channel_data: &mut AnyObject) -> Status;
}

/// Per-channel state of the XRootD transport, stashed in the channel
/// scratch slot.
struct XRootDChannelInfo {
    protocol_version: u32,
    server_flags: u32,
    server_type: u32,
    session_id: [u8; protocol::SESSION_ID_LEN],
    logged_in: bool,
}

impl XRootDChannelInfo {
    fn new() -> XRootDChannelInfo {
        XRootDChannelInfo {
            protocol_version: 0,
            server_flags: 0,
            server_type: protocol::server_type::DATA_SERVER,
            session_id: [0; protocol::SESSION_ID_LEN],
            logged_in: false,
        }
    }

    fn is_data_server(&self) -> bool {
        if self.server_flags != 0 {
            return self.server_flags & protocol::protocol_flags::IS_SERVER != 0;
        }
        self.server_type == protocol::server_type::DATA_SERVER
    }
}

/// The XRootD framing and handshake implementation.
pub struct XRootDTransport {
    env: Arc<Env>,
    log: Logger,
}

impl XRootDTransport {
    pub fn new(env: Arc<Env>, log: Logger) -> XRootDTransport {
        XRootDTransport { env, log }
    }

    fn info<'a>(&self, channel_data: &'a mut AnyObject) -> &'a mut XRootDChannelInfo {
        if channel_data.get::<XRootDChannelInfo>().is_none() {
            channel_data.set(XRootDChannelInfo::new());
        }
        channel_data.get_mut::<XRootDChannelInfo>().unwrap()
    }

    fn login_name(url: &URL) -> String {
        if !url.username().is_empty() {
            return url.username().to_string();
        }
        std::env::var("USER").unwrap_or_else(|_| "nobody".to_string())
    }

    fn io_status(err: io::Error) -> Status {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Status::retry(),
            io::ErrorKind::UnexpectedEof => Status::error(Code::SocketDisconnected),
            _ => Status::error(Code::SocketError).with_errno(err.raw_os_error().unwrap_or(0)),
        }
    }
}

impl TransportHandler for XRootDTransport {
    fn initialize_channel(&self, channel_data: &mut AnyObject) {
        channel_data.set(XRootDChannelInfo::new());
    }

    fn finalize_channel(&self, channel_data: &mut AnyObject) {
        channel_data.clear();
    }

    fn handshake(&self, hs: &mut HandShakeData, channel_data: &mut AnyObject) -> Status {
        match hs.step {
            // Open with the 20-byte client handshake.
            0 => {
                logging::debug!(self.log, "handshake: sending client handshake";
                                "host" => hs.url.host_id());
                hs.out = Some(protocol::build_initial_handshake());
                hs.step = 1;
                Status::more()
            }

            // Parse the server handshake, follow up with kXR_protocol.
            1 => {
                let msg = match hs.in_msg.take() {
                    Some(msg) => msg,
                    None => return Status::error(Code::InvalidOperation),
                };

                let server_hs = match protocol::parse_server_handshake(&msg) {
                    Ok(server_hs) => server_hs,
                    Err(status) => return status,
                };

                let info = self.info(channel_data);
                info.protocol_version = server_hs.protocol_version;
                info.server_type = server_hs.server_type;

                logging::debug!(self.log, "handshake: server handshake parsed";
                                "host" => hs.url.host_id(),
                                "protocol_version" => server_hs.protocol_version,
                                "server_type" => server_hs.server_type);

                hs.out = Some(protocol::build_protocol_request());
                hs.step = 2;
                Status::more()
            }

            // Parse the protocol response, follow up with kXR_login.
            2 => {
                let msg = match hs.in_msg.take() {
                    Some(msg) => msg,
                    None => return Status::error(Code::InvalidOperation),
                };

                if protocol::response_status(&msg) != protocol::respstat::OK {
                    return Status::error(Code::HandshakeFailed);
                }

                let proto = match protocol::parse_protocol_response(&msg) {
                    Ok(proto) => proto,
                    Err(status) => return status,
                };

                let info = self.info(channel_data);
                info.protocol_version = proto.protocol_version;
                info.server_flags = proto.flags;

                logging::debug!(self.log, "handshake: protocol negotiated";
                                "host" => hs.url.host_id(),
                                "flags" => proto.flags);

                hs.out = Some(protocol::build_login_request(
                    &Self::login_name(&hs.url),
                    std::process::id(),
                ));
                hs.step = 3;
                Status::more()
            }

            // Parse the login response. An authentication demand cannot be
            // satisfied without a credential back-end; a redirect mid-login
            // is a handshake failure the upper layers may retry elsewhere.
            3 => {
                let msg = match hs.in_msg.take() {
                    Some(msg) => msg,
                    None => return Status::error(Code::InvalidOperation),
                };

                match protocol::response_status(&msg) {
                    protocol::respstat::OK => (),
                    protocol::respstat::REDIRECT => {
                        return Status::error(Code::HandshakeFailed);
                    }
                    protocol::respstat::AUTHMORE => {
                        return Status::error(Code::AuthFailed);
                    }
                    _ => return Status::error(Code::LoginFailed),
                }

                let login = match protocol::parse_login_response(&msg) {
                    Ok(login) => login,
                    Err(status) => return status,
                };

                if !login.sec_token.is_empty() {
                    logging::warn!(self.log, "handshake: server requires authentication";
                                   "host" => hs.url.host_id());
                    return Status::error(Code::AuthFailed);
                }

                let info = self.info(channel_data);
                info.session_id = login.session_id;
                info.logged_in = true;

                logging::info!(self.log, "handshake: logged in"; "host" => hs.url.host_id());
                Status::ok()
            }

            _ => Status::error(Code::InvalidOperation),
        }
    }

    fn get_header(&self, msg: &mut Message, socket: &mut dyn io::Read) -> Status {
        if msg.cursor() >= protocol::RESPONSE_HEADER_LEN {
            return Status::ok();
        }

        match msg.read_from(socket, protocol::RESPONSE_HEADER_LEN) {
            Ok(_) => Status::ok(),
            Err(err) => Self::io_status(err),
        }
    }

    fn get_body(&self, msg: &mut Message, socket: &mut dyn io::Read) -> Status {
        let dlen = protocol::response_dlen(msg);

        if dlen > protocol::MAX_BODY_LEN {
            logging::error!(self.log, "refusing oversized message body"; "dlen" => dlen);
            return Status::error(Code::InvalidResponse);
        }

        let target = protocol::RESPONSE_HEADER_LEN + dlen as usize;
        if msg.cursor() >= target {
            return Status::ok();
        }

        match msg.read_from(socket, target) {
            Ok(_) => Status::ok(),
            Err(err) => Self::io_status(err),
        }
    }

    fn multiplex(
        &self,
        _msg: &mut Message,
        _channel_data: &mut AnyObject,
        hint: Option<PathID>,
    ) -> PathID {
        // One logical stream per channel.
        hint.unwrap_or_default()
    }

    fn multiplex_substream(
        &self,
        _msg: &mut Message,
        _channel_data: &mut AnyObject,
        hint: Option<PathID>,
    ) -> PathID {
        // Control traffic stays on the first substream. Replies arrive on
        // the connection that carried the request, so honoring a hint needs
        // no message rewrite.
        hint.unwrap_or_default()
    }

    fn stream_number(&self, _channel_data: &mut AnyObject) -> u16 {
        1
    }

    fn sub_stream_number(&self, _channel_data: &mut AnyObject) -> u16 {
        self.env
            .get_int("SubStreamsPerChannel")
            .unwrap_or(1)
            .max(1) as u16
    }

    fn is_stream_ttl_elapsed(&self, inactive_secs: u64, channel_data: &mut AnyObject) -> bool {
        let data_server = self.info(channel_data).is_data_server();

        let ttl = if data_server {
            self.env.get_int("DataServerTTL").unwrap_or(300)
        } else {
            self.env.get_int("ManagerTTL").unwrap_or(3600)
        };

        inactive_secs >= ttl.max(1) as u64
    }

    fn need_control_connection(&self) -> bool {
        true
    }

    fn disconnect(&self, channel_data: &mut AnyObject, stream_id: u16, substream_id: u16) {
        logging::debug!(self.log, "substream disconnected";
                        "stream" => stream_id,
                        "substream" => substream_id);

        // Losing the control connection invalidates the session.
        if substream_id == 0 {
            let info = self.info(channel_data);
            info.logged_in = false;
            info.session_id = [0; protocol::SESSION_ID_LEN];
        }
    }

    fn query(&self, kind: u16, result: &mut AnyObject, channel_data: &mut AnyObject) -> Status {
        match kind {
            query::NAME => {
                result.set("xrootd".to_string());
                Status::ok()
            }
            query::SERVER_FLAGS => {
                let flags = self.info(channel_data).server_flags;
                result.set(flags);
                Status::ok()
            }
            query::PROTOCOL_VERSION => {
                let version = self.info(channel_data).protocol_version;
                result.set(version);
                Status::ok()
            }
            _ => Status::error(Code::Unsupported),
        }
    }
}

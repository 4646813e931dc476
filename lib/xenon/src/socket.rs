use crate::any::AnyObject;
use crate::message::Message;
use crate::poller::{Poller, SocketEvent, SocketHandler, SocketId};
use crate::stream::{OutMessage, Stream};
use crate::transport::{HandShakeData, TransportHandler};
use crate::url::URL;
use mio::net::TcpStream;
use photon::logging::{self, Logger};
use photon::status::{Code, Status};
use photon::time::timestamp_secs;
use std::io;
use std::net::ToSocketAddrs;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex, Weak};

/// Lifecycle of a physical connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SocketState {
    Disconnected,
    /// The non-blocking connect is in flight.
    Connecting,
    /// The TCP connection is up, the handshake has not started yet.
    Connected,
    /// Exchanging handshake messages with the server.
    Handshaking,
    /// Operational.
    HandshakeDone,
    /// A fatal fault was observed; the socket is about to go away.
    Broken,
}

struct Guts {
    socket: Option<TcpStream>,
    socket_id: Option<SocketId>,
    state: SocketState,
    // One in-progress message per direction, cursors marking partial I/O.
    incoming: Option<Message>,
    outgoing: Option<OutMessage>,
    handshake: Option<HandShakeData>,
    hs_incoming: Option<Message>,
    hs_outgoing: Option<Message>,
    connect_started: u64,
    connect_window: u64,
    last_io: u64,
}

/// Drives one non-blocking socket of a stream: connect, handshake, then
/// one-message-at-a-time reads and writes, with lifecycle events reported
/// back to the owning stream. All event callbacks arrive serialized on the
/// poller thread.
///
/// Lock discipline: the internal guts mutex is never held across a call
/// into the stream; the stream may call into this handler while holding
/// its own lock.
pub struct AsyncSocketHandler {
    poller: Arc<dyn Poller>,
    transport: Arc<dyn TransportHandler>,
    channel_data: Arc<Mutex<AnyObject>>,
    stream: Mutex<Weak<Stream>>,
    stream_num: u16,
    substream: u16,
    timeout_resolution: u16,
    url: URL,
    guts: Mutex<Guts>,
    log: Logger,
}

impl AsyncSocketHandler {
    pub fn new(
        poller: Arc<dyn Poller>,
        transport: Arc<dyn TransportHandler>,
        channel_data: Arc<Mutex<AnyObject>>,
        url: URL,
        stream_num: u16,
        substream: u16,
        timeout_resolution: u16,
        log: Logger,
    ) -> AsyncSocketHandler {
        AsyncSocketHandler {
            poller,
            transport,
            channel_data,
            stream: Mutex::new(Weak::new()),
            stream_num,
            substream,
            timeout_resolution,
            url,
            guts: Mutex::new(Guts {
                socket: None,
                socket_id: None,
                state: SocketState::Disconnected,
                incoming: None,
                outgoing: None,
                handshake: None,
                hs_incoming: None,
                hs_outgoing: None,
                connect_started: 0,
                connect_window: 0,
                last_io: 0,
            }),
            log,
        }
    }

    /// Wire up the back-reference to the owning stream. Ownership flows
    /// the other way, so the reference is weak.
    pub fn set_stream(&self, stream: Weak<Stream>) {
        *self.stream.lock().unwrap() = stream;
    }

    fn stream(&self) -> Option<Arc<Stream>> {
        self.stream.lock().unwrap().upgrade()
    }

    pub fn state(&self) -> SocketState {
        self.guts.lock().unwrap().state
    }

    /// Seconds since the last byte moved in either direction.
    pub fn seconds_idle(&self, now: u64) -> u64 {
        let guts = self.guts.lock().unwrap();
        now.saturating_sub(guts.last_io)
    }

    /// Kick off a non-blocking connect, bounded by the connection window.
    pub fn connect(self: &Arc<Self>, window: u64) -> Status {
        let address = match (self.url.resolvable_hostname(), self.url.port()).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(address) => address,
                None => return Status::error(Code::InvalidArgument),
            },
            Err(err) => {
                logging::error!(self.log, "cannot resolve host";
                                "host" => self.url.hostname(),
                                "error" => %err);
                return Status::error(Code::InvalidArgument);
            }
        };

        let socket = match TcpStream::connect(address) {
            Ok(socket) => socket,
            Err(err) => {
                return Status::error(Code::SocketError)
                    .with_errno(err.raw_os_error().unwrap_or(0))
            }
        };

        logging::debug!(self.log, "connecting";
                        "address" => %address,
                        "substream" => self.substream);

        let fd = socket.as_raw_fd();
        let now = timestamp_secs();

        let mut guts = self.guts.lock().unwrap();
        guts.socket = Some(socket);
        guts.state = SocketState::Connecting;
        guts.connect_started = now;
        guts.connect_window = window;
        guts.last_io = now;

        let handler: Arc<dyn SocketHandler> = self.clone();
        let id = match self.poller.add_socket(fd, handler) {
            Ok(id) => id,
            Err(status) => {
                guts.socket = None;
                guts.state = SocketState::Disconnected;
                return status;
            }
        };
        guts.socket_id = Some(id);

        // Connect completion shows up as writability.
        let status = self
            .poller
            .enable_write_notification(id, true, self.timeout_resolution);
        if status.has_failed() {
            self.close_locked(&mut guts);
            return status;
        }

        Status::ok()
    }

    /// Tear the connection down. Returns the in-flight outgoing message,
    /// if any, for the stream to retry or fail.
    pub fn close(&self) -> Option<OutMessage> {
        let mut guts = self.guts.lock().unwrap();
        self.close_locked(&mut guts)
    }

    fn close_locked(&self, guts: &mut Guts) -> Option<OutMessage> {
        if let Some(id) = guts.socket_id.take() {
            self.poller.remove_socket(id);
        }

        if guts.socket.take().is_some() {
            logging::debug!(self.log, "socket closed"; "substream" => self.substream);
        }

        guts.state = SocketState::Disconnected;
        guts.incoming = None;
        guts.handshake = None;
        guts.hs_incoming = None;
        guts.hs_outgoing = None;

        guts.outgoing.take()
    }

    /// Ask the poller for write readiness events.
    pub fn enable_uplink(&self) -> Status {
        let guts = self.guts.lock().unwrap();
        match guts.socket_id {
            Some(id) => self
                .poller
                .enable_write_notification(id, true, self.timeout_resolution),
            None => Status::error(Code::InvalidOperation),
        }
    }

    fn disable_uplink(&self) -> Status {
        let guts = self.guts.lock().unwrap();
        match guts.socket_id {
            Some(id) => self.poller.enable_write_notification(id, false, 0),
            None => Status::error(Code::InvalidOperation),
        }
    }

    fn enable_downlink(&self) -> Status {
        let guts = self.guts.lock().unwrap();
        match guts.socket_id {
            Some(id) => self
                .poller
                .enable_read_notification(id, true, self.timeout_resolution),
            None => Status::error(Code::InvalidOperation),
        }
    }

    //--------------------------------------------------------------------
    // Connect path
    //--------------------------------------------------------------------

    fn on_connection_return(&self) {
        let verdict: Result<(), Option<Status>> = {
            let guts = self.guts.lock().unwrap();

            if guts.state != SocketState::Connecting {
                return;
            }

            let socket = match guts.socket.as_ref() {
                Some(socket) => socket,
                None => return,
            };

            match socket.take_error() {
                Ok(Some(err)) => Err(Some(
                    Status::error(Code::SocketError).with_errno(err.raw_os_error().unwrap_or(0)),
                )),
                Err(err) => Err(Some(
                    Status::error(Code::SocketError).with_errno(err.raw_os_error().unwrap_or(0)),
                )),
                Ok(None) => match socket.peer_addr() {
                    Ok(_) => Ok(()),
                    // Writable before the connect settled; keep waiting.
                    Err(err) if err.kind() == io::ErrorKind::NotConnected => Err(None),
                    Err(err) => Err(Some(
                        Status::error(Code::SocketError)
                            .with_errno(err.raw_os_error().unwrap_or(0)),
                    )),
                },
            }
        };

        match verdict {
            Ok(()) => self.start_handshake(),
            Err(None) => (),
            Err(Some(status)) => {
                logging::debug!(self.log, "connect failed";
                                "substream" => self.substream,
                                "status" => %status);
                self.close();
                if let Some(stream) = self.stream() {
                    stream.on_connect_error(self.substream, status);
                }
            }
        }
    }

    fn start_handshake(&self) {
        logging::debug!(self.log, "connected, starting the handshake";
                        "host" => self.url.host_id(),
                        "substream" => self.substream);

        {
            let mut guts = self.guts.lock().unwrap();
            guts.state = SocketState::Connected;

            let mut hs = HandShakeData::new(&self.url, self.stream_num, self.substream);
            let status = {
                let mut channel_data = self.channel_data.lock().unwrap();
                self.transport.handshake(&mut hs, &mut channel_data)
            };

            if status.has_failed() {
                drop(guts);
                self.close();
                if let Some(stream) = self.stream() {
                    stream.on_connect_error(self.substream, status);
                }
                return;
            }

            guts.hs_outgoing = hs.out.take();
            guts.handshake = Some(hs);
            guts.state = SocketState::Handshaking;
        }

        self.enable_downlink();
        self.on_write_while_handshaking();
    }

    //--------------------------------------------------------------------
    // Handshake path
    //--------------------------------------------------------------------

    fn on_write_while_handshaking(&self) {
        let mut guts = self.guts.lock().unwrap();

        if guts.state != SocketState::Handshaking {
            return;
        }

        let mut msg = match guts.hs_outgoing.take() {
            Some(msg) => msg,
            None => return,
        };

        let result = {
            let socket = match guts.socket.as_mut() {
                Some(socket) => socket,
                None => return,
            };
            msg.write_to(socket)
        };

        match result {
            Ok(_) => {
                guts.last_io = timestamp_secs();
                logging::trace!(self.log, "handshake message written";
                                "substream" => self.substream);
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Short write; the cursor marks where to resume.
                guts.hs_outgoing = Some(msg);
            }
            Err(err) => {
                let status =
                    Status::error(Code::SocketError).with_errno(err.raw_os_error().unwrap_or(0));
                drop(guts);
                self.on_fault_while_handshaking(status);
            }
        }
    }

    fn on_read_while_handshaking(&self) {
        loop {
            let mut guts = self.guts.lock().unwrap();

            if guts.state != SocketState::Handshaking {
                return;
            }

            // Pump the next handshake message, header then body.
            let status = {
                let Guts {
                    ref mut hs_incoming,
                    ref mut socket,
                    ..
                } = *guts;

                let msg = hs_incoming.get_or_insert_with(Message::new);
                let socket = match socket.as_mut() {
                    Some(socket) => socket,
                    None => return,
                };

                let status = self.transport.get_header(msg, socket);
                if status.is_ok() && !status.is_retry() {
                    self.transport.get_body(msg, socket)
                } else {
                    status
                }
            };

            if status.is_retry() {
                return;
            }

            if status.has_failed() {
                drop(guts);
                self.on_fault_while_handshaking(status);
                return;
            }

            let msg = guts.hs_incoming.take().unwrap();
            guts.last_io = timestamp_secs();

            let mut hs = match guts.handshake.take() {
                Some(hs) => hs,
                None => return,
            };
            hs.in_msg = Some(msg);

            let status = {
                let mut channel_data = self.channel_data.lock().unwrap();
                self.transport.handshake(&mut hs, &mut channel_data)
            };

            if status.has_failed() {
                drop(guts);
                self.on_fault_while_handshaking(status);
                return;
            }

            let out = hs.out.take();
            let done = !status.is_continue();
            guts.handshake = Some(hs);

            if done {
                guts.handshake = None;
                guts.state = SocketState::HandshakeDone;
                drop(guts);

                logging::debug!(self.log, "handshake done";
                                "host" => self.url.host_id(),
                                "substream" => self.substream);

                if let Some(stream) = self.stream() {
                    stream.on_connected(self.substream);
                }

                // Drain whatever the server may have sent already.
                self.on_read();
                return;
            }

            if let Some(out) = out {
                guts.hs_outgoing = Some(out);
                drop(guts);
                self.on_write_while_handshaking();
            }
        }
    }

    fn on_timeout_while_handshaking(&self) {
        let expired = {
            let guts = self.guts.lock().unwrap();
            let elapsed = timestamp_secs().saturating_sub(guts.connect_started);
            elapsed >= guts.connect_window
        };

        if !expired {
            return;
        }

        logging::debug!(self.log, "connection attempt ran out of its window";
                        "host" => self.url.host_id(),
                        "substream" => self.substream);

        self.close();
        if let Some(stream) = self.stream() {
            stream.on_connect_error(self.substream, Status::error(Code::SocketTimeout));
        }
    }

    fn on_fault_while_handshaking(&self, status: Status) {
        logging::error!(self.log, "handshake failed";
                        "host" => self.url.host_id(),
                        "substream" => self.substream,
                        "status" => %status);

        {
            let mut guts = self.guts.lock().unwrap();
            guts.state = SocketState::Broken;
            self.close_locked(&mut guts);
        }

        if let Some(stream) = self.stream() {
            stream.on_connect_error(self.substream, status);
        }
    }

    //--------------------------------------------------------------------
    // Operational path
    //--------------------------------------------------------------------

    fn on_write(&self) {
        loop {
            {
                let mut guts = self.guts.lock().unwrap();

                if guts.state != SocketState::HandshakeDone {
                    return;
                }

                if guts.outgoing.is_some() {
                    let result = {
                        let Guts {
                            ref mut outgoing,
                            ref mut socket,
                            ..
                        } = *guts;

                        let entry = outgoing.as_mut().unwrap();
                        match socket.as_mut() {
                            Some(socket) => entry.msg.write_to(socket),
                            None => return,
                        }
                    };

                    match result {
                        Ok(_) => {
                            guts.last_io = timestamp_secs();
                            let entry = guts.outgoing.take().unwrap();
                            drop(guts);

                            if let Some(stream) = self.stream() {
                                stream.on_message_sent(self.substream, entry);
                            }
                            continue;
                        }
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                        Err(err) => {
                            let status = Status::error(Code::SocketError)
                                .with_errno(err.raw_os_error().unwrap_or(0));
                            drop(guts);
                            self.on_fault(status);
                            return;
                        }
                    }
                }
            }

            // Nothing in flight; fetch the next message from the stream.
            let stream = match self.stream() {
                Some(stream) => stream,
                None => return,
            };

            match stream.get_outgoing(self.substream) {
                Some(entry) => {
                    let mut guts = self.guts.lock().unwrap();
                    if guts.state != SocketState::HandshakeDone {
                        drop(guts);
                        stream.requeue(self.substream, entry);
                        return;
                    }
                    logging::trace!(self.log, "writing message";
                                    "substream" => self.substream,
                                    "description" => entry.msg.description());
                    guts.outgoing = Some(entry);
                }
                None => {
                    // Queue drained. Stop write notifications, but close
                    // the race against a concurrent send.
                    self.disable_uplink();
                    if stream.has_outgoing(self.substream) {
                        self.enable_uplink();
                    }
                    return;
                }
            }
        }
    }

    fn on_read(&self) {
        loop {
            let mut guts = self.guts.lock().unwrap();

            if guts.state != SocketState::HandshakeDone {
                return;
            }

            let status = {
                let Guts {
                    ref mut incoming,
                    ref mut socket,
                    ..
                } = *guts;

                let msg = incoming.get_or_insert_with(Message::new);
                let socket = match socket.as_mut() {
                    Some(socket) => socket,
                    None => return,
                };

                let status = self.transport.get_header(msg, socket);
                if status.is_ok() && !status.is_retry() {
                    self.transport.get_body(msg, socket)
                } else {
                    status
                }
            };

            if status.is_retry() {
                return;
            }

            if status.has_failed() {
                drop(guts);
                self.on_fault(status);
                return;
            }

            let msg = guts.incoming.take().unwrap();
            guts.last_io = timestamp_secs();
            drop(guts);

            logging::trace!(self.log, "message received";
                            "substream" => self.substream,
                            "size" => msg.len());

            if let Some(stream) = self.stream() {
                stream.on_incoming(self.substream, msg);
            }
        }
    }

    fn on_write_timeout(&self) {
        // With an outgoing message pending this is a stalled write; the
        // request deadlines swept by the stream cover it. Otherwise it is
        // an idle probe.
        let idle = {
            let guts = self.guts.lock().unwrap();
            guts.outgoing.is_none()
        };

        if !idle {
            return;
        }

        self.check_ttl(timestamp_secs());
    }

    fn on_read_timeout(&self) {
        if let Some(stream) = self.stream() {
            stream.on_read_timeout(self.substream);
        }
    }

    /// Evaluate the idle TTL and tear the connection down when it elapsed.
    /// Also driven by the stream's tick, since write notifications are off
    /// while the queue is empty.
    pub fn check_ttl(&self, now: u64) {
        let idle = {
            let guts = self.guts.lock().unwrap();
            if guts.state != SocketState::HandshakeDone || guts.outgoing.is_some() {
                return;
            }
            now.saturating_sub(guts.last_io)
        };

        let elapsed = {
            let mut channel_data = self.channel_data.lock().unwrap();
            self.transport.is_stream_ttl_elapsed(idle, &mut channel_data)
        };

        if !elapsed {
            return;
        }

        logging::debug!(self.log, "time to live elapsed, closing the connection";
                        "host" => self.url.host_id(),
                        "substream" => self.substream,
                        "idle" => idle);

        self.close();
        if let Some(stream) = self.stream() {
            stream.on_ttl_expired(self.substream);
        }
    }

    fn on_fault(&self, status: Status) {
        logging::error!(self.log, "socket fault";
                        "host" => self.url.host_id(),
                        "substream" => self.substream,
                        "status" => %status);

        let leftover = {
            let mut guts = self.guts.lock().unwrap();
            guts.state = SocketState::Broken;
            self.close_locked(&mut guts)
        };

        if let Some(stream) = self.stream() {
            stream.on_error(self.substream, status, leftover);
        }
    }
}

impl SocketHandler for AsyncSocketHandler {
    fn event(&self, event: SocketEvent) {
        let state = self.state();

        match event {
            SocketEvent::ReadyToWrite => match state {
                SocketState::Connecting => self.on_connection_return(),
                SocketState::Connected | SocketState::Handshaking => {
                    self.on_write_while_handshaking()
                }
                SocketState::HandshakeDone => self.on_write(),
                _ => (),
            },
            SocketEvent::ReadyToRead => match state {
                SocketState::Connected | SocketState::Handshaking => {
                    self.on_read_while_handshaking()
                }
                SocketState::HandshakeDone => self.on_read(),
                _ => (),
            },
            SocketEvent::WriteTimeOut => match state {
                SocketState::Connecting | SocketState::Connected | SocketState::Handshaking => {
                    self.on_timeout_while_handshaking()
                }
                SocketState::HandshakeDone => self.on_write_timeout(),
                _ => (),
            },
            SocketEvent::ReadTimeOut => match state {
                SocketState::Connecting | SocketState::Connected | SocketState::Handshaking => {
                    self.on_timeout_while_handshaking()
                }
                SocketState::HandshakeDone => self.on_read_timeout(),
                _ => (),
            },
        }
    }
}

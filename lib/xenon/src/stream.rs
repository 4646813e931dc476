use crate::any::AnyObject;
use crate::inqueue::IncomingQueue;
use crate::message::Message;
use crate::monitor::{ConnectInfo, DisconnectInfo, Monitor, MonitorEvent};
use crate::poller::Poller;
use crate::socket::AsyncSocketHandler;
use crate::transport::TransportHandler;
use crate::url::URL;
use photon::env::Env;
use photon::logging::{self, Logger};
use photon::status::{Code, Status};
use photon::time::timestamp_secs;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Receiver of the terminal outcome of a send: the message either reached
/// the wire or failed. Exactly one call is made per request.
pub trait MessageStatusHandler: Send + Sync {
    fn handle_status(&self, msg: &Message, status: Status);
}

/// An outbound request parked in a substream queue.
pub struct OutMessage {
    pub msg: Message,
    pub handler: Option<Arc<dyn MessageStatusHandler>>,
    pub expires: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SubStreamState {
    Disconnected,
    Connecting,
    /// A failed attempt is waiting out the rest of its connection window.
    Backoff { next_attempt: u64 },
    Connected,
}

struct SubStream {
    handler: Arc<AsyncSocketHandler>,
    queue: VecDeque<OutMessage>,
    state: SubStreamState,
    attempt_started: u64,
}

struct StreamData {
    substreams: Vec<SubStream>,
    // Consecutive failed connection attempts.
    connection_count: i32,
    last_fatal: u64,
    connected_since: u64,
}

enum FaultAction {
    Nothing,
    Reconnect(u16),
    Exhausted(Vec<OutMessage>),
}

/// A logical request/response multiplex within a channel: owns the
/// substream handlers and their outbound queues, enforces per-request
/// deadlines, and drives the reconnect policy.
pub struct Stream {
    url: URL,
    stream_num: u16,
    transport: Arc<dyn TransportHandler>,
    channel_data: Arc<Mutex<AnyObject>>,
    incoming: Arc<IncomingQueue>,
    env: Arc<Env>,
    monitor: Option<Arc<dyn Monitor>>,
    data: Mutex<StreamData>,
    log: Logger,
}

impl Stream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: URL,
        stream_num: u16,
        poller: Arc<dyn Poller>,
        transport: Arc<dyn TransportHandler>,
        channel_data: Arc<Mutex<AnyObject>>,
        incoming: Arc<IncomingQueue>,
        env: Arc<Env>,
        monitor: Option<Arc<dyn Monitor>>,
        log: Logger,
    ) -> Arc<Stream> {
        let substream_count = {
            let mut channel_data = channel_data.lock().unwrap();
            transport.sub_stream_number(&mut channel_data).max(1)
        };

        let timeout_resolution = Self::timeout_resolution(&env);

        let stream = Arc::new(Stream {
            url: url.clone(),
            stream_num,
            transport: transport.clone(),
            channel_data: channel_data.clone(),
            incoming,
            env,
            monitor,
            data: Mutex::new(StreamData {
                substreams: Vec::new(),
                connection_count: 0,
                last_fatal: 0,
                connected_since: 0,
            }),
            log: log.clone(),
        });

        {
            let mut data = stream.data.lock().unwrap();
            for substream in 0..substream_count {
                let handler = Arc::new(AsyncSocketHandler::new(
                    poller.clone(),
                    transport.clone(),
                    channel_data.clone(),
                    url.clone(),
                    stream_num,
                    substream,
                    timeout_resolution,
                    log.clone(),
                ));
                handler.set_stream(Arc::downgrade(&stream));

                data.substreams.push(SubStream {
                    handler,
                    queue: VecDeque::new(),
                    state: SubStreamState::Disconnected,
                    attempt_started: 0,
                });
            }
        }

        logging::debug!(log, "stream created";
                        "host" => url.host_id(),
                        "stream" => stream_num,
                        "substreams" => substream_count);

        stream
    }

    fn timeout_resolution(env: &Env) -> u16 {
        env.get_int("TimeoutResolution").unwrap_or(15).max(1) as u16
    }

    fn connection_window(&self) -> u64 {
        self.env.get_int("ConnectionWindow").unwrap_or(120).max(1) as u64
    }

    fn connection_retry(&self) -> i32 {
        self.env.get_int("ConnectionRetry").unwrap_or(5).max(1)
    }

    fn stream_error_window(&self) -> u64 {
        self.env.get_int("StreamErrorWindow").unwrap_or(1800) as u64
    }

    /// Queue a message on the substream the transport picks. The stream id
    /// is the caller's business: the requester layers stamp ids from this
    /// channel's pool and match the replies. Connects lazily.
    pub fn send(
        &self,
        mut msg: Message,
        handler: Option<Arc<dyn MessageStatusHandler>>,
        expires: u64,
    ) -> Status {
        let path = {
            let mut channel_data = self.channel_data.lock().unwrap();
            self.transport
                .multiplex_substream(&mut msg, &mut channel_data, None)
        };

        let up = path.up as usize;
        let connect_now = {
            let mut data = self.data.lock().unwrap();

            if up >= data.substreams.len() {
                return Status::error(Code::InvalidArgument);
            }

            logging::trace!(self.log, "queueing outgoing message";
                            "host" => self.url.host_id(),
                            "substream" => path.up,
                            "description" => msg.description());

            let substream = &mut data.substreams[up];
            substream.queue.push_back(OutMessage {
                msg,
                handler,
                expires,
            });

            match substream.state {
                SubStreamState::Connected => {
                    let handler = substream.handler.clone();
                    drop(data);
                    handler.enable_uplink();
                    false
                }
                SubStreamState::Disconnected => {
                    substream.state = SubStreamState::Connecting;
                    substream.attempt_started = timestamp_secs();
                    true
                }
                _ => false,
            }
        };

        if connect_now {
            self.attempt_connect(path.up);
        }

        Status::ok()
    }

    /// Launch a connection attempt for a substream already marked as
    /// connecting. Failures feed the retry accounting.
    fn attempt_connect(&self, substream: u16) {
        let handler = {
            let data = self.data.lock().unwrap();
            data.substreams[substream as usize].handler.clone()
        };

        let status = handler.connect(self.connection_window());
        if status.has_failed() {
            self.on_connect_error(substream, status);
        }
    }

    //--------------------------------------------------------------------
    // Substream callbacks
    //--------------------------------------------------------------------

    /// A substream finished its handshake and is operational.
    pub fn on_connected(&self, substream: u16) {
        let now = timestamp_secs();

        let (uplink_handler, others) = {
            let mut data = self.data.lock().unwrap();

            data.connection_count = 0;
            data.connected_since = now;

            let entry = &mut data.substreams[substream as usize];
            entry.state = SubStreamState::Connected;

            let uplink = if entry.queue.is_empty() {
                None
            } else {
                Some(entry.handler.clone())
            };

            // With the control connection up, bring up the rest.
            let mut others = Vec::new();
            if substream == 0 && self.transport.need_control_connection() {
                for (index, other) in data.substreams.iter_mut().enumerate().skip(1) {
                    if other.state == SubStreamState::Disconnected {
                        other.state = SubStreamState::Connecting;
                        other.attempt_started = now;
                        others.push(index as u16);
                    }
                }
            }

            (uplink, others)
        };

        logging::info!(self.log, "substream operational";
                       "host" => self.url.host_id(),
                       "stream" => self.stream_num,
                       "substream" => substream);

        if let Some(handler) = uplink_handler {
            handler.enable_uplink();
        }

        for other in others {
            self.attempt_connect(other);
        }

        if let Some(monitor) = self.monitor.as_ref() {
            monitor.event(&MonitorEvent::Connect(ConnectInfo {
                host_id: self.url.host_id().to_string(),
                at: now,
            }));
        }
    }

    /// A connection attempt failed. Pace the next attempt one window out,
    /// or fault everything once the retry budget is spent.
    pub fn on_connect_error(&self, substream: u16, status: Status) {
        let now = timestamp_secs();
        let window = self.connection_window();
        let retry_budget = self.connection_retry();

        logging::debug!(self.log, "connection attempt failed";
                        "host" => self.url.host_id(),
                        "substream" => substream,
                        "status" => %status);

        let action = {
            let mut guard = self.data.lock().unwrap();
            let data = &mut *guard;
            data.connection_count += 1;

            if data.connection_count < retry_budget {
                let entry = &mut data.substreams[substream as usize];
                entry.state = SubStreamState::Backoff {
                    next_attempt: entry.attempt_started + window,
                };
                FaultAction::Nothing
            } else {
                data.connection_count = 0;
                data.last_fatal = now;
                data.substreams[substream as usize].state = SubStreamState::Disconnected;

                let mut victims = Vec::new();
                for entry in data.substreams.iter_mut() {
                    victims.extend(entry.queue.drain(..));
                }
                FaultAction::Exhausted(victims)
            }
        };

        if let FaultAction::Exhausted(victims) = action {
            logging::error!(self.log, "connection retries exhausted";
                            "host" => self.url.host_id(),
                            "retries" => retry_budget);

            self.fault_requests(victims, Status::error(Code::ConnectionError));
            self.incoming
                .fail_all(Status::error(Code::StreamDisconnect));
        }
    }

    /// A fatal fault on an operational substream. Reconnect while the
    /// error window allows it, otherwise give up on everything queued.
    pub fn on_error(&self, substream: u16, status: Status, leftover: Option<OutMessage>) {
        let now = timestamp_secs();
        let retry_budget = self.connection_retry();
        let error_window = self.stream_error_window();

        logging::error!(self.log, "stream fault";
                        "host" => self.url.host_id(),
                        "substream" => substream,
                        "status" => %status);

        let action = {
            let mut guard = self.data.lock().unwrap();
            let data = &mut *guard;

            // Faults further apart than the error window do not accumulate.
            if now.saturating_sub(data.last_fatal) > error_window {
                data.connection_count = 0;
            }
            data.last_fatal = now;

            {
                let entry = &mut data.substreams[substream as usize];
                entry.state = SubStreamState::Disconnected;

                // A partially written request never reached the peer in
                // full; rewind it and send it again on the next connection.
                if let Some(mut entry_msg) = leftover {
                    entry_msg.msg.rewind();
                    entry.queue.push_front(entry_msg);
                }
            }

            {
                let mut channel_data = self.channel_data.lock().unwrap();
                self.transport
                    .disconnect(&mut channel_data, self.stream_num, substream);
            }

            let has_pending = data.substreams.iter().any(|entry| !entry.queue.is_empty());

            if !has_pending {
                FaultAction::Nothing
            } else if data.connection_count < retry_budget {
                let entry = &mut data.substreams[substream as usize];
                entry.state = SubStreamState::Connecting;
                entry.attempt_started = now;
                FaultAction::Reconnect(substream)
            } else {
                data.connection_count = 0;
                let mut victims = Vec::new();
                for entry in data.substreams.iter_mut() {
                    victims.extend(entry.queue.drain(..));
                }
                FaultAction::Exhausted(victims)
            }
        };

        self.emit_disconnect(now, status);

        match action {
            FaultAction::Nothing => (),
            FaultAction::Reconnect(substream) => self.attempt_connect(substream),
            FaultAction::Exhausted(victims) => {
                self.fault_requests(victims, Status::error(Code::StreamDisconnect));
                self.incoming
                    .fail_all(Status::error(Code::StreamDisconnect));
            }
        }
    }

    /// Graceful teardown of an idle substream. Does not count against the
    /// retry budget; the next send reconnects transparently.
    pub fn on_ttl_expired(&self, substream: u16) {
        let now = timestamp_secs();

        let any_connected = {
            let mut data = self.data.lock().unwrap();
            data.substreams[substream as usize].state = SubStreamState::Disconnected;

            {
                let mut channel_data = self.channel_data.lock().unwrap();
                self.transport
                    .disconnect(&mut channel_data, self.stream_num, substream);
            }

            data.substreams
                .iter()
                .any(|entry| entry.state == SubStreamState::Connected)
        };

        logging::info!(self.log, "substream torn down after its idle time to live";
                       "host" => self.url.host_id(),
                       "substream" => substream);

        self.emit_disconnect(now, Status::ok());

        if !any_connected {
            // Anyone still waiting for traffic on this stream is out of
            // luck until a new connection is made.
            self.incoming
                .fail_all(Status::error(Code::StreamDisconnect));
        }
    }

    /// Hand the next queued message to a substream handler, failing
    /// requests whose deadline passed while queued.
    pub fn get_outgoing(&self, substream: u16) -> Option<OutMessage> {
        let now = timestamp_secs();
        let mut expired = Vec::new();
        let next = {
            let mut data = self.data.lock().unwrap();
            let entry = &mut data.substreams[substream as usize];

            loop {
                match entry.queue.pop_front() {
                    Some(out) if out.expires <= now => expired.push(out),
                    other => break other,
                }
            }
        };

        self.fault_requests(expired, Status::error(Code::SocketTimeout));
        next
    }

    /// Put a message back at the front of a substream queue.
    pub fn requeue(&self, substream: u16, entry: OutMessage) {
        let mut data = self.data.lock().unwrap();
        data.substreams[substream as usize].queue.push_front(entry);
    }

    pub fn has_outgoing(&self, substream: u16) -> bool {
        let data = self.data.lock().unwrap();
        !data.substreams[substream as usize].queue.is_empty()
    }

    /// A request reached the wire in full; this is its terminal send
    /// outcome. The stream id stays allocated for the requester to match
    /// the reply.
    pub fn on_message_sent(&self, substream: u16, entry: OutMessage) {
        logging::trace!(self.log, "message sent";
                        "host" => self.url.host_id(),
                        "substream" => substream,
                        "description" => entry.msg.description());

        if let Some(handler) = entry.handler.as_ref() {
            handler.handle_status(&entry.msg, Status::ok());
        }
    }

    /// A fully framed response arrived; hand it to the inbox.
    pub fn on_incoming(&self, _substream: u16, msg: Message) {
        self.incoming.put(msg);
    }

    /// Read side went quiet; sweep the request deadlines.
    pub fn on_read_timeout(&self, _substream: u16) {
        self.sweep_deadlines(timestamp_secs());
    }

    fn sweep_deadlines(&self, now: u64) {
        let mut expired = Vec::new();

        {
            let mut data = self.data.lock().unwrap();
            for entry in data.substreams.iter_mut() {
                let mut index = 0;
                while index < entry.queue.len() {
                    if entry.queue[index].expires <= now {
                        expired.extend(entry.queue.remove(index));
                    } else {
                        index += 1;
                    }
                }
            }
        }

        self.fault_requests(expired, Status::error(Code::SocketTimeout));
    }

    /// Periodic housekeeping driven by the channel's tick task: request
    /// deadlines, reconnect pacing and the idle TTL.
    pub fn tick(&self, now: u64) {
        self.sweep_deadlines(now);

        let mut to_connect = Vec::new();
        let mut ttl_probes = Vec::new();

        {
            let mut data = self.data.lock().unwrap();

            for (index, entry) in data.substreams.iter_mut().enumerate() {
                match entry.state {
                    SubStreamState::Backoff { next_attempt } if now >= next_attempt => {
                        if entry.queue.is_empty() {
                            // Nothing wants the connection any more.
                            entry.state = SubStreamState::Disconnected;
                        } else {
                            entry.state = SubStreamState::Connecting;
                            entry.attempt_started = now;
                            to_connect.push(index as u16);
                        }
                    }
                    SubStreamState::Connected if entry.queue.is_empty() => {
                        ttl_probes.push(entry.handler.clone());
                    }
                    _ => (),
                }
            }
        }

        for substream in to_connect {
            logging::debug!(self.log, "retrying connection";
                            "host" => self.url.host_id(),
                            "substream" => substream);
            self.attempt_connect(substream);
        }

        for handler in ttl_probes {
            handler.check_ttl(now);
        }
    }

    /// Drop everything: close the sockets, fail queued requests and
    /// subscribers with the given status.
    pub fn shutdown(&self, status: Status) {
        let victims = {
            let mut data = self.data.lock().unwrap();
            let mut victims = Vec::new();

            for entry in data.substreams.iter_mut() {
                entry.state = SubStreamState::Disconnected;
                victims.extend(entry.handler.close());
                victims.extend(entry.queue.drain(..));
            }

            victims
        };

        self.fault_requests(victims, status);
    }

    fn fault_requests(&self, victims: Vec<OutMessage>, status: Status) {
        for entry in victims {
            if let Some(handler) = entry.handler.as_ref() {
                handler.handle_status(&entry.msg, status);
            }
        }
    }

    fn emit_disconnect(&self, now: u64, status: Status) {
        if let Some(monitor) = self.monitor.as_ref() {
            let connected_at = self.data.lock().unwrap().connected_since;
            monitor.event(&MonitorEvent::Disconnect(DisconnectInfo {
                host_id: self.url.host_id().to_string(),
                connected_at,
                at: now,
                status,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::PollerFactory;
    use crate::protocol;
    use crate::transport::XRootDTransport;
    use photon::logging::{o, Discard, TopicMask};
    use std::net::TcpListener;

    struct RecordingStatusHandler {
        statuses: Mutex<Vec<Status>>,
    }

    impl RecordingStatusHandler {
        fn new() -> Arc<RecordingStatusHandler> {
            Arc::new(RecordingStatusHandler {
                statuses: Mutex::new(Vec::new()),
            })
        }
    }

    impl MessageStatusHandler for RecordingStatusHandler {
        fn handle_status(&self, _msg: &Message, status: Status) {
            self.statuses.lock().unwrap().push(status);
        }
    }

    /// A stream wired to real collaborators but with the poller never
    /// started, so the connection stays pending and the queues can be
    /// inspected deterministically.
    fn idle_stream() -> (Arc<Stream>, u16) {
        let log = Logger::root(Discard, o!());
        let env = Arc::new(Env::new());
        env.put_int("TimeoutResolution", 1);

        let poller = PollerFactory::create("built-in", &log, TopicMask::NONE).unwrap();
        let transport: Arc<dyn TransportHandler> =
            Arc::new(XRootDTransport::new(env.clone(), log.clone()));

        let channel_data = Arc::new(Mutex::new(AnyObject::new()));
        {
            let mut scratch = channel_data.lock().unwrap();
            transport.initialize_channel(&mut scratch);
        }

        let incoming = Arc::new(IncomingQueue::new(log.clone()));

        // A port with nothing behind it; the connect stays in flight since
        // the poller never runs.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = URL::new(&format!("root://127.0.0.1:{}", port));

        let stream = Stream::new(
            url,
            0,
            poller,
            transport,
            channel_data,
            incoming,
            env,
            None,
            log,
        );

        (stream, port)
    }

    #[test]
    fn test_outgoing_queue_is_fifo() {
        let (stream, _) = idle_stream();
        let far_future = timestamp_secs() + 3600;

        for seq in 1..=3u8 {
            let status = stream.send(protocol::build_ping_request([seq, 0]), None, far_future);
            assert!(status.is_ok());
        }

        for seq in 1..=3u8 {
            let entry = stream.get_outgoing(0).unwrap();
            assert_eq!(protocol::request_stream_id(&entry.msg), [seq, 0]);
        }

        assert!(stream.get_outgoing(0).is_none());
        assert!(!stream.has_outgoing(0));
    }

    #[test]
    fn test_requeue_goes_to_the_front() {
        let (stream, _) = idle_stream();
        let far_future = timestamp_secs() + 3600;

        stream.send(protocol::build_ping_request([1, 0]), None, far_future);
        stream.send(protocol::build_ping_request([2, 0]), None, far_future);

        let first = stream.get_outgoing(0).unwrap();
        assert_eq!(protocol::request_stream_id(&first.msg), [1, 0]);

        stream.requeue(0, first);

        let again = stream.get_outgoing(0).unwrap();
        assert_eq!(protocol::request_stream_id(&again.msg), [1, 0]);
    }

    #[test]
    fn test_expired_requests_fault_with_timeout() {
        let (stream, _) = idle_stream();
        let now = timestamp_secs();

        let expired = RecordingStatusHandler::new();
        let alive = RecordingStatusHandler::new();

        stream.send(protocol::build_ping_request([1, 0]), Some(expired.clone()), now);
        stream.send(
            protocol::build_ping_request([2, 0]),
            Some(alive.clone()),
            now + 3600,
        );

        stream.tick(now + 2);

        let statuses = expired.statuses.lock().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].code, Code::SocketTimeout);
        drop(statuses);

        assert!(alive.statuses.lock().unwrap().is_empty());

        // The live request is still queued for the eventual connection.
        let entry = stream.get_outgoing(0).unwrap();
        assert_eq!(protocol::request_stream_id(&entry.msg), [2, 0]);
    }

    #[test]
    fn test_shutdown_faults_queued_requests() {
        let (stream, _) = idle_stream();
        let handler = RecordingStatusHandler::new();

        stream.send(
            protocol::build_ping_request([7, 7]),
            Some(handler.clone()),
            timestamp_secs() + 3600,
        );

        stream.shutdown(Status::error(Code::Cancelled));

        let statuses = handler.statuses.lock().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].code, Code::Cancelled);
    }

    #[test]
    fn test_request_expired_on_arrival() {
        let (stream, _) = idle_stream();

        // A deadline already in the past never reaches the wire; the next
        // fetch drops it.
        let status = stream.send(protocol::build_ping_request([1, 1]), None, 0);

        assert!(status.is_ok());
        assert!(stream.get_outgoing(0).is_none());
        assert!(!stream.has_outgoing(0));
    }
}

use crate::any::AnyObject;
use crate::inqueue::{action, IncomingMsgHandler, IncomingQueue, MessageFilter};
use crate::message::Message;
use crate::monitor::Monitor;
use crate::poller::Poller;
use crate::sid::SIDManager;
use crate::stream::{MessageStatusHandler, Stream};
use crate::task::{Task, TaskManager};
use crate::transport::TransportHandler;
use crate::url::URL;
use photon::env::Env;
use photon::logging::{self, Logger};
use photon::status::{Code, Status};
use photon::time::timestamp_secs;
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};

/// Blocks the synchronous send until the async outcome lands.
struct SyncStatusHandler {
    tx: Mutex<SyncSender<Status>>,
}

impl MessageStatusHandler for SyncStatusHandler {
    fn handle_status(&self, _msg: &Message, status: Status) {
        let _ = self.tx.lock().unwrap().send(status);
    }
}

/// One-shot sink behind a filter registration; wakes the synchronous
/// receiver with either the matched message or a fault.
struct FilterSink {
    tx: Mutex<SyncSender<Result<Message, Status>>>,
}

impl IncomingMsgHandler for FilterSink {
    fn handle_message(&self, msg: &mut Option<Message>) -> u8 {
        if let Some(msg) = msg.take() {
            let _ = self.tx.lock().unwrap().send(Ok(msg));
        }
        action::TAKE | action::REMOVE_HANDLER
    }

    fn handle_fault(&self, status: Status) {
        let _ = self.tx.lock().unwrap().send(Err(status));
    }
}

/// Fires `Channel::tick` every timeout resolution. Holds the channel
/// weakly so an abandoned channel retires its own task.
struct TickGeneratorTask {
    channel: std::sync::Weak<Channel>,
    env: Arc<Env>,
    name: String,
}

impl Task for TickGeneratorTask {
    fn run(&self, now: u64) -> u64 {
        match self.channel.upgrade() {
            Some(channel) => {
                channel.tick(now);
                now + Channel::tick_resolution(&self.env)
            }
            None => 0,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A logical connection to one endpoint: the streams, the inbox, the
/// channel scratch and the periodic timeout tick.
pub struct Channel {
    url: URL,
    streams: Vec<Arc<Stream>>,
    incoming: Arc<IncomingQueue>,
    channel_data: Arc<Mutex<AnyObject>>,
    sid_manager: Arc<SIDManager>,
    transport: Arc<dyn TransportHandler>,
    task_manager: Arc<TaskManager>,
    tick_task: Mutex<Option<Arc<dyn Task>>>,
    env: Arc<Env>,
    log: Logger,
}

impl Channel {
    pub fn new(
        url: &URL,
        poller: Arc<dyn Poller>,
        transport: Arc<dyn TransportHandler>,
        task_manager: Arc<TaskManager>,
        env: Arc<Env>,
        monitor: Option<Arc<dyn Monitor>>,
        log: Logger,
    ) -> Arc<Channel> {
        let channel_data = Arc::new(Mutex::new(AnyObject::new()));
        {
            let mut scratch = channel_data.lock().unwrap();
            transport.initialize_channel(&mut scratch);
        }

        let incoming = Arc::new(IncomingQueue::new(log.clone()));
        let sid_manager = Arc::new(SIDManager::new());

        let stream_count = {
            let mut scratch = channel_data.lock().unwrap();
            transport.stream_number(&mut scratch).max(1)
        };

        logging::debug!(log, "creating channel";
                        "host" => url.host_id(),
                        "streams" => stream_count);

        let mut streams = Vec::new();
        for stream_num in 0..stream_count {
            streams.push(Stream::new(
                url.clone(),
                stream_num,
                poller.clone(),
                transport.clone(),
                channel_data.clone(),
                incoming.clone(),
                env.clone(),
                monitor.clone(),
                log.clone(),
            ));
        }

        let channel = Arc::new(Channel {
            url: url.clone(),
            streams,
            incoming,
            channel_data,
            sid_manager,
            transport,
            task_manager: task_manager.clone(),
            tick_task: Mutex::new(None),
            env: env.clone(),
            log,
        });

        let tick: Arc<dyn Task> = Arc::new(TickGeneratorTask {
            channel: Arc::downgrade(&channel),
            env: env.clone(),
            name: format!("tick generator for {}", url.host_id()),
        });
        task_manager.register_task(tick.clone(), timestamp_secs() + Self::tick_resolution(&env));
        *channel.tick_task.lock().unwrap() = Some(tick);

        channel
    }

    fn tick_resolution(env: &Env) -> u64 {
        env.get_int("TimeoutResolution").unwrap_or(15).max(1) as u64
    }

    fn request_timeout(&self, timeout: u16) -> u64 {
        if timeout > 0 {
            return timeout as u64;
        }
        self.env.get_int("RequestTimeout").unwrap_or(300).max(1) as u64
    }

    /// The stream id pool of this channel.
    pub fn sid_manager(&self) -> &Arc<SIDManager> {
        &self.sid_manager
    }

    /// Send a message and block until it is acknowledged on the wire or
    /// fails.
    pub fn send(&self, msg: Message, timeout: u16) -> Status {
        let (tx, rx) = sync_channel(1);
        let handler = Arc::new(SyncStatusHandler { tx: Mutex::new(tx) });

        let status = self.send_async(msg, handler, timeout);
        if status.has_failed() {
            return status;
        }

        match rx.recv() {
            Ok(status) => status,
            Err(_) => Status::error(Code::Cancelled),
        }
    }

    /// Queue a message for sending; the status handler receives exactly
    /// one terminal outcome.
    pub fn send_async(
        &self,
        mut msg: Message,
        handler: Arc<dyn MessageStatusHandler>,
        timeout: u16,
    ) -> Status {
        let expires = timestamp_secs() + self.request_timeout(timeout);

        let path = {
            let mut scratch = self.channel_data.lock().unwrap();
            self.transport.multiplex(&mut msg, &mut scratch, None)
        };

        match self.streams.get(path.up as usize) {
            Some(stream) => stream.send(msg, Some(handler), expires),
            None => Status::error(Code::InvalidArgument),
        }
    }

    /// Block until a message matching the filter arrives, or the timeout
    /// or a stream fault gets there first.
    pub fn receive(&self, filter: Arc<dyn MessageFilter>, timeout: u16) -> Result<Message, Status> {
        let (tx, rx) = sync_channel(1);
        let sink = Arc::new(FilterSink { tx: Mutex::new(tx) });

        let expires = timestamp_secs() + timeout.max(1) as u64;
        self.incoming.add_filter(filter, sink, expires);

        match rx.recv() {
            Ok(result) => result,
            Err(_) => Err(Status::error(Code::Cancelled)),
        }
    }

    /// Subscribe a persistent handler to this channel's inbox.
    pub fn receive_async(&self, handler: Arc<dyn IncomingMsgHandler>, timeout: u16) -> Status {
        let expires = timestamp_secs() + timeout.max(1) as u64;
        self.incoming.add_message_handler(handler, expires);
        Status::ok()
    }

    /// Periodic housekeeping: stream deadlines, reconnect pacing, TTL and
    /// subscriber timeouts.
    pub fn tick(&self, now: u64) {
        // Subscriber deadlines first, so a receiver expiring in the same
        // tick as a TTL teardown sees the timeout, not the disconnect.
        self.incoming.report_timeouts(now);
        for stream in self.streams.iter() {
            stream.tick(now);
        }
    }

    /// Pass a query through to the transport.
    pub fn query_transport(&self, kind: u16, result: &mut AnyObject) -> Status {
        let mut scratch = self.channel_data.lock().unwrap();
        self.transport.query(kind, result, &mut scratch)
    }

    /// Tear the channel down, failing everything in flight with the given
    /// status.
    pub fn shutdown(&self, status: Status) {
        logging::debug!(self.log, "shutting down channel"; "host" => self.url.host_id());

        if let Some(tick) = self.tick_task.lock().unwrap().take() {
            self.task_manager.unregister_task(&tick);
        }

        for stream in self.streams.iter() {
            stream.shutdown(status);
        }

        self.incoming.fail_all(status);

        let mut scratch = self.channel_data.lock().unwrap();
        self.transport.finalize_channel(&mut scratch);
    }
}

use indexmap::IndexMap;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use photon::logging::{self, Logger, Topic, TopicMask};
use photon::status::{Code, Status};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Readiness and timeout notifications delivered to socket handlers.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SocketEvent {
    ReadyToRead,
    ReadTimeOut,
    ReadyToWrite,
    WriteTimeOut,
}

/// Receiver of socket events. Callbacks for a given socket are serialized:
/// they all run on the poll thread.
pub trait SocketHandler: Send + Sync {
    fn event(&self, event: SocketEvent);
}

/// Identifies a registered socket within a poller.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SocketId(usize);

/// The readiness dispatcher. Implementations own the event loop thread;
/// handlers keep ownership of their sockets and register the raw
/// descriptor only.
pub trait Poller: Send + Sync {
    fn start(&self) -> Status;
    fn stop(&self) -> Status;
    fn add_socket(&self, fd: RawFd, handler: Arc<dyn SocketHandler>) -> Result<SocketId, Status>;
    fn remove_socket(&self, id: SocketId) -> Status;

    /// Turn read readiness notifications on or off. With a non-zero
    /// `timeout_res`, a `ReadTimeOut` event is delivered whenever no read
    /// readiness was seen for that many seconds.
    fn enable_read_notification(&self, id: SocketId, on: bool, timeout_res: u16) -> Status;

    /// Same as `enable_read_notification`, for the write side.
    fn enable_write_notification(&self, id: SocketId, on: bool, timeout_res: u16) -> Status;

    fn is_running(&self) -> bool;
}

/// Maps the `PollerPreference` string to an implementation. Only the
/// built-in mio-backed poller exists; unknown preferences fall back to it
/// with a warning.
pub struct PollerFactory;

impl PollerFactory {
    pub fn create(preference: &str, log: &Logger, mask: TopicMask) -> Result<Arc<dyn Poller>, Status> {
        let poller_log = logging::topic_logger(log, mask, Topic::PollerMsg);

        if preference != "built-in" && preference != "default" {
            logging::warn!(poller_log, "unknown poller preference, using built-in";
                           "preference" => preference);
        }

        match BuiltInPoller::new(poller_log) {
            Ok(poller) => Ok(Arc::new(poller)),
            Err(_) => Err(Status::error(Code::PollerError)),
        }
    }
}

const WAKER_TOKEN: Token = Token(0);
const EVENT_CAPACITY: usize = 1024;

// The poll call wakes up at least this often so timeout synthesis keeps
// a one second granularity.
const POLL_PERIOD: Duration = Duration::from_secs(1);

struct SocketEntry {
    fd: RawFd,
    handler: Arc<dyn SocketHandler>,
    registered: bool,
    read_on: bool,
    write_on: bool,
    read_res: u16,
    write_res: u16,
    last_read: Instant,
    last_write: Instant,
}

impl SocketEntry {
    fn interest(&self) -> Option<Interest> {
        match (self.read_on, self.write_on) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

struct SocketTable {
    entries: IndexMap<usize, SocketEntry>,
    next_id: usize,
}

/// The built-in poller: a single mio poll loop plus synthesized timeout
/// events driven by the last observed readiness of each socket.
pub struct BuiltInPoller {
    registry: Registry,
    waker: Arc<Waker>,
    poll: Mutex<Option<Poll>>,
    sockets: Arc<Mutex<SocketTable>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    log: Logger,
}

impl BuiltInPoller {
    pub fn new(log: Logger) -> Result<BuiltInPoller, std::io::Error> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(BuiltInPoller {
            registry,
            waker,
            poll: Mutex::new(Some(poll)),
            sockets: Arc::new(Mutex::new(SocketTable {
                entries: IndexMap::new(),
                next_id: 1,
            })),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            log,
        })
    }

    fn enable_notification(&self, id: SocketId, on: bool, timeout_res: u16, write: bool) -> Status {
        let mut table = self.sockets.lock().unwrap();

        let entry = match table.entries.get_mut(&id.0) {
            Some(entry) => entry,
            None => return Status::error(Code::NotFound),
        };

        let now = Instant::now();
        if write {
            entry.write_on = on;
            entry.write_res = timeout_res;
            entry.last_write = now;
        } else {
            entry.read_on = on;
            entry.read_res = timeout_res;
            entry.last_read = now;
        }

        let status = self.apply_interest(id, entry);
        drop(table);

        // Nudge the loop so an already-pending readiness surfaces without
        // waiting out the poll period.
        let _ = self.waker.wake();
        status
    }

    /// Reflect the enabled flags of an entry in the OS interest set.
    fn apply_interest(&self, id: SocketId, entry: &mut SocketEntry) -> Status {
        let result = match entry.interest() {
            Some(interest) => {
                if entry.registered {
                    self.registry
                        .reregister(&mut SourceFd(&entry.fd), Token(id.0), interest)
                } else {
                    entry.registered = true;
                    self.registry
                        .register(&mut SourceFd(&entry.fd), Token(id.0), interest)
                }
            }
            None if entry.registered => {
                entry.registered = false;
                self.registry.deregister(&mut SourceFd(&entry.fd))
            }
            None => Ok(()),
        };

        match result {
            Ok(()) => Status::ok(),
            Err(err) => {
                logging::error!(self.log, "interest change failed";
                                "socket" => id.0,
                                "error" => %err);
                Status::error(Code::PollerError)
            }
        }
    }

    fn run_loop(
        sockets: Arc<Mutex<SocketTable>>,
        running: Arc<AtomicBool>,
        mut poll: Poll,
        log: Logger,
    ) {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        let mut pending: Vec<(Arc<dyn SocketHandler>, SocketEvent)> = Vec::new();

        logging::debug!(log, "event loop running");

        while running.load(Ordering::Acquire) {
            if let Err(err) = poll.poll(&mut events, Some(POLL_PERIOD)) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                logging::error!(log, "poll failed, stopping the event loop"; "error" => %err);
                break;
            }

            let now = Instant::now();

            {
                let mut table = sockets.lock().unwrap();

                for event in events.iter() {
                    if event.token() == WAKER_TOKEN {
                        continue;
                    }

                    if let Some(entry) = table.entries.get_mut(&event.token().0) {
                        // Errors and hangups surface as readiness so the
                        // handler observes them through the socket call.
                        let readable =
                            event.is_readable() || event.is_read_closed() || event.is_error();
                        let writable =
                            event.is_writable() || event.is_write_closed() || event.is_error();

                        if readable && entry.read_on {
                            entry.last_read = now;
                            pending.push((entry.handler.clone(), SocketEvent::ReadyToRead));
                        }
                        if writable && entry.write_on {
                            entry.last_write = now;
                            pending.push((entry.handler.clone(), SocketEvent::ReadyToWrite));
                        }
                    }
                }

                // Synthesize timeout events for sockets with no recent
                // readiness of the enabled kind.
                for (_, entry) in table.entries.iter_mut() {
                    if entry.read_on
                        && entry.read_res > 0
                        && now.duration_since(entry.last_read).as_secs() >= entry.read_res as u64
                    {
                        entry.last_read = now;
                        pending.push((entry.handler.clone(), SocketEvent::ReadTimeOut));
                    }
                    if entry.write_on
                        && entry.write_res > 0
                        && now.duration_since(entry.last_write).as_secs() >= entry.write_res as u64
                    {
                        entry.last_write = now;
                        pending.push((entry.handler.clone(), SocketEvent::WriteTimeOut));
                    }
                }
            }

            // Dispatch outside the table lock; handlers re-enter the poller.
            for (handler, event) in pending.drain(..) {
                handler.event(event);
            }
        }

        logging::debug!(log, "event loop finished");
    }
}

impl Poller for BuiltInPoller {
    fn start(&self) -> Status {
        let poll = match self.poll.lock().unwrap().take() {
            Some(poll) => poll,
            None => return Status::error(Code::InvalidOperation),
        };

        logging::debug!(self.log, "starting the poller");

        self.running.store(true, Ordering::Release);

        let sockets = self.sockets.clone();
        let running = self.running.clone();
        let log = self.log.clone();

        let worker = thread::Builder::new()
            .name("xrd-poller".to_string())
            .spawn(move || Self::run_loop(sockets, running, poll, log));

        match worker {
            Ok(handle) => {
                *self.worker.lock().unwrap() = Some(handle);
                Status::ok()
            }
            Err(_) => {
                self.running.store(false, Ordering::Release);
                Status::error(Code::PollerError)
            }
        }
    }

    fn stop(&self) -> Status {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Status::ok();
        }

        logging::debug!(self.log, "stopping the poller");

        let _ = self.waker.wake();

        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }

        Status::ok()
    }

    fn add_socket(&self, fd: RawFd, handler: Arc<dyn SocketHandler>) -> Result<SocketId, Status> {
        let mut table = self.sockets.lock().unwrap();

        let id = table.next_id;
        table.next_id += 1;

        let now = Instant::now();
        table.entries.insert(
            id,
            SocketEntry {
                fd,
                handler,
                registered: false,
                read_on: false,
                write_on: false,
                read_res: 0,
                write_res: 0,
                last_read: now,
                last_write: now,
            },
        );

        logging::trace!(self.log, "socket added"; "socket" => id, "fd" => fd);

        Ok(SocketId(id))
    }

    fn remove_socket(&self, id: SocketId) -> Status {
        let mut table = self.sockets.lock().unwrap();

        if let Some(entry) = table.entries.shift_remove(&id.0) {
            if entry.registered {
                // The descriptor may already be closed; nothing to do then.
                let _ = self.registry.deregister(&mut SourceFd(&entry.fd));
            }
            logging::trace!(self.log, "socket removed"; "socket" => id.0, "fd" => entry.fd);
            Status::ok()
        } else {
            Status::error(Code::NotFound)
        }
    }

    fn enable_read_notification(&self, id: SocketId, on: bool, timeout_res: u16) -> Status {
        self.enable_notification(id, on, timeout_res, false)
    }

    fn enable_write_notification(&self, id: SocketId, on: bool, timeout_res: u16) -> Status {
        self.enable_notification(id, on, timeout_res, true)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for BuiltInPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use photon::logging::{o, Discard};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    struct RecordingHandler {
        events: Mutex<Vec<SocketEvent>>,
    }

    impl RecordingHandler {
        fn new() -> Arc<RecordingHandler> {
            Arc::new(RecordingHandler {
                events: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self, wanted: SocketEvent) -> bool {
            self.events.lock().unwrap().iter().any(|e| *e == wanted)
        }
    }

    impl SocketHandler for RecordingHandler {
        fn event(&self, event: SocketEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn test_poller() -> BuiltInPoller {
        BuiltInPoller::new(Logger::root(Discard, o!())).unwrap()
    }

    fn wait_for<F: Fn() -> bool>(cond: F, secs: u64) -> bool {
        let deadline = Instant::now() + Duration::from_secs(secs);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_read_readiness() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let poller = test_poller();
        assert!(poller.start().is_ok());

        let handler = RecordingHandler::new();
        let id = poller.add_socket(client.as_raw_fd(), handler.clone()).unwrap();
        assert!(poller.enable_read_notification(id, true, 0).is_ok());

        server.write_all(b"knock knock").unwrap();

        assert!(wait_for(|| handler.seen(SocketEvent::ReadyToRead), 5));
        assert!(!handler.seen(SocketEvent::ReadyToWrite));

        assert!(poller.remove_socket(id).is_ok());
        assert!(poller.stop().is_ok());
    }

    #[test]
    fn test_write_readiness_and_disable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let (_server, _) = listener.accept().unwrap();

        let poller = test_poller();
        assert!(poller.start().is_ok());

        let handler = RecordingHandler::new();
        let id = poller.add_socket(client.as_raw_fd(), handler.clone()).unwrap();
        assert!(poller.enable_write_notification(id, true, 0).is_ok());

        // A fresh connected socket is immediately writable.
        assert!(wait_for(|| handler.seen(SocketEvent::ReadyToWrite), 5));

        assert!(poller.enable_write_notification(id, false, 0).is_ok());
        assert!(poller.remove_socket(id).is_ok());
        assert!(poller.stop().is_ok());
    }

    #[test]
    fn test_read_timeout_synthesized() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let (_server, _) = listener.accept().unwrap();

        let poller = test_poller();
        assert!(poller.start().is_ok());

        let handler = RecordingHandler::new();
        let id = poller.add_socket(client.as_raw_fd(), handler.clone()).unwrap();
        assert!(poller.enable_read_notification(id, true, 1).is_ok());

        // Nothing ever arrives, so a timeout event must be synthesized.
        assert!(wait_for(|| handler.seen(SocketEvent::ReadTimeOut), 5));

        assert!(poller.remove_socket(id).is_ok());
        assert!(poller.stop().is_ok());
    }

    #[test]
    fn test_unknown_socket_rejected() {
        let poller = test_poller();

        let status = poller.enable_read_notification(SocketId(999), true, 0);
        assert_eq!(status.code, Code::NotFound);

        let status = poller.remove_socket(SocketId(999));
        assert_eq!(status.code, Code::NotFound);
    }

    #[test]
    fn test_factory_fallback() {
        let log = Logger::root(Discard, o!());
        let poller = PollerFactory::create("no-such-poller", &log, TopicMask::NONE).unwrap();
        assert!(!poller.is_running());
    }
}

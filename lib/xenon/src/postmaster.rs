use crate::any::AnyObject;
use crate::channel::Channel;
use crate::inqueue::{IncomingMsgHandler, MessageFilter};
use crate::message::Message;
use crate::monitor::Monitor;
use crate::poller::{Poller, PollerFactory};
use crate::stream::MessageStatusHandler;
use crate::task::TaskManager;
use crate::transport::{TransportHandler, XRootDTransport};
use crate::url::URL;
use hashbrown::HashMap;
use photon::env::Env;
use photon::logging::{self, Logger, Topic, TopicMask};
use photon::status::{Code, Status};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// The process-facing entry point of the networking core: a registry of
/// channels keyed by canonical endpoint, sharing one poller, one task
/// manager and one transport.
pub struct PostMaster {
    env: Arc<Env>,
    log: Logger,
    mask: TopicMask,
    pm_log: Logger,
    poller: Mutex<Option<Arc<dyn Poller>>>,
    task_manager: Mutex<Option<Arc<TaskManager>>>,
    transport: Mutex<Option<Arc<dyn TransportHandler>>>,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
    monitor: Mutex<Option<Arc<dyn Monitor>>>,
    initialized: AtomicBool,
    running: AtomicBool,
}

impl PostMaster {
    /// Build a post-master logging through the default terminal logger.
    pub fn new(env: Arc<Env>) -> PostMaster {
        Self::with_logger(env, logging::init())
    }

    pub fn with_logger(env: Arc<Env>, log: Logger) -> PostMaster {
        let mask = TopicMask::from_process_env();
        let pm_log = logging::topic_logger(&log, mask, Topic::PostMasterMsg);

        PostMaster {
            env,
            log,
            mask,
            pm_log,
            poller: Mutex::new(None),
            task_manager: Mutex::new(None),
            transport: Mutex::new(None),
            channels: Mutex::new(HashMap::new()),
            monitor: Mutex::new(None),
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// Create the poller, the task manager and the transport.
    pub fn initialize(&self) -> bool {
        if self.initialized.load(Ordering::Acquire) {
            return false;
        }

        let preference = self
            .env
            .get_string("PollerPreference")
            .unwrap_or_else(|| "built-in".to_string());

        let poller = match PollerFactory::create(&preference, &self.log, self.mask) {
            Ok(poller) => poller,
            Err(status) => {
                logging::error!(self.pm_log, "cannot create the poller"; "status" => %status);
                return false;
            }
        };

        let task_manager = Arc::new(TaskManager::new(logging::topic_logger(
            &self.log,
            self.mask,
            Topic::TaskMgrMsg,
        )));

        let transport = Arc::new(XRootDTransport::new(
            self.env.clone(),
            logging::topic_logger(&self.log, self.mask, Topic::XRootDTransportMsg),
        ));

        *self.poller.lock().unwrap() = Some(poller);
        *self.task_manager.lock().unwrap() = Some(task_manager);
        *self.transport.lock().unwrap() = Some(transport);

        self.initialized.store(true, Ordering::Release);
        logging::debug!(self.pm_log, "post master initialized");
        true
    }

    /// Start the poller and the task manager threads.
    pub fn start(&self) -> bool {
        if !self.initialized.load(Ordering::Acquire) || self.running.load(Ordering::Acquire) {
            return false;
        }

        let poller = match self.poller.lock().unwrap().clone() {
            Some(poller) => poller,
            None => return false,
        };
        let task_manager = match self.task_manager.lock().unwrap().clone() {
            Some(task_manager) => task_manager,
            None => return false,
        };

        if poller.start().has_failed() {
            return false;
        }

        if !task_manager.start() {
            poller.stop();
            return false;
        }

        self.running.store(true, Ordering::Release);
        logging::debug!(self.pm_log, "post master started");
        true
    }

    /// Stop the worker threads; channels stay registered.
    pub fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return false;
        }

        if let Some(task_manager) = self.task_manager.lock().unwrap().as_ref() {
            task_manager.stop();
        }
        if let Some(poller) = self.poller.lock().unwrap().as_ref() {
            poller.stop();
        }

        logging::debug!(self.pm_log, "post master stopped");
        true
    }

    /// Drop all channels, cancelling whatever is still in flight.
    pub fn finalize(&self) -> bool {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return false;
        }

        let channels: Vec<Arc<Channel>> = self.channels.lock().unwrap().drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.shutdown(Status::error(Code::Cancelled));
        }

        *self.transport.lock().unwrap() = None;
        *self.task_manager.lock().unwrap() = None;
        *self.poller.lock().unwrap() = None;

        logging::debug!(self.pm_log, "post master finalized");
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Install a monitoring plug-in; affects channels created afterwards.
    pub fn set_monitor(&self, monitor: Arc<dyn Monitor>) {
        *self.monitor.lock().unwrap() = Some(monitor);
    }

    /// Send a message to the given endpoint and block until it reaches the
    /// wire.
    pub fn send(&self, url: &URL, msg: Message, timeout: u16) -> Status {
        match self.channel(url) {
            Ok(channel) => channel.send(msg, timeout),
            Err(status) => status,
        }
    }

    /// Queue a message for the given endpoint; the handler gets exactly
    /// one terminal outcome.
    pub fn send_async(
        &self,
        url: &URL,
        msg: Message,
        handler: Arc<dyn MessageStatusHandler>,
        timeout: u16,
    ) -> Status {
        match self.channel(url) {
            Ok(channel) => channel.send_async(msg, handler, timeout),
            Err(status) => status,
        }
    }

    /// Block until a message matching the filter arrives from the given
    /// endpoint.
    pub fn receive(
        &self,
        url: &URL,
        filter: Arc<dyn MessageFilter>,
        timeout: u16,
    ) -> Result<Message, Status> {
        self.channel(url)?.receive(filter, timeout)
    }

    /// Subscribe a persistent handler to the endpoint's inbox.
    pub fn receive_async(
        &self,
        url: &URL,
        handler: Arc<dyn IncomingMsgHandler>,
        timeout: u16,
    ) -> Status {
        match self.channel(url) {
            Ok(channel) => channel.receive_async(handler, timeout),
            Err(status) => status,
        }
    }

    /// Pass a query to the transport of the endpoint's channel.
    pub fn query_transport(&self, url: &URL, kind: u16, result: &mut AnyObject) -> Status {
        match self.channel(url) {
            Ok(channel) => channel.query_transport(kind, result),
            Err(status) => status,
        }
    }

    /// Look up the channel for an endpoint, creating it on first use. At
    /// most one channel exists per canonical endpoint key.
    fn channel(&self, url: &URL) -> Result<Arc<Channel>, Status> {
        if !url.is_valid() {
            return Err(Status::error(Code::InvalidArgument));
        }

        if !self.running.load(Ordering::Acquire) {
            return Err(Status::error(Code::InvalidOperation));
        }

        let poller = match self.poller.lock().unwrap().clone() {
            Some(poller) => poller,
            None => return Err(Status::error(Code::InvalidOperation)),
        };
        let task_manager = match self.task_manager.lock().unwrap().clone() {
            Some(task_manager) => task_manager,
            None => return Err(Status::error(Code::InvalidOperation)),
        };
        let transport = match self.transport.lock().unwrap().clone() {
            Some(transport) => transport,
            None => return Err(Status::error(Code::InvalidOperation)),
        };
        let monitor = self.monitor.lock().unwrap().clone();

        let mut channels = self.channels.lock().unwrap();

        if let Some(channel) = channels.get(url.host_id()) {
            return Ok(channel.clone());
        }

        logging::debug!(self.pm_log, "creating channel"; "host" => url.host_id());

        let channel = Channel::new(
            url,
            poller,
            transport,
            task_manager,
            self.env.clone(),
            monitor,
            logging::topic_logger(&self.log, self.mask, Topic::PostMasterMsg),
        );
        channels.insert(url.host_id().to_string(), channel.clone());

        Ok(channel)
    }
}

impl Drop for PostMaster {
    fn drop(&mut self) {
        self.stop();
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol;
    use photon::logging::{o, Discard};

    fn test_post_master() -> PostMaster {
        PostMaster::with_logger(Arc::new(Env::new()), Logger::root(Discard, o!()))
    }

    #[test]
    fn test_lifecycle_ordering() {
        let post_master = test_post_master();

        // Nothing to start or stop before initialize.
        assert!(!post_master.start());
        assert!(!post_master.stop());
        assert!(!post_master.finalize());

        assert!(post_master.initialize());
        assert!(!post_master.initialize());

        assert!(post_master.start());
        assert!(!post_master.start());
        assert!(post_master.is_running());

        assert!(post_master.stop());
        assert!(!post_master.stop());
        assert!(post_master.finalize());
        assert!(!post_master.finalize());
    }

    #[test]
    fn test_send_requires_running_post_master() {
        let post_master = test_post_master();
        assert!(post_master.initialize());

        let url = URL::new("root://localhost:1094");
        let status = post_master.send(&url, protocol::build_ping_request([1, 1]), 1);

        assert_eq!(status.code, Code::InvalidOperation);
    }

    #[test]
    fn test_invalid_url_rejected() {
        let post_master = test_post_master();
        assert!(post_master.initialize());
        assert!(post_master.start());

        let url = URL::new("root://");
        let status = post_master.send(&url, protocol::build_ping_request([1, 1]), 1);
        assert_eq!(status.code, Code::InvalidArgument);

        let status = post_master.receive(&url, Arc::new(NeverFilter), 1).unwrap_err();
        assert_eq!(status.code, Code::InvalidArgument);

        assert!(post_master.stop());
        assert!(post_master.finalize());
    }

    struct NeverFilter;

    impl MessageFilter for NeverFilter {
        fn filter(&self, _msg: &Message) -> bool {
            false
        }
    }

    #[test]
    fn test_query_transport_name() {
        let post_master = test_post_master();
        assert!(post_master.initialize());
        assert!(post_master.start());

        // The channel comes to life lazily; querying it does not require
        // the connection to be up.
        let url = URL::new("root://localhost:1094");
        let mut result = AnyObject::new();
        let status = post_master.query_transport(&url, crate::transport::query::NAME, &mut result);

        assert!(status.is_ok());
        assert_eq!(result.get::<String>().unwrap(), "xrootd");

        assert!(post_master.stop());
        assert!(post_master.finalize());
    }
}

use crate::message::Message;
use photon::logging::{self, Logger};
use photon::status::{Code, Status};
use std::sync::{Arc, Mutex};

/// Actions a message handler can request, combinable by OR.
pub mod action {
    /// The handler took ownership of the message out of the slot.
    pub const TAKE: u8 = 0x01;
    /// The message stays with the queue and is offered to the next
    /// subscriber.
    pub const IGNORE: u8 = 0x02;
    /// Detach the handler after this callback.
    pub const REMOVE_HANDLER: u8 = 0x04;
}

/// Predicate deciding whether an incoming message belongs to a waiting
/// receiver.
pub trait MessageFilter: Send + Sync {
    fn filter(&self, msg: &Message) -> bool;
}

/// Subscriber to the incoming queue. The message rides in an `Option` slot;
/// a handler that reports `TAKE` must have moved it out of the slot.
pub trait IncomingMsgHandler: Send + Sync {
    fn handle_message(&self, msg: &mut Option<Message>) -> u8;

    /// Called instead of `handle_message` on a timeout or a stream fault.
    fn handle_fault(&self, status: Status);
}

struct FilterEntry {
    filter: Arc<dyn MessageFilter>,
    handler: Arc<dyn IncomingMsgHandler>,
    expires: u64,
}

struct HandlerEntry {
    handler: Arc<dyn IncomingMsgHandler>,
    expires: u64,
}

struct QueueData {
    filters: Vec<FilterEntry>,
    handlers: Vec<HandlerEntry>,
    // Messages nobody claimed yet. A receiver registering later than the
    // response arrived still gets it.
    parked: Vec<Message>,
}

/// The inbox where fully framed responses land. Filters are one-shot and
/// tried in registration order; persistent handlers then get to take,
/// ignore or detach. Unclaimed messages are parked until a matching
/// subscriber shows up or the queue is torn down.
pub struct IncomingQueue {
    data: Mutex<QueueData>,
    log: Logger,
}

impl IncomingQueue {
    pub fn new(log: Logger) -> IncomingQueue {
        IncomingQueue {
            data: Mutex::new(QueueData {
                filters: Vec::new(),
                handlers: Vec::new(),
                parked: Vec::new(),
            }),
            log,
        }
    }

    /// Register a one-shot filter. The first arriving message matching the
    /// predicate is moved into the handler and the filter is removed. A
    /// parked message matching the predicate is delivered right away.
    pub fn add_filter(
        &self,
        filter: Arc<dyn MessageFilter>,
        handler: Arc<dyn IncomingMsgHandler>,
        expires: u64,
    ) {
        let parked = {
            let mut data = self.data.lock().unwrap();

            match data.parked.iter().position(|msg| filter.filter(msg)) {
                Some(index) => Some(data.parked.remove(index)),
                None => {
                    data.filters.push(FilterEntry {
                        filter,
                        handler: handler.clone(),
                        expires,
                    });
                    None
                }
            }
        };

        if let Some(msg) = parked {
            let mut slot = Some(msg);
            let verdict = handler.handle_message(&mut slot);
            if slot.is_some() {
                logging::warn!(self.log, "filter handler left the message behind";
                               "action" => verdict);
            }
        }
    }

    /// Register a persistent handler with a deadline. Parked messages are
    /// offered to it immediately.
    pub fn add_message_handler(&self, handler: Arc<dyn IncomingMsgHandler>, expires: u64) {
        let parked: Vec<Message> = {
            let mut data = self.data.lock().unwrap();
            data.handlers.push(HandlerEntry {
                handler: handler.clone(),
                expires,
            });
            data.parked.drain(..).collect()
        };

        for msg in parked {
            // Re-run the full delivery so filter FIFO precedence holds.
            self.put(msg);
        }
    }

    /// Detach a previously registered handler.
    pub fn remove_message_handler(&self, handler: &Arc<dyn IncomingMsgHandler>) {
        let mut data = self.data.lock().unwrap();
        data.handlers
            .retain(|entry| !Arc::ptr_eq(&entry.handler, handler));
    }

    /// Offer an arrived message to the subscribers. Filters win in FIFO
    /// order; a matching filter is removed before its handler runs.
    pub fn put(&self, msg: Message) {
        let mut slot = Some(msg);

        // The matching filter leaves the list before its one-shot handler
        // is woken; callbacks run with the queue unlocked.
        let matched = {
            let mut data = self.data.lock().unwrap();
            let msg = slot.as_ref().unwrap();

            match data.filters.iter().position(|entry| entry.filter.filter(msg)) {
                Some(index) => Some(data.filters.remove(index)),
                None => None,
            }
        };

        if let Some(entry) = matched {
            let verdict = entry.handler.handle_message(&mut slot);
            if slot.is_none() {
                return;
            }
            logging::warn!(self.log, "filter handler left the message behind";
                           "action" => verdict);
        }

        // No filter claimed it; offer it to the persistent handlers.
        let handlers: Vec<Arc<dyn IncomingMsgHandler>> = {
            let data = self.data.lock().unwrap();
            data.handlers.iter().map(|entry| entry.handler.clone()).collect()
        };

        for handler in handlers {
            let verdict = handler.handle_message(&mut slot);

            if verdict & action::REMOVE_HANDLER != 0 {
                self.remove_message_handler(&handler);
            }

            if slot.is_none() {
                if verdict & action::TAKE == 0 {
                    logging::warn!(self.log, "handler took a message without reporting it");
                }
                return;
            }
        }

        if let Some(msg) = slot {
            logging::debug!(self.log, "no receiver claimed the message, parking it";
                            "size" => msg.len());
            self.data.lock().unwrap().parked.push(msg);
        }
    }

    /// Fault every subscriber whose deadline has passed with a socket
    /// timeout.
    pub fn report_timeouts(&self, now: u64) {
        let mut expired: Vec<Arc<dyn IncomingMsgHandler>> = Vec::new();

        {
            let mut data = self.data.lock().unwrap();

            let mut index = 0;
            while index < data.filters.len() {
                if data.filters[index].expires <= now {
                    expired.push(data.filters.remove(index).handler);
                } else {
                    index += 1;
                }
            }

            index = 0;
            while index < data.handlers.len() {
                if data.handlers[index].expires <= now {
                    expired.push(data.handlers.remove(index).handler);
                } else {
                    index += 1;
                }
            }
        }

        for handler in expired {
            handler.handle_fault(Status::error(Code::SocketTimeout));
        }
    }

    /// Fault every subscriber, e.g. when the owning stream dies or the
    /// post-master shuts down.
    pub fn fail_all(&self, status: Status) {
        let victims: Vec<Arc<dyn IncomingMsgHandler>> = {
            let mut data = self.data.lock().unwrap();
            data.parked.clear();
            let mut victims: Vec<Arc<dyn IncomingMsgHandler>> =
                data.filters.drain(..).map(|entry| entry.handler).collect();
            victims.extend(data.handlers.drain(..).map(|entry| entry.handler));
            victims
        };

        for handler in victims {
            handler.handle_fault(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol;
    use photon::logging::{o, Discard};

    fn test_queue() -> IncomingQueue {
        IncomingQueue::new(Logger::root(Discard, o!()))
    }

    fn ping_reply(stream_id: [u8; 2]) -> Message {
        let mut msg = Message::with_capacity(protocol::RESPONSE_HEADER_LEN);
        msg.data_mut()[0] = stream_id[0];
        msg.data_mut()[1] = stream_id[1];
        msg
    }

    struct SidFilter {
        stream_id: [u8; 2],
    }

    impl MessageFilter for SidFilter {
        fn filter(&self, msg: &Message) -> bool {
            protocol::response_stream_id(msg) == self.stream_id
        }
    }

    struct EvenFilter;

    impl MessageFilter for EvenFilter {
        fn filter(&self, msg: &Message) -> bool {
            protocol::response_stream_id(msg)[1] % 2 == 0
        }
    }

    struct AnyFilter;

    impl MessageFilter for AnyFilter {
        fn filter(&self, _msg: &Message) -> bool {
            true
        }
    }

    struct Sink {
        received: Mutex<Vec<Message>>,
        faults: Mutex<Vec<Status>>,
    }

    impl Sink {
        fn new() -> Arc<Sink> {
            Arc::new(Sink {
                received: Mutex::new(Vec::new()),
                faults: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.received.lock().unwrap().len()
        }
    }

    impl IncomingMsgHandler for Sink {
        fn handle_message(&self, msg: &mut Option<Message>) -> u8 {
            self.received.lock().unwrap().push(msg.take().unwrap());
            action::TAKE
        }

        fn handle_fault(&self, status: Status) {
            self.faults.lock().unwrap().push(status);
        }
    }

    struct IgnoringHandler;

    impl IncomingMsgHandler for IgnoringHandler {
        fn handle_message(&self, _msg: &mut Option<Message>) -> u8 {
            action::IGNORE
        }

        fn handle_fault(&self, _status: Status) {}
    }

    #[test]
    fn test_first_matching_filter_wins_and_is_removed() {
        let queue = test_queue();

        let sink1 = Sink::new();
        let sink2 = Sink::new();
        let sink3 = Sink::new();

        queue.add_filter(Arc::new(SidFilter { stream_id: [9, 9] }), sink1.clone(), u64::max_value());
        queue.add_filter(Arc::new(SidFilter { stream_id: [1, 2] }), sink2.clone(), u64::max_value());
        queue.add_filter(Arc::new(AnyFilter), sink3.clone(), u64::max_value());

        queue.put(ping_reply([1, 2]));

        assert_eq!(sink1.count(), 0);
        assert_eq!(sink2.count(), 1);
        assert_eq!(sink3.count(), 0);

        // The matched filter is one-shot; the surrounding ones survive and
        // keep their order.
        queue.put(ping_reply([1, 2]));

        assert_eq!(sink2.count(), 1);
        assert_eq!(sink3.count(), 1);
    }

    #[test]
    fn test_filter_fifo_order() {
        let queue = test_queue();

        let even_sink = Sink::new();
        let any_sink = Sink::new();

        queue.add_filter(Arc::new(EvenFilter), even_sink.clone(), u64::max_value());
        queue.add_filter(Arc::new(AnyFilter), any_sink.clone(), u64::max_value());

        // Even stream ids land in the first filter, the first odd one in
        // the catch-all.
        queue.put(ping_reply([0, 4]));
        queue.put(ping_reply([0, 7]));

        assert_eq!(even_sink.count(), 1);
        assert_eq!(any_sink.count(), 1);
        assert_eq!(
            protocol::response_stream_id(&even_sink.received.lock().unwrap()[0]),
            [0, 4]
        );
        assert_eq!(
            protocol::response_stream_id(&any_sink.received.lock().unwrap()[0]),
            [0, 7]
        );

        // Both filters are one-shot and gone now; rearming the even filter
        // picks up the next even reply.
        queue.add_filter(Arc::new(EvenFilter), even_sink.clone(), u64::max_value());
        queue.put(ping_reply([0, 6]));

        assert_eq!(even_sink.count(), 2);
        assert_eq!(any_sink.count(), 1);
    }

    #[test]
    fn test_handler_take_and_remove() {
        let queue = test_queue();
        let sink = Sink::new();

        let handler: Arc<dyn IncomingMsgHandler> = sink.clone();
        queue.add_message_handler(handler, u64::max_value());

        queue.put(ping_reply([3, 3]));
        assert_eq!(sink.count(), 1);

        // Still registered, takes the next one too.
        queue.put(ping_reply([3, 4]));
        assert_eq!(sink.count(), 2);
    }

    #[test]
    fn test_ignored_message_is_parked() {
        let queue = test_queue();

        queue.add_message_handler(Arc::new(IgnoringHandler), u64::max_value());

        // Nobody takes it now; a later receiver still gets it.
        queue.put(ping_reply([5, 5]));

        let sink = Sink::new();
        queue.add_filter(Arc::new(SidFilter { stream_id: [5, 5] }), sink.clone(), u64::max_value());

        assert_eq!(sink.count(), 1);
    }

    #[test]
    fn test_parked_message_delivered_to_late_receiver() {
        let queue = test_queue();

        // The response arrives before anyone is listening.
        queue.put(ping_reply([1, 2]));

        let other = Sink::new();
        queue.add_filter(Arc::new(SidFilter { stream_id: [9, 9] }), other.clone(), u64::max_value());
        assert_eq!(other.count(), 0);

        let sink = Sink::new();
        queue.add_filter(Arc::new(SidFilter { stream_id: [1, 2] }), sink.clone(), u64::max_value());
        assert_eq!(sink.count(), 1);

        // The non-matching filter stays armed.
        queue.put(ping_reply([9, 9]));
        assert_eq!(other.count(), 1);
    }

    #[test]
    fn test_remove_message_handler() {
        let queue = test_queue();
        let sink = Sink::new();

        let handler: Arc<dyn IncomingMsgHandler> = sink.clone();
        queue.add_message_handler(handler.clone(), u64::max_value());
        queue.remove_message_handler(&handler);

        queue.put(ping_reply([1, 1]));
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_report_timeouts() {
        let queue = test_queue();
        let fresh = Sink::new();
        let stale = Sink::new();

        queue.add_message_handler(fresh.clone(), 2000);
        queue.add_message_handler(stale.clone(), 1000);

        queue.report_timeouts(1500);

        assert!(fresh.faults.lock().unwrap().is_empty());

        let faults = stale.faults.lock().unwrap();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].code, Code::SocketTimeout);
        drop(faults);

        // The expired handler is gone, the fresh one still receives.
        queue.put(ping_reply([1, 1]));
        assert_eq!(fresh.count(), 1);
        assert_eq!(stale.count(), 0);
    }

    #[test]
    fn test_fail_all() {
        let queue = test_queue();
        let sink1 = Sink::new();
        let sink2 = Sink::new();

        queue.add_filter(Arc::new(AnyFilter), sink1.clone(), u64::max_value());
        queue.add_message_handler(sink2.clone(), u64::max_value());

        queue.fail_all(Status::error(Code::StreamDisconnect));

        assert_eq!(sink1.faults.lock().unwrap()[0].code, Code::StreamDisconnect);
        assert_eq!(sink2.faults.lock().unwrap()[0].code, Code::StreamDisconnect);

        // Everything was drained.
        queue.put(ping_reply([1, 1]));
        assert_eq!(sink1.count(), 0);
        assert_eq!(sink2.count(), 0);
    }
}

mod common;

use photon::env::Env;
use photon::logging::{o, Discard, Logger};
use std::sync::Arc;
use std::thread;
use xenon::inqueue::MessageFilter;
use xenon::message::Message;
use xenon::protocol;
use xenon::url::URL;
use xenon::PostMaster;

struct XrdFilter {
    stream_id: [u8; 2],
}

impl MessageFilter for XrdFilter {
    fn filter(&self, msg: &Message) -> bool {
        protocol::response_stream_id(msg) == self.stream_id
    }
}

const THREADS: u8 = 100;
const PINGS_PER_THREAD: u8 = 100;

#[test]
fn threading() {
    let port = common::start_server();

    let env = Arc::new(Env::new());
    env.put_int("TimeoutResolution", 1);

    let post_master = Arc::new(PostMaster::with_logger(env, Logger::root(Discard, o!())));
    assert!(post_master.initialize());
    assert!(post_master.start());

    let url = Arc::new(URL::new(&format!("root://127.0.0.1:{}", port)));

    let mut workers = Vec::new();
    for index in 0..THREADS {
        let post_master = post_master.clone();
        let url = url.clone();

        workers.push(thread::spawn(move || {
            // Fire all the pings of this thread, then collect the answers
            // through filters pinned to this thread's id byte.
            for ping in 0..PINGS_PER_THREAD {
                let msg = protocol::build_ping_request([index, ping]);
                let status = post_master.send(&url, msg, 1200);
                assert!(status.is_ok(), "send {}/{} failed: {}", index, ping, status);
            }

            for ping in 0..PINGS_PER_THREAD {
                let filter = Arc::new(XrdFilter {
                    stream_id: [index, ping],
                });
                let response = post_master
                    .receive(&url, filter, 1200)
                    .unwrap_or_else(|status| panic!("receive {}/{} failed: {}", index, ping, status));

                assert_eq!(protocol::response_status(&response), protocol::respstat::OK);
                assert_eq!(response.len(), 8);
                assert_eq!(protocol::response_stream_id(&response), [index, ping]);
            }
        }));
    }

    for worker in workers {
        worker.join().unwrap();
    }

    assert!(post_master.stop());
    assert!(post_master.finalize());
}

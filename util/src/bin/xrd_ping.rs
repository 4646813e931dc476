use clap::{App, Arg};
use photon::env::default_env;
use photon::logging;
use std::sync::Arc;
use xenon::inqueue::MessageFilter;
use xenon::message::Message;
use xenon::protocol;
use xenon::url::URL;
use xenon::PostMaster;

struct PingFilter {
    stream_id: [u8; 2],
}

impl MessageFilter for PingFilter {
    fn filter(&self, msg: &Message) -> bool {
        protocol::response_stream_id(msg) == self.stream_id
    }
}

fn main() {
    let matches = App::new("xrd_ping")
        .version("0.1")
        .about("Pings an XRootD server through the post master.")
        .arg(
            Arg::with_name("URL")
                .help("Destination, e.g. root://localhost:1094")
                .required(true),
        )
        .arg(
            Arg::with_name("COUNT")
                .help("Number of pings to send")
                .default_value("1"),
        )
        .get_matches();

    let log = logging::init();

    let url = URL::new(matches.value_of("URL").unwrap());
    if !url.is_valid() {
        logging::error!(log, "invalid url"; "url" => matches.value_of("URL").unwrap());
        std::process::exit(1);
    }

    let count: u8 = match matches.value_of("COUNT").unwrap().parse() {
        Ok(count) => count,
        Err(_) => {
            logging::error!(log, "the ping count must be a small number");
            std::process::exit(1);
        }
    };

    let post_master = PostMaster::with_logger(default_env(), log.clone());
    if !post_master.initialize() || !post_master.start() {
        logging::error!(log, "cannot start the post master");
        std::process::exit(1);
    }

    let mut failures = 0;
    for ping in 0..count {
        let stream_id = [1, ping];
        let msg = protocol::build_ping_request(stream_id);

        let status = post_master.send(&url, msg, 30);
        if status.has_failed() {
            logging::error!(log, "ping failed"; "seq" => ping, "status" => %status);
            failures += 1;
            continue;
        }

        match post_master.receive(&url, Arc::new(PingFilter { stream_id }), 30) {
            Ok(response) => {
                logging::info!(log, "ping answered";
                               "seq" => ping,
                               "status" => protocol::response_status(&response));
            }
            Err(status) => {
                logging::error!(log, "no answer"; "seq" => ping, "status" => %status);
                failures += 1;
            }
        }
    }

    post_master.stop();
    post_master.finalize();

    if failures > 0 {
        std::process::exit(1);
    }
}

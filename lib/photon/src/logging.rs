pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};
use std::env;

/// Severities understood by the terminal logger. `dump` is accepted as an
/// alias for `trace`.
const SEVERITIES: [&str; 6] = ["critical", "error", "warning", "info", "debug", "trace"];

/// Build the root logger. The severity is taken from `XRD_LOGLEVEL`
/// (default `info`); an unparseable configuration falls back to a discard
/// logger rather than failing the process.
pub fn init() -> Logger {
    let mut level = env::var("XRD_LOGLEVEL")
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase();

    if level == "dump" {
        level = "trace".to_string();
    }

    if !SEVERITIES.contains(&level.as_str()) {
        level = "info".to_string();
    }

    let config_str = format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    );

    let config: LoggerConfig = match serdeconv::from_toml_str(&config_str) {
        Ok(config) => config,
        Err(_) => return Logger::root(Discard, o!()),
    };

    match config.build_logger() {
        Ok(logger) => logger,
        Err(_) => Logger::root(Discard, o!()),
    }
}

/// Named logging topics. Each component of the client logs under exactly
/// one topic so whole subsystems can be silenced at once.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Topic {
    AppMsg,
    UtilityMsg,
    PostMasterMsg,
    PollerMsg,
    XRootDTransportMsg,
    XRootDMsg,
    TaskMgrMsg,
    FileMsg,
    QueryMsg,
}

impl Topic {
    const ALL: [Topic; 9] = [
        Topic::AppMsg,
        Topic::UtilityMsg,
        Topic::PostMasterMsg,
        Topic::PollerMsg,
        Topic::XRootDTransportMsg,
        Topic::XRootDMsg,
        Topic::TaskMgrMsg,
        Topic::FileMsg,
        Topic::QueryMsg,
    ];

    #[inline]
    fn bit(self) -> u16 {
        match self {
            Topic::AppMsg => 1 << 0,
            Topic::UtilityMsg => 1 << 1,
            Topic::PostMasterMsg => 1 << 2,
            Topic::PollerMsg => 1 << 3,
            Topic::XRootDTransportMsg => 1 << 4,
            Topic::XRootDMsg => 1 << 5,
            Topic::TaskMgrMsg => 1 << 6,
            Topic::FileMsg => 1 << 7,
            Topic::QueryMsg => 1 << 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Topic::AppMsg => "AppMsg",
            Topic::UtilityMsg => "UtilityMsg",
            Topic::PostMasterMsg => "PostMasterMsg",
            Topic::PollerMsg => "PollerMsg",
            Topic::XRootDTransportMsg => "XRootDTransportMsg",
            Topic::XRootDMsg => "XRootDMsg",
            Topic::TaskMgrMsg => "TaskMgrMsg",
            Topic::FileMsg => "FileMsg",
            Topic::QueryMsg => "QueryMsg",
        }
    }

    fn from_name(name: &str) -> Option<Topic> {
        Topic::ALL.iter().cloned().find(|t| t.name() == name)
    }
}

/// A set of enabled topics.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TopicMask(u16);

impl TopicMask {
    pub const ALL: TopicMask = TopicMask(0x01ff);
    pub const NONE: TopicMask = TopicMask(0);

    /// Parse a topic expression: `|`-separated topic names, a leading `^`
    /// meaning "everything but the listed topics", or the sentinels `All`
    /// and `None`. Unknown names are skipped.
    pub fn parse(expr: &str) -> TopicMask {
        let expr = expr.trim();

        match expr {
            "" | "All" => return TopicMask::ALL,
            "None" => return TopicMask::NONE,
            _ => (),
        }

        let (invert, list) = match expr.strip_prefix('^') {
            Some(rest) => (true, rest),
            None => (false, expr),
        };

        let mut mask = 0u16;
        for name in list.split('|') {
            if let Some(topic) = Topic::from_name(name.trim()) {
                mask |= topic.bit();
            }
        }

        if invert {
            TopicMask(TopicMask::ALL.0 & !mask)
        } else {
            TopicMask(mask)
        }
    }

    /// The mask configured through `XRD_LOGTOPICS`, default `All`.
    pub fn from_process_env() -> TopicMask {
        match env::var("XRD_LOGTOPICS") {
            Ok(expr) => TopicMask::parse(&expr),
            Err(_) => TopicMask::ALL,
        }
    }

    #[inline]
    pub fn enabled(self, topic: Topic) -> bool {
        self.0 & topic.bit() != 0
    }
}

/// Derive a component logger for the given topic. Masked-out topics get a
/// discard logger so the call sites stay unconditional.
pub fn topic_logger(root: &Logger, mask: TopicMask, topic: Topic) -> Logger {
    if mask.enabled(topic) {
        root.new(o!("topic" => topic.name()))
    } else {
        Logger::root(Discard, o!())
    }
}

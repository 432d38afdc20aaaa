use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const COMPONENT_WIDTH: usize = 20;
const LOG_LEVEL_WIDTH: usize = 9;

/// Crates whose level follows `--log-level`
const CRATES: [&str; 3] = ["zkstream", "zk_session", "zk_wire"];

/// Line formatter: `[timestamp] [component] [level] message`
pub struct ZkLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl ZkLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: std::io::stderr().is_terminal()
                && std::env::var("TERM").map_or(true, |term| term != "dumb"),
        }
    }

    /// `zk_session::pool` becomes `zkstream-pool`; anything outside our crates
    /// is logged under the service name
    fn component(&self, target: &str) -> String {
        let name = match target.split_once("::") {
            Some((krate, module)) if CRATES.contains(&krate) => {
                let module = module.split("::").next().unwrap_or(module);
                format!("{}-{}", self.service_name, module)
            }
            _ => self.service_name.clone(),
        };

        if name.chars().count() > COMPONENT_WIDTH {
            let cut: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", cut)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn level(&self, level: &tracing::Level) -> (String, &'static str) {
        let (label, color) = match *level {
            tracing::Level::ERROR => ("✗ ERROR", COLOR_BRIGHT_RED),
            tracing::Level::WARN => ("⚠ WARN", COLOR_BRIGHT_YELLOW),
            tracing::Level::INFO => ("ℹ INFO", COLOR_GREEN),
            tracing::Level::DEBUG => ("◦ DEBUG", COLOR_BRIGHT_GRAY),
            tracing::Level::TRACE => ("◦ TRACE", COLOR_BRIGHT_GRAY),
        };
        let color = if self.color_enabled { color } else { "" };
        (format!("{:<width$}", label, width = LOG_LEVEL_WIDTH), color)
    }
}

impl<S, N> FormatEvent<S, N> for ZkLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let metadata = event.metadata();

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let (level, color) = self.level(metadata.level());
        let (cyan, reset) = if self.color_enabled {
            (COLOR_CYAN, COLOR_RESET)
        } else {
            ("", "")
        };

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] ",
            cyan,
            timestamp,
            self.component(metadata.target()),
            color,
            level,
            reset
        )?;
        writeln!(writer, "{}{}{}", visitor.message, visitor.fields, reset)
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push_str(&format!(" {}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

/// Filter that applies `level` to our crates and `warn` to everything else
pub fn env_filter(level: &str) -> anyhow::Result<EnvFilter> {
    let mut filter = EnvFilter::new("warn");
    for krate in CRATES {
        filter = filter.add_directive(format!("{}={}", krate, level).parse()?);
    }
    Ok(filter)
}

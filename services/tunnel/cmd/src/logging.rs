use anyhow::Result;
use std::fmt;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// ANSI color codes for console output
const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

/// Column widths for aligned output
const SERVICE_NAME_WIDTH: usize = 20;
const LOG_LEVEL_WIDTH: usize = 7;

/// Crates whose events pass the filter at the requested level
const LOGGED_CRATES: [&str; 4] = ["redb_tunnel", "tunnel_session", "tunnel_connector", "tunnel_wire"];

/// Column formatter: `[timestamp] [service] [level] message`
pub struct TunnelLogFormatter {
    service_name: String,
    color_enabled: bool,
}

/// Macro to create component-specific logging functions
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

impl TunnelLogFormatter {
    pub fn new(service_name: impl Into<String>, color_enabled: bool) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled,
        }
    }

    /// Service column, `tunnel-<component>` when the event names a component
    fn format_service_name(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(comp) => format!("{}-{}", self.service_name, comp),
            None => self.service_name.clone(),
        };

        if name.chars().count() > SERVICE_NAME_WIDTH {
            let truncated: String = name.chars().take(SERVICE_NAME_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = SERVICE_NAME_WIDTH)
        }
    }

    fn format_log_level(&self, level: &tracing::Level) -> String {
        let level_str = match *level {
            tracing::Level::ERROR => "✗ ERROR",
            tracing::Level::WARN => "⚠ WARN",
            tracing::Level::INFO => "ℹ INFO",
            tracing::Level::DEBUG => "◦ DEBUG",
            tracing::Level::TRACE => "◦ TRACE",
        };

        format!("{:<width$}", level_str, width = LOG_LEVEL_WIDTH + 2)
    }

    fn color_for_level(&self, level: &tracing::Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }

        match *level {
            tracing::Level::ERROR => COLOR_BRIGHT_RED,
            tracing::Level::WARN => COLOR_BRIGHT_YELLOW,
            tracing::Level::INFO => COLOR_GREEN,
            tracing::Level::DEBUG | tracing::Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }

    fn format_line(&self, level: &tracing::Level, visitor: &FieldVisitor) -> String {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let color = self.color_for_level(level);
        let (cyan, reset) = if self.color_enabled {
            (COLOR_CYAN, COLOR_RESET)
        } else {
            ("", "")
        };

        format!(
            "{}[{}] [{}] [{}{}{}] {}{}",
            cyan,
            timestamp,
            self.format_service_name(visitor.component.as_deref()),
            color,
            self.format_log_level(level),
            reset,
            visitor.message,
            reset
        )
    }
}

impl<S, N> FormatEvent<S, N> for TunnelLogFormatter
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
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        writeln!(writer, "{}", self.format_line(event.metadata().level(), &visitor))
    }
}

/// Extracts `message` and `component` from an event
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
}

fn strip_quotes(value: String) -> String {
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => inner.to_string(),
        None => value,
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = strip_quotes(format!("{:?}", value)),
            "component" => self.component = Some(strip_quotes(format!("{:?}", value))),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            _ => {}
        }
    }
}

/// Filter: `info` for everything, `level` for the tunnel crates
pub fn build_filter(level: &str) -> Result<EnvFilter> {
    let mut filter = EnvFilter::new("info");
    for krate in LOGGED_CRATES {
        filter = filter.add_directive(format!("{}={}", krate, level).parse()?);
    }
    Ok(filter)
}

/// Install the global subscriber. Events are appended to `log_file` when it
/// can be opened, otherwise written to stdout.
pub fn init(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = build_filter(level)?;

    let file = log_file.and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("cannot open log file {}: {}; logging to stdout", path.display(), e);
                None
            }
        }
    });

    let (writer, color_enabled) = match file {
        Some(file) => (BoxMakeWriter::new(Mutex::new(file)), false),
        None => (BoxMakeWriter::new(std::io::stdout), is_terminal()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(color_enabled)
        .event_format(TunnelLogFormatter::new("tunnel", color_enabled))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logger: {}", e))
}

/// Whether stdout is a terminal that understands colors
fn is_terminal() -> bool {
    match std::env::var("TERM") {
        Ok(term) => term != "dumb",
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_column_width() {
        let formatter = TunnelLogFormatter::new("tunnel", false);
        assert_eq!(formatter.format_service_name(None).len(), SERVICE_NAME_WIDTH);
        assert!(formatter.format_service_name(Some("session")).starts_with("tunnel-session "));

        let long = formatter.format_service_name(Some("a-very-long-component-name"));
        assert_eq!(long.chars().count(), SERVICE_NAME_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_line_without_colors() {
        let formatter = TunnelLogFormatter::new("tunnel", false);
        let visitor = FieldVisitor {
            message: "server listening".to_string(),
            component: Some("server".to_string()),
        };
        let line = formatter.format_line(&tracing::Level::WARN, &visitor);
        assert!(!line.contains('\x1b'));
        assert!(line.contains("[tunnel-server"));
        assert!(line.contains("⚠ WARN"));
        assert!(line.ends_with("server listening"));
    }

    #[test]
    fn test_filter_accepts_levels() {
        assert!(build_filter("debug").is_ok());
        assert!(build_filter("not a level").is_err());
    }
}

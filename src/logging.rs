//! Tracing subscriber setup.

use tracing_subscriber::fmt::format;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const MAX_MESSAGE_CHARS: usize = 280;

/// Fields that may carry user text and are never written to the log.
const REDACTED_FIELDS: &[&str] = &["content", "text"];

/// Install the global subscriber: compact terminal output, `RUST_LOG` when
/// set, otherwise `info` (or `debug` with `--debug`).
pub fn init_tracing(debug: bool) {
    let field_formatter = format::debug_fn(|writer, field, value| {
        let field_name = field.name();

        if REDACTED_FIELDS.contains(&field_name) {
            Ok(())
        } else if field_name == "message" {
            let formatted = format!("{value:?}");
            let (truncated, was_truncated) = truncate_for_log(&formatted, MAX_MESSAGE_CHARS);
            write!(writer, "{truncated}")?;
            if was_truncated {
                write!(writer, "...")?;
            }
            Ok(())
        } else {
            write!(writer, "{field_name}={value:?}")
        }
    });

    let fmt_layer = tracing_subscriber::fmt::layer()
        .fmt_fields(field_formatter)
        .compact();

    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(fmt_layer)
        .init();
}

fn build_env_filter(debug: bool) -> tracing_subscriber::EnvFilter {
    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        return filter;
    }
    if debug {
        tracing_subscriber::EnvFilter::new("relaybot=debug,info")
    } else {
        tracing_subscriber::EnvFilter::new("info")
    }
}

fn truncate_for_log(message: &str, max_chars: usize) -> (&str, bool) {
    match message.char_indices().nth(max_chars) {
        Some((byte_index, _character)) => (&message[..byte_index], true),
        None => (message, false),
    }
}

/// Shorten `text` for a log line, marking the cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    match truncate_for_log(text, max_chars) {
        (truncated, true) => format!("{truncated}..."),
        (whole, false) => whole.to_string(),
    }
}

//! Tracing setup shared by the server binary and embedding applications.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Log level for jailproxy targets when RUST_LOG is unset.
pub const ENV_LOG_LEVEL: &str = "JAILPROXY_LOG";

fn filter_directives(level: Option<&str>) -> String {
    let base_level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!(
        "jailproxy={level},jailproxy_server={level}",
        level = base_level
    )
}

fn env_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    let level = std::env::var(ENV_LOG_LEVEL).ok();
    EnvFilter::new(filter_directives(level.as_deref()))
}

fn is_json_format(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.eq_ignore_ascii_case("json"))
}

/// Initialize tracing with RUST_LOG / JAILPROXY_LOG and LOG_FORMAT support.
///
/// Always writes to stderr: in the server, stdout carries protocol frames.
/// A subscriber installed earlier by the embedding application wins.
pub fn init_tracing() {
    let json = is_json_format(std::env::var("LOG_FORMAT").ok().as_deref());
    let json_layer = json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!json).then(|| fmt::layer().with_writer(std::io::stderr));

    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(json_layer)
        .with(text_layer)
        .try_init();
}

//! Tracing subscriber setup for hosts embedding the bridge.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const CRATES: [&str; 7] = [
    "xmppchat_core",
    "xmppchat_xmpp",
    "xmppchat_directory",
    "xmppchat_presence",
    "xmppchat_roster",
    "xmppchat_messaging",
    "xmppchat_bridge",
];

/// Our crates log at `level`; dependencies stay at `warn`.
fn default_filter(level: &str) -> EnvFilter {
    let directives = CRATES
        .iter()
        .map(|name| format!("{name}={level}"))
        .fold("warn".to_string(), |acc, directive| acc + "," + &directive);
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("warn,xmppchat_bridge=info"))
}

/// Build the log filter from `RUST_LOG`, falling back to the configured level.
pub fn build_log_filter(level: &str) -> EnvFilter {
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| default_filter(level));
    }
    default_filter(level)
}

/// Install a global fmt subscriber. Returns `false` if one was already set.
pub fn init(level: &str) -> bool {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    tracing_subscriber::registry()
        .with(build_log_filter(level))
        .with(fmt_layer)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_scopes_level_to_own_crates() {
        let filter = default_filter("debug").to_string();
        for name in CRATES {
            assert!(filter.contains(&format!("{name}=debug")), "{filter}");
        }
        assert!(!filter.split(',').any(|directive| directive == "debug"));
        assert!(filter.split(',').any(|directive| directive == "warn"));
    }

    #[test]
    fn second_init_is_rejected() {
        init("info");
        assert!(!init("info"));
    }
}

//! Tracing subscriber setup with a level that can be replaced at runtime.

use std::sync::Mutex;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use parley_api::{normalize_directive, LevelControl};
use parley_core::LogLevel;

/// Handle onto the installed filter, served by `/logging/level`.
pub struct ReloadableLevel {
    handle: reload::Handle<EnvFilter, Registry>,
    current: Mutex<String>,
}

/// Build a reloadable filter layer starting at `directive`.
///
/// An unparsable directive falls back to `info`.
pub fn reloadable_filter(directive: &str) -> (reload::Layer<EnvFilter, Registry>, ReloadableLevel) {
    let (filter, applied) = match EnvFilter::try_new(filter_directive(directive)) {
        Ok(filter) => (filter, directive),
        Err(_) => (EnvFilter::new("info"), "info"),
    };
    let (layer, handle) = reload::Layer::new(filter);

    let level = ReloadableLevel {
        handle,
        current: Mutex::new(normalize_directive(applied)),
    };
    (layer, level)
}

/// Install the global subscriber, starting at `directive`.
pub fn init(directive: &str) -> ReloadableLevel {
    let (filter, level) = reloadable_filter(directive);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    level
}

// EnvFilter wants lowercase level names.
fn filter_directive(directive: &str) -> String {
    match directive.parse::<LogLevel>() {
        Ok(level) => level.as_str().to_ascii_lowercase(),
        Err(_) => directive.to_string(),
    }
}

impl ReloadableLevel {
    /// Swap in a new filter directive.
    pub fn set_directive(&self, directive: &str) -> Result<(), String> {
        let filter = EnvFilter::try_new(filter_directive(directive))
            .map_err(|e| format!("invalid filter '{}': {}", directive, e))?;
        self.handle
            .reload(filter)
            .map_err(|e| format!("failed to reload filter: {}", e))?;
        let mut current = self
            .current
            .lock()
            .map_err(|e| format!("level lock poisoned: {}", e))?;
        *current = normalize_directive(directive);
        Ok(())
    }
}

impl LevelControl for ReloadableLevel {
    fn current(&self) -> String {
        self.current
            .lock()
            .map(|l| l.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn set(&self, level: LogLevel) -> Result<(), String> {
        self.set_directive(level.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_api::MemoryLevelControl;

    #[test]
    fn test_reports_level_like_memory_control() {
        let (filter, level) = reloadable_filter("info");
        let _subscriber = tracing_subscriber::registry().with(filter);
        let memory = MemoryLevelControl::new("info");
        assert_eq!(level.current(), "INFO");
        assert_eq!(level.current(), memory.current());

        level.set(LogLevel::Debug).unwrap();
        memory.set(LogLevel::Debug).unwrap();
        assert_eq!(level.current(), "DEBUG");
        assert_eq!(level.current(), memory.current());
    }

    #[test]
    fn test_uppercase_config_level_is_accepted() {
        let (filter, level) = reloadable_filter("info");
        let _subscriber = tracing_subscriber::registry().with(filter);

        level.set_directive("WARN").unwrap();
        assert_eq!(level.current(), "WARN");
    }

    #[test]
    fn test_filter_directive_kept_verbatim() {
        let (filter, level) = reloadable_filter("info");
        let _subscriber = tracing_subscriber::registry().with(filter);

        level.set_directive("parley=debug,tower=warn").unwrap();
        assert_eq!(level.current(), "parley=debug,tower=warn");
    }

    #[test]
    fn test_bad_initial_directive_falls_back_to_info() {
        let (_filter, level) = reloadable_filter("parley=loudest");
        assert_eq!(level.current(), "INFO");
    }
}

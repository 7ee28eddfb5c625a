//! Id-prefixed logging facade.

/// Logger handed to a plugin. Every line carries the `"[<id>] "` prefix and
/// a `plugin_id` field.
#[derive(Debug, Clone)]
pub struct PluginLogger {
    plugin_id: String,
    prefix: String,
}

impl PluginLogger {
    /// Create a logger for `plugin_id`.
    #[must_use]
    pub fn new(plugin_id: &str) -> Self {
        Self {
            plugin_id: plugin_id.to_owned(),
            prefix: format!("[{plugin_id}] "),
        }
    }

    /// The prefix prepended to every message.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prefix a message.
    #[must_use]
    pub fn format(&self, message: &str) -> String {
        format!("{}{message}", self.prefix)
    }

    /// Log at debug level.
    pub fn debug(&self, message: &str) {
        tracing::debug!(plugin_id = %self.plugin_id, "{}", self.format(message));
    }

    /// Log at info level.
    pub fn info(&self, message: &str) {
        tracing::info!(plugin_id = %self.plugin_id, "{}", self.format(message));
    }

    /// Log at warn level.
    pub fn warn(&self, message: &str) {
        tracing::warn!(plugin_id = %self.plugin_id, "{}", self.format(message));
    }

    /// Log at error level.
    pub fn error(&self, message: &str) {
        tracing::error!(plugin_id = %self.plugin_id, "{}", self.format(message));
    }

    /// Log at a level named by the guest. Unknown names log at info.
    pub fn log(&self, level: &str, message: &str) {
        match level.to_ascii_lowercase().as_str() {
            "trace" | "debug" => self.debug(message),
            "warn" | "warning" => self.warn(message),
            "error" | "err" => self.error(message),
            _ => self.info(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix() {
        let logger = PluginLogger::new("word-count");
        assert_eq!(logger.prefix(), "[word-count] ");
        assert_eq!(logger.format("ready"), "[word-count] ready");
    }
}

use super::{ConfigError, Settings};

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.batch_window_ms == 0 {
            return Err(invalid("queue.batch_window_ms must be >= 1"));
        }
        if self.queue.batch_max_items == 0 {
            return Err(invalid("queue.batch_max_items must be >= 1"));
        }
        if self.queue.retry_base_delay_ms == 0 {
            return Err(invalid("queue.retry_base_delay_ms must be >= 1"));
        }
        if self.queue.retry_base_delay_ms > self.queue.retry_max_delay_ms {
            return Err(invalid(
                "queue.retry_base_delay_ms must be <= queue.retry_max_delay_ms",
            ));
        }
        if self.dispatch.max_concurrency == 0 {
            return Err(invalid("dispatch.max_concurrency must be >= 1"));
        }
        if self.sandbox.binary.trim().is_empty() {
            return Err(invalid("sandbox.binary must be non-empty"));
        }
        if self.sandbox.execution_timeout_secs == 0 {
            return Err(invalid("sandbox.execution_timeout_secs must be >= 1"));
        }
        if self.sandbox.output_max_bytes == 0 {
            return Err(invalid("sandbox.output_max_bytes must be >= 1"));
        }
        if self.sandbox.heartbeat_max_age_secs == 0 {
            return Err(invalid("sandbox.heartbeat_max_age_secs must be >= 1"));
        }
        if self.sandbox.restart_window_secs == 0 {
            return Err(invalid("sandbox.restart_window_secs must be >= 1"));
        }
        if self.sandbox.max_restarts_in_window == 0 {
            return Err(invalid("sandbox.max_restarts_in_window must be >= 1"));
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err(invalid("scheduler.tick_interval_secs must be >= 1"));
        }
        if self.scheduler.retry_base_delay_secs == 0 {
            return Err(invalid("scheduler.retry_base_delay_secs must be >= 1"));
        }
        if self.scheduler.retry_base_delay_secs > self.scheduler.retry_max_delay_secs {
            return Err(invalid(
                "scheduler.retry_base_delay_secs must be <= scheduler.retry_max_delay_secs",
            ));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid {
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Settings;

    #[test]
    fn default_settings_validate() {
        Settings::default().validate().expect("defaults are valid");
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut settings = Settings::default();
        settings.dispatch.max_concurrency = 0;
        let err = settings.validate().expect_err("must reject");
        assert!(err.to_string().contains("dispatch.max_concurrency"));
    }

    #[test]
    fn rejects_backoff_base_above_cap() {
        let mut settings = Settings::default();
        settings.queue.retry_base_delay_ms = 120_000;
        settings.queue.retry_max_delay_ms = 60_000;
        let err = settings.validate().expect_err("must reject");
        assert!(err.to_string().contains("retry_base_delay_ms"));
    }

    #[test]
    fn yaml_sections_are_optional() {
        let settings: Settings = serde_yaml::from_str(
            r#"
dispatch:
  max_concurrency: 2
  interrupt_on_new_message: true
sandbox:
  binary: /usr/local/bin/agent-run
"#,
        )
        .expect("parse settings");
        assert_eq!(settings.dispatch.max_concurrency, 2);
        assert!(settings.dispatch.interrupt_on_new_message);
        assert_eq!(settings.queue.batch_window_ms, 2000);
        assert_eq!(settings.sandbox.binary, "/usr/local/bin/agent-run");
        settings.validate().expect("valid");
    }
}

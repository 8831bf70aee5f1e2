mod settings;
mod validate;

pub use settings::{
    DispatchSettings, QueueSettings, SandboxSettings, SchedulerSettings, Settings,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

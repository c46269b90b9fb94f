use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    Config(#[from] dealflow_models::ConfigError),

    #[error("Health monitoring is already running")]
    AlreadyRunning,
}

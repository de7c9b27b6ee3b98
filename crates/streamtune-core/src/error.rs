//! Error types for the streamtune engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Processing timed out after {0} ms")]
    ProcessingTimeout(u64),

    #[error("Worker {0} crashed")]
    WorkerCrashed(usize),

    #[error("No worker available")]
    PoolSaturated,

    #[error("Worker pool is shut down")]
    PoolShutdown,

    #[error("Processing error: {0}")]
    ProcessingError(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device error: {0}")]
    DeviceError(String),

    #[error("Probe timed out after {0} ms")]
    ProbeTimeout(u64),

    #[error("Tuning error: {0}")]
    TuningError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_thread() -> Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::WouldBlock,
            "thread limit reached",
        ))?;
        Ok(())
    }

    #[test]
    fn test_io_error_converts() {
        let err = spawn_thread().unwrap_err();
        assert!(matches!(err, Error::IoError(_)));
        assert_eq!(err.to_string(), "IO error: thread limit reached");
    }
}

//! Runtime error type.

use thiserror::Error;
use turngen_kernel::KernelError;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid configuration file: {0}")]
    ConfigFile(#[from] toml::de::Error),
    #[error("no tokio runtime: {0}")]
    NoRuntime(String),
}

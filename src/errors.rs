use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the serving daemon.
#[derive(Error, Debug)]
pub enum HearthError {
    /// IO error occurred (file operations, subprocess pipes, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Model path does not resolve on disk
    #[error("model not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The runner backend rejected the model; advise the user to re-pull
    #[error("{cause}: this model may be incompatible with your version of hearth. If you previously pulled this model, try updating it by running `hearth pull {model}`")]
    Incompatible { model: String, cause: String },

    /// The runner backend cannot read the weight file at all
    #[error("unsupported model format")]
    UnsupportedFormat,

    /// No accelerator group fits the model even with the registry emptied
    #[error("insufficient accelerator memory: {0}")]
    InsufficientMemory(String),

    /// The runner a caller holds was evicted before `try_use` succeeded
    #[error("{0}")]
    Unloading(String),

    /// The operation was abandoned (daemon shutdown or caller cancel)
    #[error("operation cancelled")]
    Cancelled,

    /// Model metadata could not be parsed
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Runner subprocess error (spawn, ping, inference)
    #[error("runner error: {0}")]
    Runner(String),

    /// Configuration error (invalid config, bad env value, etc.)
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, HearthError>;

/// Extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context message to error
    fn context(self, msg: &str) -> Result<T>;

    /// Add context using a closure (for lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<HearthError>,
{
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| {
            let base: HearthError = e.into();
            tracing::error!("{}: {:?}", msg, base);
            base
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let base: HearthError = e.into();
            let msg = f();
            tracing::error!("{}: {:?}", msg, base);
            base
        })
    }
}

impl From<toml::de::Error> for HearthError {
    fn from(e: toml::de::Error) -> Self {
        HearthError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for HearthError {
    fn from(e: serde_json::Error) -> Self {
        HearthError::Metadata(e.to_string())
    }
}

/// Pretty error display module for CLI
pub mod display {
    use super::HearthError;
    use colored::Colorize;

    /// Print error with colors and actionable suggestions
    pub fn print_error(err: &HearthError) {
        eprintln!("{} {}", "Error:".red().bold(), err);

        match err {
            HearthError::NotFound(_) => {
                eprintln!("{}", "  → Check the model path for typos".yellow());
                eprintln!("{}", "  → Run 'hearth devices' to confirm the daemon environment".yellow());
            }
            HearthError::Incompatible { model, .. } => {
                eprintln!(
                    "{}",
                    format!("  → Try re-pulling the model: hearth pull {}", model).yellow()
                );
            }
            HearthError::InsufficientMemory(_) => {
                eprintln!("{}", "  → Close other GPU-heavy applications".yellow());
                eprintln!(
                    "{}",
                    "  → Lower num_ctx or num_gpu, or set HEARTH_MAX_RUNNERS=1".yellow()
                );
            }
            HearthError::Config(_) => {
                eprintln!("{}", "  → Check config file at ~/.hearth/config.toml".yellow());
                eprintln!("{}", "  → Verify HEARTH_* environment variables".yellow());
            }
            HearthError::Runner(_) => {
                eprintln!("{}", "  → Check the daemon log for runner output".yellow());
            }
            _ => {}
        }
    }
}

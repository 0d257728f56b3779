//! Error types for builder-playground.
//!
//! One error enum covers every stage of a session: manifest validation,
//! release-artifact fetching, compose launch, container lifecycle, and the
//! Engine-API proxy. `category()` returns the stable kind string used in
//! logs and by callers that switch on failure class.

use thiserror::Error;

/// Result type for builder-playground operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for all builder-playground operations
#[derive(Error, Debug)]
pub enum Error {
    /// Docker binary not found in PATH
    #[error("Docker binary not found in PATH")]
    DockerNotFound,

    /// Manifest references, dependencies, mounts, or host-execution
    /// prerequisites are inconsistent
    #[error("Validation failed: {message}")]
    Validation {
        /// Description of the inconsistency
        message: String,
    },

    /// A template placeholder could not be parsed
    #[error("Invalid template expression in {input:?}: {message}")]
    TemplateParse {
        /// The string that contained the bad placeholder
        input: String,
        /// Description of the parse failure
        message: String,
    },

    /// Downloading or locating a host-execution binary failed
    #[error("Failed to fetch release artifact {artifact}: {message}")]
    ArtifactFetch {
        /// The artifact that could not be obtained
        artifact: String,
        /// Description of the failure
        message: String,
    },

    /// The container-engine compose invocation failed
    #[error("Failed to launch session: {command}")]
    LaunchFailed {
        /// The command that failed
        command: String,
        /// Exit code returned by the engine
        exit_code: i32,
        /// Standard error from the engine
        stderr: String,
    },

    /// A service died before becoming ready or its health check never passed
    #[error("Service {service} failed: {message}")]
    Lifecycle {
        /// The service that failed
        service: String,
        /// What happened to it
        message: String,
    },

    /// No free host port could be reserved
    #[error("No free port found starting at {start} after {attempts} attempts")]
    PortAllocation {
        /// First candidate port probed
        start: u16,
        /// Number of consecutive candidates that failed
        attempts: u32,
    },

    /// Operation exceeded its deadline
    #[error("Operation timed out after {timeout_seconds} seconds")]
    Timeout {
        /// Number of seconds after which the operation timed out
        timeout_seconds: u64,
    },

    /// The primary Engine-API upstream failed
    #[error("Primary builder request failed: {message}")]
    ProxyPrimary {
        /// Description of the upstream failure
        message: String,
    },

    /// The secondary Engine-API upstream failed
    #[error("Secondary builder request failed: {message}")]
    ProxySecondary {
        /// Description of the upstream failure
        message: String,
    },

    /// Shutdown was requested by the user
    #[error("Interrupted by signal")]
    Interrupted,

    /// IO error occurred during operation
    #[error("IO error: {message}")]
    Io {
        /// Error message describing the IO failure
        message: String,
        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// JSON parsing or serialization error
    #[error("JSON error: {message}")]
    Json {
        /// Error message describing the JSON failure
        message: String,
        /// The underlying JSON error
        #[source]
        source: serde_json::Error,
    },

    /// YAML serialization error
    #[error("YAML error: {message}")]
    Yaml {
        /// Error message describing the YAML failure
        message: String,
        /// The underlying YAML error
        #[source]
        source: serde_yaml::Error,
    },

    /// HTTP client error
    #[error("HTTP error: {message}")]
    Http {
        /// Error message describing the HTTP failure
        message: String,
        /// The underlying reqwest error
        #[source]
        source: reqwest::Error,
    },

    /// Generic error with custom message
    #[error("{message}")]
    Custom {
        /// Custom error message
        message: String,
    },
}

impl Error {
    /// Create a new validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a new template parse error
    pub fn template_parse(input: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TemplateParse {
            input: input.into(),
            message: message.into(),
        }
    }

    /// Create a new artifact fetch error
    pub fn artifact_fetch(artifact: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ArtifactFetch {
            artifact: artifact.into(),
            message: message.into(),
        }
    }

    /// Create a new launch failure error
    pub fn launch_failed(
        command: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        Self::LaunchFailed {
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    /// Create a new lifecycle error
    pub fn lifecycle(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Lifecycle {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Create a new primary-proxy error
    pub fn proxy_primary(message: impl Into<String>) -> Self {
        Self::ProxyPrimary {
            message: message.into(),
        }
    }

    /// Create a new secondary-proxy error
    pub fn proxy_secondary(message: impl Into<String>) -> Self {
        Self::ProxySecondary {
            message: message.into(),
        }
    }

    /// Create a new custom error
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom {
            message: message.into(),
        }
    }

    /// Get the error category for logging and reporting
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation { .. } | Self::TemplateParse { .. } => "validation",
            Self::ArtifactFetch { .. } => "artifact-fetch",
            Self::DockerNotFound | Self::LaunchFailed { .. } => "runtime-launch",
            Self::Lifecycle { .. } => "lifecycle",
            Self::Timeout { .. } => "timeout",
            Self::ProxyPrimary { .. } => "proxy-primary",
            Self::ProxySecondary { .. } => "proxy-secondary",
            Self::Interrupted => "signal",
            Self::PortAllocation { .. } => "port",
            Self::Io { .. } => "io",
            Self::Json { .. } | Self::Yaml { .. } => "serialization",
            Self::Http { .. } => "http",
            Self::Custom { .. } => "custom",
        }
    }

    /// Check whether this error should abort before anything launches
    pub fn is_pre_launch(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::TemplateParse { .. } | Self::ArtifactFetch { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Http {
            message: err.to_string(),
            source: err,
        }
    }
}

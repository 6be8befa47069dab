use std::{
    error::Error,
    fmt::{self, Display},
};
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a cyroid-related operation.
pub type CyroidResult<T> = Result<T, CyroidError>;

/// An error that occurred while orchestrating a range.
#[derive(pretty_error_debug::Debug, Error)]
pub enum CyroidError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// An error returned by the Docker Engine API.
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// The Docker daemon reported that the object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The Docker daemon reported that the object already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A readiness poll did not succeed within its deadline.
    #[error("timed out after {seconds}s waiting for {what}")]
    Timeout {
        /// What was being waited on.
        what: String,

        /// How long we waited.
        seconds: u64,
    },

    /// A command executed inside a container exited with a non-zero status.
    #[error("command `{command}` failed with exit code {exit_code}: {output}")]
    CommandFailed {
        /// The rendered command.
        command: String,

        /// The exit code reported by the exec.
        exit_code: i64,

        /// The combined stdout/stderr of the exec.
        output: String,
    },

    /// A name that would be interpolated into a command failed validation.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// A parameter that would be interpolated into a command failed validation.
    #[error("invalid parameter {name}: {value}")]
    InvalidParameter {
        /// The parameter name.
        name: &'static str,

        /// The rejected value.
        value: String,
    },

    /// The range does not exist.
    #[error("range not found: {0}")]
    RangeNotFound(String),

    /// The network does not exist.
    #[error("network not found: {0}")]
    NetworkNotFound(String),

    /// The VM does not exist.
    #[error("vm not found: {0}")]
    VmNotFound(String),

    /// The image source record referenced by a VM does not exist.
    #[error("image source not found: {0}")]
    ImageSourceNotFound(String),

    /// The VM has no image source, or more than one.
    #[error("invalid image source for vm {0}")]
    InvalidImageSource(String),

    /// The requested transition is not allowed from the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The range has no DinD sandbox.
    #[error("range {0} has no sandbox")]
    SandboxNotFound(String),

    /// No address left in a pool.
    #[error("no address available in {0}")]
    AddressPoolExhausted(String),

    /// An error that occurred during a database operation.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An error that occurred while running database migrations.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An error that occurred during JSON (de)serialization.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error that occurred during YAML (de)serialization.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// An invalid CIDR or IP address.
    #[error("invalid network address: {0}")]
    InvalidNetworkAddress(#[from] ipnetwork::IpNetworkError),

    /// An error in the configuration.
    #[error("config error: {0}")]
    Config(String),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CyroidError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> CyroidError {
        CyroidError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Whether the error means the target object is already absent.
    pub fn is_not_found(&self) -> bool {
        match self {
            CyroidError::NotFound(_) => true,
            CyroidError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code,
                ..
            }) => *status_code == 404,
            _ => false,
        }
    }

    /// Whether the error means the target object already exists.
    pub fn is_already_exists(&self) -> bool {
        match self {
            CyroidError::AlreadyExists(_) => true,
            CyroidError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code,
                ..
            }) => *status_code == 409,
            _ => false,
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `CyroidResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> CyroidResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

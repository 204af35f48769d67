//! The errors that Berth services can run into

/// An error from a Berth service or store
#[derive(Debug)]
pub enum Error {
    /// A generic error with a message
    Generic(String),
    /// An optimistic concurrency failure when updating an object
    Conflict {
        /// The key of the object that was being updated
        key: String,
        /// The resource version the caller observed
        expected: u64,
        /// The resource version the store currently has
        found: u64,
    },
    /// An object was not found in the store
    NotFound(String),
    /// An error from loading a config
    Config(config::ConfigError),
    /// An error from converting a value with serde
    Serde(serde_json::Error),
    /// An error from converting a value with serde to YAML
    SerdeYaml(serde_yaml::Error),
    /// An IO Error
    IO(std::io::Error),
    /// An error from joining a tokio task
    Join(tokio::task::JoinError),
    /// The channel to another Berth task has closed
    ChannelClosed(&'static str),
}

impl Error {
    /// Create a new generic error
    ///
    /// # Arguments
    ///
    /// * `msg` - The error message to set
    pub fn new<T: Into<String>>(msg: T) -> Self {
        Error::Generic(msg.into())
    }

    /// Create a new conflict error
    ///
    /// # Arguments
    ///
    /// * `key` - The key of the object that was being updated
    /// * `expected` - The resource version the caller observed
    /// * `found` - The resource version the store currently has
    pub fn conflict<T: Into<String>>(key: T, expected: u64, found: u64) -> Self {
        Error::Conflict {
            key: key.into(),
            expected,
            found,
        }
    }

    /// Check if this error is an optimistic concurrency conflict
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Check if this error is transient and worth retrying in a later cycle
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::ChannelClosed(_))
    }

    /// Get this errors message if one exists
    #[must_use]
    pub fn msg(&self) -> String {
        match self {
            Error::Generic(msg) => msg.clone(),
            Error::Conflict {
                key,
                expected,
                found,
            } => format!("conflict updating {key}: expected version {expected} but found {found}"),
            Error::NotFound(key) => format!("{key} not found"),
            Error::Config(err) => err.to_string(),
            Error::Serde(err) => err.to_string(),
            Error::SerdeYaml(err) => err.to_string(),
            Error::IO(err) => err.to_string(),
            Error::Join(err) => err.to_string(),
            Error::ChannelClosed(name) => format!("channel to {name} has closed"),
        }
    }
}

impl std::fmt::Display for Error {
    /// Write our error to this formatter
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.msg())
    }
}

impl std::error::Error for Error {}

impl From<config::ConfigError> for Error {
    fn from(error: config::ConfigError) -> Self {
        Error::Config(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serde(error)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(error: serde_yaml::Error) -> Self {
        Error::SerdeYaml(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IO(error)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(error: tokio::task::JoinError) -> Self {
        Error::Join(error)
    }
}

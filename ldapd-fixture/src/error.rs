use std::path::PathBuf;
use thiserror::Error;

use crate::ldif::LdifError;

/// Failure while provisioning or driving a fixture
#[derive(Error, Debug)]
pub enum Error {
    /// Data directory could not be cleared or prepared
    #[error("workspace error: {message} ({})", path.display())]
    Workspace {
        /// Human readable reason
        message: String,
        /// Directory the fixture tried to use
        path: PathBuf,
        /// Underlying IO error, if any
        #[source]
        source: Option<std::io::Error>,
    },

    /// No TCP port left in the searched range
    #[error("port exhaustion error: no free TCP port in {start}..={end}")]
    PortExhaustion {
        /// First port probed
        start: u16,
        /// Last port probed
        end: u16,
    },

    /// slapd could not be configured or did not come up
    #[error("engine start error: {0}")]
    EngineStart(String),

    /// LDIF could not be parsed or applied to the running server
    #[error("import error: {0}")]
    Import(#[from] ImportError),

    /// Failure on a running fixture outside of import
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn workspace(
        message: impl Into<String>,
        path: impl Into<PathBuf>,
        source: Option<std::io::Error>,
    ) -> Self {
        Error::Workspace {
            message: message.into(),
            path: path.into(),
            source,
        }
    }

    pub(crate) fn engine(message: impl Into<String>) -> Self {
        Error::EngineStart(message.into())
    }
}

/// Reason an LDIF import stopped
#[derive(Error, Debug)]
pub enum ImportError {
    /// LDIF source could not be read
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// LDIF file
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// LDIF text is malformed
    #[error("{0}")]
    Parse(#[from] LdifError),

    /// Administrative connection could not be opened or bound
    #[error("cannot bind as {principal}: {source}")]
    Bind {
        /// Bind DN used
        principal: String,
        /// Client error
        #[source]
        source: ldap3::LdapError,
    },

    /// Server rejected a record
    #[error("cannot apply record {dn}: {source}")]
    Apply {
        /// DN of the rejected record
        dn: String,
        /// Client or server error
        #[source]
        source: ldap3::LdapError,
    },
}

/// Result type of this crate
pub type Result<T> = std::result::Result<T, Error>;

//! Errors.

use crate::messages::error::ErrorResponse;

/// Various errors.
#[derive(Debug, PartialEq, Clone)]
pub enum Error {
    SocketError(String),
    ClientBadStartup,
    ProtocolSyncError(String),
    ParseBytesError(String),
    BadConfig(String),
    AuthError(String),
    ScramClientError(String),
    ScramServerError(String),
    ServerStartupError(String, ServerIdentifier),
    ServerAuthError(String, ServerIdentifier),
    /// An ErrorResponse the upstream sent during startup, preserved verbatim
    /// so the client sees the real SQLSTATE.
    Upstream(ErrorResponse),
    MappingNotFound(i32),
    ShuttingDown,
}

#[derive(Clone, PartialEq, Debug)]
pub struct ServerIdentifier {
    pub username: String,
    pub database: String,
}

impl ServerIdentifier {
    pub fn new(username: String, database: &str) -> ServerIdentifier {
        ServerIdentifier {
            username,
            database: database.into(),
        }
    }
}

impl std::fmt::Display for ServerIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{{ username: {}, database: {} }}",
            self.username, self.database
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self {
            Error::SocketError(msg) => write!(f, "Socket connection error: {msg}"),
            Error::ClientBadStartup => write!(f, "Client sent an invalid startup message"),
            Error::ProtocolSyncError(msg) => write!(f, "Protocol synchronization error: {msg}"),
            Error::ParseBytesError(msg) => write!(f, "Failed to parse bytes: {msg}"),
            Error::BadConfig(msg) => write!(f, "Configuration error: {msg}"),
            Error::AuthError(msg) => write!(f, "Authentication failed: {msg}"),
            Error::ScramClientError(msg) => write!(f, "SCRAM client error: {msg}"),
            Error::ScramServerError(msg) => write!(f, "SCRAM server error: {msg}"),
            Error::ServerStartupError(error, server_identifier) => write!(
                f,
                "Error reading {error} on server startup {server_identifier}"
            ),
            Error::ServerAuthError(error, server_identifier) => {
                write!(f, "{error} for {server_identifier}")
            }
            Error::Upstream(response) => write!(f, "{response}"),
            Error::MappingNotFound(client_pid) => {
                write!(f, "No connections found for client_pid: {client_pid}")
            }
            Error::ShuttingDown => write!(f, "Connection pooler is shutting down"),
        }
    }
}

// Message framing, the per-kind codec, and socket helpers.

// Declare submodules
pub mod codec;
pub mod config_socket;
pub mod error;
pub mod protocol;
pub mod socket;

// Re-export public items
pub use config_socket::configure_tcp_socket;
pub use error::{ErrorField, ErrorResponse};
pub use protocol::{
    AuthenticationRequest, BackendKeyData, CancelRequest, CommandComplete, DataRow,
    FieldDescription, NoData, ParameterStatus, PasswordMessage, QueryMessage, RawMessage,
    ReadyForQuery, RowDescription, SASLInitialResponse, SASLResponse, StartupMessage, Terminate,
};
pub use socket::{
    read_message, read_message_header, read_startup_message, write_all, write_all_flush,
    MAX_MESSAGE_SIZE,
};

// Tests
#[cfg(test)]
mod tests;

// Used in the StartupMessage to indicate regular handshake.
pub const PROTOCOL_VERSION_NUMBER: i32 = 196608;

// SSLRequest: used to indicate the client wants an SSL connection.
pub const SSL_REQUEST_CODE: i32 = 80877103;

// CancelRequest: the cancel request code.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

// AuthenticationOk
pub const AUTHENTICATION_SUCCESSFUL: i32 = 0;

// AuthenticationMD5Password
pub const MD5_ENCRYPTED_PASSWORD: i32 = 5;

// SASL
pub const SASL: i32 = 10;
pub const SASL_CONTINUE: i32 = 11;
pub const SASL_FINAL: i32 = 12;
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

// ErrorResponse: a code identifying the field type; if zero, this is the
// message terminator and no string follows.
pub const MESSAGE_TERMINATOR: u8 = 0;

// 18 random bytes base64-encode to a 24 character ASCII nonce.
pub const NONCE_RAW_LENGTH: usize = 18;
pub const NONCE_LENGTH: usize = 24;

// Sentinel kinds for the two untyped startup-channel messages.
pub const STARTUP_MESSAGE_KIND: i32 = -1;
pub const CANCEL_MESSAGE_KIND: i32 = -2;

// The PostgreSQL v3 message catalogue the proxy understands, one struct per
// kind with a symmetric unpack/pack pair against RawMessage.

// Standard library imports
use std::collections::BTreeMap;

// External crate imports
use bytes::{BufMut, BytesMut};

// Internal crate imports
use crate::constants::{
    AUTHENTICATION_SUCCESSFUL, CANCEL_MESSAGE_KIND, CANCEL_REQUEST_CODE, MD5_ENCRYPTED_PASSWORD,
    MESSAGE_TERMINATOR, PROTOCOL_VERSION_NUMBER, SASL, SASL_CONTINUE, SASL_FINAL,
    STARTUP_MESSAGE_KIND,
};
use crate::errors::Error;
use crate::messages::codec::{
    backfill_i32, parse_bytes, parse_cstring, parse_i16, parse_i32, put_cstring, write_i32,
    write_u8,
};

/// A framed message. `kind` is the leading type byte for post-startup
/// messages; the two untyped startup-channel messages carry the sentinel
/// kinds. `length` is the declared on-wire length field, which includes the
/// four length bytes and excludes the type byte, so
/// `payload.len() == length - 4` always holds.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub kind: i32,
    pub length: i32,
    pub payload: BytesMut,
}

impl RawMessage {
    pub fn new(kind: i32, payload: BytesMut) -> RawMessage {
        RawMessage {
            kind,
            length: payload.len() as i32 + 4,
            payload,
        }
    }

    /// Parse a typed message out of a full byte image.
    pub fn unpack(data: &[u8]) -> Result<RawMessage, Error> {
        if data.is_empty() {
            return Err(Error::ParseBytesError("empty message".to_string()));
        }
        let kind = data[0] as i32;
        let (idx, length) = parse_i32(data, 1)?;
        if length < 4 {
            return Err(Error::ParseBytesError(format!(
                "message length is too small: {length}"
            )));
        }
        let (_, payload) = parse_bytes(data, idx, length as usize - 4)?;
        Ok(RawMessage {
            kind,
            length,
            payload: BytesMut::from(&payload[..]),
        })
    }

    /// Re-emit the exact bytes this message was read from.
    pub fn pack(&self) -> BytesMut {
        match self.kind {
            STARTUP_MESSAGE_KIND | CANCEL_MESSAGE_KIND => {
                let mut out = BytesMut::with_capacity(self.payload.len() + 4);
                out.put_i32(self.length);
                out.put_slice(&self.payload);
                out
            }
            kind => {
                let mut out = BytesMut::with_capacity(self.payload.len() + 5);
                out.put_u8(kind as u8);
                out.put_i32(self.length);
                out.put_slice(&self.payload);
                out
            }
        }
    }

    fn expect_kind(&self, kind: i32, what: &str) -> Result<(), Error> {
        if self.kind != kind {
            return Err(Error::ProtocolSyncError(format!(
                "expected {what}, got message kind {}",
                self.kind
            )));
        }
        Ok(())
    }
}

/// The message a client opens a session with. `user` and `database` are
/// mandatory; everything else lands in the options map, which keeps a
/// deterministic order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    pub user: String,
    pub database: String,
    pub options: BTreeMap<String, String>,
}

impl StartupMessage {
    pub fn new(user: &str, database: &str) -> StartupMessage {
        StartupMessage {
            user: user.to_string(),
            database: database.to_string(),
            options: BTreeMap::new(),
        }
    }

    pub fn unpack(message: &RawMessage) -> Result<StartupMessage, Error> {
        message.expect_kind(STARTUP_MESSAGE_KIND, "startup message")?;
        let data = &message.payload[..];

        let (mut idx, protocol_version) = parse_i32(data, 0)?;
        if protocol_version != PROTOCOL_VERSION_NUMBER {
            return Err(Error::ProtocolSyncError(format!(
                "unsupported protocol version: {protocol_version}"
            )));
        }

        let mut user = None;
        let mut database = None;
        let mut options = BTreeMap::new();

        while idx < data.len() {
            let (next, key) = parse_cstring(data, idx)?;
            idx = next;
            if key.is_empty() {
                break;
            }
            let (next, value) = parse_cstring(data, idx)?;
            idx = next;
            match key.as_str() {
                "user" => user = Some(value),
                "database" => database = Some(value),
                _ => {
                    options.insert(key, value);
                }
            }
        }

        // The protocol requires the user; the proxy additionally needs a
        // database name to route the session.
        let user = user.ok_or(Error::ClientBadStartup)?;
        let database = database.ok_or(Error::ClientBadStartup)?;

        Ok(StartupMessage {
            user,
            database,
            options,
        })
    }

    /// Untyped startup framing: the length leads and is backfilled once the
    /// key/value pairs are written.
    pub fn pack(&self) -> BytesMut {
        let mut out = BytesMut::new();
        out.put_i32(0); // length, backfilled below
        out.put_i32(PROTOCOL_VERSION_NUMBER);

        put_cstring(&mut out, "user");
        put_cstring(&mut out, &self.user);
        put_cstring(&mut out, "database");
        put_cstring(&mut out, &self.database);
        for (key, value) in &self.options {
            put_cstring(&mut out, key);
            put_cstring(&mut out, value);
        }
        out.put_u8(MESSAGE_TERMINATOR);

        let length = out.len() as i32;
        backfill_i32(&mut out, 0, length);
        out
    }
}

/// Simple query ('Q'): a single C-string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryMessage {
    pub query: String,
}

impl QueryMessage {
    pub fn new(query: &str) -> QueryMessage {
        QueryMessage {
            query: query.to_string(),
        }
    }

    pub fn unpack(message: &RawMessage) -> Result<QueryMessage, Error> {
        message.expect_kind(b'Q' as i32, "query message")?;
        let (_, query) = parse_cstring(&message.payload, 0)?;
        Ok(QueryMessage { query })
    }

    pub fn pack(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(self.query.len() + 6);
        out.put_u8(b'Q');
        out.put_i32(4 + self.query.len() as i32 + 1);
        put_cstring(&mut out, &self.query);
        out
    }
}

/// Terminate ('X'): no body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Terminate;

impl Terminate {
    pub fn unpack(message: &RawMessage) -> Result<Terminate, Error> {
        message.expect_kind(b'X' as i32, "terminate message")?;
        Ok(Terminate)
    }

    pub fn pack(&self) -> BytesMut {
        let mut out = [0u8; 5];
        let idx = write_u8(&mut out, 0, b'X');
        write_i32(&mut out, idx, 4);
        BytesMut::from(&out[..])
    }
}

/// CancelRequest: sent on a fresh, untyped connection. 16 bytes on the wire,
/// the payload being the fixed 12-byte tail (code, pid, key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelRequest {
    pub backend_pid: i32,
    pub backend_key: i32,
}

impl CancelRequest {
    pub fn new(backend_pid: i32, backend_key: i32) -> CancelRequest {
        CancelRequest {
            backend_pid,
            backend_key,
        }
    }

    pub fn unpack(message: &RawMessage) -> Result<CancelRequest, Error> {
        message.expect_kind(CANCEL_MESSAGE_KIND, "cancel request")?;
        let data = &message.payload[..];
        let (idx, code) = parse_i32(data, 0)?;
        if code != CANCEL_REQUEST_CODE {
            return Err(Error::ProtocolSyncError(format!(
                "unexpected cancel request code: {code}"
            )));
        }
        let (idx, backend_pid) = parse_i32(data, idx)?;
        let (_, backend_key) = parse_i32(data, idx)?;
        Ok(CancelRequest {
            backend_pid,
            backend_key,
        })
    }

    pub fn pack(&self) -> BytesMut {
        let mut out = [0u8; 16];
        let mut idx = write_i32(&mut out, 0, 16);
        idx = write_i32(&mut out, idx, CANCEL_REQUEST_CODE);
        idx = write_i32(&mut out, idx, self.backend_pid);
        write_i32(&mut out, idx, self.backend_key);
        BytesMut::from(&out[..])
    }
}

/// PasswordMessage ('p'): the body is opaque; the MD5 flow sends a
/// NUL-terminated hash, the SASL flows reuse the same type byte with their
/// own layouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordMessage {
    pub password: Vec<u8>,
}

impl PasswordMessage {
    pub fn new(password: Vec<u8>) -> PasswordMessage {
        PasswordMessage { password }
    }

    pub fn unpack(message: &RawMessage) -> Result<PasswordMessage, Error> {
        message.expect_kind(b'p' as i32, "password message")?;
        Ok(PasswordMessage {
            password: message.payload.to_vec(),
        })
    }

    pub fn pack(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(self.password.len() + 5);
        out.put_u8(b'p');
        out.put_i32(4 + self.password.len() as i32);
        out.put_slice(&self.password);
        out
    }
}

/// SASLInitialResponse ('p'): mechanism name plus the initial client
/// message, length-prefixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SASLInitialResponse {
    pub mechanism: String,
    pub data: Vec<u8>,
}

impl SASLInitialResponse {
    pub fn new(mechanism: &str, data: Vec<u8>) -> SASLInitialResponse {
        SASLInitialResponse {
            mechanism: mechanism.to_string(),
            data,
        }
    }

    pub fn unpack(message: &RawMessage) -> Result<SASLInitialResponse, Error> {
        message.expect_kind(b'p' as i32, "SASL initial response")?;
        let data = &message.payload[..];
        let (idx, mechanism) = parse_cstring(data, 0)?;
        let (idx, len) = parse_i32(data, idx)?;
        let payload = if len < 0 {
            Vec::new()
        } else {
            let (_, payload) = parse_bytes(data, idx, len as usize)?;
            payload
        };
        Ok(SASLInitialResponse {
            mechanism,
            data: payload,
        })
    }

    pub fn pack(&self) -> BytesMut {
        let mut out = BytesMut::new();
        out.put_u8(b'p');
        out.put_i32(4 + self.mechanism.len() as i32 + 1 + 4 + self.data.len() as i32);
        put_cstring(&mut out, &self.mechanism);
        out.put_i32(self.data.len() as i32);
        out.put_slice(&self.data);
        out
    }
}

/// SASLResponse ('p'): the raw continuation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SASLResponse {
    pub data: Vec<u8>,
}

impl SASLResponse {
    pub fn new(data: Vec<u8>) -> SASLResponse {
        SASLResponse { data }
    }

    pub fn unpack(message: &RawMessage) -> Result<SASLResponse, Error> {
        message.expect_kind(b'p' as i32, "SASL response")?;
        Ok(SASLResponse {
            data: message.payload.to_vec(),
        })
    }

    pub fn pack(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(self.data.len() + 5);
        out.put_u8(b'p');
        out.put_i32(4 + self.data.len() as i32);
        out.put_slice(&self.data);
        out
    }
}

/// Authentication ('R'): the first i32 of the body discriminates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationRequest {
    Ok,
    Md5Password { salt: [u8; 4] },
    Sasl { mechanisms: Vec<String> },
    SaslContinue { data: Vec<u8> },
    SaslFinal { data: Vec<u8> },
}

impl AuthenticationRequest {
    pub fn unpack(message: &RawMessage) -> Result<AuthenticationRequest, Error> {
        message.expect_kind(b'R' as i32, "authentication request")?;
        let data = &message.payload[..];
        let (idx, code) = parse_i32(data, 0)?;

        match code {
            AUTHENTICATION_SUCCESSFUL => Ok(AuthenticationRequest::Ok),
            MD5_ENCRYPTED_PASSWORD => {
                let (_, salt) = parse_bytes(data, idx, 4)?;
                Ok(AuthenticationRequest::Md5Password {
                    salt: [salt[0], salt[1], salt[2], salt[3]],
                })
            }
            SASL => {
                let mut mechanisms = Vec::new();
                let mut idx = idx;
                while idx < data.len() && data[idx] != MESSAGE_TERMINATOR {
                    let (next, mechanism) = parse_cstring(data, idx)?;
                    idx = next;
                    mechanisms.push(mechanism);
                }
                Ok(AuthenticationRequest::Sasl { mechanisms })
            }
            SASL_CONTINUE => Ok(AuthenticationRequest::SaslContinue {
                data: data[idx..].to_vec(),
            }),
            SASL_FINAL => Ok(AuthenticationRequest::SaslFinal {
                data: data[idx..].to_vec(),
            }),
            _ => Err(Error::ProtocolSyncError(format!(
                "unsupported authentication request: {code}"
            ))),
        }
    }

    pub fn pack(&self) -> BytesMut {
        match self {
            AuthenticationRequest::Ok => {
                let mut out = [0u8; 9];
                let mut idx = write_u8(&mut out, 0, b'R');
                idx = write_i32(&mut out, idx, 8);
                write_i32(&mut out, idx, AUTHENTICATION_SUCCESSFUL);
                BytesMut::from(&out[..])
            }
            AuthenticationRequest::Md5Password { salt } => {
                let mut out = BytesMut::with_capacity(13);
                out.put_u8(b'R');
                out.put_i32(12);
                out.put_i32(MD5_ENCRYPTED_PASSWORD);
                out.put_slice(salt);
                out
            }
            AuthenticationRequest::Sasl { mechanisms } => {
                let mut out = BytesMut::new();
                out.put_u8(b'R');
                out.put_i32(0); // length, backfilled below
                out.put_i32(SASL);
                for mechanism in mechanisms {
                    put_cstring(&mut out, mechanism);
                }
                out.put_u8(MESSAGE_TERMINATOR);
                let length = (out.len() - 1) as i32;
                backfill_i32(&mut out, 1, length);
                out
            }
            AuthenticationRequest::SaslContinue { data } => {
                let mut out = BytesMut::with_capacity(data.len() + 9);
                out.put_u8(b'R');
                out.put_i32(8 + data.len() as i32);
                out.put_i32(SASL_CONTINUE);
                out.put_slice(data);
                out
            }
            AuthenticationRequest::SaslFinal { data } => {
                let mut out = BytesMut::with_capacity(data.len() + 9);
                out.put_u8(b'R');
                out.put_i32(8 + data.len() as i32);
                out.put_i32(SASL_FINAL);
                out.put_slice(data);
                out
            }
        }
    }
}

/// ParameterStatus ('S'): a key/value report from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterStatus {
    pub name: String,
    pub value: String,
}

impl ParameterStatus {
    pub fn new(name: &str, value: &str) -> ParameterStatus {
        ParameterStatus {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    pub fn unpack(message: &RawMessage) -> Result<ParameterStatus, Error> {
        message.expect_kind(b'S' as i32, "parameter status")?;
        let data = &message.payload[..];
        let (idx, name) = parse_cstring(data, 0)?;
        let (_, value) = parse_cstring(data, idx)?;
        Ok(ParameterStatus { name, value })
    }

    pub fn pack(&self) -> BytesMut {
        let mut out = BytesMut::new();
        out.put_u8(b'S');
        out.put_i32(4 + self.name.len() as i32 + 1 + self.value.len() as i32 + 1);
        put_cstring(&mut out, &self.name);
        put_cstring(&mut out, &self.value);
        out
    }
}

/// BackendKeyData ('K'): the pid/secret pair a cancel request must echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendKeyData {
    pub process_id: i32,
    pub secret_key: i32,
}

impl BackendKeyData {
    pub fn new(process_id: i32, secret_key: i32) -> BackendKeyData {
        BackendKeyData {
            process_id,
            secret_key,
        }
    }

    pub fn unpack(message: &RawMessage) -> Result<BackendKeyData, Error> {
        message.expect_kind(b'K' as i32, "backend key data")?;
        let data = &message.payload[..];
        let (idx, process_id) = parse_i32(data, 0)?;
        let (_, secret_key) = parse_i32(data, idx)?;
        Ok(BackendKeyData {
            process_id,
            secret_key,
        })
    }

    pub fn pack(&self) -> BytesMut {
        let mut out = [0u8; 13];
        let mut idx = write_u8(&mut out, 0, b'K');
        idx = write_i32(&mut out, idx, 12);
        idx = write_i32(&mut out, idx, self.process_id);
        write_i32(&mut out, idx, self.secret_key);
        BytesMut::from(&out[..])
    }
}

/// ReadyForQuery ('Z'): transaction status byte, 'I' when idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyForQuery {
    pub status: u8,
}

impl ReadyForQuery {
    pub fn idle() -> ReadyForQuery {
        ReadyForQuery { status: b'I' }
    }

    pub fn unpack(message: &RawMessage) -> Result<ReadyForQuery, Error> {
        message.expect_kind(b'Z' as i32, "ready for query")?;
        if message.payload.is_empty() {
            return Err(Error::ParseBytesError(
                "ready for query without a status byte".to_string(),
            ));
        }
        Ok(ReadyForQuery {
            status: message.payload[0],
        })
    }

    pub fn pack(&self) -> BytesMut {
        let mut out = [0u8; 6];
        let mut idx = write_u8(&mut out, 0, b'Z');
        idx = write_i32(&mut out, idx, 5);
        write_u8(&mut out, idx, self.status);
        BytesMut::from(&out[..])
    }
}

/// CommandComplete ('C'): the command tag, e.g. `SELECT 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandComplete {
    pub tag: String,
}

impl CommandComplete {
    pub fn new(tag: &str) -> CommandComplete {
        CommandComplete {
            tag: tag.to_string(),
        }
    }

    pub fn unpack(message: &RawMessage) -> Result<CommandComplete, Error> {
        message.expect_kind(b'C' as i32, "command complete")?;
        let (_, tag) = parse_cstring(&message.payload, 0)?;
        Ok(CommandComplete { tag })
    }

    pub fn pack(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(self.tag.len() + 6);
        out.put_u8(b'C');
        out.put_i32(4 + self.tag.len() as i32 + 1);
        put_cstring(&mut out, &self.tag);
        out
    }
}

/// NoData ('n'): no body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NoData;

impl NoData {
    pub fn unpack(message: &RawMessage) -> Result<NoData, Error> {
        message.expect_kind(b'n' as i32, "no data")?;
        Ok(NoData)
    }

    pub fn pack(&self) -> BytesMut {
        let mut out = [0u8; 5];
        let idx = write_u8(&mut out, 0, b'n');
        write_i32(&mut out, idx, 4);
        BytesMut::from(&out[..])
    }
}

/// One column of a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: i32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

impl FieldDescription {
    /// A detached text column, the shape synthetic results use.
    pub fn text(name: &str, type_oid: i32, type_size: i16) -> FieldDescription {
        FieldDescription {
            name: name.to_string(),
            table_oid: 0,
            column_attr: 0,
            type_oid,
            type_size,
            type_modifier: -1,
            format: 0,
        }
    }

    fn byte_length(&self) -> usize {
        self.name.len() + 1 + 4 + 2 + 4 + 2 + 4 + 2
    }
}

/// RowDescription ('T').
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDescription {
    pub fields: Vec<FieldDescription>,
}

impl RowDescription {
    pub fn unpack(message: &RawMessage) -> Result<RowDescription, Error> {
        message.expect_kind(b'T' as i32, "row description")?;
        let data = &message.payload[..];
        let (mut idx, count) = parse_i16(data, 0)?;

        let mut fields = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (next, name) = parse_cstring(data, idx)?;
            let (next, table_oid) = parse_i32(data, next)?;
            let (next, column_attr) = parse_i16(data, next)?;
            let (next, type_oid) = parse_i32(data, next)?;
            let (next, type_size) = parse_i16(data, next)?;
            let (next, type_modifier) = parse_i32(data, next)?;
            let (next, format) = parse_i16(data, next)?;
            idx = next;
            fields.push(FieldDescription {
                name,
                table_oid,
                column_attr,
                type_oid,
                type_size,
                type_modifier,
                format,
            });
        }

        Ok(RowDescription { fields })
    }

    pub fn pack(&self) -> BytesMut {
        let body: usize = 2 + self
            .fields
            .iter()
            .map(FieldDescription::byte_length)
            .sum::<usize>();
        let mut out = BytesMut::with_capacity(body + 5);
        out.put_u8(b'T');
        out.put_i32(body as i32 + 4);
        out.put_i16(self.fields.len() as i16);
        for field in &self.fields {
            put_cstring(&mut out, &field.name);
            out.put_i32(field.table_oid);
            out.put_i16(field.column_attr);
            out.put_i32(field.type_oid);
            out.put_i16(field.type_size);
            out.put_i32(field.type_modifier);
            out.put_i16(field.format);
        }
        out
    }
}

/// DataRow ('D'): values are length-prefixed, -1 marks NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    pub values: Vec<Option<Vec<u8>>>,
}

impl DataRow {
    pub fn unpack(message: &RawMessage) -> Result<DataRow, Error> {
        message.expect_kind(b'D' as i32, "data row")?;
        let data = &message.payload[..];
        let (mut idx, count) = parse_i16(data, 0)?;

        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (next, len) = parse_i32(data, idx)?;
            if len < 0 {
                idx = next;
                values.push(None);
            } else {
                let (next, value) = parse_bytes(data, next, len as usize)?;
                idx = next;
                values.push(Some(value));
            }
        }

        Ok(DataRow { values })
    }

    pub fn pack(&self) -> BytesMut {
        let body: usize = 2 + self
            .values
            .iter()
            .map(|value| 4 + value.as_ref().map(Vec::len).unwrap_or(0))
            .sum::<usize>();
        let mut out = BytesMut::with_capacity(body + 5);
        out.put_u8(b'D');
        out.put_i32(body as i32 + 4);
        out.put_i16(self.values.len() as i16);
        for value in &self.values {
            match value {
                Some(value) => {
                    out.put_i32(value.len() as i32);
                    out.put_slice(value);
                }
                None => out.put_i32(-1),
            }
        }
        out
    }
}

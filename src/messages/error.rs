// ErrorResponse ('E') and NoticeResponse ('N') payloads: a sequence of
// (type byte, C-string) records terminated by a single NUL.
// See: https://www.postgresql.org/docs/current/protocol-error-fields.html

// Standard library imports
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

// External crate imports
use bytes::{BufMut, BytesMut};

// Internal crate imports
use crate::constants::MESSAGE_TERMINATOR;
use crate::errors::Error;
use crate::messages::codec::{backfill_i32, parse_cstring, put_cstring};
use crate::messages::protocol::RawMessage;

// Human-readable field names, fixed mapping to the protocol type bytes.
pub const SEVERITY_LOCALIZED: &str = "Localized Severity"; // S
pub const SEVERITY: &str = "Severity"; // V
pub const CODE: &str = "Code"; // C
pub const MESSAGE: &str = "Message"; // M
pub const DETAIL: &str = "Detail"; // D
pub const HINT: &str = "Hint"; // H
pub const POSITION: &str = "Position"; // P
pub const INTERNAL_POSITION: &str = "Internal Position"; // p
pub const INTERNAL_QUERY: &str = "Internal Query"; // q
pub const WHERE_CONTEXT: &str = "Where"; // W
pub const SCHEMA_NAME: &str = "Schema Name"; // s
pub const TABLE_NAME: &str = "Table Name"; // t
pub const COLUMN_NAME: &str = "Column Name"; // c
pub const DATA_TYPE_NAME: &str = "Data Type Name"; // d
pub const CONSTRAINT_NAME: &str = "Constraint Name"; // n
pub const FILE_NAME: &str = "File"; // F
pub const LINE: &str = "Line"; // L
pub const ROUTINE: &str = "Routine"; // R

const FIELD_TABLE: &[(u8, &str)] = &[
    (b'S', SEVERITY_LOCALIZED),
    (b'V', SEVERITY),
    (b'C', CODE),
    (b'M', MESSAGE),
    (b'D', DETAIL),
    (b'H', HINT),
    (b'P', POSITION),
    (b'p', INTERNAL_POSITION),
    (b'q', INTERNAL_QUERY),
    (b'W', WHERE_CONTEXT),
    (b's', SCHEMA_NAME),
    (b't', TABLE_NAME),
    (b'c', COLUMN_NAME),
    (b'd', DATA_TYPE_NAME),
    (b'n', CONSTRAINT_NAME),
    (b'F', FILE_NAME),
    (b'L', LINE),
    (b'R', ROUTINE),
];

pub fn field_name(kind: u8) -> Option<&'static str> {
    FIELD_TABLE
        .iter()
        .find(|(byte, _)| *byte == kind)
        .map(|(_, name)| *name)
}

pub fn field_kind(name: &str) -> Option<u8> {
    FIELD_TABLE
        .iter()
        .find(|(_, field)| *field == name)
        .map(|(byte, _)| *byte)
}

/// One field of an ErrorResponse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorField {
    pub kind: u8,
    pub value: String,
}

/// An ErrorResponse as a field map keyed by the human-readable field name.
/// Iteration order is deterministic (sorted by name); the protocol does not
/// require an order but tests rely on one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorResponse {
    fields: BTreeMap<&'static str, ErrorField>,
}

impl ErrorResponse {
    pub fn new() -> ErrorResponse {
        ErrorResponse::default()
    }

    /// Set a field by name. Names outside the fixed table are ignored.
    pub fn set(&mut self, name: &str, value: &str) {
        if let Some((kind, key)) = FIELD_TABLE
            .iter()
            .find(|(_, field)| *field == name)
            .copied()
        {
            self.fields.insert(
                key,
                ErrorField {
                    kind,
                    value: value.to_string(),
                },
            );
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|field| field.value.as_str())
    }

    pub fn severity(&self) -> &str {
        self.get(SEVERITY).unwrap_or_default()
    }

    pub fn code(&self) -> &str {
        self.get(CODE).unwrap_or_default()
    }

    pub fn message(&self) -> &str {
        self.get(MESSAGE).unwrap_or_default()
    }

    /// A FATAL response the proxy emits on its own behalf, e.g. when the
    /// requested database is not configured.
    pub fn fatal(code: &str, message: &str) -> ErrorResponse {
        let mut response = ErrorResponse::new();
        response.set(SEVERITY_LOCALIZED, "FATAL");
        response.set(SEVERITY, "FATAL");
        response.set(CODE, code);
        response.set(MESSAGE, message);
        response
    }

    /// An ERROR response describing a failed upstream connection attempt.
    pub fn connection_error(
        message: &str,
        detail: &str,
        code: &str,
        routine: &str,
    ) -> ErrorResponse {
        let mut response = ErrorResponse::new();
        response.set(SEVERITY_LOCALIZED, "ERROR");
        response.set(SEVERITY, "ERROR");
        response.set(CODE, code);
        response.set(MESSAGE, message);
        response.set(DETAIL, detail);
        response.set(HINT, "Check the pg_spanner server logs for more information");
        response.set(ROUTINE, routine);
        response
    }

    /// Parse the payload of an 'E' (or 'N') message.
    pub fn parse_fields(payload: &[u8]) -> Result<ErrorResponse, Error> {
        let mut response = ErrorResponse::new();
        let mut idx = 0;

        while idx < payload.len() {
            let kind = payload[idx];
            if kind == MESSAGE_TERMINATOR {
                return Ok(response);
            }
            idx += 1;
            let (next, value) = parse_cstring(payload, idx)?;
            idx = next;
            // Unknown field bytes are skipped.
            if let Some(name) = field_name(kind) {
                response.set(name, &value);
            }
        }

        Err(Error::ProtocolSyncError(
            "error response payload is missing its terminator".to_string(),
        ))
    }

    pub fn unpack(message: &RawMessage) -> Result<ErrorResponse, Error> {
        if message.kind != b'E' as i32 && message.kind != b'N' as i32 {
            return Err(Error::ProtocolSyncError(format!(
                "expected error response, got kind {}",
                message.kind
            )));
        }
        Self::parse_fields(&message.payload)
    }

    /// Emit the full 'E' message, backfilling the length once the
    /// variable-size field list is known.
    pub fn pack(&self) -> BytesMut {
        let mut out = BytesMut::new();
        out.put_u8(b'E');
        out.put_i32(0); // length, backfilled below

        for field in self.fields.values() {
            out.put_u8(field.kind);
            put_cstring(&mut out, &field.value);
        }
        out.put_u8(MESSAGE_TERMINATOR);

        let length = (out.len() - 1) as i32;
        backfill_i32(&mut out, 1, length);
        out
    }
}

impl Display for ErrorResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.get(DETAIL) {
            Some(detail) if !detail.is_empty() => {
                write!(f, "{}: {}", self.message(), detail)
            }
            _ => write!(f, "{}", self.message()),
        }
    }
}

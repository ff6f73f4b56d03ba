// Tests for the byte codec, the message catalogue and the framing readers.

// External crate imports
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

// Internal crate imports
use crate::constants::{
    CANCEL_MESSAGE_KIND, CANCEL_REQUEST_CODE, PROTOCOL_VERSION_NUMBER, SSL_REQUEST_CODE,
    STARTUP_MESSAGE_KIND,
};
use crate::errors::Error;
use crate::messages::codec::{
    parse_bytes, parse_cstring, parse_i16, parse_i32, put_cstring, write_cstring, write_i16,
    write_i32,
};
use crate::messages::error::{self, ErrorResponse};
use crate::messages::protocol::{
    AuthenticationRequest, BackendKeyData, CancelRequest, CommandComplete, DataRow,
    FieldDescription, NoData, ParameterStatus, PasswordMessage, QueryMessage, RawMessage,
    ReadyForQuery, RowDescription, SASLInitialResponse, SASLResponse, StartupMessage, Terminate,
};
use crate::messages::socket::{read_message, read_startup_message};

#[test]
fn i32_round_trip() {
    for value in [0i32, 1, -1, 196608, i32::MAX, i32::MIN] {
        let mut buf = [0u8; 4];
        write_i32(&mut buf, 0, value);
        assert_eq!(parse_i32(&buf, 0).unwrap(), (4, value));
    }
    // big-endian on the wire
    let mut buf = [0u8; 4];
    write_i32(&mut buf, 0, 0x01020304);
    assert_eq!(buf, [1, 2, 3, 4]);
}

#[test]
fn i16_round_trip() {
    for value in [0i16, 7, -7, i16::MAX, i16::MIN] {
        let mut buf = [0u8; 2];
        write_i16(&mut buf, 0, value);
        assert_eq!(parse_i16(&buf, 0).unwrap(), (2, value));
    }
}

#[test]
fn cstring_round_trip() {
    let mut buf = [0u8; 16];
    let idx = write_cstring(&mut buf, 0, "hello");
    assert_eq!(idx, 6);
    assert_eq!(parse_cstring(&buf, 0).unwrap(), (6, "hello".to_string()));

    // safe flavor grows the buffer
    let mut growable = BytesMut::new();
    put_cstring(&mut growable, "world");
    assert_eq!(
        parse_cstring(&growable, 0).unwrap(),
        (6, "world".to_string())
    );
}

#[test]
fn cstring_without_nul_fails() {
    let buf = b"no terminator here";
    assert!(matches!(
        parse_cstring(buf, 0),
        Err(Error::ParseBytesError(_))
    ));
}

#[test]
fn parse_past_end_fails() {
    let buf = [0u8; 3];
    assert!(parse_i32(&buf, 0).is_err());
    assert!(parse_i16(&buf, 2).is_err());
    assert!(parse_bytes(&buf, 1, 3).is_err());
}

#[test]
fn raw_message_pack_is_the_original_bytes() {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'C');
    bytes.put_i32(13);
    bytes.put_slice(b"SELECT 1\0");

    let message = RawMessage::unpack(&bytes).unwrap();
    assert_eq!(message.kind, b'C' as i32);
    assert_eq!(message.length, 13);
    assert_eq!(message.payload.len(), 9);
    assert_eq!(message.pack(), bytes);
}

#[test]
fn startup_message_round_trip() {
    let mut message = StartupMessage::new("alice", "orders");
    message
        .options
        .insert("application_name".to_string(), "psql".to_string());

    let packed = message.pack();
    // length leads and covers the whole packet
    let (_, length) = parse_i32(&packed, 0).unwrap();
    assert_eq!(length as usize, packed.len());

    let raw = RawMessage {
        kind: STARTUP_MESSAGE_KIND,
        length,
        payload: BytesMut::from(&packed[4..]),
    };
    assert_eq!(StartupMessage::unpack(&raw).unwrap(), message);
}

#[test]
fn startup_message_rejects_wrong_protocol() {
    let mut payload = BytesMut::new();
    payload.put_i32(196607);
    payload.put_slice(b"user\0alice\0database\0orders\0\0");
    let raw = RawMessage::new(STARTUP_MESSAGE_KIND, payload);

    match StartupMessage::unpack(&raw) {
        Err(Error::ProtocolSyncError(msg)) => {
            assert!(msg.contains("unsupported protocol version"))
        }
        other => panic!("expected protocol error, got {other:?}"),
    }
}

#[test]
fn startup_message_requires_user_and_database() {
    let mut payload = BytesMut::new();
    payload.put_i32(PROTOCOL_VERSION_NUMBER);
    payload.put_slice(b"database\0orders\0\0");
    let raw = RawMessage::new(STARTUP_MESSAGE_KIND, payload);
    assert_eq!(StartupMessage::unpack(&raw), Err(Error::ClientBadStartup));

    let mut payload = BytesMut::new();
    payload.put_i32(PROTOCOL_VERSION_NUMBER);
    payload.put_slice(b"user\0alice\0\0");
    let raw = RawMessage::new(STARTUP_MESSAGE_KIND, payload);
    assert_eq!(StartupMessage::unpack(&raw), Err(Error::ClientBadStartup));
}

#[test]
fn query_message_round_trip() {
    let message = QueryMessage::new("SELECT 1");
    let packed = message.pack();
    assert_eq!(packed[0], b'Q');

    let raw = RawMessage::unpack(&packed).unwrap();
    assert_eq!(QueryMessage::unpack(&raw).unwrap(), message);
}

#[test]
fn terminate_is_five_bytes() {
    let packed = Terminate.pack();
    assert_eq!(&packed[..], &[b'X', 0, 0, 0, 4]);
    let raw = RawMessage::unpack(&packed).unwrap();
    assert_eq!(Terminate::unpack(&raw).unwrap(), Terminate);
}

#[test]
fn cancel_request_round_trip() {
    let message = CancelRequest::new(42, 43);
    let packed = message.pack();
    assert_eq!(packed.len(), 16);
    let (_, length) = parse_i32(&packed, 0).unwrap();
    assert_eq!(length, 16);
    let (_, code) = parse_i32(&packed, 4).unwrap();
    assert_eq!(code, CANCEL_REQUEST_CODE);

    let raw = RawMessage {
        kind: CANCEL_MESSAGE_KIND,
        length: 16,
        payload: BytesMut::from(&packed[4..]),
    };
    assert_eq!(CancelRequest::unpack(&raw).unwrap(), message);
}

#[test]
fn cancel_request_rejects_wrong_code() {
    let mut payload = BytesMut::new();
    payload.put_i32(SSL_REQUEST_CODE);
    payload.put_i32(1);
    payload.put_i32(2);
    let raw = RawMessage {
        kind: CANCEL_MESSAGE_KIND,
        length: 16,
        payload,
    };
    assert!(CancelRequest::unpack(&raw).is_err());
}

#[test]
fn password_message_round_trip() {
    let message = PasswordMessage::new(b"md5abcdef\0".to_vec());
    let raw = RawMessage::unpack(&message.pack()).unwrap();
    assert_eq!(PasswordMessage::unpack(&raw).unwrap(), message);
}

#[test]
fn sasl_messages_round_trip() {
    let initial = SASLInitialResponse::new("SCRAM-SHA-256", b"n,,n=,r=abc".to_vec());
    let raw = RawMessage::unpack(&initial.pack()).unwrap();
    assert_eq!(SASLInitialResponse::unpack(&raw).unwrap(), initial);

    let response = SASLResponse::new(b"c=biws,r=abc,p=proof".to_vec());
    let raw = RawMessage::unpack(&response.pack()).unwrap();
    assert_eq!(SASLResponse::unpack(&raw).unwrap(), response);
}

#[test]
fn authentication_request_round_trips() {
    let cases = vec![
        AuthenticationRequest::Ok,
        AuthenticationRequest::Md5Password { salt: [1, 2, 3, 4] },
        AuthenticationRequest::Sasl {
            mechanisms: vec!["SCRAM-SHA-256".to_string(), "SCRAM-SHA-256-PLUS".to_string()],
        },
        AuthenticationRequest::SaslContinue {
            data: b"r=nonce,s=salt,i=4096".to_vec(),
        },
        AuthenticationRequest::SaslFinal {
            data: b"v=signature".to_vec(),
        },
    ];
    for case in cases {
        let raw = RawMessage::unpack(&case.pack()).unwrap();
        assert_eq!(AuthenticationRequest::unpack(&raw).unwrap(), case);
    }
}

#[test]
fn authentication_request_rejects_unknown_discriminant() {
    let mut payload = BytesMut::new();
    payload.put_i32(7); // GSSAPI, unsupported
    let raw = RawMessage::new(b'R' as i32, payload);
    assert!(AuthenticationRequest::unpack(&raw).is_err());
}

#[test]
fn parameter_status_round_trip() {
    let message = ParameterStatus::new("TimeZone", "UTC");
    let raw = RawMessage::unpack(&message.pack()).unwrap();
    assert_eq!(ParameterStatus::unpack(&raw).unwrap(), message);
}

#[test]
fn backend_key_data_round_trip() {
    let message = BackendKeyData::new(1234, -99);
    let packed = message.pack();
    assert_eq!(packed.len(), 13);
    let raw = RawMessage::unpack(&packed).unwrap();
    assert_eq!(BackendKeyData::unpack(&raw).unwrap(), message);
}

#[test]
fn ready_for_query_round_trip() {
    let message = ReadyForQuery::idle();
    let packed = message.pack();
    assert_eq!(&packed[..], &[b'Z', 0, 0, 0, 5, b'I']);
    let raw = RawMessage::unpack(&packed).unwrap();
    assert_eq!(ReadyForQuery::unpack(&raw).unwrap(), message);
}

#[test]
fn command_complete_round_trip() {
    let message = CommandComplete::new("SELECT 1");
    let raw = RawMessage::unpack(&message.pack()).unwrap();
    assert_eq!(CommandComplete::unpack(&raw).unwrap(), message);
}

#[test]
fn no_data_round_trip() {
    let packed = NoData.pack();
    assert_eq!(&packed[..], &[b'n', 0, 0, 0, 4]);
    let raw = RawMessage::unpack(&packed).unwrap();
    assert_eq!(NoData::unpack(&raw).unwrap(), NoData);
}

#[test]
fn row_description_round_trip() {
    let message = RowDescription {
        fields: vec![
            FieldDescription::text("?column?", 23, 4),
            FieldDescription {
                name: "name".to_string(),
                table_oid: 16384,
                column_attr: 2,
                type_oid: 25,
                type_size: -1,
                type_modifier: -1,
                format: 0,
            },
        ],
    };
    let raw = RawMessage::unpack(&message.pack()).unwrap();
    assert_eq!(RowDescription::unpack(&raw).unwrap(), message);
}

#[test]
fn data_row_round_trip_with_nulls() {
    let message = DataRow {
        values: vec![Some(b"1".to_vec()), None, Some(Vec::new())],
    };
    let raw = RawMessage::unpack(&message.pack()).unwrap();
    assert_eq!(DataRow::unpack(&raw).unwrap(), message);
}

#[test]
fn error_response_round_trip() {
    let response = ErrorResponse::connection_error(
        "Failed to open connection to cluster 10.0.0.1:5432 for database orders",
        "connection refused",
        "08000",
        "handle_query",
    );
    let packed = response.pack();
    assert_eq!(packed[0], b'E');

    let raw = RawMessage::unpack(&packed).unwrap();
    assert_eq!(ErrorResponse::unpack(&raw).unwrap(), response);
}

#[test]
fn error_response_fatal_fields() {
    let response = ErrorResponse::fatal("08000", "Database nope not found");
    assert_eq!(response.get(error::SEVERITY_LOCALIZED), Some("FATAL"));
    assert_eq!(response.get(error::SEVERITY), Some("FATAL"));
    assert_eq!(response.get(error::CODE), Some("08000"));
    assert_eq!(response.get(error::MESSAGE), Some("Database nope not found"));
}

#[test]
fn error_response_display() {
    let mut response = ErrorResponse::fatal("08000", "boom");
    assert_eq!(response.to_string(), "boom");
    response.set(error::DETAIL, "the wires are crossed");
    assert_eq!(response.to_string(), "boom: the wires are crossed");
}

#[test]
fn error_response_field_mapping_is_fixed() {
    for (kind, name) in [
        (b'S', error::SEVERITY_LOCALIZED),
        (b'V', error::SEVERITY),
        (b'C', error::CODE),
        (b'M', error::MESSAGE),
        (b'D', error::DETAIL),
        (b'H', error::HINT),
        (b'P', error::POSITION),
        (b'p', error::INTERNAL_POSITION),
        (b'q', error::INTERNAL_QUERY),
        (b'W', error::WHERE_CONTEXT),
        (b's', error::SCHEMA_NAME),
        (b't', error::TABLE_NAME),
        (b'c', error::COLUMN_NAME),
        (b'd', error::DATA_TYPE_NAME),
        (b'n', error::CONSTRAINT_NAME),
        (b'F', error::FILE_NAME),
        (b'L', error::LINE),
        (b'R', error::ROUTINE),
    ] {
        assert_eq!(error::field_name(kind), Some(name));
        assert_eq!(error::field_kind(name), Some(kind));
    }
    assert_eq!(error::field_name(b'Z'), None);
}

#[test]
fn error_response_unpack_skips_unknown_fields() {
    let mut payload = BytesMut::new();
    payload.put_u8(b'M');
    payload.put_slice(b"boom\0");
    payload.put_u8(b'Y'); // not a known field byte
    payload.put_slice(b"ignored\0");
    payload.put_u8(0);

    let response = ErrorResponse::parse_fields(&payload).unwrap();
    assert_eq!(response.message(), "boom");
    assert_eq!(response.get(error::HINT), None);
}

#[test]
fn error_response_without_terminator_fails() {
    let mut payload = BytesMut::new();
    payload.put_u8(b'M');
    payload.put_slice(b"boom\0");
    assert!(ErrorResponse::parse_fields(&payload).is_err());
}

#[tokio::test]
async fn read_message_frames_one_message() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    let packed = QueryMessage::new("SELECT 1").pack();
    client.write_all(&packed).await.unwrap();

    let message = read_message(&mut server).await.unwrap();
    assert_eq!(message.kind, b'Q' as i32);
    assert_eq!(message.payload.len() as i32, message.length - 4);
    assert_eq!(message.pack(), packed);
}

#[tokio::test]
async fn read_message_recognizes_out_of_band_cancel() {
    let (mut client, mut server) = tokio::io::duplex(64);
    client
        .write_all(&CancelRequest::new(7, 8).pack())
        .await
        .unwrap();

    let message = read_message(&mut server).await.unwrap();
    assert_eq!(message.kind, CANCEL_MESSAGE_KIND);
    assert_eq!(message.length, 16);
    assert_eq!(CancelRequest::unpack(&message).unwrap(), CancelRequest::new(7, 8));
}

#[tokio::test]
async fn read_message_rejects_tiny_lengths() {
    let (mut client, mut server) = tokio::io::duplex(64);
    client.write_all(&[b'Q', 0, 0, 0, 2]).await.unwrap();
    assert!(read_message(&mut server).await.is_err());
}

#[tokio::test]
async fn startup_reader_branches_on_length() {
    // A plain startup.
    let (mut client, mut server) = tokio::io::duplex(1024);
    let startup = StartupMessage::new("alice", "orders").pack();
    client.write_all(&startup).await.unwrap();

    let message = read_startup_message(&mut server).await.unwrap();
    assert_eq!(message.kind, STARTUP_MESSAGE_KIND);
    assert_eq!(
        StartupMessage::unpack(&message).unwrap(),
        StartupMessage::new("alice", "orders")
    );

    // A cancel.
    let (mut client, mut server) = tokio::io::duplex(1024);
    client
        .write_all(&CancelRequest::new(11, 12).pack())
        .await
        .unwrap();
    let message = read_startup_message(&mut server).await.unwrap();
    assert_eq!(message.kind, CANCEL_MESSAGE_KIND);
    assert_eq!(
        CancelRequest::unpack(&message).unwrap(),
        CancelRequest::new(11, 12)
    );
}

#[tokio::test]
async fn ssl_request_gets_n_then_startup_proceeds() {
    let (mut client, mut server) = tokio::io::duplex(1024);

    let reader = tokio::spawn(async move {
        let message = read_startup_message(&mut server).await.unwrap();
        StartupMessage::unpack(&message).unwrap()
    });

    // SSLRequest: length 8, then the magic code.
    let mut ssl_request = BytesMut::new();
    ssl_request.put_i32(8);
    ssl_request.put_i32(SSL_REQUEST_CODE);
    client.write_all(&ssl_request).await.unwrap();

    // The proxy answers with a single 'N'.
    let mut answer = [0u8; 1];
    client.read_exact(&mut answer).await.unwrap();
    assert_eq!(answer[0], b'N');

    // The client then re-sends a real startup on the same socket.
    client
        .write_all(&StartupMessage::new("alice", "orders").pack())
        .await
        .unwrap();

    let startup = reader.await.unwrap();
    assert_eq!(startup.user, "alice");
    assert_eq!(startup.database, "orders");
}

#[tokio::test]
async fn framing_survives_arbitrary_write_boundaries() {
    let (mut client, mut server) = tokio::io::duplex(1024);

    let reader = tokio::spawn(async move {
        let startup = read_startup_message(&mut server).await.unwrap();
        let startup = StartupMessage::unpack(&startup).unwrap();
        let query = read_message(&mut server).await.unwrap();
        let query = QueryMessage::unpack(&query).unwrap();
        (startup, query)
    });

    let mut bytes = BytesMut::new();
    bytes.put(StartupMessage::new("alice", "orders").pack());
    bytes.put(QueryMessage::new("SELECT count(*) FROM widgets").pack());

    // Split the byte stream at awkward offsets, straddling both the
    // startup/typed boundary and the query's own header.
    let cuts = [3usize, bytes.len() - 11];
    let mut start = 0;
    for cut in cuts {
        client.write_all(&bytes[start..cut]).await.unwrap();
        client.flush().await.unwrap();
        tokio::task::yield_now().await;
        start = cut;
    }
    client.write_all(&bytes[start..]).await.unwrap();

    let (startup, query) = reader.await.unwrap();
    assert_eq!(startup.user, "alice");
    assert_eq!(query.query, "SELECT count(*) FROM widgets");
}

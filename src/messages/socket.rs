// Framed reads and writes over the raw streams. One message, one
// RawMessage; the startup channel has its own length-first framing.

// External crate imports
use bytes::{BufMut, BytesMut};
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

// Internal crate imports
use crate::constants::{CANCEL_MESSAGE_KIND, SSL_REQUEST_CODE, STARTUP_MESSAGE_KIND};
use crate::errors::Error;
use crate::messages::protocol::RawMessage;

pub const MAX_MESSAGE_SIZE: i32 = 256 * 1024 * 1024;

// The first five bytes of a CancelRequest seen through typed-message
// framing: length 16 followed by the high byte of the request code.
const CANCEL_HEADER_CODE: u8 = 0;
const CANCEL_HEADER_LENGTH: i32 = 0x0000_1004;

/// Write all data in the buffer to the stream.
pub async fn write_all<S>(stream: &mut S, buf: &[u8]) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    match stream.write_all(buf).await {
        Ok(_) => Ok(()),
        Err(err) => Err(Error::SocketError(format!(
            "Error writing to socket: {err:?}"
        ))),
    }
}

/// Write all data in the buffer to the stream and flush it.
pub async fn write_all_flush<S>(stream: &mut S, buf: &[u8]) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    match stream.write_all(buf).await {
        Ok(_) => match stream.flush().await {
            Ok(_) => Ok(()),
            Err(err) => Err(Error::SocketError(format!(
                "Error flushing socket: {err:?}"
            ))),
        },
        Err(err) => Err(Error::SocketError(format!(
            "Error writing to socket: {err:?}"
        ))),
    }
}

/// Read a message header: type byte plus declared length.
pub async fn read_message_header<S>(stream: &mut S) -> Result<(u8, i32), Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let code = match stream.read_u8().await {
        Ok(code) => code,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Error reading message code from socket: {err:?}"
            )))
        }
    };
    let len = match stream.read_i32().await {
        Ok(len) => len,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Error reading message len from socket - Code: {code:?}, Error: {err:?}"
            )))
        }
    };

    Ok((code, len))
}

async fn read_payload<S>(stream: &mut S, code: u8, len: i32) -> Result<BytesMut, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    if len < 4 {
        return Err(Error::ProtocolSyncError(format!(
            "Message length is too small: {len}"
        )));
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::ProtocolSyncError(format!(
            "Message length is too large: {len}"
        )));
    }

    let mut payload = vec![0u8; len as usize - 4];
    match stream.read_exact(&mut payload).await {
        Ok(_) => Ok(BytesMut::from(&payload[..])),
        Err(err) => Err(Error::SocketError(format!(
            "Error reading message data from socket - Code: {code:?}, Error: {err:?}"
        ))),
    }
}

/// Read one typed message: peek the 5-byte header, then the payload.
/// An out-of-band CancelRequest (untyped, but recognizable by its fixed
/// header) is returned with the cancel sentinel kind.
pub async fn read_message<S>(stream: &mut S) -> Result<RawMessage, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let (code, len) = read_message_header(stream).await?;

    if code == CANCEL_HEADER_CODE && len == CANCEL_HEADER_LENGTH {
        // 11 bytes remain of the 16-byte packet; the first five carried the
        // length and the leading code byte.
        let mut rest = [0u8; 11];
        if let Err(err) = stream.read_exact(&mut rest).await {
            return Err(Error::SocketError(format!(
                "Error reading cancel request from socket: {err:?}"
            )));
        }
        let mut payload = BytesMut::with_capacity(12);
        payload.put_u8(0x04);
        payload.put_slice(&rest);
        return Ok(RawMessage {
            kind: CANCEL_MESSAGE_KIND,
            length: 16,
            payload,
        });
    }

    let payload = read_payload(stream, code, len).await?;
    Ok(RawMessage {
        kind: code as i32,
        length: len,
        payload,
    })
}

/// Read one startup-channel message. The length leads; 8 means SSLRequest
/// (refused with a single 'N', after which the client re-sends a real
/// startup on the same socket), 16 means CancelRequest, anything else is a
/// StartupMessage.
pub async fn read_startup_message<S>(stream: &mut S) -> Result<RawMessage, Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + std::marker::Unpin,
{
    loop {
        let len = match stream.read_i32().await {
            Ok(len) => len,
            Err(_) => return Err(Error::ClientBadStartup),
        };

        if len == 8 {
            let code = match stream.read_i32().await {
                Ok(code) => code,
                Err(_) => return Err(Error::ClientBadStartup),
            };
            if code != SSL_REQUEST_CODE {
                return Err(Error::ProtocolSyncError(format!(
                    "unexpected startup code: {code}"
                )));
            }
            debug!("SSL request received, refusing");
            write_all_flush(stream, b"N").await?;
            continue;
        }

        if len == 16 {
            let payload = read_payload(stream, 0, len).await?;
            return Ok(RawMessage {
                kind: CANCEL_MESSAGE_KIND,
                length: 16,
                payload,
            });
        }

        let payload = read_payload(stream, 0, len).await?;
        return Ok(RawMessage {
            kind: STARTUP_MESSAGE_KIND,
            length: len,
            payload,
        });
    }
}

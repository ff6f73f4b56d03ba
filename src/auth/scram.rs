// Client-side SCRAM-SHA-256 (RFC 5802 / RFC 7677) as PostgreSQL speaks it.
// Channel binding is not negotiated (the GS2 header is always `n,,`) and
// SASLprep is a no-op: the password passes through verbatim.

use base64::engine::general_purpose;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::constants::NONCE_RAW_LENGTH;
use crate::errors::Error;

type HmacSha = Hmac<Sha256>;

const SHA256_BLOCK_SIZE: usize = 32;

// base64("n,,"), the channel-binding input echoed in the client-final
// message.
const CHANNEL_BINDING_ENCODED: &str = "biws";

enum ScramState {
    AwaitingServerFirst,
    AwaitingServerFinal { server_signature: String },
    Done,
}

/// One SCRAM exchange against an upstream server: `message()` is the
/// initial response, `update()` turns the server-first challenge into the
/// proof-carrying client-final message, `finish()` verifies the server
/// signature.
pub struct ScramSha256 {
    password: Vec<u8>,
    client_nonce: String,
    client_first_bare: String,
    message: Vec<u8>,
    state: ScramState,
}

impl ScramSha256 {
    pub fn new(password: &str) -> ScramSha256 {
        Self::with_nonce(password, generate_nonce())
    }

    /// Tests inject the nonce to make the whole exchange deterministic.
    pub fn with_nonce(password: &str, client_nonce: String) -> ScramSha256 {
        let client_first_bare = format!("n=,r={client_nonce}");
        let message = format!("n,,{client_first_bare}").into_bytes();

        ScramSha256 {
            password: password.as_bytes().to_vec(),
            client_nonce,
            client_first_bare,
            message,
            state: ScramState::AwaitingServerFirst,
        }
    }

    /// The message to send for the current state.
    pub fn message(&self) -> &[u8] {
        &self.message
    }

    /// Consume the server-first challenge and produce the client-final
    /// message with the proof.
    pub fn update(&mut self, server_first: &[u8]) -> Result<Vec<u8>, Error> {
        if !matches!(self.state, ScramState::AwaitingServerFirst) {
            return Err(Error::ScramClientError(
                "unexpected SCRAM challenge".to_string(),
            ));
        }

        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| Error::ScramClientError("server first message is not utf-8".to_string()))?
            .to_string();

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            match part.split_once('=') {
                Some(("r", value)) => nonce = Some(value.to_string()),
                Some(("s", value)) => salt = Some(value.to_string()),
                Some(("i", value)) => iterations = Some(value.to_string()),
                _ => (),
            }
        }

        let nonce =
            nonce.ok_or_else(|| Error::ScramClientError("challenge without nonce".to_string()))?;
        let salt =
            salt.ok_or_else(|| Error::ScramClientError("challenge without salt".to_string()))?;
        let iterations = iterations
            .ok_or_else(|| Error::ScramClientError("challenge without iterations".to_string()))?;

        if !nonce.starts_with(&self.client_nonce) {
            return Err(Error::ScramClientError("server nonce mismatch".to_string()));
        }
        let salt = general_purpose::STANDARD
            .decode(&salt)
            .map_err(|_| Error::ScramClientError("salt is not valid base64".to_string()))?;
        let iterations: u32 = iterations
            .parse()
            .map_err(|_| Error::ScramClientError("bad iteration count".to_string()))?;
        if iterations == 0 {
            return Err(Error::ScramClientError("bad iteration count".to_string()));
        }

        let salted_password = hi(&self.password, &salt, iterations);

        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);

        let client_final_without_proof = format!("c={CHANNEL_BINDING_ENCODED},r={nonce}");

        // AuthMessage = client-first-bare , server-first , client-final-without-proof
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let mut client_proof = client_key;
        for (proof, signature) in client_proof.iter_mut().zip(client_signature.iter()) {
            *proof ^= signature;
        }

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        let server_signature =
            general_purpose::STANDARD.encode(hmac_sha256(&server_key, auth_message.as_bytes()));

        self.message = format!(
            "{client_final_without_proof},p={}",
            general_purpose::STANDARD.encode(client_proof)
        )
        .into_bytes();
        self.state = ScramState::AwaitingServerFinal { server_signature };

        Ok(self.message.clone())
    }

    /// Consume the SASL-final data: `e=` is a server-reported failure, `v=`
    /// must match the expected signature byte for byte.
    pub fn finish(&mut self, server_final: &[u8]) -> Result<(), Error> {
        let expected = match &self.state {
            ScramState::AwaitingServerFinal { server_signature } => server_signature.clone(),
            _ => {
                return Err(Error::ScramClientError(
                    "unexpected SCRAM final message".to_string(),
                ))
            }
        };

        let server_final = std::str::from_utf8(server_final).map_err(|_| {
            Error::ScramServerError("server final message is not utf-8".to_string())
        })?;

        if let Some(error) = server_final.strip_prefix("e=") {
            return Err(Error::ScramServerError(error.to_string()));
        }
        let signature = server_final.strip_prefix("v=").ok_or_else(|| {
            Error::ScramServerError("server final message without signature".to_string())
        })?;

        if signature != expected {
            return Err(Error::ScramServerError(
                "server signature mismatch".to_string(),
            ));
        }

        self.state = ScramState::Done;
        Ok(())
    }
}

fn generate_nonce() -> String {
    let raw = rand::rng().random::<[u8; NONCE_RAW_LENGTH]>();
    general_purpose::STANDARD.encode(raw)
}

/// Hi(password, salt, i): U1 = HMAC(password, salt || INT(1)),
/// Un = HMAC(password, Un-1), result = U1 ^ U2 ^ ... ^ Ui.
pub(crate) fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; SHA256_BLOCK_SIZE] {
    let mut mac = HmacSha::new_from_slice(password).unwrap();
    mac.update(salt);
    mac.update(&[0, 0, 0, 1]);

    let mut prev: [u8; SHA256_BLOCK_SIZE] = mac.finalize().into_bytes().into();
    let mut result = prev;

    for _ in 1..iterations {
        let mut mac = HmacSha::new_from_slice(password).unwrap();
        mac.update(&prev);
        prev = mac.finalize().into_bytes().into();
        for (out, next) in result.iter_mut().zip(prev.iter()) {
            *out ^= next;
        }
    }

    result
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; SHA256_BLOCK_SIZE] {
    let mut mac = HmacSha::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().into()
}

pub(crate) fn sha256(data: &[u8]) -> [u8; SHA256_BLOCK_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::NONCE_LENGTH;

    const CLIENT_NONCE: &str = "C4KQWksX6Hr693gst2i+4ET5";
    const SERVER_FIRST: &str =
        "r=C4KQWksX6Hr693gst2i+4ET5C0dywTDp77Sa5H1DrXzlYGNN,s=NqkjGpyJLsb2TRd/vhu8pg==,i=4096";

    const SALTED_PASSWORD: [u8; 32] = [
        254, 117, 22, 22, 156, 185, 210, 138, 143, 61, 153, 127, 109, 112, 179, 150, 145, 62, 147,
        130, 75, 222, 71, 204, 16, 39, 144, 234, 110, 103, 22, 29,
    ];

    #[test]
    fn generated_nonce_is_24_ascii_chars() {
        let scram = ScramSha256::new("root");
        let message = std::str::from_utf8(scram.message()).unwrap();
        let nonce = message.strip_prefix("n,,n=,r=").unwrap();
        assert_eq!(nonce.len(), NONCE_LENGTH);
        assert!(nonce.is_ascii());
    }

    #[test]
    fn client_first_message_layout() {
        let scram = ScramSha256::with_nonce("root", CLIENT_NONCE.to_string());
        assert_eq!(
            scram.message(),
            format!("n,,n=,r={CLIENT_NONCE}").as_bytes()
        );
    }

    #[test]
    fn salted_password_matches_vector() {
        let salt = general_purpose::STANDARD
            .decode("NqkjGpyJLsb2TRd/vhu8pg==")
            .unwrap();
        assert_eq!(hi(b"root", &salt, 4096), SALTED_PASSWORD);
    }

    #[test]
    fn client_final_message_matches_vector() {
        let mut scram = ScramSha256::with_nonce("root", CLIENT_NONCE.to_string());
        let client_final = scram.update(SERVER_FIRST.as_bytes()).unwrap();
        let expected = "c=biws,r=C4KQWksX6Hr693gst2i+4ET5C0dywTDp77Sa5H1DrXzlYGNN,\
                        p=oiDCklV4A+KVNGngoJUMXjEwlkrm0md+7gJ81sjrs84=";
        assert_eq!(client_final, expected.as_bytes());
    }

    #[test]
    fn server_signature_matches_vector() {
        let mut scram = ScramSha256::with_nonce("root", CLIENT_NONCE.to_string());
        scram.update(SERVER_FIRST.as_bytes()).unwrap();
        scram
            .finish(b"v=c6BaPXTCrNU+cq37GaucEsrnDMjZcWqcdGmnQd/lwaA=")
            .unwrap();
    }

    #[test]
    fn mismatched_server_signature_is_fatal() {
        let mut scram = ScramSha256::with_nonce("root", CLIENT_NONCE.to_string());
        scram.update(SERVER_FIRST.as_bytes()).unwrap();
        let result = scram.finish(b"v=AAAAPXTCrNU+cq37GaucEsrnDMjZcWqcdGmnQd/lwaA=");
        assert_eq!(
            result,
            Err(Error::ScramServerError(
                "server signature mismatch".to_string()
            ))
        );
    }

    #[test]
    fn server_reported_error_is_fatal() {
        let mut scram = ScramSha256::with_nonce("root", CLIENT_NONCE.to_string());
        scram.update(SERVER_FIRST.as_bytes()).unwrap();
        let result = scram.finish(b"e=other-error");
        assert_eq!(
            result,
            Err(Error::ScramServerError("other-error".to_string()))
        );
    }

    #[test]
    fn foreign_server_nonce_is_rejected() {
        let mut scram = ScramSha256::with_nonce("root", CLIENT_NONCE.to_string());
        let challenge = "r=QQQQWksX6Hr693gst2i+4ET5C0dywTDp,s=NqkjGpyJLsb2TRd/vhu8pg==,i=4096";
        let result = scram.update(challenge.as_bytes());
        assert_eq!(
            result,
            Err(Error::ScramClientError("server nonce mismatch".to_string()))
        );
    }

    #[test]
    fn zero_iterations_is_rejected() {
        let mut scram = ScramSha256::with_nonce("root", CLIENT_NONCE.to_string());
        let challenge = format!(
            "r={CLIENT_NONCE}C0dywTDp77Sa5H1DrXzlYGNN,s=NqkjGpyJLsb2TRd/vhu8pg==,i=0"
        );
        assert!(scram.update(challenge.as_bytes()).is_err());
    }
}

// Upstream authentication helpers: MD5 password derivation and SASL
// mechanism selection. The SCRAM exchange itself lives in `scram`.

pub mod scram;

pub use scram::ScramSha256;

use md5::{Digest, Md5};

use crate::constants::SCRAM_SHA_256;
use crate::errors::Error;

/// The mechanisms this proxy can speak, in preference order.
pub const SUPPORTED_SASL_MECHANISMS: &[&str] = &[SCRAM_SHA_256];

/// Intersect the server's offered mechanism list with ours; the first
/// match wins.
pub fn select_sasl_mechanism(offered: &[String]) -> Result<&'static str, Error> {
    for mechanism in offered {
        if let Some(supported) = SUPPORTED_SASL_MECHANISMS
            .iter()
            .find(|supported| *supported == mechanism)
        {
            return Ok(supported);
        }
    }
    Err(Error::AuthError("no common SASL mechanism".to_string()))
}

/// Create the md5 password hash given a salt:
/// "md5" || hex(md5(hex(md5(password || user)) || salt)), NUL-terminated
/// the way the PasswordMessage body carries it.
pub fn md5_password(user: &str, password: &str, salt: &[u8]) -> Vec<u8> {
    let mut md5 = Md5::new();

    // First pass
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());

    let output = md5.finalize_reset();

    // Second pass
    md5_hash_second_pass(&format!("{output:x}"), salt)
}

pub fn md5_hash_second_pass(hash: &str, salt: &[u8]) -> Vec<u8> {
    let mut md5 = Md5::new();
    md5.update(hash);
    md5.update(salt);

    let mut password = format!("md5{:x}", md5.finalize()).into_bytes();
    password.push(0);

    password
}

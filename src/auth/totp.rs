//! RFC 6238 time-based one-time passwords (HMAC-SHA1, 30 s step, 6 digits)

use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

pub const STEP_SECS: u64 = 30;
pub const DIGITS: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TotpError {
    #[error("OTP secret is empty")]
    EmptySecret,
    #[error("OTP secret is not valid base32 (unexpected {0:?})")]
    InvalidCharacter(char),
    #[error("OTP secret cannot be used as an HMAC key")]
    InvalidKey,
}

/// A decoded shared secret
#[derive(Clone)]
pub struct Totp {
    key: Vec<u8>,
}

impl fmt::Debug for Totp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Totp").field("key", &"<redacted>").finish()
    }
}

impl Totp {
    /// Parses a base32 secret as shown by authenticator enrollment pages.
    /// Case, spaces, dashes and `=` padding are ignored.
    pub fn from_base32(secret: &str) -> Result<Self, TotpError> {
        let key = decode_base32(secret)?;
        if key.is_empty() {
            return Err(TotpError::EmptySecret);
        }
        Ok(Self { key })
    }

    pub fn code_for_step(&self, step: u64) -> Result<String, TotpError> {
        let mut mac = HmacSha1::new_from_slice(&self.key).map_err(|_| TotpError::InvalidKey)?;
        mac.update(&step.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        let offset = usize::from(digest[digest.len() - 1] & 0x0f);
        let binary = u32::from_be_bytes([
            digest[offset] & 0x7f,
            digest[offset + 1],
            digest[offset + 2],
            digest[offset + 3],
        ]);
        let code = binary % 10u32.pow(DIGITS);
        Ok(format!("{code:0width$}", width = DIGITS as usize))
    }
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

/// Time step the wall clock is in now
pub fn current_step() -> u64 {
    unix_now() / STEP_SECS
}

/// Time left until `step` begins (zero if it already has)
pub fn until_step(step: u64) -> Duration {
    let start = step.saturating_mul(STEP_SECS);
    Duration::from_secs(start.saturating_sub(unix_now()))
}

#[allow(clippy::cast_possible_truncation)]
fn decode_base32(secret: &str) -> Result<Vec<u8>, TotpError> {
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    let mut out = Vec::with_capacity(secret.len() * 5 / 8);

    for c in secret.chars() {
        if c.is_whitespace() || c == '-' || c == '=' {
            continue;
        }
        let value = match c.to_ascii_uppercase() {
            upper @ 'A'..='Z' => u32::from(upper) - u32::from('A'),
            digit @ '2'..='7' => u32::from(digit) - u32::from('2') + 26,
            _ => return Err(TotpError::InvalidCharacter(c)),
        };
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((buffer >> bits) & 0xff) as u8);
            buffer &= (1 << bits) - 1;
        }
    }
    Ok(out)
}

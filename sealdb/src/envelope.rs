//! Envelope wire format for stored ciphertext.
//!
//! Outer envelope, fixed byte order, no padding:
//!
//! ```text
//! [flag:1][key_id_len:1][key_id:N][nonce:24][ciphertext+tag:M]
//! ```
//!
//! The outer key id lets a reader pick the key without decrypting. It is not
//! authenticated by itself, so the same key id is repeated inside the
//! encrypted payload:
//!
//! ```text
//! [key_id_len:1][key_id:N][payload]
//! ```
//!
//! After decryption the two must agree; a difference means the header was
//! rewritten to steer decryption toward another key.

use crate::compression::CompressionAlgorithm;
use crate::error::Error;

/// XSalsa20 nonce size (192 bits).
pub const NONCE_SIZE: usize = 24;

/// Longest key id the one-byte length prefix can carry.
pub const MAX_KEY_ID_LEN: usize = 255;

/// Smallest well-formed envelope: flag, length, 1-byte key id, nonce, 1 ciphertext byte.
pub const MIN_ENVELOPE_LEN: usize = 1 + 1 + 1 + NONCE_SIZE + 1;

/// Smallest well-formed inner payload: length and a 1-byte key id.
pub const MIN_INNER_LEN: usize = 2;

/// Checks that a key id fits the one-byte length prefix.
///
/// # Errors
///
/// Returns `Error::InvalidKeyId` if the id is empty or longer than 255 bytes.
pub fn validate_key_id(key_id: &str) -> Result<(), Error> {
    if key_id.is_empty() {
        return Err(Error::InvalidKeyId("key id is empty".to_string()));
    }
    if key_id.len() > MAX_KEY_ID_LEN {
        return Err(Error::InvalidKeyId(format!(
            "key id too long: {} bytes (max: {MAX_KEY_ID_LEN})",
            key_id.len()
        )));
    }
    Ok(())
}

/// Parsed outer envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    flag: u8,
    key_id: String,
    nonce: [u8; NONCE_SIZE],
    ciphertext: Vec<u8>,
}

impl Envelope {
    /// Creates a new envelope.
    #[must_use]
    pub fn new(
        compression: CompressionAlgorithm,
        key_id: impl Into<String>,
        nonce: [u8; NONCE_SIZE],
        ciphertext: Vec<u8>,
    ) -> Self {
        Self { flag: compression.as_u8(), key_id: key_id.into(), nonce, ciphertext }
    }

    /// Returns the raw flag byte.
    #[must_use]
    pub const fn flag(&self) -> u8 {
        self.flag
    }

    /// Returns the key id the envelope claims to be encrypted under.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Returns the nonce.
    #[must_use]
    pub const fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }

    /// Returns the authenticated ciphertext, tag included.
    #[must_use]
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Consumes the envelope, returning the ciphertext.
    #[must_use]
    pub fn into_ciphertext(self) -> Vec<u8> {
        self.ciphertext
    }

    /// Serializes the envelope to bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKeyId` if the key id does not fit the length prefix,
    /// or `Error::InvalidFormat` if the ciphertext is empty.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        validate_key_id(&self.key_id)?;
        if self.ciphertext.is_empty() {
            return Err(Error::InvalidFormat("empty ciphertext".to_string()));
        }

        let mut bytes =
            Vec::with_capacity(2 + self.key_id.len() + NONCE_SIZE + self.ciphertext.len());
        bytes.push(self.flag);
        // Safe cast: validated above (max 255)
        #[allow(clippy::cast_possible_truncation)]
        bytes.push(self.key_id.len() as u8);
        bytes.extend_from_slice(self.key_id.as_bytes());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);

        Ok(bytes)
    }

    /// Deserializes an envelope from bytes.
    ///
    /// The flag byte is carried through unchecked; it is interpreted when
    /// the payload is decompressed.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidFormat` if the data is shorter than
    /// [`MIN_ENVELOPE_LEN`], the key id length is zero, the key id is not
    /// UTF-8, or the remainder cannot hold a nonce and one ciphertext byte.
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        let (key_id, rest) = split_header(data)?;

        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes.copy_from_slice(nonce);

        Ok(Self {
            flag: data[0],
            key_id: key_id.to_string(),
            nonce: nonce_bytes,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// Reads the outer key id without copying the ciphertext.
///
/// Applies the same validation as [`Envelope::from_bytes`].
///
/// # Errors
///
/// Returns `Error::InvalidFormat` for malformed envelopes.
pub fn peek_key_id(data: &[u8]) -> Result<&str, Error> {
    split_header(data).map(|(key_id, _)| key_id)
}

/// Splits an envelope into its key id and the `nonce || ciphertext` remainder.
fn split_header(data: &[u8]) -> Result<(&str, &[u8]), Error> {
    if data.len() < MIN_ENVELOPE_LEN {
        return Err(Error::InvalidFormat(format!(
            "envelope too short: {} bytes (min: {MIN_ENVELOPE_LEN})",
            data.len()
        )));
    }

    let key_id_len = data[1] as usize;
    if key_id_len == 0 {
        return Err(Error::InvalidFormat("zero-length key id".to_string()));
    }

    let body = &data[2..];
    if body.len() < key_id_len + NONCE_SIZE + 1 {
        return Err(Error::InvalidFormat("envelope truncated".to_string()));
    }

    let (key_id, rest) = body.split_at(key_id_len);
    let key_id = std::str::from_utf8(key_id)
        .map_err(|e| Error::InvalidFormat(format!("key id is not UTF-8: {e}")))?;

    Ok((key_id, rest))
}

/// Pre-encryption payload binding the plaintext to its key id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerPlaintext {
    key_id: Vec<u8>,
    payload: Vec<u8>,
}

impl InnerPlaintext {
    /// Serializes `key_id` and `payload` into the inner format.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKeyId` if the key id does not fit the length prefix.
    pub fn encode(key_id: &str, payload: &[u8]) -> Result<Vec<u8>, Error> {
        validate_key_id(key_id)?;

        let mut bytes = Vec::with_capacity(1 + key_id.len() + payload.len());
        // Safe cast: validated above (max 255)
        #[allow(clippy::cast_possible_truncation)]
        bytes.push(key_id.len() as u8);
        bytes.extend_from_slice(key_id.as_bytes());
        bytes.extend_from_slice(payload);
        Ok(bytes)
    }

    /// Parses decrypted bytes, reusing the buffer for the payload.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidFormat` if the data is shorter than
    /// [`MIN_INNER_LEN`], the key id length is zero, or the key id is truncated.
    pub fn decode(mut data: Vec<u8>) -> Result<Self, Error> {
        if data.len() < MIN_INNER_LEN {
            return Err(Error::InvalidFormat(format!(
                "inner payload too short: {} bytes (min: {MIN_INNER_LEN})",
                data.len()
            )));
        }

        let key_id_len = data[0] as usize;
        if key_id_len == 0 {
            return Err(Error::InvalidFormat("zero-length inner key id".to_string()));
        }
        if data.len() < 1 + key_id_len {
            return Err(Error::InvalidFormat("inner key id truncated".to_string()));
        }

        let payload = data.split_off(1 + key_id_len);
        data.remove(0);

        Ok(Self { key_id: data, payload })
    }

    /// Returns the authenticated key id bytes.
    #[must_use]
    pub fn key_id(&self) -> &[u8] {
        &self.key_id
    }

    /// Consumes the inner payload, returning the plaintext.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

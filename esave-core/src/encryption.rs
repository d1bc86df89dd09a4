/*!
Encryption adapters for save file content.

A save file is encrypted as a single blob: the whole serialized JSON document
goes through the cipher on save and comes back out on load. AES is used in CBC
mode with PKCS#7 padding. There is no authentication tag, so this provides
confidentiality only; a tampered file is detected only if it fails to decrypt
or to parse afterwards.

Keys and IVs travel as text inside [`SaveFileDescriptor`](crate::SaveFileDescriptor).
[`encode_token`] produces base64. How stored text turns back into bytes is
recorded as a [`KeyEncoding`]: base64, the raw ASCII bytes of the text (the
legacy passphrase form), or [`KeyEncoding::Auto`] for descriptors written
before the encoding was recorded, which falls back to [`decode_token`].
*/

use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Result, SaveError};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcEnc = cbc::Encryptor<aes::Aes192>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block size, which is also the IV length.
pub const AES_IV_LEN: usize = 16;

/// Encryption abstraction for save file content
///
/// The save file hands the fully serialized document to the adapter and
/// writes whatever comes back, so implementations operate on whole files.
pub trait CipherAdapter: Send + Sync {
    /// Encrypt a serialized save file
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt the bytes read from disk
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Get the name of the encryption algorithm
    fn algorithm_name(&self) -> &str;
}

/// Supported AES key sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeySize {
    Aes128,
    Aes192,
    #[default]
    Aes256,
}

impl KeySize {
    /// Key length in bytes
    pub fn byte_len(self) -> usize {
        match self {
            KeySize::Aes128 => 16,
            KeySize::Aes192 => 24,
            KeySize::Aes256 => 32,
        }
    }

    /// Key size for a given key length in bytes, if AES supports it
    pub fn from_byte_len(len: usize) -> Option<Self> {
        match len {
            16 => Some(KeySize::Aes128),
            24 => Some(KeySize::Aes192),
            32 => Some(KeySize::Aes256),
            _ => None,
        }
    }

    /// Key size from a bit count (128, 192 or 256)
    pub fn from_bits(bits: u32) -> Option<Self> {
        Self::from_byte_len(bits as usize / 8).filter(|_| bits % 8 == 0)
    }
}

/// How AES key and IV text is turned into bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyEncoding {
    /// Base64 when it decodes to an AES length, ASCII otherwise
    #[default]
    Auto,
    Base64,
    /// The ASCII bytes of the text itself
    Ascii,
}

impl KeyEncoding {
    /// Decode key or IV text
    pub fn decode(self, token: &str) -> Result<Vec<u8>> {
        match self {
            KeyEncoding::Auto => Ok(decode_token(token)),
            KeyEncoding::Base64 => STANDARD
                .decode(token.trim())
                .map_err(|e| SaveError::encryption(format!("Key material is not base64: {e}"))),
            KeyEncoding::Ascii => {
                if !token.is_ascii() {
                    return Err(SaveError::encryption("Key material is not ASCII"));
                }
                Ok(token.as_bytes().to_vec())
            }
        }
    }
}

/// AES-CBC cipher with a fixed key and IV
///
/// # Example
/// ```rust
/// use esave_core::encryption::{generate_iv, generate_key, AesCipher, CipherAdapter, KeySize};
///
/// let cipher = AesCipher::new(generate_key(KeySize::Aes256), generate_iv())?;
/// let encrypted = cipher.encrypt(b"{\"score\":42}")?;
/// assert_eq!(cipher.decrypt(&encrypted)?, b"{\"score\":42}");
/// # Ok::<(), esave_core::SaveError>(())
/// ```
#[derive(Clone)]
pub struct AesCipher {
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl AesCipher {
    /// Create a cipher from raw key and IV bytes
    ///
    /// The key must be 16, 24 or 32 bytes long and the IV 16 bytes.
    pub fn new(key: Vec<u8>, iv: Vec<u8>) -> Result<Self> {
        if KeySize::from_byte_len(key.len()).is_none() {
            return Err(SaveError::encryption(format!(
                "AES key must be 16, 24 or 32 bytes, got {}",
                key.len()
            )));
        }
        if iv.len() != AES_IV_LEN {
            return Err(SaveError::encryption(format!(
                "AES IV must be {AES_IV_LEN} bytes, got {}",
                iv.len()
            )));
        }
        Ok(Self { key, iv })
    }

    /// Create a cipher from the textual key and IV stored in a descriptor
    pub fn from_tokens(key: &str, iv: &str, encoding: KeyEncoding) -> Result<Self> {
        Self::new(encoding.decode(key)?, encoding.decode(iv)?)
    }

    /// The key size this cipher runs with
    pub fn key_size(&self) -> KeySize {
        // Length is checked in `new`.
        KeySize::from_byte_len(self.key.len()).unwrap_or_default()
    }
}

impl std::fmt::Debug for AesCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesCipher")
            .field("key_size", &self.key_size())
            .finish_non_exhaustive()
    }
}

impl CipherAdapter for AesCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        aes_encrypt(plaintext, &self.key, &self.iv)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        aes_decrypt(ciphertext, &self.key, &self.iv)
    }

    fn algorithm_name(&self) -> &str {
        match self.key_size() {
            KeySize::Aes128 => "aes-128-cbc",
            KeySize::Aes192 => "aes-192-cbc",
            KeySize::Aes256 => "aes-256-cbc",
        }
    }
}

/// Pass-through adapter for unencrypted save files
#[derive(Debug, Clone, Default)]
pub struct NoEncryption;

impl NoEncryption {
    pub fn new() -> Self {
        Self
    }
}

impl CipherAdapter for NoEncryption {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }

    fn algorithm_name(&self) -> &str {
        "none"
    }
}

/// Encrypt `plaintext` with AES-CBC, choosing AES-128/192/256 from the key length
pub fn aes_encrypt(plaintext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    let invalid = |e: cbc::cipher::InvalidLength| {
        SaveError::encryption(format!("Invalid AES key or IV: {e}"))
    };

    let ciphertext = match KeySize::from_byte_len(key.len()) {
        Some(KeySize::Aes128) => Aes128CbcEnc::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        Some(KeySize::Aes192) => Aes192CbcEnc::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        Some(KeySize::Aes256) => Aes256CbcEnc::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        None => {
            return Err(SaveError::encryption(format!(
                "Unsupported AES key length: {} bytes",
                key.len()
            )))
        }
    };

    Ok(ciphertext)
}

/// Decrypt AES-CBC `ciphertext`; a wrong key or IV almost always fails the padding check
pub fn aes_decrypt(ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    let invalid = |e: cbc::cipher::InvalidLength| {
        SaveError::encryption(format!("Invalid AES key or IV: {e}"))
    };
    let unpad = |e: cbc::cipher::block_padding::UnpadError| {
        SaveError::encryption(format!("Failed to decrypt save data: {e}"))
    };

    match KeySize::from_byte_len(key.len()) {
        Some(KeySize::Aes128) => Aes128CbcDec::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(unpad),
        Some(KeySize::Aes192) => Aes192CbcDec::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(unpad),
        Some(KeySize::Aes256) => Aes256CbcDec::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(unpad),
        None => Err(SaveError::encryption(format!(
            "Unsupported AES key length: {} bytes",
            key.len()
        ))),
    }
}

/// Generate a random AES key from the OS RNG
pub fn generate_key(size: KeySize) -> Vec<u8> {
    let mut key = vec![0u8; size.byte_len()];
    OsRng.fill_bytes(&mut key);
    key
}

/// Generate a random AES IV from the OS RNG
pub fn generate_iv() -> Vec<u8> {
    let mut iv = vec![0u8; AES_IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Encode key material as text for storage in a descriptor
pub fn encode_token(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode key material stored as text without a recorded encoding
///
/// Base64 is used when it decodes to a valid AES key or IV length. Anything
/// else is taken as the ASCII bytes of the text itself, which is how keys
/// typed in by hand (e.g. a 16-character passphrase) were stored. A
/// 32-character alphanumeric passphrase is also valid base64, so legacy
/// material should be decoded with [`KeyEncoding::Ascii`] instead.
pub fn decode_token(token: &str) -> Vec<u8> {
    match STANDARD.decode(token.trim()) {
        Ok(bytes) if KeySize::from_byte_len(bytes.len()).is_some() => bytes,
        _ => token.as_bytes().to_vec(),
    }
}

/// Generate a random alphanumeric token
///
/// The token is the base64 form of a v4 UUID with `=`, `+` and `/` stripped,
/// truncated to `max_len` characters when given.
pub fn generate_random_token(max_len: Option<usize>) -> String {
    let token: String = STANDARD
        .encode(Uuid::new_v4().as_bytes())
        .chars()
        .filter(|c| !matches!(c, '=' | '+' | '/'))
        .collect();

    match max_len {
        Some(max) if token.len() > max => token[..max].to_string(),
        _ => token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAINTEXT: &str = r#"{"score":{"$type":"i32","value":42}}"#;

    #[test]
    fn test_aes_roundtrip_all_key_sizes() {
        for size in [KeySize::Aes128, KeySize::Aes192, KeySize::Aes256] {
            let key = generate_key(size);
            let iv = generate_iv();

            let encrypted = aes_encrypt(PLAINTEXT.as_bytes(), &key, &iv).unwrap();
            assert_ne!(encrypted, PLAINTEXT.as_bytes());
            assert_eq!(encrypted.len() % 16, 0);

            let decrypted = aes_decrypt(&encrypted, &key, &iv).unwrap();
            assert_eq!(decrypted, PLAINTEXT.as_bytes());
        }
    }

    #[test]
    fn test_wrong_key_does_not_return_plaintext() {
        let key = generate_key(KeySize::Aes256);
        let iv = generate_iv();
        let encrypted = aes_encrypt(PLAINTEXT.as_bytes(), &key, &iv).unwrap();

        let wrong_key = generate_key(KeySize::Aes256);
        match aes_decrypt(&encrypted, &wrong_key, &iv) {
            Ok(bytes) => assert_ne!(bytes, PLAINTEXT.as_bytes()),
            Err(e) => assert!(matches!(e, SaveError::Encryption(_))),
        }
    }

    #[test]
    fn test_wrong_iv_does_not_return_plaintext() {
        let key = generate_key(KeySize::Aes128);
        let iv = generate_iv();
        let encrypted = aes_encrypt(PLAINTEXT.as_bytes(), &key, &iv).unwrap();

        let mut wrong_iv = iv.clone();
        wrong_iv[0] ^= 0xff;
        let result = aes_decrypt(&encrypted, &key, &wrong_iv);
        assert!(!matches!(result, Ok(ref bytes) if bytes == PLAINTEXT.as_bytes()));
    }

    #[test]
    fn test_same_key_and_iv_is_deterministic() {
        let cipher = AesCipher::new(generate_key(KeySize::Aes192), generate_iv()).unwrap();
        let first = cipher.encrypt(PLAINTEXT.as_bytes()).unwrap();
        let second = cipher.encrypt(PLAINTEXT.as_bytes()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_key_length_rejected() {
        assert!(AesCipher::new(vec![0u8; 10], generate_iv()).is_err());
        assert!(AesCipher::new(generate_key(KeySize::Aes128), vec![0u8; 8]).is_err());
        assert!(aes_encrypt(b"data", &[1, 2, 3], &generate_iv()).is_err());
    }

    #[test]
    fn test_token_roundtrip_base64() {
        let key = generate_key(KeySize::Aes256);
        let token = encode_token(&key);
        assert_eq!(decode_token(&token), key);

        let iv = generate_iv();
        assert_eq!(decode_token(&encode_token(&iv)), iv);
    }

    #[test]
    fn test_token_ascii_fallback() {
        // 16 ASCII characters; base64-decodes to 12 bytes, which is not an AES length
        let legacy = "0123456789abcdef";
        assert_eq!(decode_token(legacy), legacy.as_bytes());

        let cipher =
            AesCipher::from_tokens(legacy, "fedcba9876543210", KeyEncoding::Auto).unwrap();
        assert_eq!(cipher.key_size(), KeySize::Aes128);
    }

    #[test]
    fn test_recorded_encoding_resolves_ambiguous_key() {
        // Alphanumeric, so it is also valid base64 for 24 bytes
        let passphrase = "abcdefghijklmnopqrstuvwxyz012345";
        assert_eq!(decode_token(passphrase).len(), 24);

        assert_eq!(
            KeyEncoding::Ascii.decode(passphrase).unwrap(),
            passphrase.as_bytes()
        );
        let cipher =
            AesCipher::from_tokens(passphrase, "abcdef9876543210", KeyEncoding::Ascii).unwrap();
        assert_eq!(cipher.key_size(), KeySize::Aes256);
    }

    #[test]
    fn test_base64_encoding_is_strict() {
        let key = generate_key(KeySize::Aes128);
        assert_eq!(KeyEncoding::Base64.decode(&encode_token(&key)).unwrap(), key);
        assert!(KeyEncoding::Base64.decode("legacy-passphrase").is_err());
        assert!(KeyEncoding::Ascii.decode("schlüssel").is_err());
    }


    #[test]
    fn test_key_size_from_bits() {
        assert_eq!(KeySize::from_bits(128), Some(KeySize::Aes128));
        assert_eq!(KeySize::from_bits(192), Some(KeySize::Aes192));
        assert_eq!(KeySize::from_bits(256), Some(KeySize::Aes256));
        assert_eq!(KeySize::from_bits(512), None);
    }

    #[test]
    fn test_random_token() {
        let token = generate_random_token(None);
        assert!(!token.is_empty());
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));

        let short = generate_random_token(Some(8));
        assert_eq!(short.len(), 8);
        assert_ne!(generate_random_token(None), token);
    }

    #[test]
    fn test_no_encryption_passthrough() {
        let cipher = NoEncryption::new();
        let data = cipher.encrypt(PLAINTEXT.as_bytes()).unwrap();
        assert_eq!(data, PLAINTEXT.as_bytes());
        assert_eq!(cipher.decrypt(&data).unwrap(), PLAINTEXT.as_bytes());
        assert_eq!(cipher.algorithm_name(), "none");
    }

    #[test]
    fn test_algorithm_name() {
        let cipher = AesCipher::new(generate_key(KeySize::Aes128), generate_iv()).unwrap();
        assert_eq!(cipher.algorithm_name(), "aes-128-cbc");
    }
}

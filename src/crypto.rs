//! Encryption and decryption for the link.
//!
//! - Key transport: `SessionKey || TagBlock` under AES-128-ECB, unauthenticated.
//! - Data: AES-128-CBC with a fresh random IV per message and PKCS#7 padding,
//!   applied to the `msg` field only.

use aes::{Aes128, Block};
use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use rand::RngCore;

use crate::envelope::DataFrame;
use crate::ratchet::MessageKeyDeriver;
use crate::types::{
    Key, LinkError, Result, SessionKey, WrappingKey, BLOCK_SIZE, KEY_SIZE, TAG_BLOCK_SIZE,
    WRAPPED_KEY_SIZE,
};

type Aes128EcbEnc = ecb::Encryptor<Aes128>;
type Aes128EcbDec = ecb::Decryptor<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

fn check_block_multiple(data: &[u8]) -> Result<()> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(LinkError::MalformedFrame(format!(
            "ciphertext length {} is not a multiple of {}",
            data.len(),
            BLOCK_SIZE
        )));
    }
    Ok(())
}

/// AES-128-ECB encryption of whole blocks.
pub fn ecb_encrypt(key: &Key, data: &[u8]) -> Result<Vec<u8>> {
    check_block_multiple(data)?;
    Ok(Aes128EcbEnc::new(key.into()).encrypt_padded_vec_mut::<NoPadding>(data))
}

/// AES-128-ECB decryption of whole blocks.
pub fn ecb_decrypt(key: &Key, data: &[u8]) -> Result<Vec<u8>> {
    check_block_multiple(data)?;
    Aes128EcbDec::new(key.into())
        .decrypt_padded_vec_mut::<NoPadding>(data)
        .map_err(|_| LinkError::MalformedFrame("ECB input is not whole blocks".into()))
}

/// Wraps a session key for transport: `ECB(K, session_key || tag)`.
pub fn wrap_session_key(
    wrapping_key: &WrappingKey,
    session_key: &SessionKey,
    tag: &[u8; TAG_BLOCK_SIZE],
) -> [u8; WRAPPED_KEY_SIZE] {
    let mut blocks = [Block::clone_from_slice(session_key), Block::clone_from_slice(tag)];
    Aes128EcbEnc::new(wrapping_key.into()).encrypt_blocks_mut(&mut blocks);
    let mut out = [0u8; WRAPPED_KEY_SIZE];
    out[..KEY_SIZE].copy_from_slice(&blocks[0]);
    out[KEY_SIZE..].copy_from_slice(&blocks[1]);
    out
}

/// Attempts to unwrap with one candidate key.
///
/// Returns the session key when the trailing block decrypts to `tag`. The tag
/// is the only acceptance test; there is no MAC.
pub fn unwrap_session_key(
    wrapping_key: &WrappingKey,
    wrapped: &[u8; WRAPPED_KEY_SIZE],
    tag: &[u8; TAG_BLOCK_SIZE],
) -> Option<SessionKey> {
    let mut cipher = Aes128EcbDec::new(wrapping_key.into());
    let mut tag_block = Block::clone_from_slice(&wrapped[KEY_SIZE..]);
    cipher.decrypt_block_mut(&mut tag_block);
    if tag_block.as_slice() != tag {
        return None;
    }
    let mut key_block = Block::clone_from_slice(&wrapped[..KEY_SIZE]);
    cipher.decrypt_block_mut(&mut key_block);
    let mut session_key = [0u8; KEY_SIZE];
    session_key.copy_from_slice(&key_block);
    Some(session_key)
}

/// AES-128-CBC with PKCS#7 padding (always adds 1..=16 bytes).
pub fn cbc_encrypt(key: &Key, iv: &[u8; BLOCK_SIZE], plaintext: &[u8]) -> Vec<u8> {
    Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// AES-128-CBC decryption followed by PKCS#7 validation.
pub fn cbc_decrypt(key: &Key, iv: &[u8; BLOCK_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() {
        return Err(LinkError::PaddingError);
    }
    check_block_multiple(ciphertext)?;
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| LinkError::PaddingError)
}

/// Generate a fresh random IV.
pub fn generate_iv<R: RngCore + ?Sized>(rng: &mut R) -> [u8; BLOCK_SIZE] {
    let mut iv = [0u8; BLOCK_SIZE];
    rng.fill_bytes(&mut iv);
    iv
}

/// Encrypt an application message into a data frame.
///
/// # Arguments
/// * `deriver` - Message-key deriver for the session
/// * `counter` - Sender's message counter (cleartext on the wire)
/// * `plaintext` - Message text
/// * `t_ms` - Sender tick count at send time
/// * `slot` - Hop slot used for the transmission, if hopping
pub fn encrypt_message<R: RngCore + ?Sized>(
    deriver: &MessageKeyDeriver,
    counter: u32,
    plaintext: &str,
    t_ms: u32,
    slot: Option<u32>,
    rng: &mut R,
) -> DataFrame {
    let key = deriver.message_key(counter);
    let iv = generate_iv(rng);
    let ciphertext = cbc_encrypt(&key, &iv, plaintext.as_bytes());
    DataFrame {
        iv,
        ciphertext,
        counter,
        t_ms,
        slot,
    }
}

/// Decrypt the `msg` field of a data frame.
pub fn decrypt_message(deriver: &MessageKeyDeriver, frame: &DataFrame) -> Result<String> {
    let key = deriver.message_key(frame.counter);
    let plaintext = cbc_decrypt(&key, &frame.iv, &frame.ciphertext)?;
    String::from_utf8(plaintext)
        .map_err(|e| LinkError::MalformedFrame(format!("plaintext is not UTF-8: {}", e)))
}

//! ECIES over SECP384R1, bit-compatible with the key-injection client.
//!
//! Wire format:
//!
//! ```text
//! ephemeral_pubkey(97, uncompressed SEC1) ||
//! nonce(12) ||
//! AES-256-GCM ciphertext+tag(|plaintext| + 16) ||
//! HMAC-SHA256(32)
//! ```
//!
//! Both symmetric keys come from HKDF-SHA256 over the ECDH shared secret
//! (empty salt) with infos `ecies-aes-key` and `ecies-hmac-key`. The HMAC
//! covers everything before it and is verified before AES-GCM runs.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p384::elliptic_curve::sec1::ToEncodedPoint;
use p384::{ecdh, PublicKey, SecretKey};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

const EPHEMERAL_LEN: usize = 97;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HMAC_LEN: usize = 32;
const MIN_LEN: usize = EPHEMERAL_LEN + NONCE_LEN + TAG_LEN + HMAC_LEN;

const AES_KEY_INFO: &[u8] = b"ecies-aes-key";
const HMAC_KEY_INFO: &[u8] = b"ecies-hmac-key";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EciesError {
	#[error("ciphertext too short: need at least {MIN_LEN} bytes, got {0}")]
	TooShort(usize),

	#[error("invalid public key: {0}")]
	InvalidPublicKey(String),

	#[error("hmac verification failed")]
	HmacMismatch,

	#[error("aes-gcm decryption failed")]
	DecryptFailed,
}

fn derive_keys(shared_secret: &[u8]) -> ([u8; 32], [u8; 32]) {
	let kdf = Hkdf::<Sha256>::new(None, shared_secret);
	let mut aes_key = [0u8; 32];
	let mut hmac_key = [0u8; 32];
	kdf.expand(AES_KEY_INFO, &mut aes_key).expect("32 bytes is a valid hkdf length");
	kdf.expand(HMAC_KEY_INFO, &mut hmac_key).expect("32 bytes is a valid hkdf length");
	(aes_key, hmac_key)
}

pub fn decrypt(secret: &SecretKey, data: &[u8]) -> Result<Vec<u8>, EciesError> {
	if data.len() < MIN_LEN {
		return Err(EciesError::TooShort(data.len()));
	}

	let ephemeral_bytes = &data[..EPHEMERAL_LEN];
	let nonce = &data[EPHEMERAL_LEN..EPHEMERAL_LEN + NONCE_LEN];
	let ciphertext = &data[EPHEMERAL_LEN + NONCE_LEN..data.len() - HMAC_LEN];
	let hmac_tag = &data[data.len() - HMAC_LEN..];

	let ephemeral = PublicKey::from_sec1_bytes(ephemeral_bytes)
		.map_err(|e| EciesError::InvalidPublicKey(e.to_string()))?;

	let shared = ecdh::diffie_hellman(secret.to_nonzero_scalar(), ephemeral.as_affine());
	let (aes_key, hmac_key) = derive_keys(shared.raw_secret_bytes());

	// Authenticate before touching the AEAD.
	let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&hmac_key)
		.expect("hmac accepts any key length");
	mac.update(&data[..data.len() - HMAC_LEN]);
	mac.verify_slice(hmac_tag).map_err(|_| EciesError::HmacMismatch)?;

	Aes256Gcm::new_from_slice(&aes_key)
		.expect("derived key is 32 bytes")
		.decrypt(Nonce::from_slice(nonce), ciphertext)
		.map_err(|_| EciesError::DecryptFailed)
}

/// Encrypts to an uncompressed-hex SECP384R1 public key. The backend only
/// decrypts; this is the client half, kept here so the scheme round-trips
/// under test and so local tooling can drive key injection.
pub fn encrypt(recipient_public_key_hex: &str, plaintext: &[u8]) -> Result<Vec<u8>, EciesError> {
	let recipient_bytes = hex::decode(recipient_public_key_hex)
		.map_err(|e| EciesError::InvalidPublicKey(e.to_string()))?;
	if recipient_bytes.len() != EPHEMERAL_LEN || recipient_bytes[0] != 0x04 {
		return Err(EciesError::InvalidPublicKey(
			"expected 97 uncompressed SEC1 bytes".to_string(),
		));
	}
	let recipient = PublicKey::from_sec1_bytes(&recipient_bytes)
		.map_err(|e| EciesError::InvalidPublicKey(e.to_string()))?;

	let ephemeral_secret = SecretKey::random(&mut rand::rngs::OsRng);
	let ephemeral_bytes = ephemeral_secret.public_key().to_encoded_point(false);

	let shared =
		ecdh::diffie_hellman(ephemeral_secret.to_nonzero_scalar(), recipient.as_affine());
	let (aes_key, hmac_key) = derive_keys(shared.raw_secret_bytes());

	let mut nonce = [0u8; NONCE_LEN];
	rand::rngs::OsRng.fill_bytes(&mut nonce);

	let ciphertext = Aes256Gcm::new_from_slice(&aes_key)
		.expect("derived key is 32 bytes")
		.encrypt(Nonce::from_slice(&nonce), plaintext)
		.map_err(|_| EciesError::DecryptFailed)?;

	let mut out =
		Vec::with_capacity(EPHEMERAL_LEN + NONCE_LEN + ciphertext.len() + HMAC_LEN);
	out.extend_from_slice(ephemeral_bytes.as_bytes());
	out.extend_from_slice(&nonce);
	out.extend_from_slice(&ciphertext);

	let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&hmac_key)
		.expect("hmac accepts any key length");
	mac.update(&out);
	out.extend_from_slice(&mac.finalize().into_bytes());

	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::enclave::EnclaveKeyPair;

	#[test]
	fn round_trips_arbitrary_plaintexts() {
		let keypair = EnclaveKeyPair::generate();
		for plaintext in [
			b"".as_slice(),
			b"0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".as_slice(),
			&[0u8; 1024],
		] {
			let encrypted = encrypt(&keypair.public_key_hex(), plaintext).unwrap();
			assert_eq!(keypair.decrypt(&encrypted).unwrap(), plaintext);
		}
	}

	#[test]
	fn wire_layout_has_expected_length() {
		let keypair = EnclaveKeyPair::generate();
		let encrypted = encrypt(&keypair.public_key_hex(), b"secret").unwrap();
		assert_eq!(encrypted.len(), MIN_LEN + b"secret".len());
		assert_eq!(encrypted[0], 0x04);
	}

	#[test]
	fn tampered_ciphertext_fails_hmac_not_gcm() {
		let keypair = EnclaveKeyPair::generate();
		let encrypted = encrypt(&keypair.public_key_hex(), b"secret").unwrap();

		// Flip one byte inside the AES ciphertext region.
		let mut tampered = encrypted.clone();
		tampered[EPHEMERAL_LEN + NONCE_LEN + 2] ^= 0x01;
		assert_eq!(keypair.decrypt(&tampered), Err(EciesError::HmacMismatch));

		// Flip one byte of the nonce.
		let mut tampered = encrypted.clone();
		tampered[EPHEMERAL_LEN + 1] ^= 0x01;
		assert_eq!(keypair.decrypt(&tampered), Err(EciesError::HmacMismatch));

		// Flip one byte of the trailing mac itself.
		let mut tampered = encrypted;
		let last = tampered.len() - 1;
		tampered[last] ^= 0x01;
		assert_eq!(keypair.decrypt(&tampered), Err(EciesError::HmacMismatch));
	}

	#[test]
	fn wrong_recipient_key_fails_authentication() {
		let intended = EnclaveKeyPair::generate();
		let other = EnclaveKeyPair::generate();
		let encrypted = encrypt(&intended.public_key_hex(), b"secret").unwrap();
		assert_eq!(
			decrypt(other.secret(), &encrypted),
			Err(EciesError::HmacMismatch)
		);
	}

	#[test]
	fn truncated_input_rejected_before_any_crypto() {
		let keypair = EnclaveKeyPair::generate();
		assert_eq!(
			keypair.decrypt(&[0u8; MIN_LEN - 1]),
			Err(EciesError::TooShort(MIN_LEN - 1))
		);
	}

	#[test]
	fn malformed_recipient_hex_rejected() {
		assert!(matches!(
			encrypt("04deadbeef", b"x"),
			Err(EciesError::InvalidPublicKey(_))
		));
		assert!(matches!(
			encrypt("zz", b"x"),
			Err(EciesError::InvalidPublicKey(_))
		));
	}
}

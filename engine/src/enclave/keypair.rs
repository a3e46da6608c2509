use p384::elliptic_curve::sec1::ToEncodedPoint;
use p384::pkcs8::{EncodePublicKey, LineEnding};
use p384::{PublicKey, SecretKey};
use tracing::info;

use crate::enclave::ecies::{self, EciesError};

/// SECP384R1 keypair generated at boot and held only in memory. Its public
/// half is what clients encrypt the operator private key against; the
/// private half never leaves the process.
pub struct EnclaveKeyPair {
	secret: SecretKey,
}

impl EnclaveKeyPair {
	pub fn generate() -> Self {
		let secret = SecretKey::random(&mut rand::rngs::OsRng);
		info!("generated enclave SECP384R1 keypair");
		Self { secret }
	}

	pub fn public_key(&self) -> PublicKey {
		self.secret.public_key()
	}

	/// Uncompressed SEC1 hex: `04 || X(48) || Y(48)`, 194 hex chars.
	pub fn public_key_hex(&self) -> String {
		hex::encode(self.public_key().to_encoded_point(false).as_bytes())
	}

	pub fn public_key_pem(&self) -> String {
		self.public_key()
			.to_public_key_pem(LineEnding::LF)
			.expect("a valid P-384 public key always encodes to PEM")
	}

	/// DER-encoded SubjectPublicKeyInfo, as embedded in attestation
	/// documents.
	pub fn public_key_der(&self) -> Vec<u8> {
		self.public_key()
			.to_public_key_der()
			.expect("a valid P-384 public key always encodes to DER")
			.as_bytes()
			.to_vec()
	}

	pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, EciesError> {
		ecies::decrypt(&self.secret, ciphertext)
	}

	#[cfg(test)]
	pub(crate) fn secret(&self) -> &SecretKey {
		&self.secret
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn public_key_hex_is_uncompressed_sec1() {
		let keypair = EnclaveKeyPair::generate();
		let hex = keypair.public_key_hex();
		assert_eq!(hex.len(), 194);
		assert!(hex.starts_with("04"));
	}

	#[test]
	fn pem_is_spki_formatted() {
		let keypair = EnclaveKeyPair::generate();
		let pem = keypair.public_key_pem();
		assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
		assert!(pem.trim_end().ends_with("-----END PUBLIC KEY-----"));
	}

	#[test]
	fn der_parses_back_to_the_same_key() {
		use p384::pkcs8::DecodePublicKey;
		let keypair = EnclaveKeyPair::generate();
		let der = keypair.public_key_der();
		let parsed = PublicKey::from_public_key_der(&der).unwrap();
		assert_eq!(parsed, keypair.public_key());
	}
}

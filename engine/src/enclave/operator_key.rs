//! Validation and one-shot installation of the operator private key.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use ethers::utils::to_checksum;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::enclave::EnclaveKeyPair;
use crate::eth::rpc::EthRpcApi;
use crate::eth::{ChainClientError, LotteryChainClient};

#[derive(Debug, Error)]
pub enum InstallError {
	#[error("operator key already set")]
	AlreadySet { operator_address: String },

	#[error("missing required field: encrypted_private_key")]
	MissingField,

	#[error("invalid base64 encoding: {0}")]
	BadBase64(String),

	#[error("failed to decrypt private key: {0}")]
	DecryptFailed(String),

	#[error("invalid private key format: {0}")]
	InvalidFormat(String),

	#[error("operator address not configured")]
	NotConfigured,

	#[error("derived address {derived} does not match expected {expected}")]
	Mismatch { expected: String, derived: String },
}

/// Expected format: `0x` followed by exactly 64 hex characters.
pub fn validate_key_format(private_key: &str) -> Result<(), String> {
	static KEY_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
	let re = KEY_RE
		.get_or_init(|| regex::Regex::new("^0x[0-9a-fA-F]{64}$").expect("static regex compiles"));

	if !private_key.starts_with("0x") {
		return Err("private key must start with '0x'".to_string());
	}
	if private_key.len() != 66 {
		return Err(format!(
			"private key must be 66 characters (0x + 64 hex), got {}",
			private_key.len()
		));
	}
	if !re.is_match(private_key) {
		return Err("private key must contain only hex characters after '0x'".to_string());
	}
	Ok(())
}

pub fn derive_address(private_key: &str) -> Result<Address, String> {
	private_key
		.trim_start_matches("0x")
		.parse::<LocalWallet>()
		.map(|wallet| wallet.address())
		.map_err(|e| format!("invalid private key: {e}"))
}

/// Decrypts, validates and installs the operator key. Succeeds at most once
/// per process lifetime; every failure before the final install leaves the
/// slot untouched so the caller can retry.
pub fn install_operator_key<R: EthRpcApi>(
	chain: &LotteryChainClient<R>,
	keypair: &EnclaveKeyPair,
	expected_address: &str,
	encrypted_private_key_b64: &str,
) -> Result<String, InstallError> {
	if let Some(address) = chain.operator_address() {
		warn!("operator key injection rejected: already installed");
		return Err(InstallError::AlreadySet { operator_address: to_checksum(&address, None) });
	}
	if encrypted_private_key_b64.is_empty() {
		return Err(InstallError::MissingField);
	}

	let encrypted = BASE64
		.decode(encrypted_private_key_b64)
		.map_err(|e| InstallError::BadBase64(e.to_string()))?;

	let mut plaintext = keypair
		.decrypt(&encrypted)
		.map_err(|e| InstallError::DecryptFailed(e.to_string()))?;
	let private_key = match String::from_utf8(plaintext.clone()) {
		Ok(key) => key.trim().to_string(),
		Err(e) => {
			plaintext.zeroize();
			return Err(InstallError::DecryptFailed(format!("not utf-8: {e}")));
		},
	};
	plaintext.zeroize();

	let result = (|| {
		validate_key_format(&private_key).map_err(InstallError::InvalidFormat)?;
		let derived = derive_address(&private_key).map_err(InstallError::InvalidFormat)?;

		if expected_address.is_empty() {
			return Err(InstallError::NotConfigured);
		}
		let expected: Address = expected_address
			.parse()
			.map_err(|_| InstallError::NotConfigured)?;
		if derived != expected {
			return Err(InstallError::Mismatch {
				expected: to_checksum(&expected, None),
				derived: to_checksum(&derived, None),
			});
		}

		let wallet: LocalWallet = private_key
			.trim_start_matches("0x")
			.parse()
			.map_err(|e| InstallError::InvalidFormat(format!("{e}")))?;
		chain.install_operator_wallet(wallet).map_err(|e| match e {
			ChainClientError::OperatorKeyAlreadySet =>
				InstallError::AlreadySet { operator_address: to_checksum(&derived, None) },
			other => InstallError::InvalidFormat(other.to_string()),
		})?;

		info!(operator = %to_checksum(&derived, None), "operator key validated and installed");
		Ok(to_checksum(&derived, None))
	})();

	let mut private_key = private_key;
	private_key.zeroize();
	result
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::enclave::ecies;
	use crate::eth::contract::LotteryContract;
	use crate::eth::rpc::MockEthRpcApi;

	// The well-known first dev-chain account.
	const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
	const DEV_ADDRESS: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

	fn chain() -> LotteryChainClient<MockEthRpcApi> {
		LotteryChainClient::from_parts(
			MockEthRpcApi::new(),
			LotteryContract::embedded(
				"0x5FbDB2315678afecb367f032d93F642f64180aa3".parse().unwrap(),
			)
			.unwrap(),
			"http://localhost:8545".to_string(),
			31337,
			1.15,
			None,
		)
	}

	fn encrypt_for(keypair: &EnclaveKeyPair, key: &str) -> String {
		BASE64.encode(ecies::encrypt(&keypair.public_key_hex(), key.as_bytes()).unwrap())
	}

	#[test]
	fn format_validation_rejects_bad_shapes() {
		assert!(validate_key_format(DEV_KEY).is_ok());
		assert!(validate_key_format("ac0974").is_err());
		assert!(validate_key_format(&DEV_KEY[..64]).is_err());
		assert!(validate_key_format(&format!("0x{}", "g".repeat(64))).is_err());
	}

	#[test]
	fn derives_the_known_dev_address() {
		let derived = derive_address(DEV_KEY).unwrap();
		assert_eq!(to_checksum(&derived, None), DEV_ADDRESS);
	}

	#[test]
	fn happy_path_installs_once_then_403s() {
		let chain = chain();
		let keypair = EnclaveKeyPair::generate();

		let installed = install_operator_key(
			&chain,
			&keypair,
			DEV_ADDRESS,
			&encrypt_for(&keypair, DEV_KEY),
		)
		.unwrap();
		assert_eq!(installed, DEV_ADDRESS);
		assert!(chain.has_operator_key());

		let second = install_operator_key(
			&chain,
			&keypair,
			DEV_ADDRESS,
			&encrypt_for(&keypair, DEV_KEY),
		);
		assert!(matches!(
			second,
			Err(InstallError::AlreadySet { operator_address }) if operator_address == DEV_ADDRESS
		));
	}

	#[test]
	fn mismatched_key_reports_both_addresses_and_allows_retry() {
		let chain = chain();
		let keypair = EnclaveKeyPair::generate();
		// A valid key that belongs to a different account.
		let other_key = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

		let result = install_operator_key(
			&chain,
			&keypair,
			DEV_ADDRESS,
			&encrypt_for(&keypair, other_key),
		);
		match result {
			Err(InstallError::Mismatch { expected, derived }) => {
				assert_eq!(expected, DEV_ADDRESS);
				assert_ne!(derived, expected);
			},
			other => panic!("expected mismatch, got {other:?}"),
		}
		assert!(!chain.has_operator_key());

		// Retry with the right key still succeeds.
		install_operator_key(&chain, &keypair, DEV_ADDRESS, &encrypt_for(&keypair, DEV_KEY))
			.unwrap();
	}

	#[test]
	fn bad_base64_and_bad_ciphertext_are_rejected() {
		let chain = chain();
		let keypair = EnclaveKeyPair::generate();

		assert!(matches!(
			install_operator_key(&chain, &keypair, DEV_ADDRESS, "!!not-base64!!"),
			Err(InstallError::BadBase64(_))
		));
		assert!(matches!(
			install_operator_key(
				&chain,
				&keypair,
				DEV_ADDRESS,
				&BASE64.encode([0u8; 200]),
			),
			Err(InstallError::DecryptFailed(_))
		));
		assert!(matches!(
			install_operator_key(&chain, &keypair, DEV_ADDRESS, ""),
			Err(InstallError::MissingField)
		));
	}

	#[test]
	fn decrypted_garbage_fails_format_validation() {
		let chain = chain();
		let keypair = EnclaveKeyPair::generate();
		let encrypted = encrypt_for(&keypair, "not a private key");
		assert!(matches!(
			install_operator_key(&chain, &keypair, DEV_ADDRESS, &encrypted),
			Err(InstallError::InvalidFormat(_))
		));
	}

	#[test]
	fn unconfigured_operator_address_is_surfaced() {
		let chain = chain();
		let keypair = EnclaveKeyPair::generate();
		assert!(matches!(
			install_operator_key(&chain, &keypair, "", &encrypt_for(&keypair, DEV_KEY)),
			Err(InstallError::NotConfigured)
		));
	}
}

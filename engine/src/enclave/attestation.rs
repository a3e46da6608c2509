//! Attestation document generation.
//!
//! A real deployment runs inside a hardware enclave whose security module
//! signs documents over our public key and identity. This seam keeps the
//! gateway agnostic: any [`Attestor`] produces the same response shape, and
//! the in-tree provider is the clearly-marked dummy used outside genuine
//! enclaves. Verifiers tell the two apart by `verified` and by whether
//! `certificate` is non-empty.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::enclave::EnclaveKeyPair;

/// Identity bound into every attestation document.
#[derive(Debug, Clone, Serialize)]
pub struct AttestationUserData {
	pub operator_address: Option<String>,
	pub tls_public_key_hex: String,
}

pub trait Attestor: Send + Sync {
	/// Produces the `/api/attestation` response body.
	fn document(&self, operator_address: Option<String>) -> Value;
}

pub struct DummyAttestor {
	keypair: Arc<EnclaveKeyPair>,
}

impl DummyAttestor {
	pub fn new(keypair: Arc<EnclaveKeyPair>) -> Self {
		Self { keypair }
	}
}

impl Attestor for DummyAttestor {
	fn document(&self, operator_address: Option<String>) -> Value {
		let user_data = AttestationUserData {
			operator_address,
			tls_public_key_hex: self.keypair.public_key_hex(),
		};
		let user_data_b64 = BASE64.encode(
			serde_json::to_vec(&user_data).expect("user data is plain strings"),
		);

		// PCRs 0..7, 48 zero bytes each.
		let mut pcrs = Map::new();
		for index in 0..8 {
			pcrs.insert(index.to_string(), Value::String("00".repeat(48)));
		}

		let timestamp = chrono::Utc::now().timestamp_millis();
		let document = json!({
			"module_id": "i-dummy-enclave-dev",
			"timestamp": timestamp,
			"digest": "SHA384",
			"pcrs": pcrs,
			"certificate": "",
			"cabundle": [],
			"public_key": BASE64.encode(self.keypair.public_key_der()),
			"user_data": user_data_b64,
			"nonce": null,
		});

		json!({
			"attestation_document": BASE64.encode(
				serde_json::to_vec(&document).expect("document is plain json"),
			),
			"pcrs": document["pcrs"],
			"user_data": user_data_b64,
			"timestamp": timestamp,
			"certificate": "",
			"cabundle": [],
			"verified": false,
			"note": "no attestation hardware available; dummy document for development",
		})
	}
}

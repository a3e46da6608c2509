//! Everything that only exists because this backend runs inside an enclave:
//! the in-memory SECP384R1 keypair, the ECIES channel used to inject the
//! operator private key, and attestation document generation.

pub mod attestation;
pub mod ecies;
pub mod keypair;
pub mod operator_key;

pub use attestation::{Attestor, DummyAttestor};
pub use keypair::EnclaveKeyPair;
pub use operator_key::InstallError;

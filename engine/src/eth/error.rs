use thiserror::Error;

/// Failure taxonomy for chain interactions. Callers decide whether to retry;
/// the client itself never does.
#[derive(Debug, Error)]
pub enum ChainClientError {
	#[error("cannot reach the EVM node: {0}")]
	Connection(String),

	#[error("chain client configuration error: {0}")]
	Config(String),

	#[error("no operator key installed")]
	NoOperatorKey,

	#[error("operator key already installed")]
	OperatorKeyAlreadySet,

	#[error("transaction reverted: {0}")]
	Revert(String),

	#[error("transaction underpriced: {0}")]
	Underpriced(String),

	#[error("nonce gap: {0}")]
	NonceGap(String),

	#[error("timed out waiting for {0}")]
	Timeout(String),

	#[error("abi decode error: {0}")]
	Decode(String),

	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

impl ChainClientError {
	/// Classifies a provider error by its message. Node implementations
	/// disagree on exact wording, so this matches the common substrings.
	pub fn classify_send_error(message: String) -> Self {
		let lower = message.to_lowercase();
		if lower.contains("revert") || lower.contains("execution reverted") {
			ChainClientError::Revert(message)
		} else if lower.contains("underpriced") || lower.contains("fee too low") {
			ChainClientError::Underpriced(message)
		} else if lower.contains("nonce") {
			ChainClientError::NonceGap(message)
		} else if lower.contains("timed out") || lower.contains("timeout") {
			ChainClientError::Timeout(message)
		} else {
			ChainClientError::Other(anyhow::anyhow!(message))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn send_errors_are_classified_by_kind() {
		assert!(matches!(
			ChainClientError::classify_send_error("execution reverted: not operator".into()),
			ChainClientError::Revert(_)
		));
		assert!(matches!(
			ChainClientError::classify_send_error("replacement transaction underpriced".into()),
			ChainClientError::Underpriced(_)
		));
		assert!(matches!(
			ChainClientError::classify_send_error("nonce too low".into()),
			ChainClientError::NonceGap(_)
		));
		assert!(matches!(
			ChainClientError::classify_send_error("request timed out".into()),
			ChainClientError::Timeout(_)
		));
		assert!(matches!(
			ChainClientError::classify_send_error("internal error".into()),
			ChainClientError::Other(_)
		));
	}
}

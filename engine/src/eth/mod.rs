//! Everything that talks to the EVM node lives under this module. No other
//! component issues RPC calls directly.

pub mod client;
pub mod contract;
pub mod error;
pub mod rpc;

use ethers::types::{Address, U256};

pub use client::{ChainEvent, LotteryChainApi, LotteryChainClient, TxReceiptSummary};
pub use error::ChainClientError;

/// Full lowercase `0x...` rendering of an address (40 hex chars, no EIP-55
/// casing). This is the canonical address form on every wire payload.
pub fn lower_hex_address(address: &Address) -> String {
	format!("0x{}", hex::encode(address.as_bytes()))
}

/// `0x996550...a4dc` style abbreviation used by feed messages.
pub fn shorten_address(address: &Address) -> String {
	let full = lower_hex_address(address);
	format!("{}...{}", &full[..8], &full[full.len() - 4..])
}

/// Renders a wei amount as ETH with exactly four fractional digits,
/// rounding half-up on the fifth.
pub fn format_eth(wei: U256) -> String {
	let one_eth = U256::exp10(18);
	let frac_unit = U256::exp10(14);

	let mut whole = wei / one_eth;
	let remainder = wei % one_eth;
	let mut frac = (remainder + frac_unit / 2) / frac_unit;
	if frac == U256::from(10_000u64) {
		whole += U256::one();
		frac = U256::zero();
	}
	format!("{}.{:04}", whole, frac.as_u64())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn shorten_matches_feed_format() {
		let address: Address = "0x9965507d1a55bcc2695c58ba16fb37d819b0a4dc".parse().unwrap();
		assert_eq!(shorten_address(&address), "0x996550...a4dc");
	}

	#[test]
	fn format_eth_four_fraction_digits() {
		assert_eq!(format_eth(U256::from(10_000_000_000_000_000u64)), "0.0100");
		assert_eq!(format_eth(U256::zero()), "0.0000");
		assert_eq!(format_eth(U256::exp10(18)), "1.0000");
		assert_eq!(format_eth(U256::from(1_500_000_000_000_000_000u64)), "1.5000");
		// Rounds half-up at the fifth digit.
		assert_eq!(format_eth(U256::from(123_450_000_000_000u64)), "0.0001");
		// Carry into the whole part.
		assert_eq!(format_eth(U256::from(999_960_000_000_000_000u64)), "1.0000");
	}

	#[test]
	fn lower_hex_is_full_width() {
		let address: Address = "0x0000000000000000000000000000000000000001".parse().unwrap();
		assert_eq!(lower_hex_address(&address), "0x0000000000000000000000000000000000000001");
	}
}

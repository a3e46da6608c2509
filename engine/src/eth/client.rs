//! High-level lottery chain client: typed view calls, event retrieval and
//! operator transactions. Sits on top of [`EthRpcApi`] so the node can be
//! mocked out in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use itertools::Itertools;
use ethers::{
	signers::{LocalWallet, Signer},
	types::{
		transaction::eip2718::TypedTransaction, Address, BlockNumber, Filter, TransactionRequest,
		TxHash, H256, U256,
	},
	utils::to_checksum,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::constants::{BLOCK_TIMESTAMP_CACHE_SIZE, RECEIPT_POLL_INTERVAL};
use crate::eth::{
	contract::LotteryContract,
	error::ChainClientError,
	lower_hex_address,
	rpc::{EthRpcApi, EthRpcClient},
};
use crate::settings;
use crate::store::models::{ContractConfig, LotteryRound, ParticipantSummary};

/// One decoded on-chain event, ready for the event manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEvent {
	pub name: String,
	pub args: Map<String, Value>,
	pub block_number: u64,
	pub transaction_hash: H256,
	pub log_index: U256,
	pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceiptSummary {
	pub transaction_hash: TxHash,
	pub status: u64,
	pub block_number: u64,
	pub gas_used: U256,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LotteryChainApi: Send + Sync + 'static {
	async fn get_contract_config(&self) -> Result<ContractConfig, ChainClientError>;

	async fn get_current_round(&self) -> Result<Option<LotteryRound>, ChainClientError>;

	async fn get_participant_summaries(
		&self,
		round_id: u64,
	) -> Result<Vec<ParticipantSummary>, ChainClientError>;

	/// Fetches and decodes watched logs from `from_block` to the tip,
	/// ordered by `(block_number, transaction_hash, log_index)`.
	async fn get_events(&self, from_block: u64) -> Result<Vec<ChainEvent>, ChainClientError>;

	/// Highest block seen carrying a decoded event. Non-decreasing.
	fn last_seen_block(&self) -> u64;

	async fn latest_block(&self) -> Result<u64, ChainClientError>;

	async fn draw_round(&self, round_id: u64) -> Result<TxHash, ChainClientError>;

	async fn refund_round(&self, round_id: u64) -> Result<TxHash, ChainClientError>;

	async fn wait_for_transaction(
		&self,
		tx_hash: TxHash,
		timeout: Duration,
	) -> Result<TxReceiptSummary, ChainClientError>;

	/// Diagnostic probe for `/api/health`. Never fails.
	async fn health_check(&self) -> Value;
}

pub struct LotteryChainClient<R: EthRpcApi = EthRpcClient> {
	rpc: R,
	contract: LotteryContract,
	rpc_url: String,
	chain_id: u64,
	gas_multiplier: f64,
	gas_price_override: Option<U256>,
	operator_wallet: OnceLock<LocalWallet>,
	last_seen_block: AtomicU64,
	block_timestamps: Mutex<HashMap<u64, u64>>,
}

impl LotteryChainClient<EthRpcClient> {
	pub fn new(settings: &settings::Blockchain) -> Result<Self, ChainClientError> {
		let address: Address = settings
			.contract_address
			.parse()
			.map_err(|e| ChainClientError::Config(format!("bad contract address: {e}")))?;

		let contract = match &settings.abi_path {
			Some(path) => LotteryContract::from_abi_path(address, path)?,
			None => LotteryContract::embedded(address)?,
		};

		let rpc = EthRpcClient::new(&settings.rpc_url)
			.map_err(|e| ChainClientError::Config(e.to_string()))?;

		Ok(Self::from_parts(
			rpc,
			contract,
			settings.rpc_url.clone(),
			settings.chain_id,
			settings.gas_multiplier,
			settings.gas_price.map(gwei_to_wei),
		))
	}
}

fn gwei_to_wei(gwei: f64) -> U256 {
	U256::from((gwei * 1e9) as u128)
}

impl<R: EthRpcApi> LotteryChainClient<R> {
	pub fn from_parts(
		rpc: R,
		contract: LotteryContract,
		rpc_url: String,
		chain_id: u64,
		gas_multiplier: f64,
		gas_price_override: Option<U256>,
	) -> Self {
		Self {
			rpc,
			contract,
			rpc_url,
			chain_id,
			gas_multiplier,
			gas_price_override,
			operator_wallet: OnceLock::new(),
			last_seen_block: AtomicU64::new(0),
			block_timestamps: Mutex::new(HashMap::new()),
		}
	}

	/// Probes node connectivity and verifies the chain id matches the
	/// configuration. Fatal at startup when it fails.
	pub async fn initialize(&self) -> Result<(), ChainClientError> {
		let chain_id = self
			.rpc
			.chain_id()
			.await
			.map_err(|e| ChainClientError::Connection(e.to_string()))?;
		if chain_id != U256::from(self.chain_id) {
			return Err(ChainClientError::Config(format!(
				"node reports chain id {chain_id}, configuration expects {}",
				self.chain_id
			)));
		}
		info!(rpc_url = %self.rpc_url, chain_id = self.chain_id, contract = %lower_hex_address(&self.contract.address), "chain client connected");
		Ok(())
	}

	pub fn contract_address(&self) -> Address {
		self.contract.address
	}

	/// One-shot: installs the operator signing key. Further calls fail with
	/// [`ChainClientError::OperatorKeyAlreadySet`] for the process lifetime.
	pub fn install_operator_wallet(&self, wallet: LocalWallet) -> Result<(), ChainClientError> {
		let wallet = wallet.with_chain_id(self.chain_id);
		let address = wallet.address();
		self.operator_wallet
			.set(wallet)
			.map_err(|_| ChainClientError::OperatorKeyAlreadySet)?;
		info!(operator = %to_checksum(&address, None), "operator key installed");
		Ok(())
	}

	pub fn operator_address(&self) -> Option<Address> {
		self.operator_wallet.get().map(|wallet| wallet.address())
	}

	pub fn has_operator_key(&self) -> bool {
		self.operator_wallet.get().is_some()
	}

	pub fn client_status(&self) -> Value {
		json!({
			"rpc_url": self.rpc_url,
			"chain_id": self.chain_id,
			"contract_address": lower_hex_address(&self.contract.address),
			"operator": self.operator_address().map(|a| to_checksum(&a, None)),
		})
	}

	async fn view(&self, call_data: Vec<u8>) -> Result<Vec<u8>, ChainClientError> {
		let tx: TypedTransaction = TransactionRequest::new()
			.to(self.contract.address)
			.data(call_data)
			.into();
		let bytes = self
			.rpc
			.call(tx)
			.await
			.map_err(|e| ChainClientError::Connection(e.to_string()))?;
		Ok(bytes.to_vec())
	}

	async fn block_timestamp(&self, block_number: u64) -> Result<u64, ChainClientError> {
		if let Some(timestamp) = self.block_timestamps.lock().get(&block_number) {
			return Ok(*timestamp);
		}
		let block = self
			.rpc
			.block(block_number)
			.await
			.map_err(|e| ChainClientError::Connection(e.to_string()))?;
		let timestamp = block.timestamp.as_u64();

		let mut cache = self.block_timestamps.lock();
		if cache.len() >= BLOCK_TIMESTAMP_CACHE_SIZE {
			cache.clear();
		}
		cache.insert(block_number, timestamp);
		Ok(timestamp)
	}

	async fn send_contract_tx(
		&self,
		call_data: Vec<u8>,
		label: &str,
	) -> Result<TxHash, ChainClientError> {
		let wallet = self.operator_wallet.get().ok_or(ChainClientError::NoOperatorKey)?;
		let from = wallet.address();

		let mut tx: TypedTransaction = TransactionRequest::new()
			.from(from)
			.to(self.contract.address)
			.data(call_data)
			.chain_id(self.chain_id)
			.into();

		let gas_estimate = self
			.rpc
			.estimate_gas(tx.clone())
			.await
			.map_err(|e| ChainClientError::classify_send_error(e.to_string()))?;
		let gas = multiply_gas(gas_estimate, self.gas_multiplier);

		let gas_price = match self.gas_price_override {
			Some(price) => price,
			None => self
				.rpc
				.gas_price()
				.await
				.map_err(|e| ChainClientError::Connection(e.to_string()))?,
		};

		let nonce = self
			.rpc
			.transaction_count(from)
			.await
			.map_err(|e| ChainClientError::Connection(e.to_string()))?;

		tx.set_gas(gas);
		tx.set_gas_price(gas_price);
		tx.set_nonce(nonce);

		let signature = wallet
			.sign_transaction(&tx)
			.await
			.map_err(|e| ChainClientError::Other(anyhow::anyhow!("signing failed: {e}")))?;
		let raw = tx.rlp_signed(&signature);

		let tx_hash = self
			.rpc
			.send_raw_transaction(raw)
			.await
			.map_err(|e| ChainClientError::classify_send_error(e.to_string()))?;
		info!(%tx_hash, gas = %gas, "{label} transaction sent");
		Ok(tx_hash)
	}
}

fn multiply_gas(estimate: U256, multiplier: f64) -> U256 {
	U256::from((estimate.as_u128() as f64 * multiplier) as u128)
}

#[async_trait]
impl<R: EthRpcApi> LotteryChainApi for LotteryChainClient<R> {
	async fn get_contract_config(&self) -> Result<ContractConfig, ChainClientError> {
		let output = self.view(self.contract.get_config_call()).await?;
		self.contract.decode_config(&output)
	}

	async fn get_current_round(&self) -> Result<Option<LotteryRound>, ChainClientError> {
		let output = self.view(self.contract.get_round_call()).await?;
		self.contract.decode_round(&output)
	}

	async fn get_participant_summaries(
		&self,
		round_id: u64,
	) -> Result<Vec<ParticipantSummary>, ChainClientError> {
		if round_id == 0 {
			return Ok(Vec::new());
		}

		let output = self.view(self.contract.get_participants_call()).await?;
		let addresses = self.contract.decode_participants(&output)?;

		let mut summaries = Vec::with_capacity(addresses.len());
		for address in addresses {
			let output = self.view(self.contract.get_bet_amount_call(address)).await?;
			let amount = self.contract.decode_bet_amount(&output)?;
			if !amount.is_zero() {
				summaries.push(ParticipantSummary { address, total_amount: amount });
			}
		}
		Ok(summaries)
	}

	async fn get_events(&self, from_block: u64) -> Result<Vec<ChainEvent>, ChainClientError> {
		let filter = Filter::new()
			.address(self.contract.address)
			.from_block(from_block)
			.to_block(BlockNumber::Latest);
		let logs = self
			.rpc
			.get_logs(filter)
			.await
			.map_err(|e| ChainClientError::Connection(e.to_string()))?;

		let mut events = Vec::new();
		for log in logs {
			let (Some(block_number), Some(transaction_hash), Some(log_index)) =
				(log.block_number, log.transaction_hash, log.log_index)
			else {
				// Pending logs carry no block context; skip them.
				continue;
			};
			let Some(decoded) = self.contract.decode_log(&log) else {
				continue;
			};
			let timestamp = self.block_timestamp(block_number.as_u64()).await?;
			events.push(ChainEvent {
				name: decoded.name,
				args: decoded.params,
				block_number: block_number.as_u64(),
				transaction_hash,
				log_index,
				timestamp,
			});
		}

		let events: Vec<ChainEvent> = events
			.into_iter()
			.sorted_by_key(|e| (e.block_number, e.transaction_hash, e.log_index))
			.collect();

		if let Some(max_block) = events.iter().map(|e| e.block_number).max() {
			self.last_seen_block.fetch_max(max_block, Ordering::SeqCst);
		}
		Ok(events)
	}

	fn last_seen_block(&self) -> u64 {
		self.last_seen_block.load(Ordering::SeqCst)
	}

	async fn latest_block(&self) -> Result<u64, ChainClientError> {
		self.rpc
			.block_number()
			.await
			.map_err(|e| ChainClientError::Connection(e.to_string()))
	}

	async fn draw_round(&self, round_id: u64) -> Result<TxHash, ChainClientError> {
		self.send_contract_tx(self.contract.draw_winner_call(round_id), "drawWinner")
			.await
	}

	async fn refund_round(&self, round_id: u64) -> Result<TxHash, ChainClientError> {
		self.send_contract_tx(self.contract.refund_round_call(round_id), "refundRound")
			.await
	}

	async fn wait_for_transaction(
		&self,
		tx_hash: TxHash,
		timeout: Duration,
	) -> Result<TxReceiptSummary, ChainClientError> {
		let wait = async {
			loop {
				match self.rpc.transaction_receipt(tx_hash).await {
					Ok(Some(receipt)) =>
						return TxReceiptSummary {
							transaction_hash: tx_hash,
							status: receipt.status.map(|s| s.as_u64()).unwrap_or(0),
							block_number: receipt
								.block_number
								.map(|n| n.as_u64())
								.unwrap_or_default(),
							gas_used: receipt.gas_used.unwrap_or_default(),
						},
					Ok(None) => {},
					Err(e) => warn!(%tx_hash, error = %e, "receipt poll failed, retrying"),
				}
				tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
			}
		};

		tokio::time::timeout(timeout, wait)
			.await
			.map_err(|_| ChainClientError::Timeout(format!("receipt for {tx_hash}")))
	}

	async fn health_check(&self) -> Value {
		match self.rpc.block_number().await {
			Ok(latest_block) => json!({ "status": "healthy", "latest_block": latest_block }),
			Err(e) => json!({ "status": "error", "detail": e.to_string() }),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::eth::contract::{address_topic, uint_topic};
	use crate::eth::rpc::MockEthRpcApi;
	use ethers::abi::{encode, Token};
	use ethers::types::{Block, Log};

	const CONTRACT: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

	fn client(rpc: MockEthRpcApi) -> LotteryChainClient<MockEthRpcApi> {
		LotteryChainClient::from_parts(
			rpc,
			LotteryContract::embedded(CONTRACT.parse().unwrap()).unwrap(),
			"http://localhost:8545".to_string(),
			31337,
			1.15,
			None,
		)
	}

	fn bet_log(contract: &LotteryContract, block: u64, log_index: u64) -> Log {
		Log {
			address: contract.address,
			topics: vec![
				contract.event_signature("BetPlaced"),
				uint_topic(U256::from(7)),
				address_topic(
					"0x9965507d1a55bcc2695c58ba16fb37d819b0a4dc".parse().unwrap(),
				),
			],
			data: encode(&[
				Token::Uint(U256::from(10_000_000_000_000_000u64)),
				Token::Uint(U256::from(10_000_000_000_000_000u64)),
			])
			.into(),
			block_number: Some(block.into()),
			transaction_hash: Some(H256::repeat_byte(block as u8)),
			log_index: Some(log_index.into()),
			..Default::default()
		}
	}

	fn stub_block_lookup(rpc: &mut MockEthRpcApi) {
		rpc.expect_block().returning(|n| {
			Ok(Block { timestamp: U256::from(n * 100), ..Default::default() })
		});
	}

	#[tokio::test]
	async fn events_sorted_by_block_tx_and_log_index() {
		let contract = LotteryContract::embedded(CONTRACT.parse().unwrap()).unwrap();
		let logs =
			vec![bet_log(&contract, 20, 1), bet_log(&contract, 10, 3), bet_log(&contract, 10, 1)];

		let mut rpc = MockEthRpcApi::new();
		rpc.expect_get_logs().returning(move |_| Ok(logs.clone()));
		stub_block_lookup(&mut rpc);

		let client = client(rpc);
		let events = client.get_events(0).await.unwrap();
		let order: Vec<_> =
			events.iter().map(|e| (e.block_number, e.log_index.as_u64())).collect();
		assert_eq!(order, vec![(10, 1), (10, 3), (20, 1)]);
		assert_eq!(events[0].timestamp, 1000);
	}

	#[tokio::test]
	async fn last_seen_block_never_rewinds() {
		let contract = LotteryContract::embedded(CONTRACT.parse().unwrap()).unwrap();
		let high = vec![bet_log(&contract, 50, 0)];
		let low = vec![bet_log(&contract, 30, 0)];

		let mut rpc = MockEthRpcApi::new();
		// Served back-to-front: the first poll sees block 50, the second 30.
		let mut responses = vec![low, high];
		rpc.expect_get_logs()
			.times(2)
			.returning(move |_| Ok(responses.pop().unwrap()));
		stub_block_lookup(&mut rpc);

		let client = client(rpc);
		client.get_events(0).await.unwrap();
		assert_eq!(client.last_seen_block(), 50);
		client.get_events(0).await.unwrap();
		assert_eq!(client.last_seen_block(), 50);
	}

	#[tokio::test]
	async fn undecodable_logs_are_skipped_not_fatal() {
		let contract = LotteryContract::embedded(CONTRACT.parse().unwrap()).unwrap();
		let garbage = Log {
			address: contract.address,
			topics: vec![H256::repeat_byte(0xee)],
			block_number: Some(5.into()),
			transaction_hash: Some(H256::repeat_byte(5)),
			log_index: Some(0.into()),
			..Default::default()
		};
		let logs = vec![garbage, bet_log(&contract, 6, 0)];

		let mut rpc = MockEthRpcApi::new();
		rpc.expect_get_logs().returning(move |_| Ok(logs.clone()));
		stub_block_lookup(&mut rpc);

		let client = client(rpc);
		let events = client.get_events(0).await.unwrap();
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].name, "BetPlaced");
	}

	#[tokio::test]
	async fn draw_without_key_fails_fast() {
		let client = client(MockEthRpcApi::new());
		assert!(matches!(
			client.draw_round(7).await,
			Err(ChainClientError::NoOperatorKey)
		));
	}

	#[tokio::test]
	async fn install_operator_wallet_is_one_shot() {
		let client = client(MockEthRpcApi::new());
		let wallet: LocalWallet =
			"ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
				.parse()
				.unwrap();
		client.install_operator_wallet(wallet.clone()).unwrap();
		assert!(client.has_operator_key());
		assert!(matches!(
			client.install_operator_wallet(wallet),
			Err(ChainClientError::OperatorKeyAlreadySet)
		));
	}

	#[tokio::test]
	async fn health_check_reports_error_without_throwing() {
		let mut rpc = MockEthRpcApi::new();
		rpc.expect_block_number()
			.returning(|| Err(anyhow::anyhow!("connection refused")));
		let client = client(rpc);
		let health = client.health_check().await;
		assert_eq!(health["status"], "error");
	}

	#[test]
	fn gas_multiplier_applies() {
		assert_eq!(multiply_gas(U256::from(100_000u64), 1.15), U256::from(114_999u64));
		assert_eq!(multiply_gas(U256::from(100_000u64), 1.0), U256::from(100_000u64));
	}

	#[test]
	fn gwei_override_converts_to_wei() {
		assert_eq!(gwei_to_wei(2.0), U256::from(2_000_000_000u64));
	}
}

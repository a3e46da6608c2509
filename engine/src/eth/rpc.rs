//! Thin typed wrapper over the JSON-RPC provider. Higher layers go through
//! [`EthRpcApi`] so tests can substitute a mock node.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::{
	prelude::*,
	types::transaction::eip2718::TypedTransaction,
};
use tokio::time::timeout;

use crate::constants::RPC_CALL_TIMEOUT;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EthRpcApi: Send + Sync + 'static {
	async fn chain_id(&self) -> Result<U256>;

	async fn block_number(&self) -> Result<u64>;

	/// Gets block, returning an error when either the request fails or the
	/// node does not know the block.
	async fn block(&self, block_number: u64) -> Result<Block<H256>>;

	async fn get_logs(&self, filter: Filter) -> Result<Vec<Log>>;

	async fn call(&self, tx: TypedTransaction) -> Result<Bytes>;

	async fn estimate_gas(&self, tx: TypedTransaction) -> Result<U256>;

	async fn gas_price(&self) -> Result<U256>;

	async fn transaction_count(&self, address: Address) -> Result<U256>;

	async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash>;

	async fn transaction_receipt(&self, tx_hash: TxHash) -> Result<Option<TransactionReceipt>>;
}

#[derive(Clone)]
pub struct EthRpcClient {
	provider: Provider<Http>,
}

impl EthRpcClient {
	pub fn new(http_endpoint: &str) -> Result<Self> {
		Ok(Self {
			provider: Provider::<Http>::try_from(http_endpoint)
				.with_context(|| format!("invalid rpc url {http_endpoint}"))?,
		})
	}
}

/// Every call is bounded by [`RPC_CALL_TIMEOUT`] so a wedged node cannot
/// stall a polling loop indefinitely.
async fn bounded<T, F>(what: &str, fut: F) -> Result<T>
where
	F: std::future::Future<Output = Result<T>>,
{
	timeout(RPC_CALL_TIMEOUT, fut)
		.await
		.map_err(|_| anyhow!("rpc call {what} timed out after {RPC_CALL_TIMEOUT:?}"))?
}

#[async_trait]
impl EthRpcApi for EthRpcClient {
	async fn chain_id(&self) -> Result<U256> {
		bounded("eth_chainId", async { Ok(self.provider.get_chainid().await?) }).await
	}

	async fn block_number(&self) -> Result<u64> {
		bounded("eth_blockNumber", async { Ok(self.provider.get_block_number().await?.as_u64()) })
			.await
	}

	async fn block(&self, block_number: u64) -> Result<Block<H256>> {
		bounded("eth_getBlockByNumber", async {
			self.provider
				.get_block(block_number)
				.await?
				.ok_or_else(|| anyhow!("node returned no block for number {block_number}"))
		})
		.await
	}

	async fn get_logs(&self, filter: Filter) -> Result<Vec<Log>> {
		bounded("eth_getLogs", async { Ok(self.provider.get_logs(&filter).await?) }).await
	}

	async fn call(&self, tx: TypedTransaction) -> Result<Bytes> {
		bounded("eth_call", async { Ok(self.provider.call(&tx, None).await?) }).await
	}

	async fn estimate_gas(&self, tx: TypedTransaction) -> Result<U256> {
		bounded("eth_estimateGas", async { Ok(self.provider.estimate_gas(&tx, None).await?) })
			.await
	}

	async fn gas_price(&self) -> Result<U256> {
		bounded("eth_gasPrice", async { Ok(self.provider.get_gas_price().await?) }).await
	}

	async fn transaction_count(&self, address: Address) -> Result<U256> {
		bounded("eth_getTransactionCount", async {
			Ok(self
				.provider
				.get_transaction_count(address, Some(BlockNumber::Pending.into()))
				.await?)
		})
		.await
	}

	async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash> {
		// Broadcast itself is not bounded: the hash returns as soon as the
		// node accepts the payload.
		Ok(self.provider.send_raw_transaction(raw).await?.tx_hash())
	}

	async fn transaction_receipt(&self, tx_hash: TxHash) -> Result<Option<TransactionReceipt>> {
		bounded("eth_getTransactionReceipt", async {
			Ok(self.provider.get_transaction_receipt(tx_hash).await?)
		})
		.await
	}
}

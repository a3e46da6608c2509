use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use lottery_engine::enclave::{DummyAttestor, EnclaveKeyPair};
use lottery_engine::eth::LotteryChainClient;
use lottery_engine::event_manager::EventManager;
use lottery_engine::logging;
use lottery_engine::operator::PassiveOperator;
use lottery_engine::settings::{CommandLineOptions, Settings};
use lottery_engine::store::MemoryStore;
use lottery_engine::web::{self, ws, Gateway};

fn main() -> anyhow::Result<()> {
	logging::init();

	let opts = CommandLineOptions::parse();
	let settings = Settings::load(&opts).context("failed to load settings")?;

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("failed to build tokio runtime")?
		.block_on(run(settings))
}

async fn run(settings: Settings) -> anyhow::Result<()> {
	info!(
		rpc_url = %settings.blockchain.rpc_url,
		chain_id = settings.blockchain.chain_id,
		contract = %settings.blockchain.contract_address,
		operator = %settings.blockchain.operator_address,
		bind = format!("{}:{}", settings.server.host, settings.server.port),
		"starting enclave lottery engine"
	);

	// Fatal startup path: unreachable node, bad contract address or ABI all
	// end the process with exit code 1.
	let chain = Arc::new(
		LotteryChainClient::new(&settings.blockchain).context("chain client configuration")?,
	);
	chain.initialize().await.context("chain client initialization")?;

	let store = Arc::new(MemoryStore::new(
		settings.event_manager.live_feed_max_entries,
		settings.event_manager.round_history_max,
	));

	// Fresh per-process keypair: the operator key can only be injected
	// against a key generated inside this process.
	let keypair = Arc::new(EnclaveKeyPair::generate());
	let attestor = Arc::new(DummyAttestor::new(Arc::clone(&keypair)));

	let (shutdown_tx, shutdown_rx) = watch::channel(());

	let operator = PassiveOperator::new(
		Arc::clone(&chain),
		Arc::clone(&store),
		Duration::from_secs(settings.operator.tx_timeout_seconds),
	);
	let operator_task = operator.spawn(shutdown_rx.clone());

	// Subscribers must be registered before the polling loops start
	// producing, or the first updates would be missed.
	let hub = ws::WsHub::new();
	let broadcaster_task =
		ws::spawn_broadcaster(&store, Arc::clone(&hub), shutdown_rx.clone());

	let event_manager = EventManager::new(
		Arc::clone(&chain),
		Arc::clone(&store),
		settings.event_manager.clone(),
	);
	let event_tasks = event_manager.spawn(shutdown_rx.clone());

	let gateway = Arc::new(Gateway {
		store: Arc::clone(&store),
		chain: Arc::clone(&chain),
		operator: operator.status_handle(),
		keypair,
		attestor,
		hub,
		expected_operator_address: settings.blockchain.operator_address.clone(),
		static_dir: settings.server.static_dir.clone().into(),
	});

	let host = settings.server.host.clone();
	let port = settings.server.port;
	let mut server =
		tokio::spawn(async move { web::serve(gateway, &host, port, shutdown_rx).await });

	let server_result = tokio::select! {
		// The gateway ending on its own means the bind failed or the
		// server crashed; both are fatal.
		result = &mut server => Some(result),
		signal = tokio::signal::ctrl_c() => {
			signal.context("cannot listen for shutdown signal")?;
			info!("shutdown signal received");
			None
		},
	};

	let _ = shutdown_tx.send(());

	for task in event_tasks {
		let _ = task.await;
	}
	let _ = operator_task.await;
	let _ = broadcaster_task.await;

	let server_result = match server_result {
		Some(result) => result,
		None => server.await,
	};
	match server_result {
		Ok(Ok(())) => {},
		Ok(Err(e)) => {
			error!(error = %e, "web gateway failed");
			return Err(e);
		},
		Err(e) => error!(error = %e, "web gateway task panicked"),
	}

	store.clear_all();
	info!("enclave lottery engine stopped");
	Ok(())
}

//! The passive operator: watches `round_update` notifications and drives a
//! betting round forward once its draw window opens, or refunds it once the
//! window has passed. It never initiates anything else and never crashes
//! the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::eth::{ChainClientError, LotteryChainApi};
use crate::store::{value_as_u64, MemoryStore, RoundState, StoreEventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorAction {
	Draw,
	Refund,
}

/// Pure decision rule for a round in the given state at wall-clock `now`.
pub fn decide(
	state: RoundState,
	now: u64,
	min_draw_time: u64,
	max_draw_time: u64,
) -> Option<OperatorAction> {
	if state != RoundState::Betting {
		return None;
	}
	if now < min_draw_time {
		None
	} else if now <= max_draw_time {
		Some(OperatorAction::Draw)
	} else {
		Some(OperatorAction::Refund)
	}
}

/// Cloneable view of the operator's state for the gateway.
#[derive(Clone)]
pub struct OperatorStatusHandle {
	running: Arc<AtomicBool>,
	store: Arc<MemoryStore>,
}

impl OperatorStatusHandle {
	pub fn status(&self) -> Value {
		json!({
			"status": if self.running.load(Ordering::SeqCst) { "running" } else { "stopped" },
			"current_round_id": self.store.current_round().map(|round| round.round_id),
		})
	}
}

pub struct PassiveOperator<C: LotteryChainApi> {
	client: Arc<C>,
	store: Arc<MemoryStore>,
	tx_timeout: Duration,
	running: Arc<AtomicBool>,
	in_flight: Arc<Mutex<Option<(u64, OperatorAction)>>>,
}

impl<C: LotteryChainApi> PassiveOperator<C> {
	pub fn new(client: Arc<C>, store: Arc<MemoryStore>, tx_timeout: Duration) -> Arc<Self> {
		Arc::new(Self {
			client,
			store,
			tx_timeout,
			running: Arc::new(AtomicBool::new(false)),
			in_flight: Arc::new(Mutex::new(None)),
		})
	}

	pub fn status_handle(&self) -> OperatorStatusHandle {
		OperatorStatusHandle {
			running: Arc::clone(&self.running),
			store: Arc::clone(&self.store),
		}
	}

	pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<()>) -> JoinHandle<()> {
		let operator = Arc::clone(self);
		let mut round_updates = operator.store.subscribe(&[StoreEventKind::RoundUpdate]);

		tokio::spawn(async move {
			operator.running.store(true, Ordering::SeqCst);
			operator
				.store
				.publish_operator_status(operator.status_handle().status());
			info!("passive operator started");

			loop {
				tokio::select! {
					_ = shutdown.changed() => break,
					event = round_updates.recv() => match event {
						Some(event) => {
							if let Some(payload) = event.payload {
								operator.on_round_update(&payload);
							}
						},
						None => break,
					},
				}
			}

			operator.running.store(false, Ordering::SeqCst);
			operator
				.store
				.publish_operator_status(operator.status_handle().status());
			info!("passive operator stopped");
		})
	}

	/// Reacts to one serialized round payload. Returns the handle of the
	/// spawned transaction task, if one was launched.
	fn on_round_update(&self, payload: &Value) -> Option<JoinHandle<()>> {
		if !self.running.load(Ordering::SeqCst) {
			return None;
		}

		let round_id = payload.get("round_id").and_then(value_as_u64)?;
		let state = payload
			.get("state")
			.and_then(value_as_u64)
			.and_then(|s| RoundState::from_u8(s as u8))?;
		let min_draw_time = payload.get("min_draw_time").and_then(value_as_u64).unwrap_or(0);
		let max_draw_time = payload.get("max_draw_time").and_then(value_as_u64).unwrap_or(0);

		let now = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_secs())
			.unwrap_or_default();

		let action = decide(state, now, min_draw_time, max_draw_time)?;

		// Single-slot guard: only one transaction may be in flight. Stale
		// round payloads arriving while it is pending are dropped here.
		{
			let mut slot = self.in_flight.lock();
			if let Some(pending) = *slot {
				debug!(?pending, round_id, "transaction already in flight, skipping");
				return None;
			}
			*slot = Some((round_id, action));
		}

		info!(round_id, ?action, now, min_draw_time, max_draw_time, "round actionable");

		let client = Arc::clone(&self.client);
		let in_flight = Arc::clone(&self.in_flight);
		let tx_timeout = self.tx_timeout;
		Some(tokio::spawn(async move {
			Self::execute(client, round_id, action, tx_timeout).await;
			*in_flight.lock() = None;
		}))
	}

	async fn execute(client: Arc<C>, round_id: u64, action: OperatorAction, timeout: Duration) {
		let sent = match action {
			OperatorAction::Draw => client.draw_round(round_id).await,
			OperatorAction::Refund => client.refund_round(round_id).await,
		};

		let tx_hash = match sent {
			Ok(tx_hash) => tx_hash,
			Err(ChainClientError::NoOperatorKey) => {
				// Expected until key injection completes; the next
				// round_update retries.
				warn!(round_id, ?action, "operator key not yet installed");
				return;
			},
			Err(e) => {
				error!(round_id, ?action, error = %e, "transaction submission failed");
				return;
			},
		};

		match client.wait_for_transaction(tx_hash, timeout).await {
			Ok(receipt) if receipt.status == 1 => {
				info!(round_id, ?action, %tx_hash, block = receipt.block_number, "transaction confirmed");
			},
			Ok(receipt) => {
				warn!(round_id, ?action, %tx_hash, status = receipt.status, "transaction reverted on chain");
			},
			Err(e) => {
				warn!(round_id, ?action, %tx_hash, error = %e, "receipt wait failed");
			},
		}
	}
}

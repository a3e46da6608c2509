//! Keeps the [`MemoryStore`] consistent with the chain: one loop refreshing
//! the contract config, one refreshing the round + participants, and one
//! draining event logs.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::{EVENT_POLL_BACKOFF, EVENT_POLL_INTERVAL};
use crate::eth::{format_eth, shorten_address, ChainEvent, LotteryChainApi};
use crate::settings;
use crate::store::{value_as_u256, value_as_u64, MemoryStore, RoundState};

/// Events surfaced on the live activity feed. Parameter updates and
/// `EndTimeExtended` are consumed silently; the periodic refreshes make
/// their effects visible.
const LIVE_FEED_EVENTS: &[&str] =
	&["RoundCreated", "RoundStateChanged", "BetPlaced", "RoundCompleted", "RoundRefunded"];

const TERMINAL_EVENTS: &[&str] = &["RoundCompleted", "RoundRefunded"];

pub struct EventManager<C: LotteryChainApi> {
	client: Arc<C>,
	store: Arc<MemoryStore>,
	settings: settings::EventManager,
}

impl<C: LotteryChainApi> EventManager<C> {
	pub fn new(
		client: Arc<C>,
		store: Arc<MemoryStore>,
		settings: settings::EventManager,
	) -> Arc<Self> {
		store.set_feed_capacity(settings.live_feed_max_entries);
		store.set_history_capacity(settings.round_history_max);
		Arc::new(Self { client, store, settings })
	}

	/// Spawns the three polling loops. Each observes `shutdown` within one
	/// poll interval.
	pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<()>) -> Vec<JoinHandle<()>> {
		vec![
			tokio::spawn(Arc::clone(self).config_loop(shutdown.clone())),
			tokio::spawn(Arc::clone(self).round_loop(shutdown.clone())),
			tokio::spawn(Arc::clone(self).events_loop(shutdown)),
		]
	}

	async fn config_loop(self: Arc<Self>, mut shutdown: watch::Receiver<()>) {
		let mut tick = tokio::time::interval(Duration::from_secs(
			self.settings.contract_config_interval_sec.max(1),
		));
		loop {
			tokio::select! {
				_ = shutdown.changed() => break,
				_ = tick.tick() => match self.client.get_contract_config().await {
					Ok(config) => self.store.set_contract_config(config),
					Err(e) => warn!(error = %e, "contract config refresh failed"),
				},
			}
		}
		info!("contract config loop stopped");
	}

	async fn round_loop(self: Arc<Self>, mut shutdown: watch::Receiver<()>) {
		let mut tick = tokio::time::interval(Duration::from_secs(
			self.settings.round_and_participants_interval_sec.max(1),
		));
		loop {
			tokio::select! {
				_ = shutdown.changed() => break,
				_ = tick.tick() => {
					match self.client.get_current_round().await {
						Ok(round) => self.store.set_current_round(round, false),
						Err(e) => warn!(error = %e, "round refresh failed"),
					}

					if let Some(round) = self.store.current_round() {
						match self.client.get_participant_summaries(round.round_id).await {
							Ok(summaries) => self.store.sync_participants(summaries),
							Err(e) => warn!(error = %e, "participants refresh failed"),
						}
					}
				},
			}
		}
		info!("round refresh loop stopped");
	}

	async fn events_loop(self: Arc<Self>, mut shutdown: watch::Receiver<()>) {
		let mut from_block = loop {
			match self.client.latest_block().await {
				Ok(latest) => break latest.saturating_sub(self.settings.start_block_offset),
				Err(e) => {
					warn!(error = %e, "cannot determine start block, retrying");
					tokio::select! {
						_ = shutdown.changed() => return,
						_ = tokio::time::sleep(EVENT_POLL_BACKOFF) => {},
					}
				},
			}
		};
		info!(from_block, "event polling started");

		loop {
			let events = match self.client.get_events(from_block).await {
				Ok(events) => events,
				Err(e) => {
					warn!(error = %e, "event poll failed");
					Vec::new()
				},
			};

			let pause = if events.is_empty() { EVENT_POLL_BACKOFF } else { EVENT_POLL_INTERVAL };
			for event in &events {
				debug!(name = %event.name, block = event.block_number, "handling chain event");
				handle_event(&self.store, event);
			}

			from_block = from_block.max(self.client.last_seen_block() + 1);

			tokio::select! {
				_ = shutdown.changed() => break,
				_ = tokio::time::sleep(pause) => {},
			}
		}
		info!("event polling loop stopped");
	}
}

/// Translates one decoded chain event into store mutations. Pure with
/// respect to the chain: all inputs come from the event itself.
pub fn handle_event(store: &MemoryStore, event: &ChainEvent) {
	store.publish_blockchain_event(json!({
		"name": event.name,
		"args": event.args,
		"block_number": event.block_number,
		"transaction_hash": format!("0x{}", hex::encode(event.transaction_hash.as_bytes())),
		"timestamp": event.timestamp,
	}));

	let mut details = event.args.clone();
	details.insert("timestamp".to_string(), json!(event.timestamp));

	if LIVE_FEED_EVENTS.contains(&event.name.as_str()) {
		let message = feed_message(&event.name, &details);
		store.add_live_feed(&event.name, message, details.clone());
	}

	if TERMINAL_EVENTS.contains(&event.name.as_str()) {
		store.add_history_snapshot(&event.name, &details);
	}
}

/// Renders the human-readable feed line for an event. Deterministic: the
/// same event always produces the same bytes.
pub fn feed_message(event_type: &str, args: &Map<String, Value>) -> String {
	let round_id = args.get("roundId").and_then(value_as_u64);

	match event_type {
		"RoundCreated" => match round_id {
			Some(rid) => format!("Round {rid} created"),
			None => "Round created".to_string(),
		},
		"BetPlaced" => {
			let player = args
				.get("player")
				.and_then(Value::as_str)
				.and_then(|s| s.parse().ok())
				.map(|a| shorten_address(&a));
			let amount = args.get("amount").and_then(value_as_u256);
			match (player, amount) {
				(Some(player), Some(amount)) =>
					format!("{player} placed a bet for {} ETH", format_eth(amount)),
				(Some(player), None) => format!("{player} placed a bet"),
				_ => "a player placed a bet".to_string(),
			}
		},
		"RoundStateChanged" => {
			let state = args
				.get("newState")
				.and_then(value_as_u64)
				.and_then(|s| RoundState::from_u8(s as u8));
			match (round_id, state) {
				(Some(rid), Some(state)) =>
					format!("Round {rid} state transitioned to {}", state.label()),
				_ => event_type.to_string(),
			}
		},
		"RoundCompleted" => {
			let winner = args
				.get("winner")
				.and_then(Value::as_str)
				.and_then(|s| s.parse().ok())
				.map(|a| shorten_address(&a))
				.unwrap_or_else(|| "unknown".to_string());
			match round_id {
				Some(rid) => format!("Round {rid} completed - winner: {winner}"),
				None => format!("Round completed - winner: {winner}"),
			}
		},
		"RoundRefunded" => {
			let reason = args.get("reason").and_then(Value::as_str).filter(|r| !r.is_empty());
			match (round_id, reason) {
				(Some(rid), Some(reason)) => format!("Round {rid} refunded: {reason}"),
				(Some(rid), None) => format!("Round {rid} refunded"),
				(None, _) => "Round refunded".to_string(),
			}
		},
		_ => event_type.to_string(),
	}
}

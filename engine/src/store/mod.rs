//! Volatile single-source-of-truth for everything observed on chain.
//!
//! One mutex guards the data; every mutator commits under the lock, builds
//! its snapshot payloads while still holding it, and notifies listeners
//! after releasing it. Listeners receive typed notifications through their
//! own bounded queues so a slow consumer can never stall a mutator.

pub mod models;

use std::collections::{HashMap, VecDeque};

use ethers::types::{Address, U256};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::constants::LISTENER_QUEUE_CAPACITY;
pub use models::{
	ContractConfig, LiveFeedItem, LotteryRound, ParticipantSummary, RoundSnapshot, RoundState,
};

pub const DEFAULT_FEED_CAPACITY: usize = 1000;
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Typed change notifications fanned out to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreEventKind {
	RoundUpdate,
	ParticipantsUpdate,
	HistoryUpdate,
	LiveFeed,
	ConfigUpdate,
	OperatorStatus,
	BlockchainEvent,
}

impl StoreEventKind {
	pub fn as_str(self) -> &'static str {
		match self {
			StoreEventKind::RoundUpdate => "round_update",
			StoreEventKind::ParticipantsUpdate => "participants_update",
			StoreEventKind::HistoryUpdate => "history_update",
			StoreEventKind::LiveFeed => "live_feed",
			StoreEventKind::ConfigUpdate => "config_update",
			StoreEventKind::OperatorStatus => "operator_status",
			StoreEventKind::BlockchainEvent => "blockchain_event",
		}
	}
}

#[derive(Debug, Clone)]
pub struct StoreEvent {
	pub kind: StoreEventKind,
	pub payload: Option<Value>,
}

/// Ring buffer with an explicit capacity. Resizing keeps the newest entries.
#[derive(Debug)]
pub struct BoundedDeque<T> {
	items: VecDeque<T>,
	capacity: usize,
}

impl<T> BoundedDeque<T> {
	pub fn new(capacity: usize) -> Self {
		Self { items: VecDeque::new(), capacity }
	}

	pub fn push(&mut self, item: T) {
		while self.items.len() >= self.capacity {
			self.items.pop_front();
		}
		self.items.push_back(item);
	}

	pub fn set_capacity(&mut self, capacity: usize) {
		while self.items.len() > capacity {
			self.items.pop_front();
		}
		self.capacity = capacity;
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	pub fn len(&self) -> usize {
		self.items.len()
	}

	pub fn iter(&self) -> impl Iterator<Item = &T> {
		self.items.iter()
	}

	pub fn clear(&mut self) {
		self.items.clear();
	}
}

struct StoreData {
	current_round: Option<LotteryRound>,
	participants: HashMap<Address, ParticipantSummary>,
	history: BoundedDeque<RoundSnapshot>,
	live_feed: BoundedDeque<LiveFeedItem>,
	contract_config: Option<ContractConfig>,
}

struct Listener {
	kinds: Vec<StoreEventKind>,
	tx: mpsc::Sender<StoreEvent>,
}

pub struct MemoryStore {
	data: Mutex<StoreData>,
	listeners: Mutex<Vec<Listener>>,
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new(DEFAULT_FEED_CAPACITY, DEFAULT_HISTORY_CAPACITY)
	}
}

impl MemoryStore {
	pub fn new(feed_capacity: usize, history_capacity: usize) -> Self {
		Self {
			data: Mutex::new(StoreData {
				current_round: None,
				participants: HashMap::new(),
				history: BoundedDeque::new(history_capacity),
				live_feed: BoundedDeque::new(feed_capacity),
				contract_config: None,
			}),
			listeners: Mutex::new(Vec::new()),
		}
	}

	/// Registers a listener for the given event kinds. All notifications
	/// share one bounded queue; when it fills, notifications for this
	/// listener are dropped rather than blocking the mutator.
	pub fn subscribe(&self, kinds: &[StoreEventKind]) -> mpsc::Receiver<StoreEvent> {
		let (tx, rx) = mpsc::channel(LISTENER_QUEUE_CAPACITY);
		self.listeners.lock().push(Listener { kinds: kinds.to_vec(), tx });
		rx
	}

	fn emit(&self, kind: StoreEventKind, payload: Option<Value>) {
		let mut listeners = self.listeners.lock();
		listeners.retain(|listener| {
			if !listener.kinds.contains(&kind) {
				return !listener.tx.is_closed();
			}
			match listener.tx.try_send(StoreEvent { kind, payload: payload.clone() }) {
				Ok(()) => true,
				Err(mpsc::error::TrySendError::Full(_)) => {
					warn!(event = kind.as_str(), "store listener queue full, dropping notification");
					true
				},
				Err(mpsc::error::TrySendError::Closed(_)) => false,
			}
		});
	}

	// ----------------------------------------------------------------
	// Mutators
	// ----------------------------------------------------------------

	pub fn bootstrap(
		&self,
		current_round: Option<LotteryRound>,
		participants: Vec<ParticipantSummary>,
		history: Vec<RoundSnapshot>,
		contract_config: Option<ContractConfig>,
	) {
		let (round_payload, participants_payload, history_payload, config_payload) = {
			let mut data = self.data.lock();
			data.current_round = current_round;
			data.participants =
				participants.into_iter().map(|p| (p.address, p)).collect();
			data.history.clear();
			let had_history = {
				for item in history {
					data.history.push(item);
				}
				data.history.len() > 0
			};
			(
				data.current_round.as_ref().map(models::serialize_round),
				(!data.participants.is_empty()).then(|| participants_payload(&data)),
				had_history.then(|| history_payload(&data)),
				contract_config.map(|config| {
					let payload = models::serialize_config(&config);
					data.contract_config = Some(config);
					payload
				}),
			)
		};

		if let Some(payload) = round_payload {
			self.emit(StoreEventKind::RoundUpdate, Some(payload));
		}
		if let Some(payload) = participants_payload {
			self.emit(StoreEventKind::ParticipantsUpdate, Some(payload));
		}
		if let Some(payload) = history_payload {
			self.emit(StoreEventKind::HistoryUpdate, Some(payload));
		}
		if let Some(payload) = config_payload {
			self.emit(StoreEventKind::ConfigUpdate, Some(payload));
		}
	}

	/// Replaces the current round. A read that would step the same round's
	/// state backwards is treated as a stale RPC response and ignored.
	pub fn set_current_round(&self, round: Option<LotteryRound>, reset_participants: bool) {
		let payloads = {
			let mut data = self.data.lock();

			if let (Some(old), Some(new)) = (&data.current_round, &round) {
				if old.round_id == new.round_id && new.state.as_u8() < old.state.as_u8() {
					debug!(
						round_id = new.round_id,
						old_state = old.state.label(),
						new_state = new.state.label(),
						"ignoring stale round read"
					);
					return;
				}
			}

			data.current_round = round;
			if reset_participants {
				data.participants.clear();
			}
			(
				data.current_round.as_ref().map(models::serialize_round),
				reset_participants.then(|| participants_payload(&data)),
			)
		};

		self.emit(StoreEventKind::RoundUpdate, payloads.0);
		if let Some(participants) = payloads.1 {
			self.emit(StoreEventKind::ParticipantsUpdate, Some(participants));
		}
	}

	pub fn sync_participants(&self, summaries: Vec<ParticipantSummary>) {
		let payload = {
			let mut data = self.data.lock();
			data.participants = summaries.into_iter().map(|p| (p.address, p)).collect();
			participants_payload(&data)
		};
		self.emit(StoreEventKind::ParticipantsUpdate, Some(payload));
	}

	/// Appends to the live feed. Deliberately does not emit a store event:
	/// the feed's read path is `/api/activities`.
	pub fn add_live_feed(&self, event_type: &str, message: String, details: Map<String, Value>) {
		let item = LiveFeedItem {
			event_type: event_type.to_string(),
			message,
			event_time: details.get("timestamp").and_then(value_as_u64).unwrap_or(0),
			round_id: details.get("roundId").and_then(value_as_u64).unwrap_or(0),
			details,
		};
		self.data.lock().live_feed.push(item);
	}

	/// Builds a [`RoundSnapshot`] out of a terminal event's decoded fields
	/// and appends it to history. At most one snapshot is kept per
	/// `(event_type, round_id)` so replayed logs cannot duplicate history.
	pub fn add_history_snapshot(&self, event_type: &str, details: &Map<String, Value>) {
		let round_id = details.get("roundId").and_then(value_as_u64).unwrap_or(0);
		let participant_count =
			details.get("participantCount").and_then(value_as_u64).unwrap_or(0);
		let finished_at = details.get("timestamp").and_then(value_as_u64).unwrap_or(0);

		let snapshot = if event_type == "RoundCompleted" {
			RoundSnapshot {
				event_type: event_type.to_string(),
				round_id,
				participant_count,
				total_pot: details.get("totalPot").and_then(value_as_u256).unwrap_or_default(),
				finished_at,
				winner: details
					.get("winner")
					.and_then(Value::as_str)
					.and_then(|s| s.parse().ok()),
				winner_prize: details
					.get("winnerPrize")
					.and_then(value_as_u256)
					.unwrap_or_default(),
				refund_reason: None,
			}
		} else {
			RoundSnapshot {
				event_type: event_type.to_string(),
				round_id,
				participant_count,
				total_pot: details
					.get("totalRefunded")
					.and_then(value_as_u256)
					.unwrap_or_default(),
				finished_at,
				winner: None,
				winner_prize: U256::zero(),
				refund_reason: details
					.get("reason")
					.and_then(Value::as_str)
					.map(str::to_string),
			}
		};

		let payload = {
			let mut data = self.data.lock();
			if data
				.history
				.iter()
				.any(|s| s.round_id == round_id && s.event_type == event_type)
			{
				debug!(round_id, event_type, "duplicate terminal event, history unchanged");
				return;
			}
			data.history.push(snapshot);
			history_payload(&data)
		};
		self.emit(StoreEventKind::HistoryUpdate, Some(payload));
	}

	pub fn set_contract_config(&self, config: ContractConfig) {
		let payload = {
			let mut data = self.data.lock();
			let payload = models::serialize_config(&config);
			data.contract_config = Some(config);
			payload
		};
		self.emit(StoreEventKind::ConfigUpdate, Some(payload));
	}

	pub fn clear_all(&self) {
		let (participants, history) = {
			let mut data = self.data.lock();
			data.current_round = None;
			data.participants.clear();
			data.history.clear();
			data.live_feed.clear();
			data.contract_config = None;
			(participants_payload(&data), history_payload(&data))
		};
		self.emit(StoreEventKind::RoundUpdate, None);
		self.emit(StoreEventKind::ParticipantsUpdate, Some(participants));
		self.emit(StoreEventKind::HistoryUpdate, Some(history));
		self.emit(StoreEventKind::ConfigUpdate, None);
	}

	pub fn set_feed_capacity(&self, capacity: usize) {
		self.data.lock().live_feed.set_capacity(capacity);
	}

	pub fn set_history_capacity(&self, capacity: usize) {
		self.data.lock().history.set_capacity(capacity);
	}

	/// Emit-only: the operator publishes its status through the store so
	/// WebSocket clients see `operator_status` messages.
	pub fn publish_operator_status(&self, status: Value) {
		self.emit(StoreEventKind::OperatorStatus, Some(status));
	}

	/// Emit-only: raw decoded chain events for listeners that want them.
	pub fn publish_blockchain_event(&self, event: Value) {
		self.emit(StoreEventKind::BlockchainEvent, Some(event));
	}

	// ----------------------------------------------------------------
	// Accessors (every getter returns an owned copy)
	// ----------------------------------------------------------------

	pub fn current_round(&self) -> Option<LotteryRound> {
		self.data.lock().current_round.clone()
	}

	/// Participants ordered by stake, largest first.
	pub fn participants(&self) -> Vec<ParticipantSummary> {
		let data = self.data.lock();
		let mut participants: Vec<_> = data.participants.values().cloned().collect();
		participants.sort_by(|a, b| b.total_amount.cmp(&a.total_amount));
		participants
	}

	/// History ordered by round id, newest first.
	pub fn history(&self, limit: Option<usize>) -> Vec<RoundSnapshot> {
		let data = self.data.lock();
		let mut items: Vec<_> = data.history.iter().cloned().collect();
		items.sort_by(|a, b| b.round_id.cmp(&a.round_id));
		if let Some(limit) = limit {
			items.truncate(limit);
		}
		items
	}

	/// Live feed ordered by `(round_id, event_time)`, newest first.
	pub fn live_feed(&self, limit: Option<usize>) -> Vec<LiveFeedItem> {
		let data = self.data.lock();
		let mut items: Vec<_> = data.live_feed.iter().cloned().collect();
		items.sort_by(|a, b| {
			b.round_id.cmp(&a.round_id).then(b.event_time.cmp(&a.event_time))
		});
		if let Some(limit) = limit {
			items.truncate(limit);
		}
		items
	}

	pub fn contract_config(&self) -> Option<ContractConfig> {
		self.data.lock().contract_config.clone()
	}

	pub fn round_payload(&self) -> Value {
		match self.current_round() {
			Some(round) => models::serialize_round(&round),
			None => models::serialize_no_round(),
		}
	}

	pub fn participants_payload(&self) -> Value {
		participants_payload(&self.data.lock())
	}
}

fn participants_payload(data: &StoreData) -> Value {
	let mut participants: Vec<&ParticipantSummary> = data.participants.values().collect();
	participants.sort_by(|a, b| b.total_amount.cmp(&a.total_amount));
	let total = participants.len();
	json!({
		"participants": participants
			.into_iter()
			.map(models::serialize_participant)
			.collect::<Vec<_>>(),
		"total_participants": total,
	})
}

fn history_payload(data: &StoreData) -> Value {
	let mut snapshots: Vec<&RoundSnapshot> = data.history.iter().collect();
	snapshots.sort_by(|a, b| b.round_id.cmp(&a.round_id));
	json!({
		"rounds": snapshots
			.into_iter()
			.map(models::serialize_snapshot)
			.collect::<Vec<_>>(),
	})
}

/// Reads a u64 out of a JSON scalar that may be a number, a decimal string
/// or a 0x-prefixed hex string.
pub fn value_as_u64(value: &Value) -> Option<u64> {
	match value {
		Value::Number(n) => n.as_u64(),
		Value::String(s) => {
			if let Some(hex) = s.strip_prefix("0x") {
				u64::from_str_radix(hex, 16).ok()
			} else {
				s.parse().ok()
			}
		},
		_ => None,
	}
}

/// Like [`value_as_u64`] but for full-width wei amounts.
pub fn value_as_u256(value: &Value) -> Option<U256> {
	match value {
		Value::Number(n) => n.as_u64().map(U256::from),
		Value::String(s) => {
			if let Some(hex) = s.strip_prefix("0x") {
				U256::from_str_radix(hex, 16).ok()
			} else {
				U256::from_dec_str(s).ok()
			}
		},
		_ => None,
	}
}

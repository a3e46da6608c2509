use ethers::types::{Address, U256};
use serde_json::{json, Map, Value};

use crate::eth::lower_hex_address;

/// Round lifecycle states. The integer encoding is shared with the contract
/// and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
	Waiting = 0,
	Betting = 1,
	Drawing = 2,
	Completed = 3,
	Refunded = 4,
}

impl RoundState {
	pub fn from_u8(value: u8) -> Option<Self> {
		match value {
			0 => Some(RoundState::Waiting),
			1 => Some(RoundState::Betting),
			2 => Some(RoundState::Drawing),
			3 => Some(RoundState::Completed),
			4 => Some(RoundState::Refunded),
			_ => None,
		}
	}

	pub fn as_u8(self) -> u8 {
		self as u8
	}

	/// Upper-case wire label, e.g. `BETTING`.
	pub fn label(self) -> &'static str {
		match self {
			RoundState::Waiting => "WAITING",
			RoundState::Betting => "BETTING",
			RoundState::Drawing => "DRAWING",
			RoundState::Completed => "COMPLETED",
			RoundState::Refunded => "REFUNDED",
		}
	}

	/// Lower-case wire name, e.g. `betting`.
	pub fn name(self) -> &'static str {
		match self {
			RoundState::Waiting => "waiting",
			RoundState::Betting => "betting",
			RoundState::Drawing => "drawing",
			RoundState::Completed => "completed",
			RoundState::Refunded => "refunded",
		}
	}
}

/// Snapshot of the on-chain `LotteryRound` struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LotteryRound {
	pub round_id: u64,
	pub start_time: u64,
	pub end_time: u64,
	pub min_draw_time: u64,
	pub max_draw_time: u64,
	pub total_pot: U256,
	pub participant_count: u64,
	pub winner: Option<Address>,
	pub publisher_commission: U256,
	pub sparsity_commission: U256,
	pub winner_prize: U256,
	pub state: RoundState,
}

/// Normalised result of `Lottery.getConfig()`. Commissions are basis points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractConfig {
	pub publisher: Address,
	pub sparsity: Address,
	pub operator: Address,
	pub publisher_commission: u64,
	pub sparsity_commission: u64,
	pub min_bet: U256,
	pub betting_duration: u64,
	pub min_draw_delay: u64,
	pub max_draw_delay: u64,
	pub min_end_time_extension: u64,
	pub min_participants: u64,
}

/// Aggregated stake of one participant in the active round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantSummary {
	pub address: Address,
	pub total_amount: U256,
}

/// Historical record of a completed or refunded round. Created once per
/// terminal transition and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundSnapshot {
	pub event_type: String,
	pub round_id: u64,
	pub participant_count: u64,
	pub total_pot: U256,
	pub finished_at: u64,
	pub winner: Option<Address>,
	pub winner_prize: U256,
	pub refund_reason: Option<String>,
}

/// Entry in the frontend activity feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveFeedItem {
	pub event_type: String,
	pub message: String,
	pub details: Map<String, Value>,
	pub event_time: u64,
	pub round_id: u64,
}

impl LiveFeedItem {
	/// Stable identity used by the UI for deduplication.
	pub fn item_id(&self) -> String {
		format!("{}-{}-{}", self.round_id, self.event_time, self.event_type)
	}
}

pub fn serialize_round(round: &LotteryRound) -> Value {
	json!({
		"round_id": round.round_id,
		"state": round.state.as_u8(),
		"state_label": round.state.label(),
		"state_name": round.state.name(),
		"start_time": round.start_time,
		"end_time": round.end_time,
		"min_draw_time": round.min_draw_time,
		"max_draw_time": round.max_draw_time,
		"total_pot": round.total_pot.to_string(),
		"participant_count": round.participant_count,
		"winner": round.winner.map(|w| lower_hex_address(&w)),
		"publisher_commission": round.publisher_commission.to_string(),
		"sparsity_commission": round.sparsity_commission.to_string(),
		"winner_prize": round.winner_prize.to_string(),
	})
}

/// Shape returned wherever a round is expected but none is active.
pub fn serialize_no_round() -> Value {
	json!({
		"round_id": 0,
		"state": RoundState::Waiting.as_u8(),
		"state_label": RoundState::Waiting.label(),
		"state_name": RoundState::Waiting.name(),
	})
}

pub fn serialize_participant(participant: &ParticipantSummary) -> Value {
	json!({
		"address": lower_hex_address(&participant.address),
		"totalAmountWei": participant.total_amount.to_string(),
	})
}

pub fn serialize_snapshot(snapshot: &RoundSnapshot) -> Value {
	json!({
		"event_type": snapshot.event_type,
		"round_id": snapshot.round_id,
		"participant_count": snapshot.participant_count,
		"total_pot_wei": snapshot.total_pot.to_string(),
		"finished_at": snapshot.finished_at,
		"winner": snapshot.winner.map(|w| lower_hex_address(&w)),
		"winner_prize_wei": snapshot.winner_prize.to_string(),
		"refund_reason": snapshot.refund_reason,
	})
}

pub fn serialize_feed_item(item: &LiveFeedItem) -> Value {
	json!({
		"activity_id": item.item_id(),
		"event_type": item.event_type,
		"message": item.message,
		"details": item.details,
		"round_id": item.round_id,
		"timestamp": item.event_time,
	})
}

pub fn serialize_config(config: &ContractConfig) -> Value {
	json!({
		"publisher": lower_hex_address(&config.publisher),
		"sparsity": lower_hex_address(&config.sparsity),
		"operator": lower_hex_address(&config.operator),
		"publisher_commission": config.publisher_commission,
		"sparsity_commission": config.sparsity_commission,
		"min_bet": config.min_bet.to_string(),
		"betting_duration": config.betting_duration,
		"min_draw_delay": config.min_draw_delay,
		"max_draw_delay": config.max_draw_delay,
		"min_end_time_extension": config.min_end_time_extension,
		"min_participants": config.min_participants,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_state_wire_encoding_is_stable() {
		assert_eq!(RoundState::Waiting.as_u8(), 0);
		assert_eq!(RoundState::Betting.as_u8(), 1);
		assert_eq!(RoundState::Drawing.as_u8(), 2);
		assert_eq!(RoundState::Completed.as_u8(), 3);
		assert_eq!(RoundState::Refunded.as_u8(), 4);
		assert_eq!(RoundState::from_u8(1), Some(RoundState::Betting));
		assert_eq!(RoundState::from_u8(5), None);
	}

	#[test]
	fn no_round_shape_matches_wire_contract() {
		let value = serialize_no_round();
		assert_eq!(value["round_id"], 0);
		assert_eq!(value["state"], 0);
		assert_eq!(value["state_name"], "waiting");
		assert_eq!(value["state_label"], "WAITING");
	}

	#[test]
	fn wei_values_serialize_as_decimal_strings() {
		let round = LotteryRound {
			round_id: 7,
			start_time: 100,
			end_time: 200,
			min_draw_time: 210,
			max_draw_time: 300,
			total_pot: U256::from_dec_str("123456789012345678901234567890").unwrap(),
			participant_count: 2,
			winner: None,
			publisher_commission: U256::zero(),
			sparsity_commission: U256::zero(),
			winner_prize: U256::zero(),
			state: RoundState::Betting,
		};
		let value = serialize_round(&round);
		assert_eq!(value["total_pot"], "123456789012345678901234567890");
		assert_eq!(value["winner"], Value::Null);
	}

	#[test]
	fn feed_item_identity_is_round_time_type() {
		let item = LiveFeedItem {
			event_type: "BetPlaced".to_string(),
			message: "msg".to_string(),
			details: Map::new(),
			event_time: 1234,
			round_id: 7,
		};
		assert_eq!(item.item_id(), "7-1234-BetPlaced");
	}
}

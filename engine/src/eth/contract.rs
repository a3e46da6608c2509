//! Typed wrapper around the Lottery contract ABI: call-data encoding for the
//! view/write methods and client-side decoding of event logs.

use ethers::abi::{Abi, RawLog, Token};
use ethers::types::{Address, Log, H256, U256};
use serde_json::{Map, Value};

use crate::eth::{error::ChainClientError, lower_hex_address};
use crate::store::models::{ContractConfig, LotteryRound, RoundState};

/// Event names this backend understands. Logs with any other signature are
/// skipped during decoding.
pub const WATCHED_EVENTS: &[&str] = &[
	"RoundCreated",
	"RoundStateChanged",
	"BetPlaced",
	"EndTimeExtended",
	"RoundCompleted",
	"RoundRefunded",
	"MinBetAmountUpdated",
	"BettingDurationUpdated",
	"MinParticipantsUpdated",
];

const EMBEDDED_ABI: &[u8] = include_bytes!("abis/Lottery.json");

/// A decoded log: the event name plus its parameters as JSON scalars
/// (addresses lowercased, uints as decimal strings).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
	pub name: String,
	pub params: Map<String, Value>,
}

pub struct LotteryContract {
	pub address: Address,
	abi: Abi,
}

impl LotteryContract {
	pub fn new(address: Address, abi_json: &[u8]) -> Result<Self, ChainClientError> {
		let abi = Abi::load(abi_json)
			.map_err(|e| ChainClientError::Config(format!("cannot parse Lottery ABI: {e}")))?;

		for event in WATCHED_EVENTS {
			if abi.event(event).is_err() {
				return Err(ChainClientError::Config(format!(
					"Lottery ABI is missing the {event} event"
				)));
			}
		}
		Ok(Self { address, abi })
	}

	/// Builds the contract against the ABI compiled into the binary.
	pub fn embedded(address: Address) -> Result<Self, ChainClientError> {
		Self::new(address, EMBEDDED_ABI)
	}

	/// Builds the contract from an ABI file on disk.
	pub fn from_abi_path(address: Address, path: &str) -> Result<Self, ChainClientError> {
		let bytes = std::fs::read(path)
			.map_err(|e| ChainClientError::Config(format!("cannot read ABI at {path}: {e}")))?;
		Self::new(address, &bytes)
	}

	fn function(&self, name: &str) -> &ethers::abi::Function {
		self.abi
			.function(name)
			.unwrap_or_else(|_| panic!("function '{name}' should be defined in the Lottery abi"))
	}

	fn event(&self, name: &str) -> &ethers::abi::Event {
		self.abi
			.event(name)
			.unwrap_or_else(|_| panic!("event '{name}' should be defined in the Lottery abi"))
	}

	/// Topic0 for one of the watched events.
	pub fn event_signature(&self, name: &str) -> H256 {
		self.event(name).signature()
	}

	// ----------------------------------------------------------------
	// Call data
	// ----------------------------------------------------------------

	pub fn get_config_call(&self) -> Vec<u8> {
		self.function("getConfig")
			.encode_input(&[])
			.expect("getConfig takes no arguments")
	}

	pub fn get_round_call(&self) -> Vec<u8> {
		self.function("getRound").encode_input(&[]).expect("getRound takes no arguments")
	}

	pub fn get_participants_call(&self) -> Vec<u8> {
		self.function("getParticipants")
			.encode_input(&[])
			.expect("getParticipants takes no arguments")
	}

	pub fn get_bet_amount_call(&self, player: Address) -> Vec<u8> {
		self.function("getBetAmount")
			.encode_input(&[Token::Address(player)])
			.expect("getBetAmount takes one address")
	}

	pub fn draw_winner_call(&self, round_id: u64) -> Vec<u8> {
		self.function("drawWinner")
			.encode_input(&[Token::Uint(U256::from(round_id))])
			.expect("drawWinner takes one uint256")
	}

	pub fn refund_round_call(&self, round_id: u64) -> Vec<u8> {
		self.function("refundRound")
			.encode_input(&[Token::Uint(U256::from(round_id))])
			.expect("refundRound takes one uint256")
	}

	// ----------------------------------------------------------------
	// Output decoding
	// ----------------------------------------------------------------

	pub fn decode_config(&self, output: &[u8]) -> Result<ContractConfig, ChainClientError> {
		let tokens = self
			.function("getConfig")
			.decode_output(output)
			.map_err(|e| ChainClientError::Decode(format!("getConfig: {e}")))?;
		decode_config_tokens(tokens)
	}

	/// Returns `None` for `round_id == 0`, the contract's "no active round"
	/// marker. A zero winner address is normalised to absent.
	pub fn decode_round(&self, output: &[u8]) -> Result<Option<LotteryRound>, ChainClientError> {
		let tokens = self
			.function("getRound")
			.decode_output(output)
			.map_err(|e| ChainClientError::Decode(format!("getRound: {e}")))?;
		decode_round_tokens(tokens)
	}

	pub fn decode_participants(&self, output: &[u8]) -> Result<Vec<Address>, ChainClientError> {
		let tokens = self
			.function("getParticipants")
			.decode_output(output)
			.map_err(|e| ChainClientError::Decode(format!("getParticipants: {e}")))?;
		match tokens.into_iter().next() {
			Some(Token::Array(items)) => items
				.into_iter()
				.map(|t| token_as_address(&t))
				.collect::<Option<Vec<_>>>()
				.ok_or_else(|| {
					ChainClientError::Decode("getParticipants: non-address entry".to_string())
				}),
			other => Err(ChainClientError::Decode(format!(
				"getParticipants: expected address[], got {other:?}"
			))),
		}
	}

	pub fn decode_bet_amount(&self, output: &[u8]) -> Result<U256, ChainClientError> {
		let tokens = self
			.function("getBetAmount")
			.decode_output(output)
			.map_err(|e| ChainClientError::Decode(format!("getBetAmount: {e}")))?;
		tokens
			.first()
			.and_then(token_as_u256)
			.ok_or_else(|| ChainClientError::Decode("getBetAmount: expected uint256".to_string()))
	}

	// ----------------------------------------------------------------
	// Log decoding
	// ----------------------------------------------------------------

	/// Decodes one log against the watched events. Unknown signatures and
	/// malformed payloads return `None`; the caller skips them.
	pub fn decode_log(&self, log: &Log) -> Option<DecodedEvent> {
		let topic0 = log.topics.first()?;
		let name = WATCHED_EVENTS
			.iter()
			.find(|name| self.event(name).signature() == *topic0)?;

		let raw = RawLog { topics: log.topics.clone(), data: log.data.to_vec() };
		let parsed = match self.event(name).parse_log(raw) {
			Ok(parsed) => parsed,
			Err(e) => {
				tracing::warn!(event = name, error = %e, "undecodable log, skipping");
				return None;
			},
		};

		let mut params = Map::new();
		for param in parsed.params {
			params.insert(param.name, token_to_json(&param.value));
		}
		Some(DecodedEvent { name: name.to_string(), params })
	}
}

fn flatten_struct_return(tokens: Vec<Token>) -> Vec<Token> {
	// `getConfig`/`getRound` may come back either as a single named-struct
	// token or as a flat positional tuple; both carry the fields in the
	// same order.
	match tokens.as_slice() {
		[Token::Tuple(_)] => match tokens.into_iter().next() {
			Some(Token::Tuple(inner)) => inner,
			_ => unreachable!("just matched a single tuple token"),
		},
		_ => tokens,
	}
}

pub fn decode_config_tokens(tokens: Vec<Token>) -> Result<ContractConfig, ChainClientError> {
	let tokens = flatten_struct_return(tokens);
	if tokens.len() != 11 {
		return Err(ChainClientError::Decode(format!(
			"getConfig: expected 11 fields, got {}",
			tokens.len()
		)));
	}

	let address = |i: usize| {
		token_as_address(&tokens[i])
			.ok_or_else(|| ChainClientError::Decode(format!("getConfig field {i}: not an address")))
	};
	let uint = |i: usize| {
		token_as_u256(&tokens[i])
			.ok_or_else(|| ChainClientError::Decode(format!("getConfig field {i}: not a uint")))
	};

	Ok(ContractConfig {
		publisher: address(0)?,
		sparsity: address(1)?,
		operator: address(2)?,
		publisher_commission: uint(3)?.as_u64(),
		sparsity_commission: uint(4)?.as_u64(),
		min_bet: uint(5)?,
		betting_duration: uint(6)?.as_u64(),
		min_draw_delay: uint(7)?.as_u64(),
		max_draw_delay: uint(8)?.as_u64(),
		min_end_time_extension: uint(9)?.as_u64(),
		min_participants: uint(10)?.as_u64(),
	})
}

pub fn decode_round_tokens(
	tokens: Vec<Token>,
) -> Result<Option<LotteryRound>, ChainClientError> {
	let tokens = flatten_struct_return(tokens);
	if tokens.len() != 12 {
		return Err(ChainClientError::Decode(format!(
			"getRound: expected 12 fields, got {}",
			tokens.len()
		)));
	}

	let uint = |i: usize| {
		token_as_u256(&tokens[i])
			.ok_or_else(|| ChainClientError::Decode(format!("getRound field {i}: not a uint")))
	};

	let round_id = uint(0)?.as_u64();
	if round_id == 0 {
		return Ok(None);
	}

	let winner = token_as_address(&tokens[7])
		.ok_or_else(|| ChainClientError::Decode("getRound field 7: not an address".to_string()))?;
	let state_raw = uint(11)?.as_u64();
	let state = RoundState::from_u8(state_raw as u8).ok_or_else(|| {
		ChainClientError::Decode(format!("getRound: unknown round state {state_raw}"))
	})?;

	Ok(Some(LotteryRound {
		round_id,
		start_time: uint(1)?.as_u64(),
		end_time: uint(2)?.as_u64(),
		min_draw_time: uint(3)?.as_u64(),
		max_draw_time: uint(4)?.as_u64(),
		total_pot: uint(5)?,
		participant_count: uint(6)?.as_u64(),
		winner: (!winner.is_zero()).then_some(winner),
		publisher_commission: uint(8)?,
		sparsity_commission: uint(9)?,
		winner_prize: uint(10)?,
		state,
	}))
}

fn token_as_address(token: &Token) -> Option<Address> {
	match token {
		Token::Address(address) => Some(*address),
		_ => None,
	}
}

fn token_as_u256(token: &Token) -> Option<U256> {
	match token {
		Token::Uint(value) => Some(*value),
		_ => None,
	}
}

fn token_to_json(token: &Token) -> Value {
	match token {
		Token::Address(address) => Value::String(lower_hex_address(address)),
		Token::Uint(value) | Token::Int(value) => Value::String(value.to_string()),
		Token::Bool(value) => Value::Bool(*value),
		Token::String(value) => Value::String(value.clone()),
		Token::Bytes(bytes) | Token::FixedBytes(bytes) =>
			Value::String(format!("0x{}", hex::encode(bytes))),
		Token::Array(items) | Token::FixedArray(items) | Token::Tuple(items) =>
			Value::Array(items.iter().map(token_to_json).collect()),
	}
}

/// Left-pads a 20-byte address into a 32-byte topic.
pub fn address_topic(address: Address) -> H256 {
	let mut buf = [0u8; 32];
	buf[12..].copy_from_slice(address.as_bytes());
	H256::from(buf)
}

/// Big-endian uint256 topic.
pub fn uint_topic(value: U256) -> H256 {
	let mut buf = [0u8; 32];
	value.to_big_endian(&mut buf);
	H256::from(buf)
}

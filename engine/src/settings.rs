use std::collections::HashMap;

use clap::Parser;
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat, Map, Source, Value};
use ethers::types::Address;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "config/lottery.conf";

#[derive(Debug, Deserialize, Clone)]
pub struct Blockchain {
	pub rpc_url: String,
	pub chain_id: u64,
	pub contract_address: String,
	/// Expected operator address; the key-injection endpoint refuses any
	/// private key that does not derive to this address.
	pub operator_address: String,
	/// Optional gas price override in gwei. Absent means "ask the node".
	pub gas_price: Option<f64>,
	pub gas_multiplier: f64,
	/// Optional path to the Lottery ABI json. The embedded copy is used
	/// when unset.
	pub abi_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Server {
	pub host: String,
	pub port: u16,
	/// Directory holding the prebuilt SPA bundle.
	pub static_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Operator {
	pub tx_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventManager {
	pub contract_config_interval_sec: u64,
	pub round_and_participants_interval_sec: u64,
	pub start_block_offset: u64,
	pub live_feed_max_entries: usize,
	pub round_history_max: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
	pub blockchain: Blockchain,
	pub server: Server,
	pub operator: Operator,
	pub event_manager: EventManager,
}

#[derive(Parser, Debug, Clone, Default)]
#[clap(version)]
pub struct CommandLineOptions {
	#[clap(short = 'c', long = "config-path")]
	pub config_path: Option<String>,

	#[clap(long = "blockchain.rpc_url")]
	rpc_url: Option<String>,
	#[clap(long = "blockchain.contract_address")]
	contract_address: Option<String>,
	#[clap(long = "server.host")]
	host: Option<String>,
	#[clap(long = "server.port")]
	port: Option<u16>,
}

pub fn insert_command_line_option<T>(map: &mut Map<String, Value>, key: &str, option: &Option<T>)
where
	T: Clone + Into<Value>,
{
	if let Some(value) = option {
		map.insert(key.to_string(), value.clone().into());
	}
}

impl Source for CommandLineOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new((*self).clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();

		insert_command_line_option(&mut map, "blockchain.rpc_url", &self.rpc_url);
		insert_command_line_option(&mut map, "blockchain.contract_address", &self.contract_address);
		insert_command_line_option(&mut map, "server.host", &self.host);
		insert_command_line_option(&mut map, "server.port", &self.port.map(|p| p as i64));

		Ok(map)
	}
}

/// Environment overrides of the form `BLOCKCHAIN_RPC_URL=...` mapping onto
/// `blockchain.rpc_url`. Section prefixes are fixed; anything else in the
/// environment is ignored.
#[derive(Debug, Clone, Default)]
struct EnvOverrides;

const ENV_SECTIONS: &[(&str, &str)] = &[
	("BLOCKCHAIN_", "blockchain"),
	("SERVER_", "server"),
	("OPERATOR_", "operator"),
	("EVENT_MANAGER_", "event_manager"),
	("APP_", "app"),
];

impl Source for EnvOverrides {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new(self.clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();
		for (var, value) in std::env::vars() {
			for (prefix, section) in ENV_SECTIONS {
				if let Some(key) = var.strip_prefix(prefix) {
					map.insert(
						format!("{}.{}", section, key.to_lowercase()),
						Value::from(value.clone()),
					);
					break;
				}
			}
		}
		Ok(map)
	}
}

impl Settings {
	pub fn load(opts: &CommandLineOptions) -> Result<Self, ConfigError> {
		let config_path =
			opts.config_path.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

		let mut settings: Settings = Self::set_defaults(Config::builder())?
			.add_source(File::new(&config_path, FileFormat::Json).required(false))
			.add_source(EnvOverrides)
			.add_source(opts.clone())
			.build()?
			.try_deserialize()?;

		settings.validate()?;
		Ok(settings)
	}

	fn set_defaults(
		builder: ConfigBuilder<config::builder::DefaultState>,
	) -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError> {
		builder
			.set_default("blockchain.rpc_url", "http://localhost:8545")?
			.set_default("blockchain.chain_id", 31337_i64)?
			.set_default("blockchain.contract_address", "")?
			.set_default("blockchain.operator_address", "")?
			.set_default("blockchain.gas_multiplier", 1.15_f64)?
			.set_default("server.host", "0.0.0.0")?
			.set_default("server.port", 6080_i64)?
			.set_default("server.static_dir", "frontend/dist")?
			.set_default("operator.tx_timeout_seconds", 180_i64)?
			.set_default("event_manager.contract_config_interval_sec", 10_i64)?
			.set_default("event_manager.round_and_participants_interval_sec", 2_i64)?
			.set_default("event_manager.start_block_offset", 500_i64)?
			.set_default("event_manager.live_feed_max_entries", 1000_i64)?
			.set_default("event_manager.round_history_max", 100_i64)
	}

	fn validate(&mut self) -> Result<(), ConfigError> {
		if self.blockchain.contract_address.is_empty() {
			return Err(ConfigError::Message(
				"blockchain.contract_address is not configured".to_string(),
			));
		}
		self.blockchain
			.contract_address
			.parse::<Address>()
			.map_err(|e| {
				ConfigError::Message(format!(
					"blockchain.contract_address is not a valid address: {e}"
				))
			})?;
		if !self.blockchain.operator_address.is_empty() {
			self.blockchain.operator_address.parse::<Address>().map_err(|e| {
				ConfigError::Message(format!(
					"blockchain.operator_address is not a valid address: {e}"
				))
			})?;
		}
		if self.blockchain.gas_multiplier <= 0.0 {
			return Err(ConfigError::Message(
				"blockchain.gas_multiplier must be positive".to_string(),
			));
		}
		Ok(())
	}
}

//! HTTP + WebSocket gateway. Stateless over the store: every endpoint
//! renders a snapshot taken at request time.

pub mod ws;

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{info, warn};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::constants::{MAX_QUERY_LIMIT, SNAPSHOT_FEED_LIMIT, SNAPSHOT_HISTORY_LIMIT};
use crate::enclave::{operator_key, Attestor, EnclaveKeyPair, InstallError};
use crate::eth::rpc::EthRpcApi;
use crate::eth::{lower_hex_address, LotteryChainApi, LotteryChainClient};
use crate::operator::OperatorStatusHandle;
use crate::store::{models, MemoryStore};
use crate::web::ws::WsHub;

pub struct Gateway<R: EthRpcApi> {
	pub store: Arc<MemoryStore>,
	pub chain: Arc<LotteryChainClient<R>>,
	pub operator: OperatorStatusHandle,
	pub keypair: Arc<EnclaveKeyPair>,
	pub attestor: Arc<dyn Attestor>,
	pub hub: Arc<WsHub>,
	pub expected_operator_address: String,
	pub static_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
	limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct PlayerQuery {
	player: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SetOperatorKeyRequest {
	encrypted_private_key: Option<String>,
}

fn now_iso() -> String {
	chrono::Utc::now().to_rfc3339()
}

fn now_millis() -> i64 {
	chrono::Utc::now().timestamp_millis()
}

fn u256_to_f64(value: &ethers::types::U256) -> f64 {
	value.to_string().parse().unwrap_or(0.0)
}

fn clamp_limit(limit: Option<usize>, default: usize) -> usize {
	limit.unwrap_or(default).clamp(1, MAX_QUERY_LIMIT)
}

fn json_reply(value: &Value, status: StatusCode) -> warp::reply::WithStatus<warp::reply::Json> {
	warp::reply::with_status(warp::reply::json(value), status)
}

fn ok(value: Value) -> warp::reply::WithStatus<warp::reply::Json> {
	json_reply(&value, StatusCode::OK)
}

/// Binds the gateway and serves until `shutdown` fires. Bind failures are
/// fatal: the caller exits with status 1.
pub async fn serve<R: EthRpcApi>(
	gateway: Arc<Gateway<R>>,
	host: &str,
	port: u16,
	mut shutdown: watch::Receiver<()>,
) -> anyhow::Result<()> {
	let addr = SocketAddr::new(
		host.parse::<IpAddr>().with_context(|| format!("invalid bind host {host}"))?,
		port,
	);

	let routes = routes(Arc::clone(&gateway));
	let (bound, serving) = warp::serve(routes)
		.try_bind_with_graceful_shutdown(addr, async move {
			let _ = shutdown.changed().await;
		})
		.with_context(|| format!("cannot bind web gateway to {addr}"))?;

	info!(%bound, "web gateway listening");
	serving.await;
	info!("web gateway stopped");
	Ok(())
}

pub fn routes<R: EthRpcApi>(
	gateway: Arc<Gateway<R>>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
	let cors = warp::cors()
		.allow_any_origin()
		.allow_methods(vec!["GET", "POST"])
		.allow_headers(vec!["content-type"]);

	api_routes(Arc::clone(&gateway))
		.or(ws_route(Arc::clone(&gateway)))
		.or(warp::get().and(warp::fs::dir(gateway.static_dir.clone())))
		.or(spa_fallback(gateway))
		.with(cors)
		.recover(handle_rejection)
}

fn with_gateway<R: EthRpcApi>(
	gateway: Arc<Gateway<R>>,
) -> impl Filter<Extract = (Arc<Gateway<R>>,), Error = Infallible> + Clone {
	warp::any().map(move || Arc::clone(&gateway))
}

fn api_routes<R: EthRpcApi>(
	gateway: Arc<Gateway<R>>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	let health = warp::path!("api" / "health")
		.and(warp::get())
		.and(with_gateway(Arc::clone(&gateway)))
		.then(health_handler);

	let status = warp::path!("api" / "status")
		.and(warp::get())
		.and(with_gateway(Arc::clone(&gateway)))
		.then(status_handler);

	let round_status = warp::path!("api" / "round" / "status")
		.and(warp::get())
		.and(with_gateway(Arc::clone(&gateway)))
		.then(round_status_handler);

	let participants = warp::path!("api" / "round" / "participants")
		.and(warp::get())
		.and(warp::query::<LimitQuery>())
		.and(with_gateway(Arc::clone(&gateway)))
		.then(participants_handler);

	let player = warp::path!("api" / "round" / "player")
		.and(warp::get())
		.and(warp::query::<PlayerQuery>())
		.and(with_gateway(Arc::clone(&gateway)))
		.then(player_handler);

	let history = warp::path!("api" / "history")
		.and(warp::get())
		.and(warp::query::<LimitQuery>())
		.and(with_gateway(Arc::clone(&gateway)))
		.then(history_handler);

	let activities = warp::path!("api" / "activities")
		.and(warp::get())
		.and(warp::query::<LimitQuery>())
		.and(with_gateway(Arc::clone(&gateway)))
		.then(activities_handler);

	let contract_config = warp::path!("api" / "contract" / "config")
		.and(warp::get())
		.and(with_gateway(Arc::clone(&gateway)))
		.then(contract_config_handler);

	let contract_address = warp::path!("api" / "contract" / "address")
		.and(warp::get())
		.and(with_gateway(Arc::clone(&gateway)))
		.then(contract_address_handler);

	let attestation = warp::path!("api" / "attestation")
		.and(warp::get())
		.and(with_gateway(Arc::clone(&gateway)))
		.then(attestation_handler);

	let get_pub_key = warp::path!("api" / "get_pub_key")
		.and(warp::get())
		.and(with_gateway(Arc::clone(&gateway)))
		.then(get_pub_key_handler);

	let set_operator_key = warp::path!("api" / "set_operator_key")
		.and(warp::post())
		.and(warp::body::json::<SetOperatorKeyRequest>())
		.and(with_gateway(gateway))
		.then(set_operator_key_handler);

	health
		.or(status)
		.or(round_status)
		.or(participants)
		.or(player)
		.or(history)
		.or(activities)
		.or(contract_config)
		.or(contract_address)
		.or(attestation)
		.or(get_pub_key)
		.or(set_operator_key)
}

fn ws_route<R: EthRpcApi>(
	gateway: Arc<Gateway<R>>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	warp::path!("ws" / "lottery")
		.and(warp::ws())
		.and(with_gateway(gateway))
		.map(|upgrade: warp::ws::Ws, gateway: Arc<Gateway<R>>| {
			upgrade.on_upgrade(move |socket| async move {
				let snapshot = build_snapshot(&gateway);
				ws::handle_socket(socket, Arc::clone(&gateway.hub), snapshot).await;
			})
		})
}

fn spa_fallback<R: EthRpcApi>(
	gateway: Arc<Gateway<R>>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	warp::get()
		.and(warp::path::tail())
		.and(with_gateway(gateway))
		.and_then(|tail: warp::path::Tail, gateway: Arc<Gateway<R>>| async move {
			let path = tail.as_str();
			if path.starts_with("api") || path.starts_with("ws") {
				return Err(warp::reject::not_found());
			}
			let index = gateway.static_dir.join("index.html");
			let html = tokio::fs::read_to_string(index)
				.await
				.unwrap_or_else(|_| "<h1>Lottery frontend not built</h1>".to_string());
			Ok(warp::reply::html(html))
		})
}

async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
	let (status, error) = if rejection.is_not_found() {
		(StatusCode::NOT_FOUND, "Not found".to_string())
	} else if rejection.find::<warp::filters::body::BodyDeserializeError>().is_some() {
		(StatusCode::BAD_REQUEST, "Invalid request body".to_string())
	} else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
		(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
	} else {
		warn!(?rejection, "unhandled rejection");
		(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
	};
	Ok(json_reply(&json!({ "error": error }), status))
}

/// The `snapshot` message sent to every freshly accepted WebSocket.
pub fn build_snapshot<R: EthRpcApi>(gateway: &Gateway<R>) -> Value {
	json!({
		"round": gateway.store.round_payload(),
		"participants": gateway.store.participants_payload(),
		"history": gateway
			.store
			.history(Some(SNAPSHOT_HISTORY_LIMIT))
			.iter()
			.map(models::serialize_snapshot)
			.collect::<Vec<_>>(),
		"live_feed": gateway
			.store
			.live_feed(Some(SNAPSHOT_FEED_LIMIT))
			.iter()
			.map(models::serialize_feed_item)
			.collect::<Vec<_>>(),
		"operator": gateway.operator.status(),
		"config": gateway.store.contract_config().map(|c| models::serialize_config(&c)),
	})
}

async fn health_handler<R: EthRpcApi>(gateway: Arc<Gateway<R>>) -> impl Reply {
	let blockchain = gateway.chain.health_check().await;
	let operator = gateway.operator.status();
	let round_id = gateway.store.current_round().map(|round| round.round_id).unwrap_or(0);

	ok(json!({
		"status": "ok",
		"timestamp": now_iso(),
		"components": {
			"web": true,
			"operator": operator["status"],
			"blockchain": blockchain,
			"store": { "round": round_id },
		},
	}))
}

async fn status_handler<R: EthRpcApi>(gateway: Arc<Gateway<R>>) -> impl Reply {
	ok(json!({
		"timestamp": now_iso(),
		"round": gateway.store.round_payload(),
		"participants": gateway.store.participants_payload(),
		"recent_history": gateway
			.store
			.history(Some(5))
			.iter()
			.map(models::serialize_snapshot)
			.collect::<Vec<_>>(),
		"operator": gateway.operator.status(),
		"blockchain": gateway.chain.client_status(),
		"websocket_connections": gateway.hub.client_count(),
	}))
}

async fn round_status_handler<R: EthRpcApi>(gateway: Arc<Gateway<R>>) -> impl Reply {
	ok(gateway.store.round_payload())
}

async fn participants_handler<R: EthRpcApi>(
	query: LimitQuery,
	gateway: Arc<Gateway<R>>,
) -> impl Reply {
	let Some(round) = gateway.store.current_round() else {
		return ok(json!({
			"round_id": 0,
			"participants": [],
			"total_participants": 0,
			"total_amount_wei": "0",
			"timestamp": now_iso(),
		}));
	};

	let all = gateway.store.participants();
	let limit = clamp_limit(query.limit, MAX_QUERY_LIMIT);
	let shown = &all[..all.len().min(limit)];
	let total_amount: ethers::types::U256 =
		shown.iter().fold(Default::default(), |acc, p| acc + p.total_amount);

	ok(json!({
		"round_id": round.round_id,
		"round_state": round.state.label(),
		"participants": shown.iter().map(models::serialize_participant).collect::<Vec<_>>(),
		"total_participants": all.len(),
		"total_amount_wei": total_amount.to_string(),
		"timestamp": now_iso(),
	}))
}

async fn player_handler<R: EthRpcApi>(query: PlayerQuery, gateway: Arc<Gateway<R>>) -> impl Reply {
	let Some(player) = query.player.filter(|p| !p.is_empty()) else {
		return json_reply(
			&json!({ "error": "Missing required query parameter: player" }),
			StatusCode::BAD_REQUEST,
		);
	};

	let round = gateway.store.current_round();
	let total = gateway
		.store
		.participants()
		.iter()
		.find(|p| lower_hex_address(&p.address) == player.to_lowercase())
		.map(|p| p.total_amount)
		.unwrap_or_default();

	// The player's share of the pot, as a percentage.
	let win_rate = match &round {
		Some(round) if !round.total_pot.is_zero() =>
			u256_to_f64(&total) / u256_to_f64(&round.total_pot) * 100.0,
		_ => 0.0,
	};

	ok(json!({
		"player": player,
		"round_id": round.map(|r| r.round_id).unwrap_or(0),
		"totalAmountWei": total.to_string(),
		"winRate": win_rate,
		"timestamp": now_iso(),
	}))
}

async fn history_handler<R: EthRpcApi>(query: LimitQuery, gateway: Arc<Gateway<R>>) -> impl Reply {
	let limit = clamp_limit(query.limit, 50);
	let history = gateway.store.history(Some(limit));

	let completed = history.iter().filter(|s| s.event_type == "RoundCompleted").count();
	let refunded = history.iter().filter(|s| s.event_type == "RoundRefunded").count();
	let volume: ethers::types::U256 =
		history.iter().fold(Default::default(), |acc, s| acc + s.total_pot);

	ok(json!({
		"rounds": history.iter().map(models::serialize_snapshot).collect::<Vec<_>>(),
		"summary": {
			"total_rounds": history.len(),
			"completed_rounds": completed,
			"refunded_rounds": refunded,
			"total_volume_wei": volume.to_string(),
		},
		"pagination": { "limit": limit, "returned": history.len() },
		"timestamp": now_iso(),
	}))
}

async fn activities_handler<R: EthRpcApi>(
	query: LimitQuery,
	gateway: Arc<Gateway<R>>,
) -> impl Reply {
	let limit = clamp_limit(query.limit, 50);
	let feed = gateway.store.live_feed(Some(limit));
	ok(json!({
		"activities": feed.iter().map(models::serialize_feed_item).collect::<Vec<_>>(),
	}))
}

async fn contract_config_handler<R: EthRpcApi>(gateway: Arc<Gateway<R>>) -> impl Reply {
	let config = match gateway.store.contract_config() {
		Some(config) => config,
		// Cold path: the config loop has not run yet, fetch on demand.
		None => match gateway.chain.get_contract_config().await {
			Ok(config) => {
				gateway.store.set_contract_config(config.clone());
				config
			},
			Err(e) => {
				return json_reply(
					&json!({ "error": format!("contract config unavailable: {e}") }),
					StatusCode::SERVICE_UNAVAILABLE,
				);
			},
		},
	};

	ok(json!({
		"config": models::serialize_config(&config),
		"contract_address": lower_hex_address(&gateway.chain.contract_address()),
		"timestamp": now_iso(),
	}))
}

async fn contract_address_handler<R: EthRpcApi>(gateway: Arc<Gateway<R>>) -> impl Reply {
	ok(json!({
		"contract_address": lower_hex_address(&gateway.chain.contract_address()),
		"timestamp": now_iso(),
	}))
}

async fn attestation_handler<R: EthRpcApi>(gateway: Arc<Gateway<R>>) -> impl Reply {
	let operator_address = gateway
		.chain
		.operator_address()
		.map(|address| ethers::utils::to_checksum(&address, None));
	ok(gateway.attestor.document(operator_address))
}

async fn get_pub_key_handler<R: EthRpcApi>(gateway: Arc<Gateway<R>>) -> impl Reply {
	ok(json!({
		"public_key_pem": gateway.keypair.public_key_pem(),
		"public_key_hex": gateway.keypair.public_key_hex(),
		"curve": "secp384r1",
		"key_size": 384,
		"usage": "Use this public key to encrypt the operator private key with ECIES",
		"timestamp": now_millis(),
	}))
}

async fn set_operator_key_handler<R: EthRpcApi>(
	request: SetOperatorKeyRequest,
	gateway: Arc<Gateway<R>>,
) -> impl Reply {
	let encrypted = request.encrypted_private_key.unwrap_or_default();
	match operator_key::install_operator_key(
		&gateway.chain,
		&gateway.keypair,
		&gateway.expected_operator_address,
		&encrypted,
	) {
		Ok(operator_address) => ok(json!({
			"success": true,
			"operator_address": operator_address,
			"message": "Operator key set successfully",
			"timestamp": now_millis(),
		})),
		Err(InstallError::AlreadySet { operator_address }) => json_reply(
			&json!({
				"success": false,
				"error": "Operator key already set",
				"operator_address": operator_address,
				"timestamp": now_millis(),
			}),
			StatusCode::FORBIDDEN,
		),
		Err(InstallError::NotConfigured) => json_reply(
			&json!({
				"success": false,
				"error": "Operator address not configured",
			}),
			StatusCode::INTERNAL_SERVER_ERROR,
		),
		Err(InstallError::Mismatch { expected, derived }) => json_reply(
			&json!({
				"success": false,
				"error": "Address mismatch",
				"detail": format!("derived {derived} but expected {expected}"),
				"expected_address": expected,
				"derived_address": derived,
				"operator_key_set": false,
			}),
			StatusCode::BAD_REQUEST,
		),
		Err(error) => json_reply(
			&json!({
				"success": false,
				"error": error.to_string(),
				"operator_key_set": false,
			}),
			StatusCode::BAD_REQUEST,
		),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::enclave::{ecies, DummyAttestor};
	use crate::eth::contract::LotteryContract;
	use crate::eth::rpc::MockEthRpcApi;
	use crate::operator::PassiveOperator;
	use crate::store::models::{LotteryRound, ParticipantSummary, RoundState};
	use base64::engine::general_purpose::STANDARD as BASE64;
	use base64::Engine;
	use ethers::types::U256;
	use serde_json::Map;
	use std::time::Duration;

	const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
	const DEV_ADDRESS: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

	fn gateway() -> Arc<Gateway<MockEthRpcApi>> {
		gateway_with_rpc(MockEthRpcApi::new())
	}

	fn gateway_with_rpc(rpc: MockEthRpcApi) -> Arc<Gateway<MockEthRpcApi>> {
		let store = Arc::new(MemoryStore::default());
		let chain = Arc::new(LotteryChainClient::from_parts(
			rpc,
			LotteryContract::embedded(
				"0x5FbDB2315678afecb367f032d93F642f64180aa3".parse().unwrap(),
			)
			.unwrap(),
			"http://localhost:8545".to_string(),
			31337,
			1.15,
			None,
		));
		let operator = PassiveOperator::new(
			Arc::clone(&chain),
			Arc::clone(&store),
			Duration::from_secs(180),
		);
		let keypair = Arc::new(EnclaveKeyPair::generate());
		Arc::new(Gateway {
			store,
			chain,
			operator: operator.status_handle(),
			attestor: Arc::new(DummyAttestor::new(Arc::clone(&keypair))),
			keypair,
			hub: WsHub::new(),
			expected_operator_address: DEV_ADDRESS.to_string(),
			static_dir: PathBuf::from("frontend/dist"),
		})
	}

	fn betting_round(round_id: u64, pot_wei: u64) -> LotteryRound {
		LotteryRound {
			round_id,
			start_time: 1000,
			end_time: 2000,
			min_draw_time: 2100,
			max_draw_time: 3000,
			total_pot: U256::from(pot_wei),
			participant_count: 1,
			winner: None,
			publisher_commission: U256::zero(),
			sparsity_commission: U256::zero(),
			winner_prize: U256::zero(),
			state: RoundState::Betting,
		}
	}

	async fn get(gateway: &Arc<Gateway<MockEthRpcApi>>, path: &str) -> (StatusCode, Value) {
		let response = warp::test::request()
			.method("GET")
			.path(path)
			.reply(&routes(Arc::clone(gateway)))
			.await;
		let status = response.status();
		let body: Value = serde_json::from_slice(response.body()).unwrap();
		(status, body)
	}

	#[tokio::test]
	async fn empty_chain_round_status_shape() {
		let (status, body) = get(&gateway(), "/api/round/status").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["round_id"], 0);
		assert_eq!(body["state"], 0);
		assert_eq!(body["state_name"], "waiting");
	}

	#[tokio::test]
	async fn empty_history_has_zeroed_summary() {
		let (status, body) = get(&gateway(), "/api/history").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["rounds"].as_array().unwrap().len(), 0);
		assert_eq!(body["summary"]["total_rounds"], 0);
		assert_eq!(body["summary"]["total_volume_wei"], "0");
	}

	#[tokio::test]
	async fn activities_return_newest_first_with_limit() {
		let gateway = gateway();
		for (i, message) in ["first", "second"].iter().enumerate() {
			let mut details = Map::new();
			details.insert("roundId".to_string(), json!(7));
			details.insert("timestamp".to_string(), json!(1000 + i as u64));
			gateway
				.store
				.add_live_feed("BetPlaced", message.to_string(), details);
		}

		let (status, body) = get(&gateway, "/api/activities?limit=1").await;
		assert_eq!(status, StatusCode::OK);
		let activities = body["activities"].as_array().unwrap();
		assert_eq!(activities.len(), 1);
		assert_eq!(activities[0]["message"], "second");
	}

	#[tokio::test]
	async fn participants_include_wei_amounts() {
		let gateway = gateway();
		gateway.store.set_current_round(Some(betting_round(7, 10_000_000_000_000_000)), false);
		gateway.store.sync_participants(vec![ParticipantSummary {
			address: "0x9965507d1a55bcc2695c58ba16fb37d819b0a4dc".parse().unwrap(),
			total_amount: U256::from(10_000_000_000_000_000u64),
		}]);

		let (status, body) = get(&gateway, "/api/round/participants").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["round_id"], 7);
		let participants = body["participants"].as_array().unwrap();
		assert_eq!(participants[0]["address"], "0x9965507d1a55bcc2695c58ba16fb37d819b0a4dc");
		assert_eq!(participants[0]["totalAmountWei"], "10000000000000000");
		assert_eq!(body["total_amount_wei"], "10000000000000000");
	}

	#[tokio::test]
	async fn player_win_rate_is_share_of_pot() {
		let gateway = gateway();
		gateway.store.set_current_round(Some(betting_round(7, 20_000_000_000_000_000)), false);
		gateway.store.sync_participants(vec![ParticipantSummary {
			address: "0x9965507d1a55bcc2695c58ba16fb37d819b0a4dc".parse().unwrap(),
			total_amount: U256::from(10_000_000_000_000_000u64),
		}]);

		let (status, body) = get(
			&gateway,
			"/api/round/player?player=0x9965507D1a55bcc2695C58ba16FB37d819B0A4dc",
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["winRate"], 50.0);
		assert_eq!(body["totalAmountWei"], "10000000000000000");

		let (status, body) = get(&gateway, "/api/round/player").await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
		assert!(body["error"].as_str().unwrap().contains("player"));
	}

	#[tokio::test]
	async fn pub_key_endpoint_exposes_pem_and_hex() {
		let (status, body) = get(&gateway(), "/api/get_pub_key").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["curve"], "secp384r1");
		assert_eq!(body["public_key_hex"].as_str().unwrap().len(), 194);
		assert!(body["public_key_pem"]
			.as_str()
			.unwrap()
			.starts_with("-----BEGIN PUBLIC KEY-----"));
	}

	#[tokio::test]
	async fn attestation_is_dummy_before_hardware() {
		let (status, body) = get(&gateway(), "/api/attestation").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["verified"], false);
		assert_eq!(body["certificate"], "");
	}

	async fn post_key(
		gateway: &Arc<Gateway<MockEthRpcApi>>,
		encrypted_b64: &str,
	) -> (StatusCode, Value) {
		let response = warp::test::request()
			.method("POST")
			.path("/api/set_operator_key")
			.json(&json!({ "encrypted_private_key": encrypted_b64 }))
			.reply(&routes(Arc::clone(gateway)))
			.await;
		let status = response.status();
		let body: Value = serde_json::from_slice(response.body()).unwrap();
		(status, body)
	}

	#[tokio::test]
	async fn key_injection_happy_path_then_forbidden() {
		let gateway = gateway();
		let encrypted = BASE64.encode(
			ecies::encrypt(&gateway.keypair.public_key_hex(), DEV_KEY.as_bytes()).unwrap(),
		);

		let (status, body) = post_key(&gateway, &encrypted).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["success"], true);
		assert_eq!(body["operator_address"], DEV_ADDRESS);
		assert!(gateway.chain.has_operator_key());

		let (status, body) = post_key(&gateway, &encrypted).await;
		assert_eq!(status, StatusCode::FORBIDDEN);
		assert_eq!(body["error"], "Operator key already set");
		assert_eq!(body["operator_address"], DEV_ADDRESS);
	}

	#[tokio::test]
	async fn key_injection_mismatch_is_retryable() {
		let gateway = gateway();
		let other_key = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
		let encrypted = BASE64.encode(
			ecies::encrypt(&gateway.keypair.public_key_hex(), other_key.as_bytes()).unwrap(),
		);

		let (status, body) = post_key(&gateway, &encrypted).await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
		assert_eq!(body["expected_address"], DEV_ADDRESS);
		assert_ne!(body["derived_address"], body["expected_address"]);
		assert_eq!(body["operator_key_set"], false);

		// The keypair is unchanged, so a correct retry succeeds.
		let (_, pub_key_body) = get(&gateway, "/api/get_pub_key").await;
		assert_eq!(
			pub_key_body["public_key_hex"].as_str().unwrap(),
			gateway.keypair.public_key_hex()
		);
		let encrypted = BASE64.encode(
			ecies::encrypt(&gateway.keypair.public_key_hex(), DEV_KEY.as_bytes()).unwrap(),
		);
		let (status, _) = post_key(&gateway, &encrypted).await;
		assert_eq!(status, StatusCode::OK);
	}

	#[tokio::test]
	async fn invalid_base64_is_bad_request() {
		let (status, body) = post_key(&gateway(), "!!!").await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
		assert_eq!(body["success"], false);
	}

	#[tokio::test]
	async fn unknown_api_path_is_not_found() {
		let (status, body) = get(&gateway(), "/api/nope").await;
		assert_eq!(status, StatusCode::NOT_FOUND);
		assert_eq!(body["error"], "Not found");
	}

	#[tokio::test]
	async fn websocket_receives_snapshot_first() {
		let gateway = gateway();
		gateway.store.set_current_round(Some(betting_round(7, 1)), false);

		let mut client = warp::test::ws()
			.path("/ws/lottery")
			.handshake(routes(Arc::clone(&gateway)))
			.await
			.unwrap();

		let message = client.recv().await.unwrap();
		let parsed: Value = serde_json::from_str(message.to_str().unwrap()).unwrap();
		assert_eq!(parsed["type"], "snapshot");
		assert_eq!(parsed["payload"]["round"]["round_id"], 7);
		assert_eq!(parsed["payload"]["operator"]["status"], "stopped");
	}
}

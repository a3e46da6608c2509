/// Installs the global tracing subscriber. `RUST_LOG` controls filtering,
/// defaulting to `info` for our own crate when unset.
pub fn init() {
	tracing_subscriber::FmtSubscriber::builder()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.try_init()
		.expect("tracing subscriber should only be initialised once");
}

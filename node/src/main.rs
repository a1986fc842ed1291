use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use tracing::{error, info};

use trefoil_core::address_book::AddressBook;
use trefoil_core::network::connection::ConnectionManager;
use trefoil_core::peer_manager::PeerManager;
use trefoil_core::shutdown::Controller;
use trefoil_core::utils::{default_subscriber, install_panic_hooks, json_subscriber, spawn_in_span};

use cli::CliOpts;
use config::RuntimeConfig;
use ledger::{genesis, InMemoryDag, InMemoryMempool};

mod cli;
mod config;
mod ledger;

async fn run(cfg: RuntimeConfig, shutdown: Controller<String>) -> Result<Arc<PeerManager>> {
	let version = clap::crate_version!();
	info!(version, "Running {}", clap::crate_name!());
	info!("Using config: {cfg:?}");

	let params = cfg.params();
	let dag = InMemoryDag::new(params.clone(), genesis(&params));
	let mempool = Arc::new(InMemoryMempool::default());
	let address_book = Arc::new(AddressBook::new(cfg.seed_addresses(&params)?));

	let (conn_mgr, network_events) = ConnectionManager::new(shutdown.clone());
	let manager = PeerManager::new(
		params.clone(),
		cfg.peer_manager.clone(),
		conn_mgr,
		address_book,
		dag.clone(),
		mempool,
		shutdown.clone(),
	);
	dag.set_relay(&manager);

	let bind: SocketAddr = format!(
		"{}:{}",
		cfg.bind_address,
		cfg.port.unwrap_or(params.default_port)
	)
	.parse()
	.wrap_err("Unable to parse bind address")?;
	let bound = manager.listen(bind).await?;
	info!(address = %bound, "P2P listener started");

	manager.clone().start(network_events);

	if let Some(connect) = &cfg.connect {
		let address = connect
			.parse()
			.wrap_err_with(|| format!("Unable to parse connect address: {connect}"))?;
		info!(%address, "connecting to configured peer");
		manager.connect_to(address);
	}

	Ok(manager)
}

#[tokio::main]
async fn main() -> Result<()> {
	let shutdown = Controller::new();
	let opts = CliOpts::parse();
	let cfg = config::load_runtime_config(&opts)?;

	if cfg.log_format_json {
		tracing::subscriber::set_global_default(json_subscriber(cfg.log_level))?;
	} else {
		tracing::subscriber::set_global_default(default_subscriber(cfg.log_level))?;
	}
	tracing_log::LogTracer::init()?;

	install_panic_hooks(shutdown.clone())?;

	// watch for ctrl-c / SIGTERM to trigger the shutdown
	spawn_in_span(shutdown.clone().on_user_signal("User signaled shutdown".to_string()));

	let manager = match run(cfg, shutdown.clone()).await {
		Ok(manager) => manager,
		Err(error) => {
			error!("Node failed to start: {error:#}");
			return Err(error.wrap_err("Starting the node failed"));
		},
	};

	let reason = shutdown.completed_shutdown().await;
	manager.stop();

	// the terminating condition is logged before the trigger; this only
	// reports how the process went down
	Err(eyre!(reason).wrap_err("Running the node encountered an error"))
}

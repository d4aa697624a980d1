use clap::{Arg, ArgAction, Command};
use std::error::Error;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};

use verm::config::Config;
use verm::logging::*;
use verm::server::{serve, VermServer};
use verm::PeerAddress;

fn cli() -> Command {
	Command::new("verm")
		.version(env!("CARGO_PKG_VERSION"))
		.about("Content-addressed, replicating HTTP blob store")
		.arg(
			Arg::new("data")
				.short('d')
				.long("data")
				.value_name("DIR")
				.env("VERM_DATA")
				.help("Sets the root data directory.  Must be fully-qualified (ie. it must start with a /)."),
		)
		.arg(
			Arg::new("listen")
				.short('l')
				.long("listen")
				.value_name("ADDRESS")
				.env("VERM_LISTEN")
				.help("Listen on the given IP address.  Default: listen on all network interfaces."),
		)
		.arg(
			Arg::new("port")
				.short('p')
				.long("port")
				.value_name("PORT")
				.env("VERM_PORT")
				.value_parser(clap::value_parser!(u16))
				.help("Listen on the given port."),
		)
		.arg(
			Arg::new("mime-types-file")
				.short('m')
				.long("mime-types-file")
				.value_name("FILE")
				.env("VERM_MIME_TYPES_FILE")
				.help("Load MIME content-types from the given file."),
		)
		.arg(
			Arg::new("replicate-to")
				.short('r')
				.long("replicate-to")
				.value_name("HOST[:PORT]")
				.env("VERM_REPLICATE_TO")
				.action(ArgAction::Append)
				.help("Replicate files to the given Verm server.  May be given multiple times, or comma-separated."),
		)
		.arg(
			Arg::new("replication-workers")
				.long("replication-workers")
				.value_name("N")
				.env("VERM_REPLICATION_WORKERS")
				.value_parser(clap::value_parser!(usize))
				.help("Number of replication workers per target.  Default: the number of CPUs."),
		)
		.arg(
			Arg::new("health-check-path")
				.long("health-check-path")
				.value_name("PATH")
				.env("VERM_HEALTH_CHECK_PATH")
				.help("Respond to the given path for load-balancer health checks."),
		)
		.arg(
			Arg::new("healthy-if-file")
				.long("healthy-if-file")
				.value_name("FILE")
				.env("VERM_HEALTHY_IF_FILE")
				.help("Only respond healthy to health checks if the given file exists."),
		)
		.arg(
			Arg::new("healthy-unless-file")
				.long("healthy-unless-file")
				.value_name("FILE")
				.env("VERM_HEALTHY_UNLESS_FILE")
				.help("Respond unhealthy to health checks if the given file exists."),
		)
		.arg(
			Arg::new("quiet")
				.short('q')
				.long("quiet")
				.env("VERM_QUIET")
				.action(ArgAction::SetTrue)
				.help("Quiet mode.  Don't print startup/shutdown/request log messages."),
		)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	let matches = cli().get_matches();
	init_tracing();

	let mut config = Config::default();
	if let Some(data) = matches.get_one::<String>("data") {
		config.root_data_dir = PathBuf::from(data);
	}
	if let Some(listen) = matches.get_one::<String>("listen") {
		config.listen_address = listen.clone();
	}
	if let Some(port) = matches.get_one::<u16>("port") {
		config.port = *port;
	}
	if let Some(mime_file) = matches.get_one::<String>("mime-types-file") {
		config.mime_types_file = PathBuf::from(mime_file);
	}
	if let Some(targets) = matches.get_many::<String>("replicate-to") {
		config.replication_targets =
			targets.flat_map(|value| PeerAddress::parse_list(value)).collect();
	}
	if let Some(workers) = matches.get_one::<usize>("replication-workers") {
		config.replication_workers = *workers;
	}
	if let Some(path) = matches.get_one::<String>("health-check-path") {
		config.health_check_path = path.clone();
	}
	if let Some(file) = matches.get_one::<String>("healthy-if-file") {
		config.healthy_if_file = file.clone();
	}
	if let Some(file) = matches.get_one::<String>("healthy-unless-file") {
		config.healthy_unless_file = file.clone();
	}
	config.quiet = matches.get_flag("quiet");

	let server = VermServer::new(&config)?;
	server.start_replication();

	// SIGUSR1 requests a resync round on every peer
	let mut usr1 = signal(SignalKind::user_defined1())?;
	let peers = server.peers.clone();
	tokio::spawn(async move {
		while usr1.recv().await.is_some() {
			info!("received SIGUSR1, requesting resync to all replication targets");
			peers.request_resync_all();
		}
	});

	// SIGUSR2 dumps a diagnostic snapshot
	let mut usr2 = signal(SignalKind::user_defined2())?;
	let diagnostic = server.clone();
	tokio::spawn(async move {
		while usr2.recv().await.is_some() {
			info!("open connections: {}", diagnostic.statistics.connections_current.get());
			for peer in diagnostic.peers.peers() {
				info!("replication backlog for {}: {}", peer.address, peer.unfinished_jobs());
			}
		}
	});

	let mut interrupt = signal(SignalKind::interrupt())?;
	let mut terminate = signal(SignalKind::terminate())?;
	let shutdown = async move {
		tokio::select! {
			_ = interrupt.recv() => info!("received SIGINT, shutting down"),
			_ = terminate.recv() => info!("received SIGTERM, shutting down"),
		}
	};

	let listener = TcpListener::bind((config.listen_address.as_str(), config.port)).await?;
	if !config.quiet {
		info!(
			"verm listening on http://{}:{}, data in {}",
			config.listen_address,
			config.port,
			config.root_data_dir.display()
		);
	}

	serve(server, listener, shutdown).await;
	Ok(())
}

// vim: ts=4

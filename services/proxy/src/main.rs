// tm-proxy: Multiplexes thing-model peers across LANs.

use std::path::Path;
use std::process::ExitCode;

use clap::{Arg, ArgAction, Command};
use tokio::net::TcpListener;
use tracing::{info, warn};

use proxy::{ProxyConfig, ProxyCore, handle_incoming};
use tm_link::Transport;

fn cli() -> Command {
    Command::new("tm-proxy")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Pub/sub and RPC proxy for thing models")
        .disable_version_flag(true)
        .arg(
            Arg::new("addr")
                .long("addr")
                .value_name("ADDR")
                .default_value("0.0.0.0:8080")
                .help("TCP listen address"),
        )
        .arg(
            Arg::new("ws")
                .long("ws")
                .action(ArgAction::SetTrue)
                .help("Enable the WebSocket listener"),
        )
        .arg(
            Arg::new("wsAddr")
                .long("wsAddr")
                .value_name("ADDR")
                .default_value("0.0.0.0:9090")
                .help("WebSocket listen address"),
        )
        .arg(
            Arg::new("log")
                .long("log")
                .value_name("FILE")
                .help("Record every frame to FILE"),
        )
        .arg(
            Arg::new("print")
                .short('p')
                .action(ArgAction::SetTrue)
                .help("Echo every frame to stdout"),
        )
        .arg(
            Arg::new("meta")
                .long("meta")
                .action(ArgAction::SetTrue)
                .help("Print the proxy's schema and exit"),
        )
        .arg(
            Arg::new("version")
                .short('v')
                .long("version")
                .action(ArgAction::Version)
                .help("Print version and exit"),
        )
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();

    if matches.get_flag("meta") {
        match serde_json::to_string_pretty(&proxy::proxy_meta::document()) {
            Ok(doc) => println!("{doc}"),
            Err(e) => {
                eprintln!("FATAL: render schema: {e}");
                return ExitCode::FAILURE;
            }
        }
        return ExitCode::SUCCESS;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "tm-proxy starting");

    let log_path = matches.get_one::<String>("log").map(Path::new);
    let core = match ProxyCore::with_frame_log(
        ProxyConfig::default(),
        log_path,
        matches.get_flag("print"),
    ) {
        Ok(core) => core,
        Err(e) => {
            eprintln!("FATAL: {e}");
            return ExitCode::FAILURE;
        }
    };

    let addr = matches
        .get_one::<String>("addr")
        .map(String::as_str)
        .unwrap_or("0.0.0.0:8080");
    let tcp_listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: listen {addr}: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!(addr, "tcp listener bound");
    tokio::spawn(accept_tcp(tcp_listener, core.clone()));

    if matches.get_flag("ws") {
        let ws_addr = matches
            .get_one::<String>("wsAddr")
            .map(String::as_str)
            .unwrap_or("0.0.0.0:9090");
        let ws_listener = match TcpListener::bind(ws_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                eprintln!("FATAL: listen {ws_addr}: {e}");
                return ExitCode::FAILURE;
            }
        };
        info!(addr = ws_addr, "ws listener bound");
        tokio::spawn(accept_ws(ws_listener, core.clone()));
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutting down"),
        Err(e) => warn!(error = %e, "signal wait failed"),
    }
    ExitCode::SUCCESS
}

async fn accept_tcp(listener: TcpListener, core: ProxyCore) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let transport = Transport::accept_tcp(stream, peer);
                tokio::spawn(handle_incoming(core.clone(), transport));
            }
            Err(e) => {
                warn!(error = %e, "tcp accept error");
                break;
            }
        }
    }
}

async fn accept_ws(listener: TcpListener, core: ProxyCore) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let core = core.clone();
                tokio::spawn(async move {
                    match Transport::accept_ws(stream, peer).await {
                        Ok(transport) => handle_incoming(core, transport).await,
                        Err(e) => warn!(%peer, error = %e, "ws handshake failed"),
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "ws accept error");
                break;
            }
        }
    }
}

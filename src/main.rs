//! svcgated entry point.
//!
//! Bootstraps the interception proxy:
//! - Configuration loading from the environment
//! - Structured logging setup
//! - Port listener setup
//! - Signal handling for graceful shutdown
//!
//! ## CLI Subcommands
//!
//! - `svcgated` or `svcgated serve` - Run the proxy (default)
//! - `svcgated version` - Show version information
//! - `svcgated help` - Show usage

use std::process::ExitCode;
use std::sync::Arc;

use svcgate::config;
use svcgate::provider::SocketConnector;
use svcgate::shutdown::ShutdownResult;
use svcgate::telemetry::init_logging;
use svcgate::{Proxy, ProxyConfig};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("serve");

    match command {
        "serve" | "" => {
            let env = config::load();
            if let Err(e) = init_logging(&env.log) {
                eprintln!("Logging setup failed: {}", e);
                return ExitCode::FAILURE;
            }

            let workers = config::effective_worker_threads(env.worker_threads);
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(workers)
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("Runtime setup failed: {}", e);
                    return ExitCode::FAILURE;
                }
            };

            match runtime.block_on(run_proxy(env)) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("Proxy error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        "help" | "--help" | "-h" => {
            print_usage();
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("svcgated {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

async fn run_proxy(env: config::EnvConfig) -> Result<(), Box<dyn std::error::Error>> {
    let connector = Arc::new(SocketConnector::new(
        env.provider_socket.clone(),
        env.frame_limit,
    ));
    let proxy = Proxy::new(
        connector,
        ProxyConfig {
            ports: env.ports.clone(),
            socket_dir: env.socket_dir.clone(),
            frame_limit: env.frame_limit,
            shutdown_timeout: env.shutdown_timeout,
        },
    );
    let shutdown = Arc::clone(proxy.shutdown());
    let shutdown_timeout = env.shutdown_timeout;

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    let server_handle = {
        let stop_rx = stop_rx.clone();
        tokio::spawn(async move { proxy.serve(stop_rx).await })
    };

    // Wait for Ctrl+C, then initiate graceful shutdown
    tokio::signal::ctrl_c().await?;
    eprintln!("Shutdown signal received, draining...");

    // Signal the accept loops to stop
    let _ = stop_tx.send(true);

    // Drain in-flight calls
    match shutdown.initiate(shutdown_timeout).await {
        ShutdownResult::Complete => eprintln!("Shutdown complete"),
        ShutdownResult::Timeout { remaining } => {
            eprintln!("Shutdown timeout, {} calls remaining", remaining);
        }
    }

    // Wait for the server task to finish
    if let Err(e) = server_handle.await? {
        eprintln!("Server error: {}", e);
    }

    Ok(())
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "svcgated - IPC interception proxy v{}

USAGE:
    svcgated [COMMAND]

COMMANDS:
    serve        Run the proxy (default when no command given)
    version      Show version information
    help         Show this help message

ENVIRONMENT:
    SVCGATE_SOCKET_DIR        Listener socket directory (default: /var/run/svcgate)
    SVCGATE_PROVIDER_SOCKET   Real provider socket (default: /var/run/svcgate/upstream.sock)
    SVCGATE_PORTS             Intercepted ports as name=max_sessions
                              (default: usb:hs=20,usb:hs:a=3)
    SVCGATE_WORKER_THREADS    Runtime worker threads, 0 = auto (default: 2)
    SVCGATE_FRAME_LIMIT       Max wire frame size in bytes (default: 1048576)
    SVCGATE_SHUTDOWN_TIMEOUT  Drain timeout in seconds (default: 30)
    SVCGATE_LOG_FORMAT        json or pretty (default: json)
    SVCGATE_LOG_LEVEL         Log filter directive (default: info)

EXIT CODES:
    0  Success
    1  Failure
",
        version
    );
}

//! compute-server - demo compute service.
//!
//! Listens on the given port. Every client that connects is sent a lambda
//! that upper-cases its input and a first batch, `"hello"`. Each result the
//! client returns is logged and answered with a follow-up batch
//! (`"hello 1!"`, `"hello 2!"`, ...). Ctrl-C closes the listener and exits.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam::channel::Receiver;

use compute_link::{
    Batch, ConnectionListener, Error, Executor, Lambda, ServerConfig, ServiceConnection, ServiceStatus,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lambda registered on every client.
const UPPERCASE_LAMBDA: &str = "lcm:register(function (batch)\n  return batch:upper()\nend)\n";

#[derive(Parser)]
#[command(name = "compute-server")]
#[command(version = VERSION)]
#[command(about = "Distributes lambdas and batches to compute clients")]
struct Cli {
    /// TCP port to listen on (0 picks a free port)
    port: u16,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::load(cli.port, cli.config.as_deref())?;

    let executor = Executor::spawn("compute-listener").context("starting listener executor")?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let listener = Arc::new(
        ConnectionListener::bind(addr, config.connection(), executor)
            .with_context(|| format!("binding port {}", config.port))?,
    );
    log::info!("compute-server {VERSION} listening on {}", listener.local_addr());

    let connections = listener.subscribe_connections();
    let exceptions = listener.subscribe_exceptions();
    thread::Builder::new()
        .name("listener-exceptions".to_string())
        .spawn(move || {
            for e in exceptions.iter() {
                log::error!("Listener failed: {e}");
            }
        })
        .context("spawning exception logger")?;

    let hook = Arc::clone(&listener);
    ctrlc::set_handler(move || {
        log::info!("Shutting down");
        hook.close();
    })
    .context("installing shutdown hook")?;

    // Ends once the listener closes.
    let mut served: Vec<Arc<ServiceConnection>> = Vec::new();
    for connection in connections.iter() {
        let worker = Arc::clone(&connection);
        thread::Builder::new()
            .name(format!("serve-{}", connection.peer_addr()))
            .spawn(move || serve(&worker))
            .context("spawning connection thread")?;
        track(&mut served, connection);
    }

    for connection in &served {
        connection.close();
    }
    log::info!("Stopped");
    Ok(())
}

/// Remember `connection` for shutdown, forgetting connections that already
/// ended on their own.
fn track(served: &mut Vec<Arc<ServiceConnection>>, connection: Arc<ServiceConnection>) {
    served.retain(|open| !open.is_closed());
    served.push(connection);
}

/// Drive one client: send the demo lambda and batches, log everything it
/// reports.
fn serve(connection: &ServiceConnection) {
    let peer = connection.peer_addr();
    let batches = connection.subscribe_batches();
    let errors = connection.subscribe_errors();
    let log_entries = connection.subscribe_log_entries();
    let status = connection.subscribe_status();
    let exceptions = connection.subscribe_exceptions();

    let mut next_batch_id = 0;
    let mut send = |data: String| {
        let batch = Batch::new(1, next_batch_id, data.into_bytes());
        next_batch_id += 1;
        if let Err(e) = connection.submit_batch(batch) {
            log::warn!("{peer}: batch not queued: {e}");
        }
    };

    if let Err(e) = connection.submit_lambda(Lambda::new(1, UPPERCASE_LAMBDA)) {
        log::warn!("{peer}: lambda not queued: {e}");
    }
    send("hello".to_string());

    loop {
        crossbeam::select! {
            recv(batches) -> batch => match batch {
                Ok(batch) => {
                    log::info!(
                        "{peer}: received batch {} \"{}\"",
                        batch.batch_id,
                        String::from_utf8_lossy(&batch.data)
                    );
                    send(format!("hello {}!", batch.batch_id + 1));
                }
                Err(_) => break,
            },
            recv(errors) -> error => if let Ok(error) = error {
                log::warn!("{peer}: received error {error}");
            },
            recv(log_entries) -> entry => if let Ok(entry) = entry {
                log::info!(
                    "{peer}: log {} [{},{}] \"{}\"",
                    entry.timestamp,
                    entry.lambda_id,
                    entry.batch_id,
                    entry.message
                );
            },
            recv(status) -> state => if let Ok(state) = state {
                log::info!("{peer}: status {state:?}");
            },
            recv(exceptions) -> error => if let Ok(error) = error {
                log::error!("{peer}: {error}");
            },
        }
    }

    log_remaining(peer, &status, &exceptions);
}

fn log_remaining(
    peer: SocketAddr,
    status: &Receiver<ServiceStatus>,
    exceptions: &Receiver<Arc<Error>>,
) {
    for error in exceptions.try_iter() {
        log::error!("{peer}: {error}");
    }
    for state in status.try_iter() {
        log::info!("{peer}: status {state:?}");
    }
}

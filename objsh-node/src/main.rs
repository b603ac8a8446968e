// objsh-node: hosts shared objects on a TCP port and connects to configured peers.

mod config;

use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use objsh_core::{Args, EchoServer, Sharer, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("objsh-node {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    // The sharer is single-threaded: current-thread runtime plus a LocalSet.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, serve(cfg))
}

async fn serve(cfg: config::Config) -> Result<()> {
    let sharer = Sharer::new(cfg.sharer_config());
    let port = (cfg.listen_port != 0).then_some(cfg.listen_port);
    let bound = sharer
        .listen(&cfg.listen_host, port)
        .await
        .with_context(|| format!("cannot listen on {}:{}", cfg.listen_host, cfg.listen_port))?;
    info!(version = VERSION, uid = %sharer.uid(), %bound, "objsh-node started");

    let echo = sharer.register(Rc::new(EchoServer), Some("echo"))?;

    if cfg.heartbeat_ms > 0 {
        let weak = sharer.weak();
        let mut beat = 0i64;
        sharer.schedule(Duration::from_millis(cfg.heartbeat_ms), true, move || {
            let Some(sharer) = weak.upgrade() else {
                return false;
            };
            beat += 1;
            if let Err(e) = sharer.emit(echo, "heartbeat", Args::positional(vec![Value::Int(beat)])) {
                warn!("heartbeat not emitted: {}", e);
            }
            true
        });
    }

    for peer in &cfg.peers {
        match sharer.connect_nowait(peer) {
            Ok(()) => info!(%peer, "dialing peer"),
            Err(e) => warn!(%peer, "skipping peer: {}", e),
        }
    }

    tokio::select! {
        _ = sharer.run_forever() => {}
        r = shutdown_signal() => r?,
    }

    info!(clients = sharer.clients().len(), "shutting down");
    sharer.forget_all();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

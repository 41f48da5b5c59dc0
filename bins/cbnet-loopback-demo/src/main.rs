use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use cbnet_config::{Config, ConfigManager};
use cbnet_logging::{init_logging, LogConfig};
use cbnet_rdma::fabric::loopback::LoopbackFabric;
use cbnet_rdma::{accept_callback, BufferSpec, EnvConfig, Environment, Hooks, MemoryClass};
use cbnet_types::NetworkDescriptor;
use clap::Parser;

/// Listen, connect, exchange counters and close over the in-process transport.
#[derive(Parser, Debug)]
#[command(name = "cbnet-loopback-demo", version, about)]
struct Args {
    /// Path to an environment configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, default_value_t = 7000)]
    port: u16,

    /// Connections to open against the listener
    #[arg(long, default_value_t = 4)]
    connections: usize,

    #[arg(long, default_value_t = 4096)]
    block_size: u32,

    #[arg(long, default_value_t = 16)]
    block_count: u32,

    /// Print the default configuration and exit
    #[arg(long)]
    dump_default_config: bool,

    /// Keep the connections open until Ctrl-C
    #[arg(long)]
    wait: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_logging(&LogConfig::default())?;

    if args.dump_default_config {
        println!("{}", EnvConfig::default().render());
        return Ok(());
    }

    let manager = match &args.config {
        Some(path) => ConfigManager::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ConfigManager::new(EnvConfig::default()),
    };
    let local_ip = manager.get().local_ipv4()?;
    let fabric = LoopbackFabric::with_host(local_ip, "lo0");

    let disconnected = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let hooks = {
        let disconnected = Arc::clone(&disconnected);
        let closed = Arc::clone(&closed);
        Hooks::new()
            .on_disconnected(move |nd, _| {
                disconnected.fetch_add(1, Ordering::Relaxed);
                tracing::info!(%nd, "disconnected");
            })
            .on_closed(move |_, _| {
                closed.fetch_add(1, Ordering::Relaxed);
            })
    };
    let env = Arc::new(Environment::init_with_manager(fabric.clone(), manager, hooks)?);

    let spec = BufferSpec::new(args.block_size, args.block_count, MemoryClass::Normal);
    let ip = local_ip.to_string();
    let on_accept = accept_callback(|nd, _| {
        tracing::info!(%nd, "accepted");
        None
    });
    let server = env.listen(&ip, args.port, spec, Some(on_accept), None)?;

    let active: Vec<NetworkDescriptor> = {
        let env = Arc::clone(&env);
        let ip = ip.clone();
        let (port, count) = (args.port, args.connections);
        tokio::task::spawn_blocking(move || {
            (0..count)
                .map(|_| env.connect(&ip, port, spec, Duration::ZERO, None))
                .collect::<Result<Vec<_>, _>>()
        })
        .await??
    };

    for nd in &active {
        env.update_counters(*nd, |c| {
            c.posted_sends += 1;
            c.local_send_window = u64::from(args.block_count);
        });
    }
    println!("{}", serde_json::to_string_pretty(&env.metrics())?);
    if let Some(first) = active.first() {
        if let Some(counters) = env.connection_counters(*first) {
            println!("{first}: {}", serde_json::to_string(&counters)?);
        }
    }

    if args.wait {
        tracing::info!("waiting for Ctrl-C");
        tokio::signal::ctrl_c().await?;
    }

    let passive = env
        .server(server)
        .map(|s| s.accepted())
        .unwrap_or_default();
    for nd in active.iter().chain(passive.iter()) {
        env.close(*nd);
    }
    env.close(server);

    let expected = active.len() + passive.len();
    let deadline = Instant::now() + Duration::from_secs(5);
    while closed.load(Ordering::Relaxed) < expected && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tracing::info!(
        closed = closed.load(Ordering::Relaxed),
        disconnected = disconnected.load(Ordering::Relaxed),
        expected,
        "teardown finished"
    );

    match Arc::try_unwrap(env) {
        Ok(env) => env.destroy(),
        Err(_) => anyhow::bail!("environment still shared at shutdown"),
    }
    println!("{}", serde_json::to_string_pretty(&fabric.stats())?);
    Ok(())
}

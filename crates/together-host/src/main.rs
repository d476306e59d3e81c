use std::net::SocketAddr;

use clap::Parser;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use together_client::SyncPolicy;
use together_host::net::rate_limit::RateLimitConfig;
use together_host::{HostConfig, HostHandle};

/// Synced listening session host
#[derive(Parser, Debug)]
#[command(name = "together-host")]
#[command(about = "Hosts a synced listening session on the local network", long_about = None)]
struct Args {
    /// WebSocket bind address
    #[arg(short, long, default_value = "0.0.0.0:42117")]
    bind: SocketAddr,

    /// Host name or IP written into the join link (defaults to the bound IP)
    #[arg(long)]
    advertise_host: Option<String>,

    /// Fixed session id (random when omitted)
    #[arg(long)]
    session_id: Option<String>,

    /// Fixed session key (random when omitted)
    #[arg(long)]
    session_key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: Level,

    /// Disable connection and message rate limiting
    #[arg(long)]
    no_rate_limit: bool,

    /// Max new connections per IP per second
    #[arg(long, default_value_t = 10)]
    conn_per_ip_per_sec: u32,

    /// Max frames per connection per second
    #[arg(long, default_value_t = 50)]
    msg_per_conn_per_sec: u32,

    /// Only the host may control playback
    #[arg(long)]
    host_only_control: bool,

    #[command(flatten)]
    policy: SyncPolicy,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let rate_limit = (!args.no_rate_limit).then(|| RateLimitConfig {
        conn_per_ip_per_sec: args.conn_per_ip_per_sec,
        msg_per_conn_per_sec: args.msg_per_conn_per_sec,
        ..RateLimitConfig::default()
    });
    let config = HostConfig {
        bind: args.bind,
        advertise_host: args.advertise_host,
        session_id: args.session_id,
        session_key: args.session_key,
        policy: args.policy,
        rate_limit,
        allow_guest_control: !args.host_only_control,
    };

    let host = HostHandle::start(config, None).await?;
    info!("Session host listening on {}", host.local_addr());
    info!("Join link: {}", host.link());
    info!("Log level: {}", args.log_level);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    host.shutdown().await;
    Ok(())
}

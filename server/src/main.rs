use clap::Parser;
use log::{error, info};
use server::config::{GameConfiguration, ServerConfig};
use server::external::{
    AllowAll, AllowList, EligibilityCheck, LoggingStatisticsSink, ProceduralDistributions,
};
use server::network::Server;
use server::quadtree::PoolCapacities;
use std::sync::Arc;
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "5000")]
    port: u16,
    /// Tick rate (updates per second)
    #[clap(short, long, default_value = "33")]
    tick_rate: u32,
    /// Side length of the square field
    #[clap(long, default_value = "1000")]
    field_size: f32,
    /// Named game configuration (default, feast, hazard, duel)
    #[clap(short, long, default_value = "default")]
    game: String,
    /// Frames buffered per session before old state frames are replaced
    #[clap(long, default_value = "64")]
    outbox_capacity: usize,
    /// Outbox depth that counts as falling behind
    #[clap(long, default_value = "48")]
    slow_threshold: usize,
    /// Consecutive deep-outbox observations before disconnecting
    #[clap(long, default_value = "100")]
    slow_strikes: u32,
    /// Registrations and disconnects buffered between ticks
    #[clap(long, default_value = "1024")]
    event_queue: usize,
    /// Operator commands buffered between ticks
    #[clap(long, default_value = "64")]
    admin_queue: usize,
    /// Seconds a bot may stay silent before it is disconnected
    #[clap(long, default_value = "10")]
    inactivity_timeout: u64,
    /// Seconds to wait for the handshake and registration
    #[clap(long, default_value = "5")]
    registration_timeout: u64,
    /// Leaf pool size of the food index; the other pools scale with it
    #[clap(long, default_value = "8192")]
    index_leaves: usize,
    /// Seed for the world generator; random when omitted
    #[clap(long)]
    seed: Option<u64>,
    /// Only these bot names may register (repeatable); everyone when empty
    #[clap(short, long)]
    allow: Vec<String>,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        if self.tick_rate == 0 {
            return Err("tick rate must be at least 1".into());
        }
        let defaults = ServerConfig::default();
        Ok(ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            tick_interval: Duration::from_secs_f64(1.0 / self.tick_rate as f64),
            field_size: self.field_size,
            outbox_capacity: self.outbox_capacity,
            slow_consumer_threshold: self.slow_threshold,
            slow_consumer_strikes: self.slow_strikes,
            event_queue: self.event_queue,
            admin_queue: self.admin_queue,
            registration_timeout: Duration::from_secs(self.registration_timeout),
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout),
            pool_capacities: PoolCapacities {
                empty: self.index_leaves * 2,
                leaf: self.index_leaves,
                inner: self.index_leaves / 2,
                chained: self.index_leaves / 4,
            },
            seed: self.seed,
            game: GameConfiguration::preset(&self.game)?,
            ..defaults
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let eligibility: Arc<dyn EligibilityCheck> = if args.allow.is_empty() {
        Arc::new(AllowAll)
    } else {
        info!("Restricting registration to {} names", args.allow.len());
        Arc::new(AllowList::new(args.allow.clone()))
    };
    let config = args.into_config()?;

    let (sink, sink_handle) = LoggingStatisticsSink::spawn();
    let server = Server::bind(
        config,
        eligibility,
        Arc::new(ProceduralDistributions),
        Arc::new(sink),
    )
    .await?;

    let ctx = server.context();
    let server_handle = tokio::spawn(server.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            ctx.control.request_shutdown();
        }
        _ = ctx.control.shutdown_requested() => {
            info!("Shutdown requested by an operator");
        }
    }

    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Server stopped with an error: {}", e),
        Err(e) => error!("Server task panicked: {}", e),
    }
    // The sink's channel closes once the tick loop is dropped.
    if let Err(e) = sink_handle.await {
        error!("Statistics writer panicked: {}", e);
    }
    Ok(())
}

use clap::{Parser, Subcommand};
use client::network::{BotClient, ObserverClient, OperatorClient};
use client::strategy::Strategy;
use log::info;
use shared::{Color, OperatorCommand, Registration, FIELD_SIZE};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:5000")]
    server: String,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Play as a headless bot
    Bot {
        /// Bot name; bots sharing a name form a team
        #[arg(short, long, default_value = "rustbot")]
        name: String,
        /// Colour as r,g,b
        #[arg(short, long, default_value = "40,160,220")]
        color: String,
        /// Stop after this many states
        #[arg(long)]
        max_states: Option<u64>,
        /// Never split toward prey
        #[arg(long)]
        passive: bool,
    },
    /// Follow the whole arena and log a leaderboard
    Observer {
        /// Log a summary every this many deltas
        #[arg(short, long, default_value = "100")]
        report_every: u64,
        /// Stop after this many deltas
        #[arg(long)]
        max_deltas: Option<u64>,
    },
    /// Send one JSON operator command, e.g. '{"type":"kill_all_bots"}'
    Operator {
        command: String,
    },
}

fn parse_color(s: &str) -> Result<Color, Box<dyn std::error::Error + Send + Sync>> {
    let parts: Vec<u8> = s
        .split(',')
        .map(|p| p.trim().parse::<u8>())
        .collect::<Result<_, _>>()?;
    match parts.as_slice() {
        [r, g, b] => Ok(Color::new(*r, *g, *b)),
        _ => Err(format!("expected r,g,b but got '{}'", s).into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    info!("Connecting to: {}", args.server);

    match args.mode {
        Mode::Bot {
            name,
            color,
            max_states,
            passive,
        } => {
            let registration = Registration {
                name,
                color: parse_color(&color)?,
                image: String::new(),
            };
            let mut strategy = Strategy::new(FIELD_SIZE);
            strategy.aggressive = !passive;
            let bot = BotClient::register(&args.server, registration, strategy).await?;
            let summary = bot.run(max_states).await?;
            println!(
                "bot {}: {} states, last tick {}, peak mass {:.1}",
                summary.bot_id, summary.states, summary.last_tick, summary.peak_mass
            );
        }
        Mode::Observer {
            report_every,
            max_deltas,
        } => {
            let observer = ObserverClient::connect(&args.server).await?;
            let world = observer.run(max_deltas, report_every).await?;
            println!("{}", world.summary());
        }
        Mode::Operator { command } => {
            let command: OperatorCommand = serde_json::from_str(&command)?;
            let mut operator = OperatorClient::connect(&args.server).await?;
            let reply = operator.send(&command).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
            if !reply.ok {
                return Err(reply.message.into());
            }
        }
    }

    Ok(())
}

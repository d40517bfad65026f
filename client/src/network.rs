use crate::game::ObserverWorld;
use crate::strategy::Strategy;
use log::{debug, info, warn};
use serde::Serialize;
use shared::{
    decode, decode_json, decompress, encode, encode_json, read_frame, write_frame, BotCommand,
    BotGameState, BotId, BotMessage, BotServerMessage, Hello, ObserverMessage, OperatorCommand,
    OperatorReply, Registration, Role, PROTOCOL_VERSION,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

pub type ClientError = Box<dyn std::error::Error + Send + Sync>;

/// A framed TCP connection that has completed the handshake.
pub struct Connection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl Connection {
    pub async fn open(server: &str, role: Role) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(server).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let mut connection = Self { reader, writer };
        connection
            .send(&Hello {
                role,
                version: PROTOCOL_VERSION,
            })
            .await?;
        debug!("Connected to {} as {:?}", server, role);
        Ok(connection)
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), ClientError> {
        write_frame(&mut self.writer, &encode(message)?).await?;
        Ok(())
    }

    pub async fn send_json<T: Serialize>(&mut self, message: &T) -> Result<(), ClientError> {
        write_frame(&mut self.writer, &encode_json(message)?).await?;
        Ok(())
    }

    /// Next raw frame, or None once the server closed the connection.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, ClientError> {
        Ok(read_frame(&mut self.reader).await?)
    }
}

/// What a bot run ended with.
#[derive(Debug, Clone, PartialEq)]
pub struct BotSummary {
    pub bot_id: BotId,
    pub states: u64,
    pub last_tick: u64,
    pub peak_mass: f32,
    pub stopped_by_server: bool,
}

pub struct BotClient {
    connection: Connection,
    pub bot_id: BotId,
    strategy: Strategy,
}

impl BotClient {
    /// Connects and registers. A rejection is returned as an error.
    pub async fn register(
        server: &str,
        registration: Registration,
        strategy: Strategy,
    ) -> Result<Self, ClientError> {
        let name = registration.name.clone();
        let mut connection = Connection::open(server, Role::Bot).await?;
        connection.send(&BotMessage::Register(registration)).await?;

        loop {
            let Some(bytes) = connection.recv().await? else {
                return Err("server closed the connection during registration".into());
            };
            match decode::<BotServerMessage>(&bytes)? {
                BotServerMessage::Registered { bot_id } => {
                    info!("Registered '{}' as bot {}", name, bot_id);
                    return Ok(Self {
                        connection,
                        bot_id,
                        strategy,
                    });
                }
                BotServerMessage::Rejected { reason } => {
                    return Err(format!("registration rejected: {}", reason).into())
                }
                other => debug!("Ignoring {:?} before registration", other),
            }
        }
    }

    /// Next state for this bot, or None when the server stopped the bot.
    pub async fn next_state(&mut self) -> Result<Option<BotGameState>, ClientError> {
        loop {
            let Some(bytes) = self.connection.recv().await? else {
                return Ok(None);
            };
            match decode::<BotServerMessage>(&bytes) {
                Ok(BotServerMessage::State(state)) => return Ok(Some(state)),
                Ok(BotServerMessage::Stop) => return Ok(None),
                Ok(other) => warn!("Bot {} got unexpected {:?}", self.bot_id, other),
                Err(e) => warn!("Bot {} got a malformed frame: {}", self.bot_id, e),
            }
        }
    }

    pub async fn command(&mut self, command: BotCommand) -> Result<(), ClientError> {
        self.connection.send(&BotMessage::Command(command)).await
    }

    /// Plays until the server stops the bot or `max_states` states were seen.
    pub async fn run(mut self, max_states: Option<u64>) -> Result<BotSummary, ClientError> {
        let mut summary = BotSummary {
            bot_id: self.bot_id,
            states: 0,
            last_tick: 0,
            peak_mass: 0.0,
            stopped_by_server: false,
        };

        while max_states.map_or(true, |max| summary.states < max) {
            let Some(state) = self.next_state().await? else {
                summary.stopped_by_server = true;
                break;
            };
            summary.states += 1;
            summary.last_tick = state.tick;
            let mass: f32 = state.my_blobs.iter().map(|b| b.mass).sum();
            summary.peak_mass = summary.peak_mass.max(mass);

            let command = self.strategy.decide(&state);
            self.command(command).await?;
        }

        info!(
            "Bot {} done after {} states, peak mass {:.1}",
            summary.bot_id, summary.states, summary.peak_mass
        );
        Ok(summary)
    }
}

pub struct ObserverClient {
    connection: Connection,
    pub world: ObserverWorld,
}

impl ObserverClient {
    pub async fn connect(server: &str) -> Result<Self, ClientError> {
        Ok(Self {
            connection: Connection::open(server, Role::Observer).await?,
            world: ObserverWorld::new(),
        })
    }

    /// Applies the next delta and returns its tick, or None once the server stops.
    pub async fn next_delta(&mut self) -> Result<Option<u64>, ClientError> {
        let Some(bytes) = self.connection.recv().await? else {
            return Ok(None);
        };
        match decompress::<ObserverMessage>(&bytes)? {
            ObserverMessage::Delta(delta) => {
                let tick = delta.tick;
                self.world.apply(delta);
                Ok(Some(tick))
            }
            ObserverMessage::Stop => Ok(None),
        }
    }

    /// Follows the arena, logging a summary and leaderboard every `report_every` deltas.
    pub async fn run(
        mut self,
        max_deltas: Option<u64>,
        report_every: u64,
    ) -> Result<ObserverWorld, ClientError> {
        while max_deltas.map_or(true, |max| self.world.deltas_applied < max) {
            if self.next_delta().await?.is_none() {
                info!("Server stopped the observer");
                break;
            }
            if report_every > 0 && self.world.deltas_applied % report_every == 0 {
                info!("{}", self.world.summary());
                for (rank, entry) in self.world.leaderboard(5).iter().enumerate() {
                    info!("  {}. {} ({:.1})", rank + 1, entry.name, entry.mass);
                }
            }
        }
        Ok(self.world)
    }
}

/// Sends operator commands over one connection and waits for each reply.
pub struct OperatorClient {
    connection: Connection,
}

impl OperatorClient {
    pub async fn connect(server: &str) -> Result<Self, ClientError> {
        Ok(Self {
            connection: Connection::open(server, Role::Operator).await?,
        })
    }

    pub async fn send(&mut self, command: &OperatorCommand) -> Result<OperatorReply, ClientError> {
        self.connection.send_json(command).await?;
        let bytes = self
            .connection
            .recv()
            .await?
            .ok_or("server closed the connection before replying")?;
        Ok(decode_json(&bytes)?)
    }
}

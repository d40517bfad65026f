//! The tick loop: the only place the world is mutated.
//!
//! Each tick applies queued operator commands, drains session input, runs the
//! game phases and then pushes one frame per session without waiting on any
//! of them. The loop parks while no relevant session is attached.

use crate::config::ConfigError;
use crate::context::{AdminRequest, EngineChannels, EngineEvent, ServerContext};
use crate::delta;
use crate::external::{SpawnDistributionProvider, StatisticsSink};
use crate::game::{DeathReason, Game};
use crate::outbox::{Frame, PushOutcome};
use crate::session::Session;
use log::{debug, error, info, warn};
use shared::{compress, encode, BotId, BotServerMessage, ObserverMessage, Role, MAX_DELTA_TIME};
use std::sync::Arc;
use tokio::time::{interval, Instant, MissedTickBehavior};

const DIAGNOSTICS_INTERVAL: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Running,
    Paused,
    Stopped,
}

/// Frames that could not be queued since the last diagnostics line.
#[derive(Debug, Default)]
struct EmitCounters {
    replaced: u64,
    dropped: u64,
}

impl EmitCounters {
    fn record(&mut self, outcome: PushOutcome) {
        match outcome {
            PushOutcome::ReplacedOldest => self.replaced += 1,
            PushOutcome::Dropped => self.dropped += 1,
            PushOutcome::Queued | PushOutcome::Closed => {}
        }
    }
}

pub struct Engine {
    ctx: Arc<ServerContext>,
    game: Game,
    channels: EngineChannels,
    state: EngineState,
    counters: EmitCounters,
}

impl Engine {
    pub fn new(
        ctx: Arc<ServerContext>,
        channels: EngineChannels,
        provider: Arc<dyn SpawnDistributionProvider>,
        sink: Arc<dyn StatisticsSink>,
    ) -> Result<Self, ConfigError> {
        let game = Game::new(&ctx.config, Arc::clone(&ctx.ids), provider, sink)?;
        Ok(Self {
            ctx,
            game,
            channels,
            state: EngineState::Paused,
            counters: EmitCounters::default(),
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn game(&self) -> &Game {
        &self.game
    }

    fn set_state(&mut self, state: EngineState) {
        if self.state != state {
            info!("Simulation {:?} -> {:?} at tick {}", self.state, state, self.game.tick);
            self.state = state;
        }
    }

    /// Runs until shutdown is requested.
    pub async fn run(mut self) {
        let ctx = Arc::clone(&self.ctx);
        let mut ticker = interval(ctx.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();

        while ctx.control.is_running() {
            if !ctx.standby.is_relevant() {
                self.set_state(EngineState::Paused);
                tokio::select! {
                    _ = ctx.standby.wait_until_relevant() => {}
                    _ = ctx.control.shutdown_requested() => break,
                }
                ticker.reset();
                last_tick = Instant::now();
                continue;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = ctx.control.shutdown_requested() => break,
            }

            let now = Instant::now();
            let dt = now.duration_since(last_tick).as_secs_f32();
            last_tick = now;

            if !ctx.control.simulation_enabled() {
                self.set_state(EngineState::Paused);
                continue;
            }
            self.set_state(EngineState::Running);

            if dt > MAX_DELTA_TIME * 4.0 {
                debug!("Tick took {:.3}s, capping to {:.3}s", dt, MAX_DELTA_TIME);
            }
            self.tick(dt.min(MAX_DELTA_TIME));
        }

        self.shutdown().await;
    }

    /// One full tick: input, mutation, emission.
    pub fn tick(&mut self, dt: f32) {
        if self.ctx.control.take_reload() {
            match self.game.reload_configuration() {
                Ok(()) => {}
                Err(e) => warn!("Configuration reload failed: {}", e),
            }
        }
        self.apply_admin_requests();
        self.drain_events();
        self.reap_orphaned_bots();
        self.drain_commands();

        self.game.step(dt);
        self.close_dead_sessions();

        self.emit();
        self.game.clear_transient();

        if self.game.tick % DIAGNOSTICS_INTERVAL == 0 {
            self.log_diagnostics(dt);
        }
    }

    fn apply_admin_requests(&mut self) {
        while let Ok(AdminRequest {
            command,
            command_id,
            session_id,
        }) = self.channels.admin.try_recv()
        {
            match self.game.apply_admin(&command) {
                Ok(message) => info!(
                    "Command {} from session {} applied: {}",
                    command_id, session_id, message
                ),
                Err(reason) => warn!(
                    "Command {} from session {} ({:?}) refused: {}",
                    command_id, session_id, command, reason
                ),
            }
        }
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.channels.events.try_recv() {
            match event {
                EngineEvent::Register {
                    session_id,
                    bot_id,
                    registration,
                    lifetime,
                    placeholder,
                } => {
                    let Some(session) = self.ctx.clients.get(session_id) else {
                        debug!("Session {} left before bot {} was placed", session_id, bot_id);
                        continue;
                    };
                    match self
                        .game
                        .add_bot(bot_id, session_id, &registration, lifetime, placeholder)
                    {
                        Ok(()) => {
                            session.send(&BotServerMessage::Registered { bot_id });
                        }
                        Err(reason) => {
                            info!("Rejecting bot '{}': {}", registration.name, reason);
                            session.detach_bot();
                            session.send(&BotServerMessage::Rejected { reason });
                            session.close_after_flush();
                        }
                    }
                }
                EngineEvent::Disconnect { bot_id, .. } => {
                    self.game.remove_bot(bot_id, DeathReason::Disconnected);
                }
            }
        }
    }

    /// Removes bots whose session is gone but whose disconnect never arrived.
    fn reap_orphaned_bots(&mut self) {
        let orphans: Vec<BotId> = self
            .game
            .world
            .bots
            .values()
            .filter(|bot| self.ctx.clients.get(bot.session_id).is_none())
            .map(|bot| bot.id)
            .collect();
        for bot_id in orphans {
            debug!("Bot {} lost its session, removing", bot_id);
            self.game.remove_bot(bot_id, DeathReason::Disconnected);
        }
    }

    /// Only the newest command per bot counts; older ones were overwritten.
    fn drain_commands(&mut self) {
        for session in self.ctx.clients.with_role(Role::Bot) {
            let Some(bot_id) = session.bot_id() else {
                continue;
            };
            if let Some(command) = session.take_command() {
                self.game.set_command(bot_id, command);
            }
        }
    }

    fn close_dead_sessions(&mut self) {
        for dead in self.game.take_dead() {
            let Some(session) = self.ctx.clients.get(dead.session_id) else {
                continue;
            };
            session.detach_bot();
            session.send(&BotServerMessage::Stop);
            session.close_after_flush();
            debug!(
                "Closing session {} of bot {} ({})",
                dead.session_id, dead.bot_id, dead.reason
            );
        }
    }

    fn emit(&mut self) {
        self.game.rebuild_view_indexes();

        for session in self.ctx.clients.with_role(Role::Bot) {
            let Some(bot_id) = session.bot_id() else {
                continue;
            };
            let Some(view) = delta::bot_view(&mut self.game, bot_id) else {
                continue;
            };
            match encode(&BotServerMessage::State(view)) {
                Ok(bytes) => {
                    let outcome = session.push(Frame::droppable(Arc::new(bytes)));
                    self.counters.record(outcome);
                }
                Err(e) => error!("Failed to encode state for bot {}: {}", bot_id, e),
            }
        }

        let observers = self.ctx.clients.with_role(Role::Observer);
        if observers.is_empty() {
            return;
        }
        let mut incremental: Option<Arc<Vec<u8>>> = None;
        let mut snapshot: Option<Arc<Vec<u8>>> = None;
        for session in observers {
            let full = session.take_fresh();
            let cached = if full { &mut snapshot } else { &mut incremental };
            if cached.is_none() {
                let message = ObserverMessage::Delta(delta::observer_delta(&self.game, full));
                match compress(&message) {
                    Ok(bytes) => *cached = Some(Arc::new(bytes)),
                    Err(e) => {
                        error!("Failed to encode observer delta: {}", e);
                        return;
                    }
                }
            }
            if let Some(bytes) = cached {
                let frame = if full {
                    Frame::essential(Vec::clone(bytes))
                } else {
                    Frame::droppable(Arc::clone(bytes))
                };
                let outcome = session.push(frame);
                self.counters.record(outcome);
            }
        }
    }

    fn log_diagnostics(&mut self, dt: f32) {
        let (bots, observers, operators) = self.ctx.clients.counts();
        debug!(
            "Tick {}: {:.1}Hz, {} bots / {} blobs, {} food, {} toxins, sessions {}b/{}o/{}op, frames replaced {} dropped {}",
            self.game.tick,
            if dt > 0.0 { 1.0 / dt } else { 0.0 },
            self.game.world.bots.len(),
            self.game.world.blob_count(),
            self.game.world.foods.len(),
            self.game.world.toxins.len(),
            bots,
            observers,
            operators,
            self.counters.replaced,
            self.counters.dropped
        );
        for report in self.game.index_report() {
            debug!("Food index {}", report);
        }
        self.counters = EmitCounters::default();
    }

    /// Tells every session to stop and gives statistics writes a moment to land.
    async fn shutdown(&mut self) {
        self.set_state(EngineState::Stopped);
        let sessions = self.ctx.clients.all();
        info!("Stopping {} sessions", sessions.len());

        let observer_stop = compress(&ObserverMessage::Stop);
        for session in &sessions {
            stop_session(session, observer_stop.as_ref().ok());
        }
        self.game.submit_statistics();

        tokio::time::sleep(self.ctx.config.shutdown_grace).await;
        for session in sessions {
            session.terminate(&self.ctx, "server shutting down");
        }
    }
}

fn stop_session(session: &Session, observer_stop: Option<&Vec<u8>>) {
    match session.role {
        Role::Bot => {
            session.send(&BotServerMessage::Stop);
        }
        Role::Observer => {
            if let Some(bytes) = observer_stop {
                session.push(Frame::essential(bytes.clone()));
            }
        }
        Role::Operator => {}
    }
    session.close_after_flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GameConfiguration, ServerConfig};
    use crate::context::AdminRequest;
    use crate::external::{AllowAll, MemoryStatisticsSink, ProceduralDistributions};
    use shared::{decode, decompress, BotCommand, Color, OperatorCommand, Registration, Statistics, Vec2};
    use std::net::SocketAddr;
    use std::time::Duration;

    fn engine_with(config: ServerConfig) -> (Engine, Arc<ServerContext>, Arc<MemoryStatisticsSink>) {
        let (ctx, channels) = ServerContext::new(config, Arc::new(AllowAll));
        let sink = Arc::new(MemoryStatisticsSink::default());
        let engine = Engine::new(
            Arc::clone(&ctx),
            channels,
            Arc::new(ProceduralDistributions),
            sink.clone(),
        )
        .unwrap();
        (engine, ctx, sink)
    }

    fn small_config() -> ServerConfig {
        ServerConfig {
            seed: Some(11),
            game: GameConfiguration {
                min_food: 10,
                max_food: 20,
                min_toxins: 2,
                max_toxins: 4,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn open_session(ctx: &Arc<ServerContext>, role: Role) -> Arc<Session> {
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let session = Arc::new(Session::new(
            ctx.ids.next_session(),
            role,
            peer,
            ctx.config.outbox_capacity,
        ));
        ctx.clients.insert(Arc::clone(&session));
        session
    }

    fn register(ctx: &Arc<ServerContext>, name: &str) -> (Arc<Session>, BotId) {
        let session = open_session(ctx, Role::Bot);
        let bot_id = ctx.ids.next_bot();
        session.set_bot(bot_id);
        ctx.send_event(EngineEvent::Register {
            session_id: session.id,
            bot_id,
            registration: Registration {
                name: name.to_string(),
                color: Color::new(1, 1, 1),
                image: String::new(),
            },
            lifetime: Statistics::default(),
            placeholder: false,
        });
        (session, bot_id)
    }

    async fn frames(session: &Session) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while session.outbox.depth() > 0 {
            if let Some(frame) = session.outbox.next().await {
                out.push(frame.bytes().to_vec());
            }
        }
        out
    }

    #[tokio::test]
    async fn test_registration_then_state() {
        let (mut engine, ctx, _) = engine_with(small_config());
        let (session, bot_id) = register(&ctx, "alpha");

        engine.tick(0.03);

        let frames = frames(&session).await;
        assert_eq!(frames.len(), 2);
        let first: BotServerMessage = decode(&frames[0]).unwrap();
        assert_eq!(first, BotServerMessage::Registered { bot_id });
        match decode::<BotServerMessage>(&frames[1]).unwrap() {
            BotServerMessage::State(state) => {
                assert_eq!(state.tick, 1);
                assert_eq!(state.my_blobs.len(), 1);
            }
            other => panic!("expected state, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_arena_rejects_and_closes() {
        let mut config = small_config();
        config.game.max_bots = 1;
        let (mut engine, ctx, _) = engine_with(config);
        let (_first, _) = register(&ctx, "one");
        let (second, _) = register(&ctx, "two");

        engine.tick(0.03);

        assert!(second.outbox.is_closed());
        assert!(second.bot_id().is_none());
        let frames = frames(&second).await;
        let reply: BotServerMessage = decode(&frames[0]).unwrap();
        assert!(matches!(reply, BotServerMessage::Rejected { .. }));
        assert_eq!(engine.game().world.bots.len(), 1);
    }

    #[tokio::test]
    async fn test_commands_and_disconnects_are_applied() {
        let (mut engine, ctx, sink) = engine_with(small_config());
        let (session, bot_id) = register(&ctx, "mover");
        engine.tick(0.03);

        session.store_command(BotCommand {
            target: Vec2::new(1.0, 2.0),
            ..Default::default()
        });
        engine.tick(0.03);
        assert_eq!(
            engine.game().world.bots[&bot_id].command.target,
            Vec2::new(1.0, 2.0)
        );

        session.terminate(&ctx, "test");
        engine.tick(0.03);
        assert!(engine.game().world.bots.is_empty());
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_flooding_bot_does_not_crowd_out_others() {
        let (mut engine, ctx, _) = engine_with(small_config());
        let (noisy, noisy_id) = register(&ctx, "noisy");
        let (quiet, quiet_id) = register(&ctx, "quiet");
        engine.tick(0.03);

        for i in 0..5000 {
            noisy.store_command(BotCommand {
                target: Vec2::new(i as f32 % 1000.0, 10.0),
                ..Default::default()
            });
        }
        quiet.store_command(BotCommand {
            target: Vec2::new(900.0, 900.0),
            ..Default::default()
        });
        engine.tick(0.03);

        let bots = &engine.game().world.bots;
        assert_eq!(bots[&quiet_id].command.target, Vec2::new(900.0, 900.0));
        assert_eq!(bots[&noisy_id].command.target, Vec2::new(999.0, 10.0));
        assert!(noisy.take_command().is_none());
    }

    #[tokio::test]
    async fn test_bot_without_session_is_removed() {
        let (mut engine, ctx, sink) = engine_with(small_config());
        let (session, bot_id) = register(&ctx, "lost");
        engine.tick(0.03);
        assert!(engine.game().world.bots.contains_key(&bot_id));

        // Gone from the registry without a disconnect event reaching the loop.
        ctx.clients.remove(session.id);
        engine.tick(0.03);

        assert!(!engine.game().world.bots.contains_key(&bot_id));
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_observer_gets_snapshot_then_deltas() {
        let (mut engine, ctx, _) = engine_with(small_config());
        let observer = open_session(&ctx, Role::Observer);

        engine.tick(0.03);
        engine.tick(0.03);

        let frames = frames(&observer).await;
        assert_eq!(frames.len(), 2);
        let ObserverMessage::Delta(snapshot) = decompress(&frames[0]).unwrap() else {
            panic!("expected a delta");
        };
        assert_eq!(snapshot.created_or_updated_foods.len(), engine.game().world.foods.len());
        let ObserverMessage::Delta(next) = decompress(&frames[1]).unwrap() else {
            panic!("expected a delta");
        };
        assert_eq!(next.tick, 2);
        assert!(next.created_or_updated_foods.len() < snapshot.created_or_updated_foods.len());
    }

    #[tokio::test]
    async fn test_admin_requests_applied_in_tick() {
        let (mut engine, ctx, _) = engine_with(small_config());
        ctx.submit_admin(AdminRequest {
            command: OperatorCommand::SwitchGameConfiguration {
                name: "duel".to_string(),
            },
            command_id: 1,
            session_id: 1,
        })
        .unwrap();
        engine.tick(0.03);
        assert_eq!(engine.game().config.name, "duel");

        ctx.control.request_reload();
        engine.game.config.max_bots = 99;
        engine.tick(0.03);
        assert_eq!(engine.game().config.max_bots, 2);
    }

    #[tokio::test]
    async fn test_dead_bot_session_gets_stop() {
        let (mut engine, ctx, _) = engine_with(small_config());
        let (session, bot_id) = register(&ctx, "doomed");
        engine.tick(0.03);
        frames(&session).await;

        engine
            .game
            .apply_admin(&OperatorCommand::KillAllBots)
            .unwrap();
        engine.tick(0.03);

        assert!(session.outbox.is_closed());
        assert!(session.bot_id().is_none());
        let frames = frames(&session).await;
        let last: BotServerMessage = decode(frames.last().unwrap()).unwrap();
        assert_eq!(last, BotServerMessage::Stop);
        assert!(!engine.game().world.bots.contains_key(&bot_id));
    }

    #[tokio::test]
    async fn test_tick_never_waits_on_full_outbox() {
        let mut config = small_config();
        config.outbox_capacity = 2;
        config.slow_consumer_threshold = 2;
        let (mut engine, ctx, _) = engine_with(config);
        let (session, _) = register(&ctx, "slow");

        let start = std::time::Instant::now();
        for _ in 0..200 {
            engine.tick(0.03);
        }
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(engine.game().tick, 200);
        assert!(session.outbox.depth() <= 2);
        assert!(engine.counters.replaced > 0);
    }

    #[tokio::test]
    async fn test_parks_without_relevant_sessions_and_stops_on_shutdown() {
        let (engine, ctx, _) = engine_with(small_config());
        let handle = tokio::spawn(engine.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());

        ctx.control.request_shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

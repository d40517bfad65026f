//! One connected peer: a writer task draining its outbox and a reader task
//! turning wire frames into engine events.
//!
//! Both tasks share the [`Session`] and whichever finishes first calls
//! [`Session::terminate`]. Termination runs its cleanup once no matter how
//! many callers race to it.

use crate::context::{AdminRequest, EngineEvent, ServerContext};
use crate::error::SessionError;
use crate::outbox::{Frame, Outbox, PushOutcome, SlowConsumerGuard};
use crate::standby::StandbyCoordinator;
use crate::PLACEHOLDER_NAME;
use log::{debug, info, warn};
use serde::Serialize;
use shared::{
    decode, decode_json, encode, encode_json, read_frame, write_frame, BotCommand, BotId,
    BotMessage, BotServerMessage, CommandId, Hello, OperatorCommand, OperatorReply, Registration,
    Role, SessionId, Statistics, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};

const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const PAYLOAD_PREFIX_LEN: usize = 32;

pub struct Session {
    pub id: SessionId,
    pub role: Role,
    pub peer: SocketAddr,
    pub outbox: Outbox<Frame>,
    /// Zero until a bot registers.
    bot_id: AtomicU64,
    /// Newest command from the bot, taken by the tick loop.
    latest_command: Mutex<Option<BotCommand>>,
    terminated: AtomicBool,
    stop: watch::Sender<bool>,
    last_activity: Mutex<Instant>,
    standby_attached: AtomicBool,
    /// Observer still needs its first full snapshot.
    fresh: AtomicBool,
}

impl Session {
    pub fn new(id: SessionId, role: Role, peer: SocketAddr, outbox_capacity: usize) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            id,
            role,
            peer,
            outbox: Outbox::new(outbox_capacity),
            bot_id: AtomicU64::new(0),
            latest_command: Mutex::new(None),
            terminated: AtomicBool::new(false),
            stop,
            last_activity: Mutex::new(Instant::now()),
            standby_attached: AtomicBool::new(false),
            fresh: AtomicBool::new(role == Role::Observer),
        }
    }

    pub fn bot_id(&self) -> Option<BotId> {
        match self.bot_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub(crate) fn set_bot(&self, bot_id: BotId) {
        self.bot_id.store(bot_id, Ordering::Release);
    }

    /// Forgets the bot, e.g. after the engine already removed it.
    pub fn detach_bot(&self) -> Option<BotId> {
        match self.bot_id.swap(0, Ordering::AcqRel) {
            0 => None,
            id => Some(id),
        }
    }

    /// Overwrites whatever command the tick loop has not picked up yet.
    pub fn store_command(&self, command: BotCommand) {
        *self
            .latest_command
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(command);
    }

    pub fn take_command(&self) -> Option<BotCommand> {
        self.latest_command
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    pub fn attach_standby(&self, standby: &StandbyCoordinator) {
        if !self.standby_attached.swap(true, Ordering::AcqRel) {
            standby.attach();
        }
    }

    /// True exactly once for a new observer.
    pub fn take_fresh(&self) -> bool {
        self.fresh.swap(false, Ordering::AcqRel)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Resolves once the session has been told to stop.
    pub async fn stopped(&self) {
        let mut stop = self.stop.subscribe();
        while !*stop.borrow_and_update() {
            if stop.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn push(&self, frame: Frame) -> PushOutcome {
        self.outbox.push(frame)
    }

    /// Queues `message` as an essential bincode frame.
    pub fn send<T: Serialize>(&self, message: &T) -> PushOutcome {
        match encode(message) {
            Ok(bytes) => self.push(Frame::essential(bytes)),
            Err(e) => {
                warn!("Session {}: failed to encode message: {}", self.id, e);
                PushOutcome::Dropped
            }
        }
    }

    fn reply(&self, command_id: CommandId, ok: bool, message: impl Into<String>) {
        let reply = OperatorReply {
            command_id,
            ok,
            message: message.into(),
        };
        match encode_json(&reply) {
            Ok(bytes) => {
                self.push(Frame::essential(bytes));
            }
            Err(e) => warn!("Session {}: failed to encode reply: {}", self.id, e),
        }
    }

    /// Lets the writer flush what is queued, then end the session.
    pub fn close_after_flush(&self) {
        self.outbox.close();
    }

    /// Ends the session. Returns true for the one caller that ran the cleanup.
    pub fn terminate(&self, ctx: &ServerContext, reason: &str) -> bool {
        if self
            .terminated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.stop.send_replace(true);
        self.outbox.close();
        ctx.clients.remove(self.id);
        if self.standby_attached.swap(false, Ordering::AcqRel) {
            ctx.standby.detach();
        }
        if let Some(bot_id) = self.detach_bot() {
            ctx.send_event(EngineEvent::Disconnect {
                session_id: self.id,
                bot_id,
            });
        }
        info!(
            "Session {} ({:?}, {}) closed: {}",
            self.id, self.role, self.peer, reason
        );
        true
    }
}

/// Hex of the first bytes of a payload, for diagnostics.
pub fn payload_prefix(bytes: &[u8]) -> String {
    let mut hex: String = bytes
        .iter()
        .take(PAYLOAD_PREFIX_LEN)
        .map(|b| format!("{:02x}", b))
        .collect();
    if bytes.len() > PAYLOAD_PREFIX_LEN {
        hex.push_str("..");
    }
    hex
}

/// Runs a freshly accepted connection until it closes.
pub async fn handle_connection(ctx: Arc<ServerContext>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not disable Nagle for {}: {}", peer, e);
    }
    let (mut reader, writer) = stream.into_split();

    let hello = match read_hello(&ctx, &mut reader).await {
        Ok(hello) => hello,
        Err(e) => {
            warn!("Handshake with {} failed: {}", peer, e);
            return;
        }
    };

    let session = Arc::new(Session::new(
        ctx.ids.next_session(),
        hello.role,
        peer,
        ctx.config.outbox_capacity,
    ));
    ctx.clients.insert(Arc::clone(&session));
    info!("Session {} opened for {:?} at {}", session.id, hello.role, peer);

    let writer_task = tokio::spawn(run_writer(
        Arc::clone(&ctx),
        Arc::clone(&session),
        writer,
    ));

    let result = match hello.role {
        Role::Bot => run_bot(&ctx, &session, &mut reader).await,
        Role::Observer => run_observer(&ctx, &session, &mut reader).await,
        Role::Operator => run_operator(&ctx, &session, &mut reader).await,
    };

    let reason = match &result {
        Ok(()) => "stopped".to_string(),
        Err(SessionError::Closed) => "peer disconnected".to_string(),
        Err(e) => {
            warn!("Session {} ended with an error: {}", session.id, e);
            e.to_string()
        }
    };
    session.terminate(&ctx, &reason);

    if let Err(e) = writer_task.await {
        warn!("Writer task of session {} panicked: {}", session.id, e);
    }
}

async fn read_hello<R>(ctx: &ServerContext, reader: &mut R) -> Result<Hello, SessionError>
where
    R: AsyncRead + Unpin,
{
    let frame = timeout(ctx.config.registration_timeout, read_frame(reader))
        .await
        .map_err(|_| SessionError::Timeout("handshake"))??
        .ok_or(SessionError::Closed)?;
    let hello: Hello = decode(&frame)?;
    if hello.version != PROTOCOL_VERSION {
        return Err(SessionError::Protocol(format!(
            "protocol version {} not supported, expected {}",
            hello.version, PROTOCOL_VERSION
        )));
    }
    Ok(hello)
}

/// Drains the outbox to the wire until the session stops.
pub async fn run_writer<W>(ctx: Arc<ServerContext>, session: Arc<Session>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    let mut guard = SlowConsumerGuard::new(
        ctx.config.slow_consumer_threshold,
        ctx.config.slow_consumer_strikes,
    );
    let mut paused = ctx.standby.timers_paused();
    let mut idle_check = interval(IDLE_CHECK_INTERVAL);
    idle_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let reason = loop {
        tokio::select! {
            frame = session.outbox.next() => {
                let Some(frame) = frame else {
                    break "outbox closed".to_string();
                };
                if guard.observe(session.outbox.depth()) {
                    break format!(
                        "too slow, outbox stayed at {} of {} frames",
                        session.outbox.depth(),
                        session.outbox.capacity()
                    );
                }
                match timeout(ctx.config.write_timeout, write_frame(&mut writer, frame.bytes())).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break format!("write failed: {}", e),
                    Err(_) => break "write timed out".to_string(),
                }
            }
            _ = idle_check.tick(), if session.role == Role::Bot => {
                let idle = session.idle_for();
                if !*paused.borrow() && idle > ctx.config.inactivity_timeout {
                    break format!("inactive for {:.1}s", idle.as_secs_f32());
                }
            }
            changed = paused.changed() => {
                if changed.is_err() {
                    break "standby coordinator gone".to_string();
                }
                if !*paused.borrow_and_update() {
                    // Time spent on standby does not count as inactivity.
                    session.touch();
                }
            }
            _ = session.stopped() => break "stopped".to_string(),
        }
    };

    session.terminate(&ctx, &reason);
}

async fn next_frame<R>(session: &Session, reader: &mut R) -> Result<Option<Vec<u8>>, SessionError>
where
    R: AsyncRead + Unpin,
{
    tokio::select! {
        frame = read_frame(reader) => match frame? {
            Some(bytes) => {
                session.touch();
                Ok(Some(bytes))
            }
            None => Err(SessionError::Closed),
        },
        _ = session.stopped() => Ok(None),
    }
}

async fn check_eligibility(
    ctx: &ServerContext,
    peer: SocketAddr,
    registration: &Registration,
) -> Result<Statistics, String> {
    if registration.name == PLACEHOLDER_NAME && !peer.ip().is_loopback() {
        return Err(format!(
            "'{}' may only register from a local address",
            PLACEHOLDER_NAME
        ));
    }

    let check = Arc::clone(&ctx.eligibility);
    let name = registration.name.clone();
    let verdict = timeout(
        ctx.config.eligibility_timeout,
        tokio::task::spawn_blocking(move || check.check(&name)),
    )
    .await;

    match verdict {
        Err(_) => Err("eligibility check timed out".to_string()),
        Ok(Err(e)) => Err(format!("eligibility check failed: {}", e)),
        Ok(Ok(eligibility)) if !eligibility.allowed => {
            Err(format!("'{}' is not allowed to play", registration.name))
        }
        Ok(Ok(eligibility)) => {
            if let Some(group) = eligibility.group {
                debug!("'{}' plays for group '{}'", registration.name, group);
            }
            Ok(eligibility.statistics)
        }
    }
}

async fn run_bot<R>(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    reader: &mut R,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
{
    let first = tokio::select! {
        frame = timeout(ctx.config.registration_timeout, read_frame(reader)) => {
            frame.map_err(|_| SessionError::Timeout("registration"))??
        }
        _ = session.stopped() => return Ok(()),
    };
    let bytes = first.ok_or(SessionError::Closed)?;
    let registration = match decode::<BotMessage>(&bytes)? {
        BotMessage::Register(registration) => registration,
        BotMessage::Command(_) => {
            return Err(SessionError::Protocol(
                "command sent before registration".to_string(),
            ))
        }
    };
    session.touch();

    let lifetime = match check_eligibility(ctx, session.peer, &registration).await {
        Ok(lifetime) => lifetime,
        Err(reason) => {
            session.send(&BotServerMessage::Rejected {
                reason: reason.clone(),
            });
            session.close_after_flush();
            session.stopped().await;
            return Err(SessionError::Rejected(reason));
        }
    };

    let placeholder = registration.name == PLACEHOLDER_NAME;
    let bot_id = ctx.ids.next_bot();
    session.set_bot(bot_id);
    info!(
        "Session {} registered '{}' as bot {}",
        session.id, registration.name, bot_id
    );
    let queued = ctx.send_event(EngineEvent::Register {
        session_id: session.id,
        bot_id,
        registration,
        lifetime,
        placeholder,
    });
    if !queued {
        let reason = "server busy".to_string();
        session.detach_bot();
        session.send(&BotServerMessage::Rejected {
            reason: reason.clone(),
        });
        session.close_after_flush();
        session.stopped().await;
        return Err(SessionError::Rejected(reason));
    }
    if !placeholder {
        session.attach_standby(&ctx.standby);
    }

    while let Some(bytes) = next_frame(session, reader).await? {
        match decode::<BotMessage>(&bytes) {
            Ok(BotMessage::Command(command)) => session.store_command(command),
            Ok(BotMessage::Register(_)) => {
                warn!("Bot {} sent a second registration, ignoring", bot_id);
            }
            Err(e) => warn!(
                "Bot {} sent a malformed frame ({}), treating as no-op; payload {}",
                bot_id,
                e,
                payload_prefix(&bytes)
            ),
        }
    }
    Ok(())
}

async fn run_observer<R>(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    reader: &mut R,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
{
    session.attach_standby(&ctx.standby);
    while let Some(bytes) = next_frame(session, reader).await? {
        warn!(
            "Observer session {} sent {} bytes, ignoring",
            session.id,
            bytes.len()
        );
    }
    Ok(())
}

/// Applies a command that only flips process-wide flags.
fn apply_immediate(ctx: &ServerContext, command: &OperatorCommand) -> &'static str {
    match command {
        OperatorCommand::Start => {
            ctx.control.set_simulation_enabled(true);
            ctx.standby.set_held(false);
            "simulation started"
        }
        OperatorCommand::Stop => {
            ctx.control.set_simulation_enabled(false);
            ctx.standby.set_held(true);
            "simulation stopped"
        }
        OperatorCommand::ReloadConfiguration => {
            ctx.control.request_reload();
            "configuration reload requested"
        }
        OperatorCommand::Shutdown => {
            ctx.control.request_shutdown();
            "shutting down"
        }
        _ => "not an immediate command",
    }
}

async fn run_operator<R>(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    reader: &mut R,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
{
    while let Some(bytes) = next_frame(session, reader).await? {
        let command_id = ctx.ids.next_command();
        let command = match decode_json::<OperatorCommand>(&bytes) {
            Ok(command) => command,
            Err(e) => {
                session.reply(command_id, false, format!("malformed command: {}", e));
                session.close_after_flush();
                session.stopped().await;
                return Err(SessionError::Protocol(format!(
                    "malformed operator command: {}",
                    payload_prefix(&bytes)
                )));
            }
        };

        info!(
            "Operator session {} sent command {}: {:?}",
            session.id, command_id, command
        );
        if command.is_immediate() {
            let message = apply_immediate(ctx, &command);
            session.reply(command_id, true, message);
        } else {
            let request = AdminRequest {
                command,
                command_id,
                session_id: session.id,
            };
            match ctx.submit_admin(request) {
                Ok(()) => session.reply(command_id, true, "queued for the next tick"),
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Operator session {}: command queue full, refusing command {}",
                        session.id, command_id
                    );
                    session.reply(command_id, false, "command queue full")
                }
                Err(TrySendError::Closed(_)) => {
                    session.reply(command_id, false, "simulation is not running")
                }
            }
        }
    }
    Ok(())
}

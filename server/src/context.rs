//! Process-wide state shared by the tick loop and every session task.
//!
//! Built once at startup and handed out as an `Arc`. Sessions talk to the
//! tick loop only through the bounded queues held here and the latest-command
//! slot on each bot session.

use crate::client_manager::ClientManager;
use crate::config::ServerConfig;
use crate::external::EligibilityCheck;
use crate::ids::IdAllocator;
use crate::standby::StandbyCoordinator;
use log::warn;
use shared::{BotId, CommandId, OperatorCommand, Registration, SessionId, Statistics};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

/// Session lifecycle changes for the tick loop.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Register {
        session_id: SessionId,
        bot_id: BotId,
        registration: Registration,
        lifetime: Statistics,
        placeholder: bool,
    },
    Disconnect {
        session_id: SessionId,
        bot_id: BotId,
    },
}

#[derive(Debug, Clone)]
pub struct AdminRequest {
    pub command: OperatorCommand,
    pub command_id: CommandId,
    pub session_id: SessionId,
}

/// Flags operators flip without waiting for a tick.
pub struct ControlFlags {
    running: watch::Sender<bool>,
    simulation_enabled: AtomicBool,
    reload_requested: AtomicBool,
}

impl ControlFlags {
    fn new() -> Self {
        let (running, _) = watch::channel(true);
        Self {
            running,
            simulation_enabled: AtomicBool::new(true),
            reload_requested: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn request_shutdown(&self) {
        self.running.send_replace(false);
    }

    /// Resolves once shutdown has been requested.
    pub async fn shutdown_requested(&self) {
        let mut running = self.running.subscribe();
        while *running.borrow_and_update() {
            if running.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn simulation_enabled(&self) -> bool {
        self.simulation_enabled.load(Ordering::Acquire)
    }

    pub fn set_simulation_enabled(&self, enabled: bool) {
        self.simulation_enabled.store(enabled, Ordering::Release);
    }

    pub fn request_reload(&self) {
        self.reload_requested.store(true, Ordering::Release);
    }

    /// Returns whether a reload was pending and clears it.
    pub fn take_reload(&self) -> bool {
        self.reload_requested.swap(false, Ordering::AcqRel)
    }
}

/// Receiving ends owned by the tick loop.
pub struct EngineChannels {
    pub events: mpsc::Receiver<EngineEvent>,
    pub admin: mpsc::Receiver<AdminRequest>,
}

pub struct ServerContext {
    pub config: ServerConfig,
    pub ids: Arc<IdAllocator>,
    pub standby: StandbyCoordinator,
    pub clients: ClientManager,
    pub control: ControlFlags,
    pub eligibility: Arc<dyn EligibilityCheck>,
    events: mpsc::Sender<EngineEvent>,
    admin: mpsc::Sender<AdminRequest>,
}

impl ServerContext {
    pub fn new(
        config: ServerConfig,
        eligibility: Arc<dyn EligibilityCheck>,
    ) -> (Arc<Self>, EngineChannels) {
        let (events_tx, events) = mpsc::channel(config.event_queue.max(1));
        let (admin_tx, admin) = mpsc::channel(config.admin_queue.max(1));

        let ctx = Arc::new(Self {
            config,
            ids: Arc::new(IdAllocator::new()),
            standby: StandbyCoordinator::new(),
            clients: ClientManager::new(),
            control: ControlFlags::new(),
            eligibility,
            events: events_tx,
            admin: admin_tx,
        });
        (ctx, EngineChannels { events, admin })
    }

    /// Never waits. Returns false when the event could not be queued.
    ///
    /// A lost `Disconnect` is harmless: the tick loop also removes bots whose
    /// session is gone.
    pub fn send_event(&self, event: EngineEvent) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!("Event queue full, dropping {:?}", event);
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Tick loop has stopped, dropping session event");
                false
            }
        }
    }

    /// Queues a command for the next tick. Never waits.
    pub fn submit_admin(&self, request: AdminRequest) -> Result<(), TrySendError<AdminRequest>> {
        self.admin.try_send(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::AllowAll;
    use std::time::Duration;

    fn reset(command_id: CommandId) -> AdminRequest {
        AdminRequest {
            command: OperatorCommand::ResetWorld,
            command_id,
            session_id: 1,
        }
    }

    #[test]
    fn test_admin_queue_is_bounded() {
        let config = ServerConfig {
            admin_queue: 2,
            ..Default::default()
        };
        let (ctx, mut channels) = ServerContext::new(config, Arc::new(AllowAll));
        assert!(ctx.submit_admin(reset(1)).is_ok());
        assert!(ctx.submit_admin(reset(2)).is_ok());
        assert!(matches!(ctx.submit_admin(reset(3)), Err(TrySendError::Full(_))));

        assert_eq!(channels.admin.try_recv().unwrap().command_id, 1);
        assert!(ctx.submit_admin(reset(4)).is_ok());
    }

    #[test]
    fn test_event_queue_is_bounded() {
        let config = ServerConfig {
            event_queue: 1,
            ..Default::default()
        };
        let (ctx, mut channels) = ServerContext::new(config, Arc::new(AllowAll));
        let disconnect = |bot_id| EngineEvent::Disconnect {
            session_id: 1,
            bot_id,
        };
        assert!(ctx.send_event(disconnect(1)));
        assert!(!ctx.send_event(disconnect(2)));

        assert!(channels.events.try_recv().is_ok());
        assert!(ctx.send_event(disconnect(3)));
    }

    #[test]
    fn test_closed_queues_refuse() {
        let (ctx, channels) = ServerContext::new(ServerConfig::default(), Arc::new(AllowAll));
        drop(channels);
        assert!(!ctx.send_event(EngineEvent::Disconnect {
            session_id: 1,
            bot_id: 1,
        }));
        assert!(matches!(ctx.submit_admin(reset(1)), Err(TrySendError::Closed(_))));
    }

    #[test]
    fn test_control_flags() {
        let (ctx, _channels) = ServerContext::new(ServerConfig::default(), Arc::new(AllowAll));
        assert!(ctx.control.is_running());
        assert!(ctx.control.simulation_enabled());
        assert!(!ctx.control.take_reload());

        ctx.control.request_reload();
        assert!(ctx.control.take_reload());
        assert!(!ctx.control.take_reload());

        ctx.control.set_simulation_enabled(false);
        assert!(!ctx.control.simulation_enabled());
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let (ctx, _channels) = ServerContext::new(ServerConfig::default(), Arc::new(AllowAll));
        let waiter = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ctx.control.shutdown_requested().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.control.request_shutdown();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!ctx.control.is_running());
    }
}

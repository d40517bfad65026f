//! Parks the tick loop while nobody is watching or playing.
//!
//! A session is relevant when it is an observer or a registered bot that is
//! not the local placeholder. Every change to the relevant count happens under
//! one lock, and the engine registers interest in a wakeup before it checks the
//! count, so an attach can never slip between check and park.

use log::info;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{watch, Notify};

struct State {
    relevant: usize,
    held: bool,
}

pub struct StandbyCoordinator {
    state: Mutex<State>,
    wake: Notify,
    timers_paused: watch::Sender<bool>,
}

impl StandbyCoordinator {
    pub fn new() -> Self {
        let (timers_paused, _) = watch::channel(true);
        Self {
            state: Mutex::new(State {
                relevant: 0,
                held: false,
            }),
            wake: Notify::new(),
            timers_paused,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &State) {
        let paused = state.relevant == 0 || state.held;
        self.timers_paused.send_if_modified(|current| {
            let changed = *current != paused;
            *current = paused;
            changed
        });
    }

    pub fn attach(&self) {
        let state = {
            let mut state = self.lock();
            state.relevant += 1;
            self.publish(&state);
            state.relevant
        };
        if state == 1 {
            info!("Relevant session attached, resuming simulation");
        }
        self.wake.notify_waiters();
    }

    pub fn detach(&self) {
        let mut state = self.lock();
        state.relevant = state.relevant.saturating_sub(1);
        if state.relevant == 0 {
            info!("No relevant sessions left, simulation goes on standby");
        }
        self.publish(&state);
    }

    /// Pauses session inactivity timers while the simulation is stopped by an operator.
    pub fn set_held(&self, held: bool) {
        let mut state = self.lock();
        state.held = held;
        self.publish(&state);
    }

    pub fn relevant_count(&self) -> usize {
        self.lock().relevant
    }

    pub fn is_relevant(&self) -> bool {
        self.relevant_count() > 0
    }

    /// Watch for whether inactivity timers should currently be paused.
    pub fn timers_paused(&self) -> watch::Receiver<bool> {
        self.timers_paused.subscribe()
    }

    /// Resolves once at least one relevant session is attached.
    pub async fn wait_until_relevant(&self) {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_relevant() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for StandbyCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_attach_detach_counts() {
        let standby = StandbyCoordinator::new();
        assert!(!standby.is_relevant());
        standby.attach();
        standby.attach();
        standby.detach();
        assert_eq!(standby.relevant_count(), 1);
        standby.detach();
        standby.detach();
        assert_eq!(standby.relevant_count(), 0);
    }

    #[test]
    fn test_timers_follow_relevance_and_hold() {
        let standby = StandbyCoordinator::new();
        let paused = standby.timers_paused();
        assert!(*paused.borrow());

        standby.attach();
        assert!(!*paused.borrow());

        standby.set_held(true);
        assert!(*paused.borrow());
        standby.set_held(false);
        assert!(!*paused.borrow());

        standby.detach();
        assert!(*paused.borrow());
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_relevant() {
        let standby = StandbyCoordinator::new();
        standby.attach();
        tokio::time::timeout(Duration::from_millis(100), standby.wait_until_relevant())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_attach_wakes_parked_waiter() {
        let standby = Arc::new(StandbyCoordinator::new());
        let waiter = {
            let standby = Arc::clone(&standby);
            tokio::spawn(async move { standby.wait_until_relevant().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        standby.attach();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_lost_wakeup_under_races() {
        for _ in 0..200 {
            let standby = Arc::new(StandbyCoordinator::new());
            let waiter = {
                let standby = Arc::clone(&standby);
                tokio::spawn(async move { standby.wait_until_relevant().await })
            };
            let attacher = {
                let standby = Arc::clone(&standby);
                tokio::spawn(async move { standby.attach() })
            };
            attacher.await.unwrap();
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
        }
    }
}

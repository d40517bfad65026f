//! Server configuration and the named game configurations operators can
//! switch between at runtime.

use crate::quadtree::PoolCapacities;
use shared::{DEFAULT_MAX_BLOBS, FIELD_SIZE, TICK_MILLIS};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown game configuration '{0}'")]
    UnknownGame(String),
    #[error("unknown spawn distribution '{0}'")]
    UnknownDistribution(String),
    #[error("tick interval must be positive")]
    ZeroTick,
    #[error("field size must be a positive finite number, got {0}")]
    BadFieldSize(f32),
    #[error("{name}: minimum {min} exceeds maximum {max}")]
    MinAboveMax {
        name: &'static str,
        min: usize,
        max: usize,
    },
    #[error("outbox capacity must be at least 1")]
    ZeroOutbox,
    #[error("slow consumer threshold {threshold} exceeds outbox capacity {capacity}")]
    SlowThreshold { threshold: usize, capacity: usize },
    #[error("{0} queue must hold at least one entry")]
    ZeroQueue(&'static str),
}

/// Population limits and spawn distributions for one kind of game.
#[derive(Debug, Clone, PartialEq)]
pub struct GameConfiguration {
    pub name: String,
    pub max_bots: usize,
    pub min_food: usize,
    pub max_food: usize,
    pub min_toxins: usize,
    pub max_toxins: usize,
    pub max_blobs_per_bot: usize,
    pub food_distribution: String,
    pub toxin_distribution: String,
    pub bot_distribution: String,
}

impl GameConfiguration {
    pub const PRESETS: [&'static str; 4] = ["default", "feast", "hazard", "duel"];

    pub fn preset(name: &str) -> Result<Self, ConfigError> {
        let base = Self {
            name: name.to_string(),
            ..Self::default()
        };

        match name {
            "default" => Ok(base),
            "feast" => Ok(Self {
                min_food: 900,
                max_food: 1200,
                min_toxins: 20,
                max_toxins: 40,
                food_distribution: "center".to_string(),
                ..base
            }),
            "hazard" => Ok(Self {
                min_food: 200,
                max_food: 300,
                min_toxins: 300,
                max_toxins: 400,
                toxin_distribution: "ring".to_string(),
                ..base
            }),
            "duel" => Ok(Self {
                max_bots: 2,
                min_food: 100,
                max_food: 150,
                min_toxins: 10,
                max_toxins: 20,
                max_blobs_per_bot: 8,
                bot_distribution: "corners".to_string(),
                ..base
            }),
            other => Err(ConfigError::UnknownGame(other.to_string())),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_food > self.max_food {
            return Err(ConfigError::MinAboveMax {
                name: "food",
                min: self.min_food,
                max: self.max_food,
            });
        }
        if self.min_toxins > self.max_toxins {
            return Err(ConfigError::MinAboveMax {
                name: "toxins",
                min: self.min_toxins,
                max: self.max_toxins,
            });
        }
        Ok(())
    }
}

impl Default for GameConfiguration {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_bots: 100,
            min_food: 300,
            max_food: 400,
            min_toxins: 150,
            max_toxins: 200,
            max_blobs_per_bot: DEFAULT_MAX_BLOBS,
            food_distribution: "uniform".to_string(),
            toxin_distribution: "uniform".to_string(),
            bot_distribution: "uniform".to_string(),
        }
    }
}

/// Everything the server needs to start, resolved from the command line.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub tick_interval: Duration,
    pub field_size: f32,
    pub outbox_capacity: usize,
    pub slow_consumer_threshold: usize,
    pub slow_consumer_strikes: u32,
    /// Registrations and disconnects waiting for the tick loop.
    pub event_queue: usize,
    /// Operator commands waiting for the tick loop.
    pub admin_queue: usize,
    pub registration_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub eligibility_timeout: Duration,
    pub write_timeout: Duration,
    pub shutdown_grace: Duration,
    pub pool_capacities: PoolCapacities,
    pub query_capacity: usize,
    pub seed: Option<u64>,
    pub game: GameConfiguration,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ZeroTick);
        }
        if !(self.field_size.is_finite() && self.field_size > 0.0) {
            return Err(ConfigError::BadFieldSize(self.field_size));
        }
        if self.outbox_capacity == 0 {
            return Err(ConfigError::ZeroOutbox);
        }
        if self.event_queue == 0 {
            return Err(ConfigError::ZeroQueue("event"));
        }
        if self.admin_queue == 0 {
            return Err(ConfigError::ZeroQueue("admin"));
        }
        if self.slow_consumer_threshold > self.outbox_capacity {
            return Err(ConfigError::SlowThreshold {
                threshold: self.slow_consumer_threshold,
                capacity: self.outbox_capacity,
            });
        }
        self.game.validate()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            tick_interval: Duration::from_millis(TICK_MILLIS),
            field_size: FIELD_SIZE,
            outbox_capacity: 64,
            slow_consumer_threshold: 48,
            slow_consumer_strikes: 100,
            event_queue: 1024,
            admin_queue: 64,
            registration_timeout: Duration::from_secs(5),
            inactivity_timeout: Duration::from_secs(10),
            eligibility_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(500),
            pool_capacities: PoolCapacities::default(),
            query_capacity: 2048,
            seed: None,
            game: GameConfiguration::default(),
        }
    }
}

//! Entities of the arena. The engine is their only owner and mutator.

use shared::{
    mass_to_radius, BlobId, BlobView, BotCommand, BotId, BotInfo, FoodId, FoodView, Rect,
    SessionId, Statistics, ToxinId, ToxinView, Vec2, BOT_START_MASS, TOXIN_MASS_MIN,
};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub position: Vec2,
    pub mass: f32,
    pub velocity_factor: f32,
    pub is_split: bool,
    pub reunion_time: f32,
    pub impulse: Vec2,
}

impl Blob {
    pub fn new(position: Vec2, mass: f32) -> Self {
        Self {
            position,
            mass,
            velocity_factor: 1.0,
            is_split: false,
            reunion_time: 0.0,
            impulse: Vec2::ZERO,
        }
    }

    pub fn radius(&self) -> f32 {
        mass_to_radius(self.mass)
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite()
            && self.impulse.is_finite()
            && self.mass.is_finite()
            && self.velocity_factor.is_finite()
    }
}

#[derive(Debug, Clone)]
pub struct Bot {
    pub id: BotId,
    pub session_id: SessionId,
    pub info: BotInfo,
    pub blobs: BTreeMap<BlobId, Blob>,
    pub view_window: Rect,
    pub statistics: Statistics,
    pub lifetime: Statistics,
    pub command: BotCommand,
    pub alive_time: f32,
    pub placeholder: bool,
    /// Set when `info` changed and observers have not seen it yet.
    pub info_dirty: bool,
}

impl Bot {
    pub fn new(
        id: BotId,
        session_id: SessionId,
        info: BotInfo,
        lifetime: Statistics,
        placeholder: bool,
    ) -> Self {
        Self {
            id,
            session_id,
            info,
            blobs: BTreeMap::new(),
            view_window: Rect::default(),
            statistics: Statistics {
                max_size: BOT_START_MASS,
                ..Default::default()
            },
            lifetime,
            command: BotCommand::default(),
            alive_time: 0.0,
            placeholder,
            info_dirty: true,
        }
    }

    pub fn total_mass(&self) -> f32 {
        self.blobs.values().map(|b| b.mass).sum()
    }

    pub fn is_dead(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn blob_views(&self) -> Vec<BlobView> {
        self.blobs
            .iter()
            .map(|(id, blob)| BlobView {
                id: *id,
                bot_id: self.id,
                position: blob.position,
                mass: blob.mass,
            })
            .collect()
    }

    /// Lifetime statistics with this game's numbers folded in.
    pub fn merged_statistics(&self) -> Statistics {
        let mut merged = self.lifetime;
        merged.merge(&self.statistics);
        merged
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Food {
    pub position: Vec2,
    pub mass: f32,
    pub velocity: Vec2,
    pub is_new: bool,
    pub is_moving: bool,
    pub is_thrown: bool,
    pub thrown_by: Option<BotId>,
}

impl Food {
    pub fn ambient(position: Vec2, mass: f32) -> Self {
        Self {
            position,
            mass,
            velocity: Vec2::ZERO,
            is_new: true,
            is_moving: false,
            is_thrown: false,
            thrown_by: None,
        }
    }

    pub fn thrown(position: Vec2, mass: f32, velocity: Vec2, by: BotId) -> Self {
        Self {
            position,
            mass,
            velocity,
            is_new: true,
            is_moving: true,
            is_thrown: true,
            thrown_by: Some(by),
        }
    }

    pub fn view(&self, id: FoodId) -> FoodView {
        FoodView {
            id,
            position: self.position,
            mass: self.mass,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite() && self.velocity.is_finite() && self.mass.is_finite()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Toxin {
    pub position: Vec2,
    pub mass: f32,
    pub velocity: Vec2,
    pub is_new: bool,
    pub is_moving: bool,
    pub is_split: bool,
    pub fed_by: Option<BotId>,
}

impl Toxin {
    pub fn new(position: Vec2) -> Self {
        Self {
            position,
            mass: TOXIN_MASS_MIN,
            velocity: Vec2::ZERO,
            is_new: true,
            is_moving: false,
            is_split: false,
            fed_by: None,
        }
    }

    pub fn radius(&self) -> f32 {
        mass_to_radius(self.mass)
    }

    /// Back to a fresh, unfed toxin at `position`.
    pub fn respawn(&mut self, position: Vec2) {
        *self = Toxin::new(position);
    }

    pub fn view(&self, id: ToxinId) -> ToxinView {
        ToxinView {
            id,
            position: self.position,
            mass: self.mass,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite() && self.velocity.is_finite() && self.mass.is_finite()
    }
}

/// All simulated entities, kept in id order so every pass is deterministic.
#[derive(Debug, Default)]
pub struct World {
    pub bots: BTreeMap<BotId, Bot>,
    pub foods: BTreeMap<FoodId, Food>,
    pub toxins: BTreeMap<ToxinId, Toxin>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob_count(&self) -> usize {
        self.bots.values().map(|b| b.blobs.len()).sum()
    }
}

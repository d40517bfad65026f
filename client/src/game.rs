use log::debug;
use shared::{
    BotId, BotInfo, BotState, FoodId, FoodView, ObserverDelta, Statistics, ToxinId, ToxinView,
};
use std::collections::BTreeMap;

/// Observer-side mirror of the arena, rebuilt from deltas.
#[derive(Debug, Clone, Default)]
pub struct ObserverWorld {
    pub tick: u64,
    pub bot_infos: BTreeMap<BotId, BotInfo>,
    pub bots: BTreeMap<BotId, BotState>,
    pub foods: BTreeMap<FoodId, FoodView>,
    pub toxins: BTreeMap<ToxinId, ToxinView>,
    pub statistics: BTreeMap<BotId, Statistics>,
    pub deltas_applied: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaderboardEntry {
    pub bot_id: BotId,
    pub name: String,
    pub mass: f32,
}

impl ObserverWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one server delta. Deletions run after updates so an entity
    /// created and removed within a tick does not linger.
    pub fn apply(&mut self, delta: ObserverDelta) {
        if delta.tick < self.tick {
            debug!("Delta for tick {} arrived after tick {}", delta.tick, self.tick);
        }
        self.tick = delta.tick;
        self.deltas_applied += 1;

        self.bot_infos.extend(delta.created_or_updated_bot_infos);
        self.bots.extend(delta.created_or_updated_bots);
        self.foods.extend(delta.created_or_updated_foods);
        self.toxins.extend(delta.created_or_updated_toxins);
        self.statistics.extend(delta.statistics_local);

        for id in delta.deleted_bot_infos {
            self.bot_infos.remove(&id);
        }
        for id in delta.deleted_bots {
            self.bots.remove(&id);
            self.bot_infos.remove(&id);
            self.statistics.remove(&id);
        }
        for id in delta.deleted_foods {
            self.foods.remove(&id);
        }
        for id in delta.deleted_toxins {
            self.toxins.remove(&id);
        }
    }

    pub fn bot_mass(&self, bot_id: BotId) -> f32 {
        self.bots
            .get(&bot_id)
            .map(|state| state.blobs.iter().map(|b| b.mass).sum())
            .unwrap_or(0.0)
    }

    /// Heaviest bots first.
    pub fn leaderboard(&self, limit: usize) -> Vec<LeaderboardEntry> {
        let mut entries: Vec<LeaderboardEntry> = self
            .bots
            .keys()
            .map(|id| LeaderboardEntry {
                bot_id: *id,
                name: self
                    .bot_infos
                    .get(id)
                    .map(|info| info.name.clone())
                    .unwrap_or_else(|| format!("bot {}", id)),
                mass: self.bot_mass(*id),
            })
            .collect();
        entries.sort_by(|a, b| b.mass.total_cmp(&a.mass).then(a.bot_id.cmp(&b.bot_id)));
        entries.truncate(limit);
        entries
    }

    pub fn summary(&self) -> String {
        format!(
            "tick {}: {} bots, {} food, {} toxins",
            self.tick,
            self.bots.len(),
            self.foods.len(),
            self.toxins.len()
        )
    }
}

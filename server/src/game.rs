//! The authoritative world state and the mutation phases of a tick.
//!
//! [`Game::step`] runs every phase from blob motion to population control in
//! a fixed order. Draining session input before the step and emitting views
//! after it are the engine's job.

use crate::config::{ConfigError, GameConfiguration, ServerConfig};
use crate::external::{SpawnDistribution, SpawnDistributionProvider, StatisticsRecord, StatisticsSink};
use crate::ids::IdAllocator;
use crate::physics;
use crate::quadtree::{InsertError, PoolReport, QuadTree, QueryBuffer};
use crate::world::{Blob, Bot, Food, Toxin, World};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{
    mass_to_radius, BlobId, BotAction, BotCommand, BotId, BotInfo, FoodId, Limit,
    OperatorCommand, Rect, Registration, SessionId, SpawnTarget, Statistics, ToxinId, Vec2,
    BLOB_REUNION_TIME, BLOB_SPLIT_MASS, BLOB_SPLIT_VELOCITY, BOT_MIN_MASS, BOT_START_MASS,
    CONSUME_RATIO, EXPLOSION_FRAGMENTS, FOOD_MASS_MAX, FOOD_MASS_MIN,
    MASS_TO_BE_ALLOWED_TO_THROW, MAX_BLOB_COUNT_TO_EXPLODE, MIN_BLOB_MASS_TO_EXPLODE,
    THROWN_FOOD_MASS, THROWN_FOOD_SPEED, TOXIN_INHERITED_SPEED, TOXIN_MASS_MAX, TOXIN_MASS_MIN,
    VELOCITY_DECREASE_FACTOR,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Percent chance per tick that one food and one toxin trickle in below the ceiling.
const TRICKLE_PERCENT: u32 = 5;
const STATISTICS_SUBMIT_INTERVAL: u64 = 300;
const EXPLOSION_SPREAD: f32 = 3.0;
const SPLIT_IMPULSE: f32 = 0.1;
const SPLIT_RECOIL: f32 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathReason {
    Starved,
    Consumed,
    Killed,
    Disconnected,
    Invalid,
}

impl fmt::Display for DeathReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DeathReason::Starved => "starved",
            DeathReason::Consumed => "consumed",
            DeathReason::Killed => "killed by operator",
            DeathReason::Disconnected => "disconnected",
            DeathReason::Invalid => "invalid state",
        };
        f.write_str(text)
    }
}

/// A bot removed from the world whose session still needs closing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadBot {
    pub bot_id: BotId,
    pub session_id: SessionId,
    pub reason: DeathReason,
}

/// Deletions since the last emitted delta.
#[derive(Debug, Default)]
pub struct TickChanges {
    pub deleted_bots: BTreeSet<BotId>,
    pub deleted_foods: BTreeSet<FoodId>,
    pub deleted_toxins: BTreeSet<ToxinId>,
}

/// Empties `index` and inserts `(id, position, mass)` entries until a pool
/// runs out. Returns the largest radius indexed.
fn refill_index(
    index: &mut QuadTree,
    label: &str,
    tick: u64,
    entries: impl Iterator<Item = (u64, Vec2, f32)>,
) -> f32 {
    index.reset();
    let mut max_radius: f32 = 0.0;
    for (id, position, mass) in entries {
        match index.insert(position, mass, id) {
            Ok(()) => max_radius = max_radius.max(mass_to_radius(mass)),
            Err(InsertError::PoolExhausted) => break,
            Err(e) => warn!("{} {} not indexed on tick {}: {}", label, id, tick, e),
        }
    }
    if index.limit_was_hit() {
        error!(
            "{} index full on tick {}, indexed values: {}",
            label,
            tick,
            index.dump_json()
        );
    }
    max_radius
}

pub struct Game {
    pub world: World,
    pub config: GameConfiguration,
    pub tick: u64,
    pub changes: TickChanges,
    field_size: f32,
    ids: Arc<IdAllocator>,
    rng: StdRng,
    provider: Arc<dyn SpawnDistributionProvider>,
    sink: Arc<dyn StatisticsSink>,
    food_spawn: SpawnDistribution,
    toxin_spawn: SpawnDistribution,
    bot_spawn: SpawnDistribution,
    pub(crate) food_index: QuadTree,
    pub(crate) blob_index: QuadTree,
    pub(crate) toxin_index: QuadTree,
    /// Owner of every blob in `blob_index`.
    pub(crate) blob_owners: HashMap<BlobId, BotId>,
    /// Largest radius in each index, for growing query windows.
    pub(crate) max_blob_radius: f32,
    pub(crate) max_toxin_radius: f32,
    pub(crate) query: QueryBuffer,
    teams: HashMap<String, u32>,
    dead: Vec<DeadBot>,
}

impl Game {
    pub fn new(
        config: &ServerConfig,
        ids: Arc<IdAllocator>,
        provider: Arc<dyn SpawnDistributionProvider>,
        sink: Arc<dyn StatisticsSink>,
    ) -> Result<Self, ConfigError> {
        let game_config = config.game.clone();
        game_config.validate()?;
        let resolve = |name: &str| {
            provider
                .distribution(name, config.field_size)
                .ok_or_else(|| ConfigError::UnknownDistribution(name.to_string()))
        };
        let food_spawn = resolve(&game_config.food_distribution)?;
        let toxin_spawn = resolve(&game_config.toxin_distribution)?;
        let bot_spawn = resolve(&game_config.bot_distribution)?;

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut game = Self {
            world: World::new(),
            config: game_config,
            tick: 0,
            changes: TickChanges::default(),
            field_size: config.field_size,
            ids,
            rng,
            provider,
            sink,
            food_spawn,
            toxin_spawn,
            bot_spawn,
            food_index: QuadTree::new(config.field_size, config.pool_capacities),
            blob_index: QuadTree::new(config.field_size, config.pool_capacities),
            toxin_index: QuadTree::new(config.field_size, config.pool_capacities),
            blob_owners: HashMap::new(),
            max_blob_radius: 0.0,
            max_toxin_radius: 0.0,
            query: QueryBuffer::new(config.query_capacity),
            teams: HashMap::new(),
            dead: Vec::new(),
        };
        game.populate_to_max();
        Ok(game)
    }

    pub fn field_size(&self) -> f32 {
        self.field_size
    }

    /// Bots removed since the last call.
    pub fn take_dead(&mut self) -> Vec<DeadBot> {
        std::mem::take(&mut self.dead)
    }

    fn team_for(&mut self, name: &str) -> u32 {
        let next = self.teams.len() as u32 + 1;
        *self.teams.entry(name.to_string()).or_insert(next)
    }

    fn random_unit(&mut self) -> Vec2 {
        let angle = self.rng.gen_range(0.0..std::f32::consts::TAU);
        Vec2::new(angle.cos(), angle.sin())
    }

    fn food_mass(&mut self) -> f32 {
        self.rng.gen_range(FOOD_MASS_MIN..FOOD_MASS_MAX)
    }

    fn spawn_food(&mut self) {
        let position = self.food_spawn.sample(&mut self.rng, self.field_size);
        let mass = self.food_mass();
        self.world
            .foods
            .insert(self.ids.next_food(), Food::ambient(position, mass));
    }

    fn spawn_toxin(&mut self) {
        let position = self.toxin_spawn.sample(&mut self.rng, self.field_size);
        self.world
            .toxins
            .insert(self.ids.next_toxin(), Toxin::new(position));
    }

    fn populate_to_max(&mut self) {
        while self.world.foods.len() < self.config.max_food {
            self.spawn_food();
        }
        while self.world.toxins.len() < self.config.max_toxins {
            self.spawn_toxin();
        }
    }

    // ---------------------------------------------------------------
    // Session driven changes
    // ---------------------------------------------------------------

    /// Places a newly registered bot with a single starting blob.
    pub fn add_bot(
        &mut self,
        bot_id: BotId,
        session_id: SessionId,
        registration: &Registration,
        lifetime: Statistics,
        placeholder: bool,
    ) -> Result<(), String> {
        if self.world.bots.len() >= self.config.max_bots {
            return Err(format!(
                "arena is full ({} bots)",
                self.config.max_bots
            ));
        }

        let info = BotInfo {
            name: registration.name.clone(),
            color: registration.color,
            image: registration.image.clone(),
            team_id: self.team_for(&registration.name),
        };
        let mut bot = Bot::new(bot_id, session_id, info, lifetime, placeholder);
        let position = self.bot_spawn.sample(&mut self.rng, self.field_size);
        bot.blobs
            .insert(self.ids.next_blob(), Blob::new(position, BOT_START_MASS));
        bot.command.target = position;
        if let Some(window) = physics::view_window([(position, BOT_START_MASS)]) {
            bot.view_window = window;
        }

        info!(
            "Bot {} '{}' joined on team {} at ({:.1}, {:.1})",
            bot_id, registration.name, bot.info.team_id, position.x, position.y
        );
        self.world.bots.insert(bot_id, bot);
        Ok(())
    }

    /// Stores the latest command for a bot, replacing any earlier one.
    pub fn set_command(&mut self, bot_id: BotId, command: BotCommand) {
        match self.world.bots.get_mut(&bot_id) {
            Some(bot) if command.target.is_finite() => bot.command = command,
            Some(_) => warn!("Bot {} sent a non-finite target, ignoring", bot_id),
            None => debug!("Command for unknown bot {}", bot_id),
        }
    }

    /// Removes a bot, submits its statistics and queues its session for closing.
    pub fn remove_bot(&mut self, bot_id: BotId, reason: DeathReason) -> bool {
        let Some(bot) = self.world.bots.remove(&bot_id) else {
            return false;
        };
        info!(
            "Bot {} '{}' removed ({}) after {:.1}s",
            bot_id, bot.info.name, reason, bot.alive_time
        );
        self.sink.submit(StatisticsRecord {
            bot_id,
            name: bot.info.name.clone(),
            statistics: bot.merged_statistics(),
        });
        self.changes.deleted_bots.insert(bot_id);
        if reason != DeathReason::Disconnected {
            self.dead.push(DeadBot {
                bot_id,
                session_id: bot.session_id,
                reason,
            });
        }
        true
    }

    // ---------------------------------------------------------------
    // Operator commands
    // ---------------------------------------------------------------

    /// Applies a queued operator command. Immediate commands never get here.
    pub fn apply_admin(&mut self, command: &OperatorCommand) -> Result<String, String> {
        match command {
            OperatorCommand::SetLimit { limit, value } => {
                let mut updated = self.config.clone();
                let field = match limit {
                    Limit::MaxBots => &mut updated.max_bots,
                    Limit::MinFood => &mut updated.min_food,
                    Limit::MaxFood => &mut updated.max_food,
                    Limit::MinToxins => &mut updated.min_toxins,
                    Limit::MaxToxins => &mut updated.max_toxins,
                    Limit::MaxBlobsPerBot => &mut updated.max_blobs_per_bot,
                };
                *field = *value;
                updated.validate().map_err(|e| e.to_string())?;
                self.config = updated;
                Ok(format!("{:?} set to {}", limit, value))
            }
            OperatorCommand::SetSpawnDistribution { target, name } => {
                let distribution = self
                    .provider
                    .distribution(name, self.field_size)
                    .ok_or_else(|| format!("unknown distribution '{}'", name))?;
                match target {
                    SpawnTarget::Food => {
                        self.food_spawn = distribution;
                        self.config.food_distribution = name.clone();
                    }
                    SpawnTarget::Toxin => {
                        self.toxin_spawn = distribution;
                        self.config.toxin_distribution = name.clone();
                    }
                    SpawnTarget::Bot => {
                        self.bot_spawn = distribution;
                        self.config.bot_distribution = name.clone();
                    }
                }
                Ok(format!("{:?} now spawns from '{}'", target, name))
            }
            OperatorCommand::KillAllBots => {
                let ids: Vec<BotId> = self.world.bots.keys().copied().collect();
                for id in &ids {
                    self.remove_bot(*id, DeathReason::Killed);
                }
                Ok(format!("killed {} bots", ids.len()))
            }
            OperatorCommand::KillBotsAboveMass { threshold } => {
                let ids: Vec<BotId> = self
                    .world
                    .bots
                    .iter()
                    .filter(|(_, bot)| bot.total_mass() > *threshold)
                    .map(|(id, _)| *id)
                    .collect();
                for id in &ids {
                    self.remove_bot(*id, DeathReason::Killed);
                }
                Ok(format!("killed {} bots above mass {}", ids.len(), threshold))
            }
            OperatorCommand::SwitchGameConfiguration { name } => {
                let preset = GameConfiguration::preset(name).map_err(|e| e.to_string())?;
                self.switch_configuration(preset)?;
                Ok(format!("switched to game configuration '{}'", name))
            }
            OperatorCommand::ResetWorld => {
                self.reset_world();
                Ok("world reset".to_string())
            }
            OperatorCommand::Start
            | OperatorCommand::Stop
            | OperatorCommand::ReloadConfiguration
            | OperatorCommand::Shutdown => Err("immediate commands are not queued".to_string()),
        }
    }

    /// Re-reads the current game configuration by name, dropping runtime tweaks.
    pub fn reload_configuration(&mut self) -> Result<(), String> {
        let preset = GameConfiguration::preset(&self.config.name).map_err(|e| e.to_string())?;
        self.switch_configuration(preset)?;
        info!("Reloaded game configuration '{}'", self.config.name);
        Ok(())
    }

    fn switch_configuration(&mut self, preset: GameConfiguration) -> Result<(), String> {
        let resolve = |name: &str| {
            self.provider
                .distribution(name, self.field_size)
                .ok_or_else(|| format!("unknown distribution '{}'", name))
        };
        let food = resolve(&preset.food_distribution)?;
        let toxin = resolve(&preset.toxin_distribution)?;
        let bot = resolve(&preset.bot_distribution)?;
        self.food_spawn = food;
        self.toxin_spawn = toxin;
        self.bot_spawn = bot;
        self.config = preset;
        Ok(())
    }

    /// Clears food and toxins, refills them and respawns every bot with a fresh blob.
    pub fn reset_world(&mut self) {
        let foods = std::mem::take(&mut self.world.foods);
        self.changes.deleted_foods.extend(foods.into_keys());
        let toxins = std::mem::take(&mut self.world.toxins);
        self.changes.deleted_toxins.extend(toxins.into_keys());
        self.populate_to_max();

        let bot_ids: Vec<BotId> = self.world.bots.keys().copied().collect();
        for bot_id in bot_ids {
            let position = self.bot_spawn.sample(&mut self.rng, self.field_size);
            let blob_id = self.ids.next_blob();
            if let Some(bot) = self.world.bots.get_mut(&bot_id) {
                bot.blobs.clear();
                bot.blobs.insert(blob_id, Blob::new(position, BOT_START_MASS));
                bot.command = BotCommand {
                    action: BotAction::None,
                    target: position,
                };
            }
        }
        info!("World reset");
    }

    // ---------------------------------------------------------------
    // Tick phases
    // ---------------------------------------------------------------

    /// Runs the mutation phases of one tick.
    pub fn step(&mut self, dt: f32) {
        self.tick += 1;
        self.integrate_blobs(dt);
        self.update_view_windows();
        self.integrate_free_entities(dt);
        self.apply_bot_actions();
        self.split_toxins();
        self.reunite_blobs();
        self.explode_blobs_on_toxins();
        self.push_blobs_apart();
        self.eat_food();
        self.consume_blobs();
        self.enforce_population();
        self.remove_invalid_entities();

        if self.tick % STATISTICS_SUBMIT_INTERVAL == 0 {
            self.submit_statistics();
        }
    }

    /// Hands the merged statistics of every live bot to the sink.
    pub fn submit_statistics(&self) {
        for bot in self.world.bots.values() {
            self.sink.submit(StatisticsRecord {
                bot_id: bot.id,
                name: bot.info.name.clone(),
                statistics: bot.merged_statistics(),
            });
        }
    }

    pub fn index_report(&self) -> [PoolReport; 4] {
        self.food_index.report()
    }

    pub(crate) fn integrate_blobs(&mut self, dt: f32) {
        let field = self.field_size;
        let mut starved = Vec::new();
        for bot in self.world.bots.values_mut() {
            let target = bot.command.target;
            for blob in bot.blobs.values_mut() {
                let velocity =
                    physics::blob_velocity(blob.position, target, blob.mass, blob.velocity_factor);
                let moved = blob.position + physics::blob_displacement(velocity, blob.impulse, dt);
                blob.position = physics::clamp_to_field(moved, field);
                blob.mass = physics::decayed_mass(blob.mass, dt);
                blob.velocity_factor *= VELOCITY_DECREASE_FACTOR;
                blob.impulse = blob.impulse * VELOCITY_DECREASE_FACTOR;
                blob.reunion_time = (blob.reunion_time - dt).max(0.0);
            }
            bot.blobs.retain(|_, blob| blob.mass >= BOT_MIN_MASS);
            bot.alive_time += dt;
            if bot.is_dead() {
                starved.push(bot.id);
            }
        }
        for bot_id in starved {
            self.remove_bot(bot_id, DeathReason::Starved);
        }
    }

    pub(crate) fn update_view_windows(&mut self) {
        let mut empty = Vec::new();
        for bot in self.world.bots.values_mut() {
            let window = physics::view_window(bot.blobs.values().map(|b| (b.position, b.mass)));
            match window {
                Some(window) => bot.view_window = window,
                None => {
                    empty.push(bot.id);
                    continue;
                }
            }
            let mass = bot.total_mass();
            bot.statistics.max_size = bot.statistics.max_size.max(mass);
            bot.statistics.max_survival_time = bot.statistics.max_survival_time.max(bot.alive_time);
        }
        for bot_id in empty {
            error!("Bot {} has no blobs while computing its view window", bot_id);
            self.remove_bot(bot_id, DeathReason::Invalid);
        }
    }

    pub(crate) fn integrate_free_entities(&mut self, dt: f32) {
        let field = self.field_size;
        for food in self.world.foods.values_mut().filter(|f| f.is_moving) {
            let (position, velocity, moving) =
                physics::integrate_free_motion(food.position, food.velocity, dt, field);
            food.position = position;
            food.velocity = velocity;
            food.is_moving = moving;
        }
        for toxin in self.world.toxins.values_mut().filter(|t| t.is_moving) {
            let (position, velocity, moving) =
                physics::integrate_free_motion(toxin.position, toxin.velocity, dt, field);
            toxin.position = position;
            toxin.velocity = velocity;
            toxin.is_moving = moving;
        }
    }

    pub(crate) fn apply_bot_actions(&mut self) {
        let bot_ids: Vec<BotId> = self.world.bots.keys().copied().collect();
        for bot_id in bot_ids {
            let action = match self.world.bots.get_mut(&bot_id) {
                Some(bot) => std::mem::take(&mut bot.command.action),
                None => continue,
            };
            match action {
                BotAction::None => {}
                BotAction::Split => self.split_bot(bot_id),
                BotAction::Throw => self.throw_from_bot(bot_id),
            }
        }
    }

    fn split_bot(&mut self, bot_id: BotId) {
        let max_blobs = self.config.max_blobs_per_bot;
        let Some(bot) = self.world.bots.get(&bot_id) else {
            return;
        };
        let target = bot.command.target;
        let candidates: Vec<BlobId> = bot
            .blobs
            .iter()
            .filter(|(_, blob)| blob.mass >= BLOB_SPLIT_MASS)
            .map(|(id, _)| *id)
            .collect();
        let mut room = max_blobs.saturating_sub(bot.blobs.len());

        let mut new_blobs = Vec::new();
        for blob_id in candidates {
            if room == 0 {
                break;
            }
            let fallback = self.random_unit();
            let new_id = self.ids.next_blob();
            let Some(blob) = self
                .world
                .bots
                .get_mut(&bot_id)
                .and_then(|bot| bot.blobs.get_mut(&blob_id))
            else {
                continue;
            };

            let mut direction = (target - blob.position).normalize();
            if direction == Vec2::ZERO {
                direction = fallback;
            }
            let half = blob.mass / 2.0;
            let radius = mass_to_radius(half);

            blob.mass = half;
            blob.is_split = true;
            blob.reunion_time = BLOB_REUNION_TIME;
            blob.impulse = direction * (-radius * SPLIT_RECOIL);

            new_blobs.push((
                new_id,
                Blob {
                    position: blob.position,
                    mass: half,
                    velocity_factor: BLOB_SPLIT_VELOCITY,
                    is_split: true,
                    reunion_time: BLOB_REUNION_TIME,
                    impulse: direction * (radius * SPLIT_IMPULSE),
                },
            ));
            room -= 1;
        }

        if let Some(bot) = self.world.bots.get_mut(&bot_id) {
            if !new_blobs.is_empty() {
                bot.statistics.split_count += 1;
            }
            bot.blobs.extend(new_blobs);
        }
    }

    fn throw_from_bot(&mut self, bot_id: BotId) {
        let field = self.field_size;
        let Some(bot) = self.world.bots.get(&bot_id) else {
            return;
        };
        let target = bot.command.target;
        let throwers: Vec<BlobId> = bot
            .blobs
            .iter()
            .filter(|(_, blob)| blob.mass > MASS_TO_BE_ALLOWED_TO_THROW)
            .map(|(id, _)| *id)
            .collect();

        for blob_id in throwers {
            let fallback = self.random_unit();
            let food_id = self.ids.next_food();
            let Some(blob) = self
                .world
                .bots
                .get_mut(&bot_id)
                .and_then(|bot| bot.blobs.get_mut(&blob_id))
            else {
                continue;
            };

            let diff = target - blob.position;
            let direction = if diff.length() <= 0.01 {
                fallback
            } else {
                diff.normalize()
            };
            let offset = 1.5 * (blob.radius() + mass_to_radius(THROWN_FOOD_MASS));
            let position = physics::clamp_to_field(blob.position + direction * offset, field);
            blob.mass -= THROWN_FOOD_MASS;

            self.world.foods.insert(
                food_id,
                Food::thrown(
                    position,
                    THROWN_FOOD_MASS,
                    direction * THROWN_FOOD_SPEED,
                    bot_id,
                ),
            );
        }
    }

    pub(crate) fn split_toxins(&mut self) {
        let mut spawned = Vec::new();
        for toxin in self.world.toxins.values_mut() {
            if toxin.mass <= TOXIN_MASS_MAX {
                continue;
            }
            spawned.push(Toxin {
                position: toxin.position,
                mass: TOXIN_MASS_MIN,
                velocity: toxin.velocity,
                is_new: true,
                is_moving: toxin.velocity != Vec2::ZERO,
                is_split: true,
                fed_by: toxin.fed_by,
            });
            if let Some(bot) = toxin.fed_by.and_then(|id| self.world.bots.get_mut(&id)) {
                bot.statistics.toxin_throw += 1;
            }
            toxin.mass = TOXIN_MASS_MIN;
            toxin.is_split = false;
            toxin.fed_by = None;
            toxin.velocity = Vec2::ZERO;
            toxin.is_moving = false;
        }
        for toxin in spawned {
            self.world.toxins.insert(self.ids.next_toxin(), toxin);
        }
    }

    pub(crate) fn reunite_blobs(&mut self) {
        for bot in self.world.bots.values_mut() {
            let ids: Vec<BlobId> = bot.blobs.keys().copied().collect();
            for (i, &a_id) in ids.iter().enumerate() {
                for &b_id in &ids[i + 1..] {
                    let (Some(a), Some(b)) = (bot.blobs.get(&a_id), bot.blobs.get(&b_id)) else {
                        continue;
                    };
                    if a.reunion_time > 0.0 || b.reunion_time > 0.0 {
                        continue;
                    }
                    let (keep, absorb) = if b.mass > a.mass {
                        (b_id, a_id)
                    } else {
                        (a_id, b_id)
                    };
                    let (keeper, absorbed) = (&bot.blobs[&keep], &bot.blobs[&absorb]);
                    let distance = keeper.position.distance(absorbed.position);
                    let reach = keeper.radius() + absorbed.radius();
                    if distance < reach && reach - distance > absorbed.radius() {
                        let mass = absorbed.mass;
                        bot.blobs.remove(&absorb);
                        if let Some(keeper) = bot.blobs.get_mut(&keep) {
                            keeper.mass += mass;
                            keeper.is_split = false;
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn explode_blobs_on_toxins(&mut self) {
        let toxin_ids: Vec<ToxinId> = self.world.toxins.keys().copied().collect();
        for toxin_id in toxin_ids {
            let Some(toxin) = self.world.toxins.get(&toxin_id).cloned() else {
                continue;
            };
            let hit = self.world.bots.iter().find_map(|(bot_id, bot)| {
                bot.blobs
                    .iter()
                    .find(|(_, blob)| {
                        blob.mass >= MIN_BLOB_MASS_TO_EXPLODE
                            && blob.position.distance(toxin.position) < blob.radius()
                    })
                    .map(|(blob_id, _)| (*bot_id, *blob_id, bot.blobs.len()))
            });
            let Some((bot_id, blob_id, blob_count)) = hit else {
                continue;
            };

            if blob_count > MAX_BLOB_COUNT_TO_EXPLODE {
                if toxin.is_split || self.world.toxins.len() >= self.config.max_toxins {
                    self.world.toxins.remove(&toxin_id);
                    self.changes.deleted_toxins.insert(toxin_id);
                } else {
                    self.respawn_toxin(toxin_id);
                }
                continue;
            }

            if toxin.is_split {
                if let Some(feeder) = toxin.fed_by.and_then(|id| self.world.bots.get_mut(&id)) {
                    feeder.statistics.successful_toxin += 1;
                }
            }
            self.explode_blob(bot_id, blob_id);
            self.respawn_toxin(toxin_id);
        }
    }

    fn respawn_toxin(&mut self, toxin_id: ToxinId) {
        let position = self.toxin_spawn.sample(&mut self.rng, self.field_size);
        if let Some(toxin) = self.world.toxins.get_mut(&toxin_id) {
            toxin.respawn(position);
        }
    }

    fn explode_blob(&mut self, bot_id: BotId, blob_id: BlobId) {
        let Some(blob) = self
            .world
            .bots
            .get_mut(&bot_id)
            .and_then(|bot| bot.blobs.remove(&blob_id))
        else {
            return;
        };

        let mass = blob.mass / EXPLOSION_FRAGMENTS as f32;
        let mut fragments = Vec::with_capacity(EXPLOSION_FRAGMENTS);
        for _ in 0..EXPLOSION_FRAGMENTS {
            let jitter = self.random_unit();
            let spread = self.random_unit() * EXPLOSION_SPREAD;
            fragments.push((
                self.ids.next_blob(),
                Blob {
                    position: physics::clamp_to_field(blob.position + jitter, self.field_size),
                    mass,
                    velocity_factor: blob.velocity_factor + 0.1,
                    is_split: false,
                    reunion_time: BLOB_REUNION_TIME,
                    impulse: spread,
                },
            ));
        }
        if let Some(bot) = self.world.bots.get_mut(&bot_id) {
            bot.blobs.extend(fragments);
            debug!("Bot {} blob {} exploded on a toxin", bot_id, blob_id);
        }
    }

    pub(crate) fn push_blobs_apart(&mut self) {
        let field = self.field_size;
        for bot in self.world.bots.values_mut() {
            let ids: Vec<BlobId> = bot.blobs.keys().copied().collect();
            for (i, &a_id) in ids.iter().enumerate() {
                for &b_id in &ids[i + 1..] {
                    let (a, b) = (&bot.blobs[&a_id], &bot.blobs[&b_id]);
                    if a.velocity_factor >= 1.1 || b.velocity_factor >= 1.1 {
                        continue;
                    }
                    let min_distance = physics::separation_distance(
                        a.radius(),
                        b.radius(),
                        a.reunion_time,
                        b.reunion_time,
                    );
                    let overlap = min_distance - a.position.distance(b.position);
                    if overlap <= 0.0 {
                        continue;
                    }
                    let mut away = a.position - b.position;
                    if away.length() <= 0.01 {
                        // Coincident centres: separate along an id derived axis.
                        let angle = (a_id.wrapping_mul(31).wrapping_add(b_id) % 360) as f32;
                        away = Vec2::new(angle.to_radians().cos(), angle.to_radians().sin());
                    }
                    let push = away.normalize() * (overlap / 2.0);
                    if let Some(a) = bot.blobs.get_mut(&a_id) {
                        a.position = physics::clamp_to_field(a.position + push, field);
                    }
                    if let Some(b) = bot.blobs.get_mut(&b_id) {
                        b.position = physics::clamp_to_field(b.position - push, field);
                    }
                }
            }
        }
    }

    pub(crate) fn rebuild_food_index(&mut self) {
        refill_index(
            &mut self.food_index,
            "Food",
            self.tick,
            self.world.foods.iter().map(|(id, f)| (*id, f.position, f.mass)),
        );
    }

    pub(crate) fn rebuild_blob_index(&mut self) {
        self.blob_owners.clear();
        for (bot_id, bot) in &self.world.bots {
            for blob_id in bot.blobs.keys() {
                self.blob_owners.insert(*blob_id, *bot_id);
            }
        }
        self.max_blob_radius = refill_index(
            &mut self.blob_index,
            "Blob",
            self.tick,
            self.world
                .bots
                .values()
                .flat_map(|bot| bot.blobs.iter().map(|(id, b)| (*id, b.position, b.mass))),
        );
    }

    pub(crate) fn rebuild_toxin_index(&mut self) {
        self.max_toxin_radius = refill_index(
            &mut self.toxin_index,
            "Toxin",
            self.tick,
            self.world.toxins.iter().map(|(id, t)| (*id, t.position, t.mass)),
        );
    }

    /// Brings every index up to date with the world for building views.
    pub(crate) fn rebuild_view_indexes(&mut self) {
        self.rebuild_food_index();
        self.rebuild_blob_index();
        self.rebuild_toxin_index();
    }

    pub(crate) fn eat_food(&mut self) {
        self.rebuild_food_index();
        let mut eaten: BTreeSet<FoodId> = BTreeSet::new();

        let World { bots, foods, toxins } = &mut self.world;
        let team_of: HashMap<BotId, u32> =
            bots.iter().map(|(id, bot)| (*id, bot.info.team_id)).collect();
        let mut team_feeds: Vec<BotId> = Vec::new();

        for bot in bots.values_mut() {
            for blob in bot.blobs.values_mut() {
                let radius = blob.radius();
                self.query.clear();
                self.food_index
                    .query(&Rect::around(blob.position, radius), &mut self.query);
                if self.query.is_truncated() {
                    warn!("Food query around bot {} truncated on tick {}", bot.id, self.tick);
                }
                for value in self.query.iter() {
                    if eaten.contains(&value.id)
                        || value.position.distance_squared(blob.position) >= radius * radius
                    {
                        continue;
                    }
                    let Some(food) = foods.get(&value.id) else {
                        continue;
                    };
                    blob.mass += food.mass;
                    eaten.insert(value.id);
                    if let Some(thrower) = food.thrown_by {
                        if thrower != bot.id && team_of.get(&thrower) == Some(&bot.info.team_id) {
                            team_feeds.push(thrower);
                        }
                    }
                }
            }
        }

        for toxin in toxins.values_mut() {
            let radius = toxin.radius();
            self.query.clear();
            self.food_index
                .query(&Rect::around(toxin.position, radius), &mut self.query);
            for value in self.query.iter() {
                if eaten.contains(&value.id)
                    || value.position.distance_squared(toxin.position) >= radius * radius
                {
                    continue;
                }
                let Some(food) = foods.get(&value.id) else {
                    continue;
                };
                if !food.is_thrown {
                    continue;
                }
                let direction = if food.velocity.length() <= 0.01 {
                    let angle = self.rng.gen_range(0.0..std::f32::consts::TAU);
                    Vec2::new(angle.cos(), angle.sin())
                } else {
                    food.velocity.normalize()
                };
                toxin.mass += food.mass;
                toxin.velocity = direction * TOXIN_INHERITED_SPEED;
                toxin.fed_by = food.thrown_by;
                eaten.insert(value.id);
            }
        }

        for thrower in team_feeds {
            if let Some(bot) = bots.get_mut(&thrower) {
                bot.statistics.successful_team += 1;
            }
        }

        for food_id in eaten {
            let thrown = foods.get(&food_id).map(|f| f.is_thrown).unwrap_or(true);
            if thrown || foods.len() > self.config.max_food {
                foods.remove(&food_id);
                self.changes.deleted_foods.insert(food_id);
            } else {
                let position = self.food_spawn.sample(&mut self.rng, self.field_size);
                let mass = self.rng.gen_range(FOOD_MASS_MIN..FOOD_MASS_MAX);
                if let Some(food) = foods.get_mut(&food_id) {
                    *food = Food::ambient(position, mass);
                }
            }
        }
    }

    pub(crate) fn consume_blobs(&mut self) {
        self.rebuild_blob_index();
        let order: Vec<(BotId, BlobId)> = self
            .world
            .bots
            .iter()
            .flat_map(|(bot_id, bot)| bot.blobs.keys().map(move |blob_id| (*bot_id, *blob_id)))
            .collect();

        let mut eaten: HashSet<BlobId> = HashSet::new();
        let mut killed_bots: Vec<BotId> = Vec::new();

        for (bot_id, blob_id) in order {
            if eaten.contains(&blob_id) {
                continue;
            }
            let Some(consumer) = self.world.bots.get(&bot_id).and_then(|b| b.blobs.get(&blob_id))
            else {
                continue;
            };
            let (position, radius) = (consumer.position, consumer.radius());

            self.query.clear();
            self.blob_index
                .query(&Rect::around(position, radius), &mut self.query);
            let candidates: Vec<BlobId> = self.query.iter().map(|v| v.id).collect();

            for victim_id in candidates {
                if victim_id == blob_id || eaten.contains(&victim_id) {
                    continue;
                }
                let Some(&victim_bot) = self.blob_owners.get(&victim_id) else {
                    continue;
                };
                if victim_bot == bot_id {
                    continue;
                }
                let consumer_mass = match self.world.bots.get(&bot_id).and_then(|b| b.blobs.get(&blob_id)) {
                    Some(blob) => blob.mass,
                    None => break,
                };
                let Some(victim) = self
                    .world
                    .bots
                    .get(&victim_bot)
                    .and_then(|b| b.blobs.get(&victim_id))
                else {
                    continue;
                };
                if victim.mass >= CONSUME_RATIO * consumer_mass
                    || victim.position.distance_squared(position) >= radius * radius
                {
                    continue;
                }

                let victim_mass = victim.mass;
                let victim_team = self.world.bots.get(&victim_bot).map(|b| b.info.team_id);
                let victim_dead = match self.world.bots.get_mut(&victim_bot) {
                    Some(bot) => {
                        bot.blobs.remove(&victim_id);
                        bot.is_dead()
                    }
                    None => false,
                };
                eaten.insert(victim_id);

                if let Some(bot) = self.world.bots.get_mut(&bot_id) {
                    if let Some(blob) = bot.blobs.get_mut(&blob_id) {
                        blob.mass += victim_mass;
                        if blob.is_split {
                            bot.statistics.successful_split += 1;
                        }
                    }
                    bot.statistics.blob_kill_count += 1;
                    if victim_team == Some(bot.info.team_id) {
                        bot.statistics.bad_teaming += 1;
                    }
                    if victim_dead {
                        bot.statistics.bot_kill_count += 1;
                        killed_bots.push(victim_bot);
                    }
                }
            }
        }

        for bot_id in killed_bots {
            self.remove_bot(bot_id, DeathReason::Consumed);
        }
    }

    /// Evicts the oldest entries above the ceilings, tops up to the minimums
    /// and occasionally lets one more trickle in.
    pub(crate) fn enforce_population(&mut self) {
        while self.world.toxins.len() > self.config.max_toxins {
            if let Some((id, _)) = self.world.toxins.pop_first() {
                self.changes.deleted_toxins.insert(id);
            }
        }
        while self.world.foods.len() > self.config.max_food {
            if let Some((id, _)) = self.world.foods.pop_first() {
                self.changes.deleted_foods.insert(id);
            }
        }

        while self.world.foods.len() < self.config.min_food {
            self.spawn_food();
        }
        while self.world.toxins.len() < self.config.min_toxins {
            self.spawn_toxin();
        }

        if self.rng.gen_range(0..100) < TRICKLE_PERCENT
            && self.world.toxins.len() < self.config.max_toxins
        {
            self.spawn_toxin();
        }
        if self.rng.gen_range(0..100) < TRICKLE_PERCENT
            && self.world.foods.len() < self.config.max_food
        {
            self.spawn_food();
        }
    }

    /// Drops any entity whose numbers went non-finite this tick.
    pub(crate) fn remove_invalid_entities(&mut self) {
        let mut emptied = Vec::new();
        for bot in self.world.bots.values_mut() {
            let tick = self.tick;
            let bot_id = bot.id;
            bot.blobs.retain(|blob_id, blob| {
                let ok = blob.is_finite();
                if !ok {
                    error!(
                        "Removing blob {} of bot {} with non-finite state on tick {}: {:?}",
                        blob_id, bot_id, tick, blob
                    );
                }
                ok
            });
            if bot.is_dead() {
                emptied.push(bot_id);
            }
        }
        for bot_id in emptied {
            self.remove_bot(bot_id, DeathReason::Invalid);
        }

        let bad_foods: Vec<FoodId> = self
            .world
            .foods
            .iter()
            .filter(|(_, f)| !f.is_finite())
            .map(|(id, _)| *id)
            .collect();
        for id in bad_foods {
            error!("Removing food {} with non-finite state on tick {}", id, self.tick);
            self.world.foods.remove(&id);
            self.changes.deleted_foods.insert(id);
        }

        let bad_toxins: Vec<ToxinId> = self
            .world
            .toxins
            .iter()
            .filter(|(_, t)| !t.is_finite())
            .map(|(id, _)| *id)
            .collect();
        for id in bad_toxins {
            error!("Removing toxin {} with non-finite state on tick {}", id, self.tick);
            self.world.toxins.remove(&id);
            self.changes.deleted_toxins.insert(id);
        }
    }

    /// Resets per-tick flags once every session has seen this tick.
    pub fn clear_transient(&mut self) {
        for food in self.world.foods.values_mut() {
            food.is_new = false;
        }
        for toxin in self.world.toxins.values_mut() {
            toxin.is_new = false;
        }
        for bot in self.world.bots.values_mut() {
            bot.info_dirty = false;
        }
        self.changes = TickChanges::default();
    }
}

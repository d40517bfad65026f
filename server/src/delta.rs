//! Per-session views of the world, computed after a tick's mutation phases.

use crate::game::Game;
use log::warn;
use shared::{
    mass_to_radius, BotGameState, BotId, BotState, ObserverDelta, Rect, Vec2, FOOD_MASS_MAX,
};

/// How often observers get the statistics tables, in ticks.
pub const STATISTICS_EVERY: u64 = 30;

fn grown(rect: &Rect, by: f32) -> Rect {
    Rect::new(
        Vec2::new(rect.min.x - by, rect.min.y - by),
        Vec2::new(rect.max.x + by, rect.max.y + by),
    )
}

/// Everything the bot may see inside its view window.
///
/// Expects the indexes to reflect the current tick; see
/// [`Game::rebuild_view_indexes`].
pub fn bot_view(game: &mut Game, bot_id: BotId) -> Option<BotGameState> {
    let bot = game.world.bots.get(&bot_id)?;
    let window = bot.view_window;

    let mut state = BotGameState {
        tick: game.tick,
        view_window: window,
        my_blobs: bot.blob_views(),
        ..Default::default()
    };

    game.query.clear();
    game.blob_index
        .query(&grown(&window, game.max_blob_radius), &mut game.query);
    if game.query.is_truncated() {
        warn!("Blob view for bot {} truncated on tick {}", bot_id, game.tick);
    }
    for value in game.query.iter() {
        let Some(&owner) = game.blob_owners.get(&value.id) else {
            continue;
        };
        if owner == bot_id {
            continue;
        }
        let Some(blob) = game.world.bots.get(&owner).and_then(|b| b.blobs.get(&value.id)) else {
            continue;
        };
        if grown(&window, blob.radius()).contains(blob.position) {
            state.other_blobs.push(shared::BlobView {
                id: value.id,
                bot_id: owner,
                position: blob.position,
                mass: blob.mass,
            });
        }
    }
    state.other_blobs.sort_by_key(|b| (b.bot_id, b.id));

    game.query.clear();
    game.food_index
        .query(&grown(&window, mass_to_radius(FOOD_MASS_MAX)), &mut game.query);
    if game.query.is_truncated() {
        warn!("Food view for bot {} truncated on tick {}", bot_id, game.tick);
    }
    for value in game.query.iter() {
        let Some(food) = game.world.foods.get(&value.id) else {
            continue;
        };
        if grown(&window, mass_to_radius(food.mass)).contains(food.position) {
            state.food.push(food.view(value.id));
        }
    }
    state.food.sort_by_key(|f| f.id);

    game.query.clear();
    game.toxin_index
        .query(&grown(&window, game.max_toxin_radius), &mut game.query);
    for value in game.query.iter() {
        let Some(toxin) = game.world.toxins.get(&value.id) else {
            continue;
        };
        if grown(&window, toxin.radius()).contains(toxin.position) {
            state.toxin.push(toxin.view(value.id));
        }
    }
    state.toxin.sort_by_key(|t| t.id);

    Some(state)
}

/// Changes since the previous tick, or the whole world when `full` is set.
pub fn observer_delta(game: &Game, full: bool) -> ObserverDelta {
    let world = &game.world;
    let mut delta = ObserverDelta {
        tick: game.tick,
        ..Default::default()
    };

    for (id, bot) in &world.bots {
        if full || bot.info_dirty {
            delta.created_or_updated_bot_infos.insert(*id, bot.info.clone());
        }
        delta.created_or_updated_bots.insert(
            *id,
            BotState {
                blobs: bot.blob_views(),
                view_window: bot.view_window,
            },
        );
    }
    for (id, food) in &world.foods {
        if full || food.is_new || food.is_moving {
            delta.created_or_updated_foods.insert(*id, food.view(*id));
        }
    }
    for (id, toxin) in &world.toxins {
        if full || toxin.is_new || toxin.is_moving {
            delta.created_or_updated_toxins.insert(*id, toxin.view(*id));
        }
    }

    if !full {
        let changes = &game.changes;
        delta.deleted_bot_infos = changes.deleted_bots.iter().copied().collect();
        delta.deleted_bots = changes.deleted_bots.iter().copied().collect();
        delta.deleted_foods = changes.deleted_foods.iter().copied().collect();
        delta.deleted_toxins = changes.deleted_toxins.iter().copied().collect();
    }

    if full || game.tick % STATISTICS_EVERY == 0 {
        for (id, bot) in &world.bots {
            delta.statistics_local.insert(*id, bot.statistics);
            delta.statistics_global.insert(*id, bot.merged_statistics());
        }
    }

    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GameConfiguration, ServerConfig};
    use crate::external::{MemoryStatisticsSink, ProceduralDistributions};
    use crate::ids::IdAllocator;
    use crate::world::{Blob, Food, Toxin};
    use shared::{Color, Registration, Statistics};
    use std::sync::Arc;

    fn game() -> Game {
        let config = ServerConfig {
            seed: Some(5),
            game: GameConfiguration {
                min_food: 0,
                max_food: 0,
                min_toxins: 0,
                max_toxins: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        Game::new(
            &config,
            Arc::new(IdAllocator::new()),
            Arc::new(ProceduralDistributions),
            Arc::new(MemoryStatisticsSink::default()),
        )
        .unwrap()
    }

    fn add(game: &mut Game, bot_id: BotId, position: Vec2) {
        let registration = Registration {
            name: format!("bot{}", bot_id),
            color: Color::new(0, 0, 0),
            image: String::new(),
        };
        game.add_bot(bot_id, bot_id, &registration, Statistics::default(), false)
            .unwrap();
        let bot = game.world.bots.get_mut(&bot_id).unwrap();
        bot.blobs.clear();
        bot.blobs.insert(bot_id * 100, Blob::new(position, 100.0));
        bot.view_window = Rect::around(position, 50.0);
    }

    #[test]
    fn test_bot_view_filters_by_window() {
        let mut game = game();
        add(&mut game, 1, Vec2::new(100.0, 100.0));
        add(&mut game, 2, Vec2::new(130.0, 100.0));
        add(&mut game, 3, Vec2::new(900.0, 900.0));
        game.world.foods.insert(1, Food::ambient(Vec2::new(120.0, 120.0), 10.0));
        game.world.foods.insert(2, Food::ambient(Vec2::new(500.0, 500.0), 10.0));
        game.world.toxins.insert(1, Toxin::new(Vec2::new(80.0, 80.0)));
        game.world.toxins.insert(2, Toxin::new(Vec2::new(700.0, 80.0)));
        game.rebuild_view_indexes();

        let view = bot_view(&mut game, 1).unwrap();
        assert_eq!(view.my_blobs.len(), 1);
        assert_eq!(view.my_blobs[0].id, 100);
        assert_eq!(view.other_blobs.len(), 1);
        assert_eq!(view.other_blobs[0].bot_id, 2);
        assert_eq!(view.food.iter().map(|f| f.id).collect::<Vec<_>>(), vec![1]);
        assert_eq!(view.toxin.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_entity_overlapping_window_edge_is_visible() {
        let mut game = game();
        add(&mut game, 1, Vec2::new(100.0, 100.0));
        // Centre just outside the window, body reaching in.
        game.world.toxins.insert(1, Toxin::new(Vec2::new(152.0, 100.0)));
        game.rebuild_view_indexes();

        let view = bot_view(&mut game, 1).unwrap();
        assert_eq!(view.toxin.len(), 1);
    }

    #[test]
    fn test_unknown_bot_has_no_view() {
        let mut game = game();
        assert!(bot_view(&mut game, 42).is_none());
    }

    #[test]
    fn test_full_snapshot_contains_everything() {
        let mut game = game();
        add(&mut game, 1, Vec2::new(100.0, 100.0));
        game.world.foods.insert(1, Food::ambient(Vec2::new(10.0, 10.0), 10.0));
        game.world.toxins.insert(1, Toxin::new(Vec2::new(20.0, 20.0)));
        game.clear_transient();

        let incremental = observer_delta(&game, false);
        assert!(incremental.created_or_updated_foods.is_empty());
        assert!(incremental.created_or_updated_bot_infos.is_empty());
        assert_eq!(incremental.created_or_updated_bots.len(), 1);

        let full = observer_delta(&game, true);
        assert_eq!(full.created_or_updated_foods.len(), 1);
        assert_eq!(full.created_or_updated_toxins.len(), 1);
        assert_eq!(full.created_or_updated_bot_infos.len(), 1);
        assert_eq!(full.statistics_global.len(), 1);
    }

    #[test]
    fn test_delta_reports_new_and_deleted() {
        let mut game = game();
        add(&mut game, 1, Vec2::new(100.0, 100.0));
        game.world.foods.insert(7, Food::ambient(Vec2::new(10.0, 10.0), 10.0));
        game.changes.deleted_foods.insert(3);
        game.changes.deleted_toxins.insert(4);

        let delta = observer_delta(&game, false);
        assert!(delta.created_or_updated_foods.contains_key(&7));
        assert!(delta.created_or_updated_bot_infos.contains_key(&1));
        assert_eq!(delta.deleted_foods, vec![3]);
        assert_eq!(delta.deleted_toxins, vec![4]);

        game.remove_bot(1, crate::game::DeathReason::Killed);
        let delta = observer_delta(&game, false);
        assert_eq!(delta.deleted_bots, vec![1]);
        assert_eq!(delta.deleted_bot_infos, vec![1]);

        game.clear_transient();
        let delta = observer_delta(&game, false);
        assert!(delta.deleted_bots.is_empty());
        assert!(delta.created_or_updated_foods.is_empty());
    }
}

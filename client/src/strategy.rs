//! Decision making for the reference bot.
//!
//! Each state gets one command, in order of preference:
//! - flee from the nearest visible blob that could consume ours
//! - split toward prey small enough to be eaten by a half-sized blob
//! - steer toward the nearest food
//! - otherwise drift toward the field centre

use shared::{
    BlobView, BotAction, BotCommand, BotGameState, Vec2, BLOB_SPLIT_MASS, CONSUME_RATIO,
};

/// How close a threat has to be, in multiples of our own radius, before fleeing.
const FLEE_RADIUS_FACTOR: f32 = 6.0;
const SPLIT_RANGE: f32 = 120.0;

#[derive(Debug, Clone)]
pub struct Strategy {
    field_size: f32,
    /// Splitting is off for passive bots used in tests.
    pub aggressive: bool,
}

impl Strategy {
    pub fn new(field_size: f32) -> Self {
        Self {
            field_size,
            aggressive: true,
        }
    }

    pub fn decide(&self, state: &BotGameState) -> BotCommand {
        let Some(me) = largest(&state.my_blobs) else {
            return BotCommand::default();
        };

        if let Some(threat) = nearest(me.position, state.other_blobs.iter().filter(|o| {
            me.mass < o.mass * CONSUME_RATIO
                && me.position.distance(o.position)
                    < shared::mass_to_radius(o.mass) * FLEE_RADIUS_FACTOR
        })) {
            let away = (me.position - threat.position).normalize();
            return BotCommand {
                action: BotAction::None,
                target: me.position + away.scale(self.field_size / 4.0),
            };
        }

        if self.aggressive && me.mass >= 2.0 * BLOB_SPLIT_MASS {
            let half = me.mass / 2.0;
            if let Some(prey) = nearest(me.position, state.other_blobs.iter().filter(|o| {
                o.mass < half * CONSUME_RATIO && me.position.distance(o.position) < SPLIT_RANGE
            })) {
                return BotCommand {
                    action: BotAction::Split,
                    target: prey.position,
                };
            }
        }

        if let Some(food) = state
            .food
            .iter()
            .min_by(|a, b| {
                me.position
                    .distance_squared(a.position)
                    .total_cmp(&me.position.distance_squared(b.position))
            })
        {
            return BotCommand {
                action: BotAction::None,
                target: food.position,
            };
        }

        let centre = self.field_size / 2.0;
        BotCommand {
            action: BotAction::None,
            target: Vec2::new(centre, centre),
        }
    }
}

fn largest(blobs: &[BlobView]) -> Option<&BlobView> {
    blobs.iter().max_by(|a, b| a.mass.total_cmp(&b.mass))
}

fn nearest<'a>(from: Vec2, blobs: impl Iterator<Item = &'a BlobView>) -> Option<&'a BlobView> {
    blobs.min_by(|a, b| {
        from.distance_squared(a.position)
            .total_cmp(&from.distance_squared(b.position))
    })
}

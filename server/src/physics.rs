//! Motion and mass rules shared by the tick phases.

use shared::{
    Rect, Vec2, BLOB_MIN_SPEED_FACTOR, BOT_MAX_MASS, BOT_MIN_MASS, MASS_LOSS_FACTOR,
    MOTION_SCALE, MOVING_THRESHOLD, VELOCITY_DECREASE_FACTOR, WINDOW_MAX, WINDOW_MIN,
};

/// Speed multiplier for a blob of the given mass. Heavier is slower, never zero.
pub fn speed_factor(mass: f32) -> f32 {
    (1.0 - mass / BOT_MAX_MASS).max(BLOB_MIN_SPEED_FACTOR)
}

/// Velocity of a blob heading for `target`.
pub fn blob_velocity(position: Vec2, target: Vec2, mass: f32, velocity_factor: f32) -> Vec2 {
    let diff = target - position;
    let distance = diff.length();
    if (velocity_factor < 0.2 && distance <= 0.5) || distance <= 0.01 {
        return Vec2::ZERO;
    }
    let velocity = diff.normalize() * speed_factor(mass);
    velocity * (1.0 + velocity_factor)
}

/// Mass after `dt` seconds of decay. Blobs at or under the floor do not decay.
pub fn decayed_mass(mass: f32, dt: f32) -> f32 {
    if mass > BOT_MAX_MASS {
        BOT_MAX_MASS
    } else if mass > BOT_MIN_MASS {
        mass - (mass / BOT_MAX_MASS) * dt * MASS_LOSS_FACTOR
    } else {
        mass
    }
}

/// Position offset for one tick of blob motion.
pub fn blob_displacement(velocity: Vec2, impulse: Vec2, dt: f32) -> Vec2 {
    velocity * (dt * MOTION_SCALE) + impulse
}

pub fn clamp_to_field(position: Vec2, field_size: f32) -> Vec2 {
    position.clamp(0.0, field_size)
}

/// Square view window centred on the mean blob position, sized by total mass.
///
/// Returns `None` for an empty blob set; the caller treats that bot as dead.
pub fn view_window<I>(blobs: I) -> Option<Rect>
where
    I: IntoIterator<Item = (Vec2, f32)>,
{
    let mut center = Vec2::ZERO;
    let mut total_mass = 0.0;
    let mut count = 0usize;
    for (position, mass) in blobs {
        center += position;
        total_mass += mass;
        count += 1;
    }
    if count == 0 {
        return None;
    }

    let center = center * (1.0 / count as f32);
    let diameter = window_diameter(total_mass);
    Some(Rect::around(center, diameter / 2.0))
}

pub fn window_diameter(total_mass: f32) -> f32 {
    let diameter = 30.0 * total_mass.max(1.0).ln() - 20.0;
    diameter.clamp(WINDOW_MIN, WINDOW_MAX)
}

/// One tick of free motion for thrown food or split toxins.
///
/// Returns the new position, velocity and whether the entity is still moving.
pub fn integrate_free_motion(
    position: Vec2,
    velocity: Vec2,
    dt: f32,
    field_size: f32,
) -> (Vec2, Vec2, bool) {
    let position = clamp_to_field(position + velocity * dt, field_size);
    let velocity = velocity * VELOCITY_DECREASE_FACTOR;
    let moving = velocity.length() > MOVING_THRESHOLD;
    (position, if moving { velocity } else { Vec2::ZERO }, moving)
}

/// Minimum centre distance two blobs of the same bot keep from each other.
pub fn separation_distance(radius_a: f32, radius_b: f32, reunion_a: f32, reunion_b: f32) -> f32 {
    let min_dist = radius_a + radius_b;
    let reunion = reunion_a.max(reunion_b);
    if reunion <= 1.0 {
        min_dist * reunion.max(0.0)
    } else {
        min_dist
    }
}

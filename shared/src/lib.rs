use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};

pub mod frame;
pub mod protocol;

pub use frame::{
    compress, decode, decode_json, decompress, encode, encode_json, read_frame, write_frame,
    FrameError, MAX_FRAME_LEN,
};
pub use protocol::*;

pub type BotId = u64;
pub type BlobId = u64;
pub type FoodId = u64;
pub type ToxinId = u64;
pub type SessionId = u64;
pub type CommandId = u64;

pub const PROTOCOL_VERSION: u32 = 1;

pub const FIELD_SIZE: f32 = 1000.0;
pub const TICK_MILLIS: u64 = 30;
pub const MAX_DELTA_TIME: f32 = 0.03;

pub const FOOD_MASS_MIN: f32 = 8.0;
pub const FOOD_MASS_MAX: f32 = 12.0;
pub const THROWN_FOOD_MASS: f32 = 10.0;
pub const THROWN_FOOD_SPEED: f32 = 150.0;
pub const MASS_TO_BE_ALLOWED_TO_THROW: f32 = 120.0;

pub const BOT_START_MASS: f32 = 100.0;
pub const BOT_MIN_MASS: f32 = 10.0;
pub const BOT_MAX_MASS: f32 = 4000.0;
pub const MASS_LOSS_FACTOR: f32 = 10.0;
pub const MOTION_SCALE: f32 = 50.0;

pub const BLOB_REUNION_TIME: f32 = 10.0;
pub const BLOB_SPLIT_MASS: f32 = 100.0;
pub const BLOB_SPLIT_VELOCITY: f32 = 1.5;
pub const BLOB_MIN_SPEED_FACTOR: f32 = 0.225;
pub const DEFAULT_MAX_BLOBS: usize = 16;

pub const TOXIN_MASS_MIN: f32 = 100.0;
pub const TOXIN_MASS_MAX: f32 = 119.0;
pub const TOXIN_INHERITED_SPEED: f32 = 100.0;
pub const MIN_BLOB_MASS_TO_EXPLODE: f32 = 400.0;
pub const MAX_BLOB_COUNT_TO_EXPLODE: usize = 10;
pub const EXPLOSION_FRAGMENTS: usize = 12;

pub const WINDOW_MIN: f32 = 100.0;
pub const WINDOW_MAX: f32 = 400.0;

pub const VELOCITY_DECREASE_FACTOR: f32 = 0.95;
pub const MOVING_THRESHOLD: f32 = 0.001;
pub const CONSUME_RATIO: f32 = 0.9;

/// Radius of a circle with the given mass as area.
pub fn mass_to_radius(mass: f32) -> f32 {
    (mass / std::f32::consts::PI).sqrt()
}

/// Two dimensional vector used for every position, velocity and target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn length(&self) -> f32 {
        self.length_squared().sqrt()
    }

    pub fn length_squared(&self) -> f32 {
        self.x * self.x + self.y * self.y
    }

    /// Unit vector in the same direction, or zero for the zero vector.
    pub fn normalize(&self) -> Vec2 {
        let len = self.length();
        if len == 0.0 {
            Vec2::ZERO
        } else {
            Vec2::new(self.x / len, self.y / len)
        }
    }

    pub fn scale(&self, factor: f32) -> Vec2 {
        Vec2::new(self.x * factor, self.y * factor)
    }

    pub fn distance(&self, other: Vec2) -> f32 {
        (*self - other).length()
    }

    pub fn distance_squared(&self, other: Vec2) -> f32 {
        (*self - other).length_squared()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    pub fn clamp(&self, min: f32, max: f32) -> Vec2 {
        Vec2::new(self.x.clamp(min, max), self.y.clamp(min, max))
    }
}

impl Add for Vec2 {
    type Output = Vec2;

    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Vec2 {
    type Output = Vec2;

    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f32> for Vec2 {
    type Output = Vec2;

    fn mul(self, rhs: f32) -> Vec2 {
        self.scale(rhs)
    }
}

impl AddAssign for Vec2 {
    fn add_assign(&mut self, rhs: Vec2) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl SubAssign for Vec2 {
    fn sub_assign(&mut self, rhs: Vec2) {
        self.x -= rhs.x;
        self.y -= rhs.y;
    }
}

/// Axis aligned rectangle with inclusive bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub min: Vec2,
    pub max: Vec2,
}

impl Rect {
    pub fn new(min: Vec2, max: Vec2) -> Self {
        Self { min, max }
    }

    pub fn around(center: Vec2, half_extent: f32) -> Self {
        Self {
            min: Vec2::new(center.x - half_extent, center.y - half_extent),
            max: Vec2::new(center.x + half_extent, center.y + half_extent),
        }
    }

    pub fn contains(&self, p: Vec2) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.min.x <= other.max.x
            && other.min.x <= self.max.x
            && self.min.y <= other.max.y
            && other.min.y <= self.max.y
    }

    pub fn width(&self) -> f32 {
        self.max.x - self.min.x
    }

    pub fn center(&self) -> Vec2 {
        Vec2::new(
            (self.min.x + self.max.x) / 2.0,
            (self.min.y + self.max.y) / 2.0,
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

//! Seams to collaborators that live outside the simulation: who may play,
//! where things spawn and where statistics end up.

use log::{debug, info, warn};
use rand::Rng;
use shared::{BotId, Statistics, Vec2};
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Result of an eligibility check for a registering bot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Eligibility {
    pub allowed: bool,
    pub group: Option<String>,
    pub statistics: Statistics,
}

/// Decides whether a bot name may register.
///
/// Implementations may block; the session calls them on the blocking pool
/// under a timeout.
pub trait EligibilityCheck: Send + Sync {
    fn check(&self, name: &str) -> Eligibility;
}

pub struct AllowAll;

impl EligibilityCheck for AllowAll {
    fn check(&self, _name: &str) -> Eligibility {
        Eligibility {
            allowed: true,
            ..Default::default()
        }
    }
}

/// Admits only the listed names. The reserved placeholder name is always admitted.
pub struct AllowList {
    names: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl EligibilityCheck for AllowList {
    fn check(&self, name: &str) -> Eligibility {
        Eligibility {
            allowed: name == crate::PLACEHOLDER_NAME || self.names.contains(name),
            ..Default::default()
        }
    }
}

/// Weighted point set; a point listed twice is twice as likely.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnDistribution {
    points: Vec<Vec2>,
    jitter: f32,
}

impl SpawnDistribution {
    pub fn new(points: Vec<Vec2>, jitter: f32) -> Self {
        Self { points, jitter }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Picks a point uniformly from the set and jitters it inside its cell.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, field_size: f32) -> Vec2 {
        if self.points.is_empty() {
            return Vec2::new(
                rng.gen_range(0.0..field_size),
                rng.gen_range(0.0..field_size),
            );
        }
        let base = self.points[rng.gen_range(0..self.points.len())];
        let offset = if self.jitter > 0.0 {
            Vec2::new(
                rng.gen_range(-self.jitter..self.jitter),
                rng.gen_range(-self.jitter..self.jitter),
            )
        } else {
            Vec2::ZERO
        };
        (base + offset).clamp(0.0, field_size)
    }
}

pub trait SpawnDistributionProvider: Send + Sync {
    fn distribution(&self, name: &str, field_size: f32) -> Option<SpawnDistribution>;
}

const GRID_CELLS: usize = 25;

/// Built-in distributions generated on a coarse grid.
pub struct ProceduralDistributions;

impl ProceduralDistributions {
    pub const NAMES: [&'static str; 4] = ["uniform", "center", "ring", "corners"];

    fn weight(name: &str, cell: Vec2, field_size: f32) -> Option<usize> {
        let center = Vec2::new(field_size / 2.0, field_size / 2.0);
        let rel = cell.distance(center) / (field_size / 2.0);
        let weight = match name {
            "uniform" => 1,
            "center" => (4.0 * (1.0 - rel).max(0.0)).round() as usize,
            "ring" => {
                if (0.55..0.85).contains(&rel) {
                    3
                } else {
                    0
                }
            }
            "corners" => {
                let edge = field_size * 0.2;
                let near_x = cell.x < edge || cell.x > field_size - edge;
                let near_y = cell.y < edge || cell.y > field_size - edge;
                if near_x && near_y {
                    1
                } else {
                    0
                }
            }
            _ => return None,
        };
        Some(weight)
    }
}

impl SpawnDistributionProvider for ProceduralDistributions {
    fn distribution(&self, name: &str, field_size: f32) -> Option<SpawnDistribution> {
        let cell = field_size / GRID_CELLS as f32;
        let mut points = Vec::new();
        for gx in 0..GRID_CELLS {
            for gy in 0..GRID_CELLS {
                let p = Vec2::new((gx as f32 + 0.5) * cell, (gy as f32 + 0.5) * cell);
                let weight = Self::weight(name, p, field_size)?;
                points.extend(std::iter::repeat(p).take(weight));
            }
        }
        Some(SpawnDistribution::new(points, cell / 2.0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatisticsRecord {
    pub bot_id: BotId,
    pub name: String,
    pub statistics: Statistics,
}

/// Fire-and-forget destination for statistics. Must never block the caller.
pub trait StatisticsSink: Send + Sync {
    fn submit(&self, record: StatisticsRecord);
}

/// Forwards records to a background task that logs them.
pub struct LoggingStatisticsSink {
    tx: mpsc::UnboundedSender<StatisticsRecord>,
}

impl LoggingStatisticsSink {
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<StatisticsRecord>();
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                info!(
                    "Statistics for '{}' (bot {}): max size {:.1}, survived {:.1}s, {} blob kills, {} bot kills",
                    record.name,
                    record.bot_id,
                    record.statistics.max_size,
                    record.statistics.max_survival_time,
                    record.statistics.blob_kill_count,
                    record.statistics.bot_kill_count
                );
                debug!("{:?}", record.statistics);
            }
        });
        (Self { tx }, handle)
    }
}

impl StatisticsSink for LoggingStatisticsSink {
    fn submit(&self, record: StatisticsRecord) {
        if self.tx.send(record).is_err() {
            warn!("Statistics writer has stopped, dropping record");
        }
    }
}

/// Keeps every record in memory.
#[derive(Default)]
pub struct MemoryStatisticsSink {
    records: Mutex<Vec<StatisticsRecord>>,
}

impl MemoryStatisticsSink {
    pub fn records(&self) -> Vec<StatisticsRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl StatisticsSink for MemoryStatisticsSink {
    fn submit(&self, record: StatisticsRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_allow_all() {
        assert!(AllowAll.check("anyone").allowed);
    }

    #[test]
    fn test_allow_list() {
        let list = AllowList::new(["alice", "bob"]);
        assert!(list.check("alice").allowed);
        assert!(!list.check("mallory").allowed);
        assert!(list.check(crate::PLACEHOLDER_NAME).allowed);
    }

    #[test]
    fn test_all_procedural_distributions_exist() {
        for name in ProceduralDistributions::NAMES {
            let dist = ProceduralDistributions.distribution(name, 1000.0).unwrap();
            assert!(!dist.is_empty(), "{} is empty", name);
        }
        assert!(ProceduralDistributions
            .distribution("nonexistent", 1000.0)
            .is_none());
    }

    #[test]
    fn test_samples_stay_in_field() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        for name in ProceduralDistributions::NAMES {
            let dist = ProceduralDistributions.distribution(name, 1000.0).unwrap();
            for _ in 0..500 {
                let p = dist.sample(&mut rng, 1000.0);
                assert!(p.x >= 0.0 && p.x <= 1000.0 && p.y >= 0.0 && p.y <= 1000.0);
            }
        }
    }

    #[test]
    fn test_center_distribution_prefers_center() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(2);
        let dist = ProceduralDistributions.distribution("center", 1000.0).unwrap();
        let center = Vec2::new(500.0, 500.0);
        let near = (0..1000)
            .filter(|_| dist.sample(&mut rng, 1000.0).distance(center) < 250.0)
            .count();
        assert!(near > 350);
    }

    #[test]
    fn test_empty_distribution_falls_back_to_uniform() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let dist = SpawnDistribution::new(Vec::new(), 0.0);
        let p = dist.sample(&mut rng, 10.0);
        assert!(p.x >= 0.0 && p.x < 10.0);
    }

    #[test]
    fn test_memory_sink_records() {
        let sink = MemoryStatisticsSink::default();
        sink.submit(StatisticsRecord {
            bot_id: 3,
            name: "blobby".to_string(),
            statistics: Statistics::default(),
        });
        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.records()[0].bot_id, 3);
    }

    #[tokio::test]
    async fn test_logging_sink_does_not_block() {
        let (sink, handle) = LoggingStatisticsSink::spawn();
        for bot_id in 0..100 {
            sink.submit(StatisticsRecord {
                bot_id,
                name: "x".to_string(),
                statistics: Statistics::default(),
            });
        }
        drop(sink);
        handle.await.unwrap();
    }
}

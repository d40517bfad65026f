//! Wire messages exchanged between the arena server and its peers.
//!
//! Every connection starts with a bincode [`Hello`] frame naming its role.
//! After that:
//! - bots send bincode [`BotMessage`] frames and receive [`BotServerMessage`]
//! - observers only receive deflate compressed [`ObserverMessage`] frames
//! - operators send JSON [`OperatorCommand`] frames and receive JSON [`OperatorReply`]

use crate::{BlobId, BotId, Color, CommandId, FoodId, Rect, ToxinId, Vec2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Bot,
    Observer,
    Operator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub role: Role,
    pub version: u32,
}

/// Bot registration request, the first frame a bot sends after [`Hello`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub name: String,
    pub color: Color,
    pub image: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BotAction {
    #[default]
    None,
    Split,
    Throw,
}

/// Steering command. Only the latest command per bot is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BotCommand {
    pub action: BotAction,
    pub target: Vec2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BotMessage {
    Register(Registration),
    Command(BotCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlobView {
    pub id: BlobId,
    pub bot_id: BotId,
    pub position: Vec2,
    pub mass: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FoodView {
    pub id: FoodId,
    pub position: Vec2,
    pub mass: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToxinView {
    pub id: ToxinId,
    pub position: Vec2,
    pub mass: f32,
}

/// Per-tick world view sent to a single bot, filtered to its view window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BotGameState {
    pub tick: u64,
    pub view_window: Rect,
    pub my_blobs: Vec<BlobView>,
    pub other_blobs: Vec<BlobView>,
    pub food: Vec<FoodView>,
    pub toxin: Vec<ToxinView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BotServerMessage {
    Registered { bot_id: BotId },
    Rejected { reason: String },
    State(BotGameState),
    Stop,
}

/// Per bot game statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub max_size: f32,
    pub max_survival_time: f32,
    pub blob_kill_count: u32,
    pub bot_kill_count: u32,
    pub toxin_throw: u32,
    pub successful_toxin: u32,
    pub split_count: u32,
    pub successful_split: u32,
    pub successful_team: u32,
    pub bad_teaming: u32,
}

impl Statistics {
    /// Folds another set of statistics into this one: counters add up, records keep the maximum.
    pub fn merge(&mut self, other: &Statistics) {
        self.max_size = self.max_size.max(other.max_size);
        self.max_survival_time = self.max_survival_time.max(other.max_survival_time);
        self.blob_kill_count += other.blob_kill_count;
        self.bot_kill_count += other.bot_kill_count;
        self.toxin_throw += other.toxin_throw;
        self.successful_toxin += other.successful_toxin;
        self.split_count += other.split_count;
        self.successful_split += other.successful_split;
        self.successful_team += other.successful_team;
        self.bad_teaming += other.bad_teaming;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotInfo {
    pub name: String,
    pub color: Color,
    pub image: String,
    pub team_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotState {
    pub blobs: Vec<BlobView>,
    pub view_window: Rect,
}

/// Incremental full-world update for observers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObserverDelta {
    pub tick: u64,
    pub created_or_updated_bot_infos: BTreeMap<BotId, BotInfo>,
    pub deleted_bot_infos: Vec<BotId>,
    pub created_or_updated_bots: BTreeMap<BotId, BotState>,
    pub deleted_bots: Vec<BotId>,
    pub created_or_updated_foods: BTreeMap<FoodId, FoodView>,
    pub deleted_foods: Vec<FoodId>,
    pub created_or_updated_toxins: BTreeMap<ToxinId, ToxinView>,
    pub deleted_toxins: Vec<ToxinId>,
    pub statistics_local: BTreeMap<BotId, Statistics>,
    pub statistics_global: BTreeMap<BotId, Statistics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObserverMessage {
    Delta(ObserverDelta),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    MaxBots,
    MinFood,
    MaxFood,
    MinToxins,
    MaxToxins,
    MaxBlobsPerBot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnTarget {
    Food,
    Toxin,
    Bot,
}

/// Operator control commands, sent as JSON objects tagged by `type`.
///
/// `start`, `stop`, `reload_configuration` and `shutdown` take effect
/// immediately; everything else is applied at the start of the next tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorCommand {
    Start,
    Stop,
    ReloadConfiguration,
    Shutdown,
    SetLimit { limit: Limit, value: usize },
    SetSpawnDistribution { target: SpawnTarget, name: String },
    KillAllBots,
    KillBotsAboveMass { threshold: f32 },
    SwitchGameConfiguration { name: String },
    ResetWorld,
}

impl OperatorCommand {
    pub fn is_immediate(&self) -> bool {
        matches!(
            self,
            OperatorCommand::Start
                | OperatorCommand::Stop
                | OperatorCommand::ReloadConfiguration
                | OperatorCommand::Shutdown
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorReply {
    pub command_id: CommandId,
    pub ok: bool,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_statistics_merge() {
        let mut lifetime = Statistics {
            max_size: 500.0,
            max_survival_time: 20.0,
            blob_kill_count: 3,
            split_count: 1,
            ..Default::default()
        };
        let game = Statistics {
            max_size: 300.0,
            max_survival_time: 45.0,
            blob_kill_count: 2,
            bad_teaming: 1,
            ..Default::default()
        };

        lifetime.merge(&game);

        assert_approx_eq!(lifetime.max_size, 500.0);
        assert_approx_eq!(lifetime.max_survival_time, 45.0);
        assert_eq!(lifetime.blob_kill_count, 5);
        assert_eq!(lifetime.split_count, 1);
        assert_eq!(lifetime.bad_teaming, 1);
    }

    #[test]
    fn test_operator_command_json_tags() {
        let json = serde_json::to_string(&OperatorCommand::KillBotsAboveMass { threshold: 250.0 })
            .unwrap();
        assert_eq!(json, r#"{"type":"kill_bots_above_mass","threshold":250.0}"#);

        let parsed: OperatorCommand =
            serde_json::from_str(r#"{"type":"set_limit","limit":"max_food","value":800}"#).unwrap();
        assert_eq!(
            parsed,
            OperatorCommand::SetLimit {
                limit: Limit::MaxFood,
                value: 800
            }
        );

        let parsed: OperatorCommand = serde_json::from_str(r#"{"type":"start"}"#).unwrap();
        assert_eq!(parsed, OperatorCommand::Start);
    }

    #[test]
    fn test_operator_command_unknown_type_rejected() {
        let parsed = serde_json::from_str::<OperatorCommand>(r#"{"type":"explode_everything"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_immediate_commands() {
        assert!(OperatorCommand::Start.is_immediate());
        assert!(OperatorCommand::Shutdown.is_immediate());
        assert!(!OperatorCommand::ResetWorld.is_immediate());
        assert!(!OperatorCommand::SwitchGameConfiguration {
            name: "feast".to_string()
        }
        .is_immediate());
    }

    #[test]
    fn test_bot_message_serialization() {
        let msg = BotMessage::Command(BotCommand {
            action: BotAction::Split,
            target: Vec2::new(10.0, 20.0),
        });
        let bytes = bincode::serialize(&msg).unwrap();

        match bincode::deserialize::<BotMessage>(&bytes).unwrap() {
            BotMessage::Command(cmd) => {
                assert_eq!(cmd.action, BotAction::Split);
                assert_eq!(cmd.target, Vec2::new(10.0, 20.0));
            }
            _ => panic!("Wrong message type after deserialization"),
        }
    }
}

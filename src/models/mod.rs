use chrono::{DateTime, Duration, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Grace period after puck drop during which submissions are still accepted
pub const LOCK_WINDOW_MINUTES: i64 = 7;

/// Sanity bound on a combined shots-on-goal prediction
pub const MAX_TOTAL_SHOTS: u32 = 150;

/// Deadline after which predictions for a game are locked
pub fn lock_deadline(start_time_utc: DateTime<Utc>) -> DateTime<Utc> {
    start_time_utc + Duration::minutes(LOCK_WINDOW_MINUTES)
}

/// How a game ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndCondition {
    Regulation,
    Overtime,
    Shootout,
}

impl EndCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndCondition::Regulation => "regulation",
            EndCondition::Overtime => "overtime",
            EndCondition::Shootout => "shootout",
        }
    }
}

impl FromStr for EndCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regulation" => Ok(EndCondition::Regulation),
            "overtime" => Ok(EndCondition::Overtime),
            "shootout" => Ok(EndCondition::Shootout),
            other => Err(format!("unknown end condition {:?}", other)),
        }
    }
}

/// A predicted or actual final score, away goals first.
/// Serialized as the "away-home" string the frontend sends (e.g. "3-4").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreLine {
    pub away: u32,
    pub home: u32,
}

impl ScoreLine {
    pub fn new(away: u32, home: u32) -> Self {
        Self { away, home }
    }
}

impl fmt::Display for ScoreLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.away, self.home)
    }
}

impl FromStr for ScoreLine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (away, home) = s
            .split_once('-')
            .ok_or_else(|| format!("invalid score line {:?}, expected \"away-home\"", s))?;
        let away = away
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("invalid away goals in score line {:?}", s))?;
        let home = home
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("invalid home goals in score line {:?}", s))?;
        Ok(ScoreLine { away, home })
    }
}

impl Serialize for ScoreLine {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ScoreLine {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Older clients send totalShots as a string, newer ones as a number.
/// Coerce both at the boundary so nothing downstream has to care.
fn shots_from_string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s
            .trim()
            .parse::<u32>()
            .map_err(|_| de::Error::custom(format!("invalid totalShots {:?}", s))),
    }
}

/// The fields a user actually picks. Everything else on a stored
/// prediction (who, which game, when) is added by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionCandidate {
    pub winning_team: String,
    pub gwg_scorer: i64,
    pub score: ScoreLine,
    pub end_condition: EndCondition,
    #[serde(default)]
    pub is_empty_net: bool,
    #[serde(deserialize_with = "shots_from_string_or_number")]
    pub total_shots: u32,
}

impl PredictionCandidate {
    /// Field-level checks, run before any storage is touched.
    pub fn validate(&self) -> Result<(), String> {
        if self.winning_team.trim().is_empty() {
            return Err("winningTeam must not be empty".to_string());
        }
        if self.gwg_scorer <= 0 {
            return Err(format!("gwgScorer must be a player id, got {}", self.gwg_scorer));
        }
        if self.total_shots == 0 || self.total_shots > MAX_TOTAL_SHOTS {
            return Err(format!(
                "totalShots must be between 1 and {}, got {}",
                MAX_TOTAL_SHOTS, self.total_shots
            ));
        }
        Ok(())
    }
}

/// A stored prediction, one per (user, game)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub user_id: String,
    pub game_id: i64,
    #[serde(flatten)]
    pub candidate: PredictionCandidate,
    #[serde(rename = "startTimeUTC")]
    pub start_time_utc: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
}

/// A prediction joined with the predictor's display name (community picks view)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunityPick {
    #[serde(flatten)]
    pub prediction: Prediction,
    pub username: String,
}

/// Per-game sets of already-claimed unique picks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PickLedger {
    #[serde(default)]
    pub taken_gwg_scorers: BTreeSet<i64>,
    #[serde(default)]
    pub taken_shot_totals: BTreeSet<u32>,
}

/// Leaderboard row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserScore {
    pub user_id: String,
    pub username: String,
    pub total_score: i64,
}

/// Authoritative final facts for a finished game, derived from the
/// NHL gamecenter landing payload. Read-only input to scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameOutcome {
    pub home_team: String,
    pub away_team: String,
    pub home_score: u32,
    pub away_score: u32,
    pub total_shots: u32,
    pub end_condition: EndCondition,
    pub empty_net_final_goal: bool,
}

impl GameOutcome {
    /// Abbrev of the winning side. Finished NHL games cannot tie; the
    /// API client rejects outcomes with equal scores before we get here.
    pub fn winner(&self) -> &str {
        if self.home_score > self.away_score {
            &self.home_team
        } else {
            &self.away_team
        }
    }
}

/// Submission payload. Current clients nest the picks under a
/// `prediction` key; an older shape sent them flat at the top level.
/// Both are accepted and normalized here, so only the canonical
/// [`PredictionCandidate`] exists past this boundary.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionBody {
    pub user_id: String,
    pub game_id: i64,
    #[serde(rename = "startTimeUTC")]
    pub start_time_utc: DateTime<Utc>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    prediction: Option<PredictionCandidate>,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

impl SubmissionBody {
    /// Normalize into the canonical shape, trying the nested field first
    /// and falling back to the legacy flat layout.
    pub fn into_parts(
        self,
    ) -> Result<(String, Option<String>, i64, PredictionCandidate, DateTime<Utc>), String> {
        let candidate = match self.prediction {
            Some(candidate) => candidate,
            None => serde_json::from_value(serde_json::Value::Object(self.rest))
                .map_err(|e| format!("missing or malformed prediction fields: {}", e))?,
        };
        Ok((
            self.user_id,
            self.username,
            self.game_id,
            candidate,
            self.start_time_utc,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_line_round_trip() {
        let line: ScoreLine = "3-4".parse().unwrap();
        assert_eq!(line, ScoreLine::new(3, 4));
        assert_eq!(line.to_string(), "3-4");

        assert!("34".parse::<ScoreLine>().is_err());
        assert!("3-x".parse::<ScoreLine>().is_err());
    }

    #[test]
    fn test_candidate_validation() {
        let good = PredictionCandidate {
            winning_team: "CBJ".to_string(),
            gwg_scorer: 8478460,
            score: ScoreLine::new(2, 4),
            end_condition: EndCondition::Regulation,
            is_empty_net: false,
            total_shots: 58,
        };
        assert!(good.validate().is_ok());

        let mut bad = good.clone();
        bad.winning_team = "  ".to_string();
        assert!(bad.validate().is_err());

        let mut bad = good.clone();
        bad.gwg_scorer = 0;
        assert!(bad.validate().is_err());

        let mut bad = good;
        bad.total_shots = 500;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_submission_body_nested_and_flat() {
        let nested = serde_json::json!({
            "userId": "u1",
            "gameId": 2024020001i64,
            "startTimeUTC": "2026-10-10T23:00:00Z",
            "prediction": {
                "winningTeam": "CBJ",
                "gwgScorer": 8478460,
                "score": "3-4",
                "endCondition": "overtime",
                "isEmptyNet": true,
                "totalShots": "65"
            }
        });
        let body: SubmissionBody = serde_json::from_value(nested).unwrap();
        let (user_id, _, game_id, candidate, _) = body.into_parts().unwrap();
        assert_eq!(user_id, "u1");
        assert_eq!(game_id, 2024020001);
        assert_eq!(candidate.total_shots, 65);
        assert!(candidate.is_empty_net);

        let flat = serde_json::json!({
            "userId": "u2",
            "gameId": 2024020001i64,
            "startTimeUTC": "2026-10-10T23:00:00Z",
            "winningTeam": "SEA",
            "gwgScorer": 8480009,
            "score": "4-2",
            "endCondition": "regulation",
            "totalShots": 55
        });
        let body: SubmissionBody = serde_json::from_value(flat).unwrap();
        let (user_id, _, _, candidate, _) = body.into_parts().unwrap();
        assert_eq!(user_id, "u2");
        assert_eq!(candidate.score, ScoreLine::new(4, 2));
        assert!(!candidate.is_empty_net);

        let incomplete = serde_json::json!({
            "userId": "u3",
            "gameId": 2024020001i64,
            "startTimeUTC": "2026-10-10T23:00:00Z",
            "winningTeam": "SEA"
        });
        let body: SubmissionBody = serde_json::from_value(incomplete).unwrap();
        assert!(body.into_parts().is_err());
    }

    #[test]
    fn test_end_condition_wire_format() {
        assert_eq!(
            serde_json::to_string(&EndCondition::Shootout).unwrap(),
            "\"shootout\""
        );
        let parsed: EndCondition = serde_json::from_str("\"overtime\"").unwrap();
        assert_eq!(parsed, EndCondition::Overtime);
    }
}

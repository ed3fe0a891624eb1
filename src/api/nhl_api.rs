use crate::models::{EndCondition, GameOutcome};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const BASE_URL: &str = "https://api-web.nhle.com/v1";
const FETCH_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 500;

/// How many games the schedule endpoints surface to the frontend
const SCHEDULE_WINDOW: usize = 5;

/// A game from the club schedule. Only the fields this system reasons
/// about are typed; everything else rides along untouched so the
/// frontend still gets the full game object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledGame {
    pub id: i64,
    #[serde(rename = "startTimeUTC")]
    pub start_time_utc: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ClubScheduleResponse {
    #[serde(default)]
    games: Vec<ScheduledGame>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DailyScheduleResponse {
    #[serde(default)]
    game_week: Vec<GameDay>,
}

#[derive(Debug, Deserialize)]
struct GameDay {
    #[serde(default)]
    games: Vec<ScheduledGame>,
}

// Gamecenter landing payload, only what scoring needs. Every fact the
// scoring engine depends on is Option here so a thin or in-progress
// payload is detected and rejected instead of guessed at.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GamecenterLanding {
    home_team: Option<LandingTeam>,
    away_team: Option<LandingTeam>,
    period_descriptor: Option<PeriodDescriptor>,
    summary: Option<LandingSummary>,
}

#[derive(Debug, Deserialize)]
struct LandingTeam {
    abbrev: String,
    score: Option<u32>,
    sog: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeriodDescriptor {
    period_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LandingSummary {
    #[serde(default)]
    shootout: Vec<serde_json::Value>,
    scoring: Option<Vec<ScoringPeriod>>,
}

#[derive(Debug, Deserialize)]
struct ScoringPeriod {
    #[serde(default)]
    goals: Vec<ScoredGoal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScoredGoal {
    goal_modifier: Option<String>,
}

pub struct NhlApiClient {
    client: Client,
}

impl Default for NhlApiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl NhlApiClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// GET with bounded retries on transport errors. Persistent failure
    /// is a hard error; callers abort rather than guess.
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut last_err = None;
        for attempt in 1..=FETCH_ATTEMPTS {
            match self.try_get_json(url).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!(
                        "NHL API request to {} failed (attempt {}/{}): {}",
                        url,
                        attempt,
                        FETCH_ATTEMPTS,
                        e
                    );
                    last_err = Some(e);
                    if attempt < FETCH_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(
                            RETRY_BACKOFF_MS * attempt as u64,
                        ))
                        .await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("NHL API request to {} failed", url)))
    }

    async fn try_get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    /// Full season schedule for a club, in API order
    pub async fn fetch_schedule(&self, team: &str) -> Result<Vec<ScheduledGame>> {
        let url = format!("{}/club-schedule-season/{}/now", BASE_URL, team.to_uppercase());
        let schedule: ClubScheduleResponse = self
            .get_json(&url)
            .await
            .context("Failed to fetch club schedule")?;
        Ok(schedule.games)
    }

    /// The next few games users can predict. During the offseason there
    /// is nothing upcoming, so fall back to the most recent results.
    pub async fn upcoming_games(&self, team: &str, now: DateTime<Utc>) -> Result<Vec<ScheduledGame>> {
        let all_games = self.fetch_schedule(team).await?;
        let upcoming: Vec<ScheduledGame> = all_games
            .iter()
            .filter(|g| g.start_time_utc > now)
            .take(SCHEDULE_WINDOW)
            .cloned()
            .collect();
        if !upcoming.is_empty() {
            return Ok(upcoming);
        }
        let mut past: Vec<ScheduledGame> = all_games
            .into_iter()
            .filter(|g| g.start_time_utc < now)
            .collect();
        past.sort_by_key(|g| std::cmp::Reverse(g.start_time_utc));
        past.truncate(SCHEDULE_WINDOW);
        Ok(past)
    }

    /// Past games, most recent first
    pub async fn past_games(&self, team: &str, now: DateTime<Utc>) -> Result<Vec<ScheduledGame>> {
        let all_games = self.fetch_schedule(team).await?;
        let mut past: Vec<ScheduledGame> = all_games
            .into_iter()
            .filter(|g| g.start_time_utc < now)
            .collect();
        past.sort_by_key(|g| std::cmp::Reverse(g.start_time_utc));
        Ok(past)
    }

    /// League-wide games for one calendar day (YYYY-MM-DD), used by the
    /// daily scoring job
    pub async fn games_on_date(&self, date: &str) -> Result<Vec<ScheduledGame>> {
        let url = format!("{}/schedule/{}", BASE_URL, date);
        let schedule: DailyScheduleResponse = self
            .get_json(&url)
            .await
            .with_context(|| format!("Failed to fetch schedule for {}", date))?;
        Ok(schedule
            .game_week
            .into_iter()
            .next()
            .map(|day| day.games)
            .unwrap_or_default())
    }

    /// Current roster, passed through untouched
    pub async fn fetch_roster(&self, team: &str) -> Result<serde_json::Value> {
        let url = format!("{}/roster/{}/current", BASE_URL, team.to_uppercase());
        self.get_json(&url).await.context("Failed to fetch roster")
    }

    /// Authoritative final facts for a finished game
    pub async fn fetch_outcome(&self, game_id: i64) -> Result<GameOutcome> {
        let url = format!("{}/gamecenter/{}/landing", BASE_URL, game_id);
        let landing: GamecenterLanding = self
            .get_json(&url)
            .await
            .context("Failed to fetch gamecenter landing")?;
        outcome_from_landing(landing)
            .with_context(|| format!("Incomplete outcome data for game {}", game_id))
    }
}

/// Derive the scoring inputs from a landing payload, rejecting anything
/// incomplete. Scoring must never run on guessed facts.
fn outcome_from_landing(landing: GamecenterLanding) -> Result<GameOutcome> {
    let home = landing.home_team.context("missing homeTeam")?;
    let away = landing.away_team.context("missing awayTeam")?;
    let home_score = home.score.context("missing homeTeam.score")?;
    let away_score = away.score.context("missing awayTeam.score")?;
    if home_score == away_score {
        bail!("scores are tied, game is not final");
    }
    let home_sog = home.sog.context("missing homeTeam.sog")?;
    let away_sog = away.sog.context("missing awayTeam.sog")?;

    let summary = landing.summary.context("missing summary")?;
    let end_condition = if !summary.shootout.is_empty() {
        EndCondition::Shootout
    } else {
        let period_type = landing
            .period_descriptor
            .and_then(|p| p.period_type)
            .context("missing periodDescriptor.periodType")?;
        if period_type == "OT" {
            EndCondition::Overtime
        } else {
            EndCondition::Regulation
        }
    };

    let scoring = summary.scoring.context("missing summary.scoring")?;
    let empty_net_final_goal = scoring
        .iter()
        .flat_map(|period| &period.goals)
        .last()
        .and_then(|goal| goal.goal_modifier.as_deref())
        .map(|modifier| modifier == "empty-net")
        .unwrap_or(false);

    Ok(GameOutcome {
        home_team: home.abbrev,
        away_team: away.abbrev,
        home_score,
        away_score,
        total_shots: home_sog + away_sog,
        end_condition,
        empty_net_final_goal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn landing_json() -> serde_json::Value {
        serde_json::json!({
            "id": 2024020001i64,
            "homeTeam": { "abbrev": "CBJ", "score": 4, "sog": 31 },
            "awayTeam": { "abbrev": "PIT", "score": 3, "sog": 34 },
            "periodDescriptor": { "periodType": "REG", "number": 3 },
            "summary": {
                "shootout": [],
                "scoring": [
                    { "goals": [ { "goalModifier": "none" }, { "goalModifier": "ppg" } ] },
                    { "goals": [] },
                    { "goals": [ { "goalModifier": "empty-net" } ] }
                ]
            }
        })
    }

    #[test]
    fn test_outcome_from_landing() {
        let landing: GamecenterLanding = serde_json::from_value(landing_json()).unwrap();
        let outcome = outcome_from_landing(landing).unwrap();
        assert_eq!(outcome.winner(), "CBJ");
        assert_eq!(outcome.total_shots, 65);
        assert_eq!(outcome.end_condition, EndCondition::Regulation);
        assert!(outcome.empty_net_final_goal);
    }

    #[test]
    fn test_overtime_and_shootout_detection() {
        let mut json = landing_json();
        json["periodDescriptor"]["periodType"] = "OT".into();
        let landing: GamecenterLanding = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(
            outcome_from_landing(landing).unwrap().end_condition,
            EndCondition::Overtime
        );

        // A shootout entry wins over the period descriptor.
        json["summary"]["shootout"] = serde_json::json!([{ "sequence": 1 }]);
        let landing: GamecenterLanding = serde_json::from_value(json).unwrap();
        assert_eq!(
            outcome_from_landing(landing).unwrap().end_condition,
            EndCondition::Shootout
        );
    }

    #[test]
    fn test_missing_fields_fail_closed() {
        let mut json = landing_json();
        json["homeTeam"].as_object_mut().unwrap().remove("sog");
        let landing: GamecenterLanding = serde_json::from_value(json).unwrap();
        assert!(outcome_from_landing(landing).is_err());

        let mut json = landing_json();
        json.as_object_mut().unwrap().remove("summary");
        let landing: GamecenterLanding = serde_json::from_value(json).unwrap();
        assert!(outcome_from_landing(landing).is_err());
    }

    #[test]
    fn test_tied_score_is_not_final() {
        let mut json = landing_json();
        json["awayTeam"]["score"] = 4.into();
        let landing: GamecenterLanding = serde_json::from_value(json).unwrap();
        assert!(outcome_from_landing(landing).is_err());
    }

    #[tokio::test]
    #[ignore]
    async fn test_fetch_schedule() {
        let client = NhlApiClient::new();
        let games = client.fetch_schedule("CBJ").await.unwrap();
        assert!(!games.is_empty());
    }

    #[tokio::test]
    #[ignore]
    async fn test_fetch_roster() {
        let client = NhlApiClient::new();
        let roster = client.fetch_roster("cbj").await.unwrap();
        assert!(roster.get("forwards").is_some());
    }
}

use crate::models::{
    lock_deadline, CommunityPick, EndCondition, PickLedger, Prediction, PredictionCandidate,
    UserScore,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Why a submission was rejected. Reason codes are part of the API contract.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid submission: {0}")]
    Validation(String),
    #[error("the prediction deadline for this game has passed")]
    DeadlinePassed,
    #[error("this player has already been selected by another user")]
    PlayerTaken,
    #[error("this shot total has already been selected by another user")]
    ShotsTaken,
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
}

impl SubmitError {
    pub fn code(&self) -> &'static str {
        match self {
            SubmitError::Validation(_) => "VALIDATION_ERROR",
            SubmitError::DeadlinePassed => "DEADLINE_PASSED",
            SubmitError::PlayerTaken => "PLAYER_TAKEN",
            SubmitError::ShotsTaken => "SHOTS_TAKEN",
            SubmitError::Storage(_) => "STORAGE_ERROR",
        }
    }
}

/// Why score application did not run
#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("game {0} has already been scored")]
    AlreadyScored(i64),
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id     TEXT PRIMARY KEY,
    username    TEXT NOT NULL,
    total_score INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS predictions (
    user_id        TEXT NOT NULL,
    game_id        INTEGER NOT NULL,
    winning_team   TEXT NOT NULL,
    gwg_scorer     INTEGER NOT NULL,
    score_away     INTEGER NOT NULL,
    score_home     INTEGER NOT NULL,
    end_condition  TEXT NOT NULL,
    is_empty_net   INTEGER NOT NULL,
    total_shots    INTEGER NOT NULL,
    start_time_utc TEXT NOT NULL,
    submitted_at   TEXT NOT NULL,
    PRIMARY KEY (user_id, game_id)
);
CREATE INDEX IF NOT EXISTS idx_predictions_game ON predictions (game_id);
CREATE TABLE IF NOT EXISTS game_picks (
    game_id           INTEGER PRIMARY KEY,
    taken_gwg_scorers TEXT NOT NULL,
    taken_shot_totals TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS scored_games (
    game_id   INTEGER PRIMARY KEY,
    scored_at TEXT NOT NULL
);
";

/// SQLite-backed store for predictions, per-game pick ledgers, user
/// scores and the scored-game markers. All writers funnel through one
/// connection, so transactions on it serialize concurrent submissions.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize database schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection mutex poisoned")
    }

    /// Validate a submission and, if it passes, atomically update the
    /// game's pick ledger and upsert the user's prediction. Either both
    /// writes land or neither does.
    pub fn submit_prediction(
        &self,
        user_id: &str,
        username: Option<&str>,
        game_id: i64,
        candidate: &PredictionCandidate,
        start_time_utc: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), SubmitError> {
        candidate.validate().map_err(SubmitError::Validation)?;
        if now > lock_deadline(start_time_utc) {
            return Err(SubmitError::DeadlinePassed);
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let mut ledger = read_ledger(&tx, game_id)?;
        let previous: Option<(i64, u32)> = tx
            .query_row(
                "SELECT gwg_scorer, total_shots FROM predictions
                 WHERE user_id = ?1 AND game_id = ?2",
                params![user_id, game_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        // A user may keep or change their own claims without self-blocking.
        let prev_scorer = previous.map(|(s, _)| s);
        let prev_shots = previous.map(|(_, t)| t);
        if ledger.taken_gwg_scorers.contains(&candidate.gwg_scorer)
            && prev_scorer != Some(candidate.gwg_scorer)
        {
            return Err(SubmitError::PlayerTaken);
        }
        if ledger.taken_shot_totals.contains(&candidate.total_shots)
            && prev_shots != Some(candidate.total_shots)
        {
            return Err(SubmitError::ShotsTaken);
        }

        // Release the old claims when the picks change, then take the new ones.
        if let Some(prev) = prev_scorer {
            if prev != candidate.gwg_scorer {
                ledger.taken_gwg_scorers.remove(&prev);
            }
        }
        if let Some(prev) = prev_shots {
            if prev != candidate.total_shots {
                ledger.taken_shot_totals.remove(&prev);
            }
        }
        ledger.taken_gwg_scorers.insert(candidate.gwg_scorer);
        ledger.taken_shot_totals.insert(candidate.total_shots);

        write_ledger(&tx, game_id, &ledger)?;

        tx.execute(
            "INSERT INTO users (user_id, username, total_score)
             VALUES (?1, ?2, 0)
             ON CONFLICT (user_id) DO NOTHING",
            params![user_id, username.unwrap_or(user_id)],
        )?;
        if let Some(name) = username {
            tx.execute(
                "UPDATE users SET username = ?2 WHERE user_id = ?1",
                params![user_id, name],
            )?;
        }

        tx.execute(
            "INSERT INTO predictions
               (user_id, game_id, winning_team, gwg_scorer, score_away, score_home,
                end_condition, is_empty_net, total_shots, start_time_utc, submitted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT (user_id, game_id) DO UPDATE SET
               winning_team = excluded.winning_team,
               gwg_scorer = excluded.gwg_scorer,
               score_away = excluded.score_away,
               score_home = excluded.score_home,
               end_condition = excluded.end_condition,
               is_empty_net = excluded.is_empty_net,
               total_shots = excluded.total_shots,
               start_time_utc = excluded.start_time_utc,
               submitted_at = excluded.submitted_at",
            params![
                user_id,
                game_id,
                candidate.winning_team,
                candidate.gwg_scorer,
                candidate.score.away,
                candidate.score.home,
                candidate.end_condition.as_str(),
                candidate.is_empty_net,
                candidate.total_shots,
                start_time_utc.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Current pick ledger for a game (empty sets if nobody has predicted yet)
    pub fn ledger(&self, game_id: i64) -> Result<PickLedger> {
        let conn = self.conn();
        Ok(read_ledger(&conn, game_id)?)
    }

    /// All current predictions for a game
    pub fn predictions_for_game(&self, game_id: i64) -> Result<Vec<Prediction>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT user_id, game_id, winning_team, gwg_scorer, score_away, score_home,
                    end_condition, is_empty_net, total_shots, start_time_utc, submitted_at
             FROM predictions WHERE game_id = ?1 ORDER BY user_id",
        )?;
        let rows = stmt.query_map(params![game_id], row_to_prediction)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// A user's predictions, keyed by game id
    pub fn predictions_for_user(&self, user_id: &str) -> Result<BTreeMap<i64, Prediction>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT user_id, game_id, winning_team, gwg_scorer, score_away, score_home,
                    end_condition, is_empty_net, total_shots, start_time_utc, submitted_at
             FROM predictions WHERE user_id = ?1",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_prediction)?;
        let mut by_game = BTreeMap::new();
        for row in rows {
            let prediction = row?;
            by_game.insert(prediction.game_id, prediction);
        }
        Ok(by_game)
    }

    /// Predictions for a game joined with display names, for the
    /// community picks view
    pub fn community_picks(&self, game_id: i64) -> Result<Vec<CommunityPick>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT p.user_id, p.game_id, p.winning_team, p.gwg_scorer, p.score_away,
                    p.score_home, p.end_condition, p.is_empty_net, p.total_shots,
                    p.start_time_utc, p.submitted_at, u.username
             FROM predictions p
             LEFT JOIN users u ON u.user_id = p.user_id
             WHERE p.game_id = ?1 ORDER BY p.user_id",
        )?;
        let rows = stmt.query_map(params![game_id], |row| {
            let prediction = row_to_prediction(row)?;
            let username: Option<String> = row.get(11)?;
            Ok(CommunityPick {
                username: username.unwrap_or_else(|| "Unknown User".to_string()),
                prediction,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Top users by total score
    pub fn leaderboard(&self, limit: u32) -> Result<Vec<UserScore>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT user_id, username, total_score FROM users
             ORDER BY total_score DESC, user_id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(UserScore {
                user_id: row.get(0)?,
                username: row.get(1)?,
                total_score: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn user(&self, user_id: &str) -> Result<Option<UserScore>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT user_id, username, total_score FROM users WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(UserScore {
                        user_id: row.get(0)?,
                        username: row.get(1)?,
                        total_score: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn is_scored(&self, game_id: i64) -> Result<bool> {
        let conn = self.conn();
        let marker: Option<i64> = conn
            .query_row(
                "SELECT game_id FROM scored_games WHERE game_id = ?1",
                params![game_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(marker.is_some())
    }

    /// Apply scoring deltas for a game as atomic increments, gated by the
    /// scored-game marker. Re-invocation for the same game is a rejected
    /// no-op, so a double-fired scoring trigger cannot double-pay.
    pub fn apply_score_deltas(
        &self,
        game_id: i64,
        deltas: &BTreeMap<String, i64>,
        scored_at: DateTime<Utc>,
    ) -> Result<(), ScoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT INTO scored_games (game_id, scored_at) VALUES (?1, ?2)
             ON CONFLICT (game_id) DO NOTHING",
            params![game_id, scored_at.to_rfc3339()],
        )?;
        if inserted == 0 {
            return Err(ScoreError::AlreadyScored(game_id));
        }

        for (user_id, delta) in deltas {
            tx.execute(
                "INSERT INTO users (user_id, username, total_score)
                 VALUES (?1, ?1, ?2)
                 ON CONFLICT (user_id) DO UPDATE SET
                   total_score = total_score + excluded.total_score",
                params![user_id, delta],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Every game id that currently has predictions
    pub fn games_with_predictions(&self) -> Result<Vec<i64>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT DISTINCT game_id FROM predictions ORDER BY game_id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Consistency repair: rebuild a game's pick ledger from its
    /// predictions. The prediction table is the source of truth whenever
    /// the two disagree. Returns the rebuilt ledger and whether the stored
    /// one had drifted.
    pub fn rebuild_ledger(&self, game_id: i64) -> Result<(PickLedger, bool)> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let stored = read_ledger(&tx, game_id)?;
        let mut rebuilt = PickLedger::default();
        {
            let mut stmt = tx.prepare(
                "SELECT gwg_scorer, total_shots FROM predictions WHERE game_id = ?1",
            )?;
            let rows = stmt.query_map(params![game_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, u32>(1)?))
            })?;
            for row in rows {
                let (scorer, shots) = row?;
                rebuilt.taken_gwg_scorers.insert(scorer);
                rebuilt.taken_shot_totals.insert(shots);
            }
        }

        let drifted = stored.taken_gwg_scorers != rebuilt.taken_gwg_scorers
            || stored.taken_shot_totals != rebuilt.taken_shot_totals;
        if drifted {
            write_ledger(&tx, game_id, &rebuilt)?;
        }
        tx.commit()?;
        Ok((rebuilt, drifted))
    }
}

fn read_ledger(conn: &Connection, game_id: i64) -> rusqlite::Result<PickLedger> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT taken_gwg_scorers, taken_shot_totals FROM game_picks WHERE game_id = ?1",
            params![game_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        Some((scorers, shots)) => Ok(PickLedger {
            taken_gwg_scorers: serde_json::from_str(&scorers).map_err(json_error)?,
            taken_shot_totals: serde_json::from_str(&shots).map_err(json_error)?,
        }),
        None => Ok(PickLedger::default()),
    }
}

fn write_ledger(conn: &Connection, game_id: i64, ledger: &PickLedger) -> rusqlite::Result<()> {
    let scorers = serde_json::to_string(&ledger.taken_gwg_scorers).map_err(json_error)?;
    let shots = serde_json::to_string(&ledger.taken_shot_totals).map_err(json_error)?;
    conn.execute(
        "INSERT INTO game_picks (game_id, taken_gwg_scorers, taken_shot_totals)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (game_id) DO UPDATE SET
           taken_gwg_scorers = excluded.taken_gwg_scorers,
           taken_shot_totals = excluded.taken_shot_totals",
        params![game_id, scorers, shots],
    )?;
    Ok(())
}

fn json_error(err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

fn text_error(err: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, err.into())
}

fn parse_utc(text: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_prediction(row: &Row<'_>) -> rusqlite::Result<Prediction> {
    let end_condition: String = row.get(6)?;
    Ok(Prediction {
        user_id: row.get(0)?,
        game_id: row.get(1)?,
        candidate: PredictionCandidate {
            winning_team: row.get(2)?,
            gwg_scorer: row.get(3)?,
            score: crate::models::ScoreLine::new(row.get(4)?, row.get(5)?),
            end_condition: end_condition.parse::<EndCondition>().map_err(text_error)?,
            is_empty_net: row.get(7)?,
            total_shots: row.get(8)?,
        },
        start_time_utc: parse_utc(row.get(9)?)?,
        submitted_at: parse_utc(row.get(10)?)?,
    })
}

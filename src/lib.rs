pub mod api;
pub mod models;
pub mod scoring;
pub mod store;

pub use api::*;
pub use models::*;
pub use scoring::*;
pub use store::*;

use anyhow::{Context, Result};
use api::nhl_api::NhlApiClient;
use models::GameOutcome;
use serde::Serialize;
use std::collections::BTreeMap;
use store::{ScoreError, Store};

/// What a scoring run did for one game
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringReport {
    pub game_id: i64,
    pub outcome: GameOutcome,
    pub deltas: BTreeMap<String, i64>,
}

/// Result of asking for a game to be scored
#[derive(Debug)]
pub enum ScoringRun {
    /// Deltas were computed and applied exactly once
    Applied(ScoringReport),
    /// Nobody predicted this game; nothing to do
    NoPredictions,
    /// A previous (or concurrent) run already applied this game's points
    AlreadyScored,
}

/// Score one finished game end to end: fetch the authoritative outcome,
/// compute per-user deltas from the stored predictions, and apply them
/// under the scored-game guard. Upstream failures abort before any
/// points are touched, leaving the game eligible for a manual retry.
pub async fn score_finished_game(
    store: &Store,
    nhl: &NhlApiClient,
    game_id: i64,
) -> Result<ScoringRun> {
    if store.is_scored(game_id)? {
        return Ok(ScoringRun::AlreadyScored);
    }

    let outcome = nhl
        .fetch_outcome(game_id)
        .await
        .with_context(|| format!("Failed to fetch outcome for game {}", game_id))?;

    let predictions = store.predictions_for_game(game_id)?;
    if predictions.is_empty() {
        tracing::info!("No predictions to score for game {}", game_id);
        return Ok(ScoringRun::NoPredictions);
    }

    let deltas = scoring::score_game(&outcome, &predictions);
    match store.apply_score_deltas(game_id, &deltas, chrono::Utc::now()) {
        Ok(()) => {}
        // Lost a race with another trigger; their run paid the points.
        Err(ScoreError::AlreadyScored(_)) => return Ok(ScoringRun::AlreadyScored),
        Err(ScoreError::Storage(e)) => return Err(e.into()),
    }

    for (user_id, delta) in &deltas {
        tracing::info!("Awarding {} points to user {}", delta, user_id);
    }

    Ok(ScoringRun::Applied(ScoringReport {
        game_id,
        outcome,
        deltas,
    }))
}

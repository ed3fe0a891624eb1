use axum::{
    extract::{Path, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use puck_pickem::models::SubmissionBody;
use puck_pickem::nhl_api::NhlApiClient;
use puck_pickem::store::{Store, SubmitError};
use puck_pickem::{score_finished_game, ScoringRun};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

const LEADERBOARD_SIZE: u32 = 25;

#[derive(Clone)]
struct AppState {
    store: Arc<Store>,
    nhl: Arc<NhlApiClient>,
    team: String,
    scoring_secret: String,
}

fn error_response(status: StatusCode, code: &str, message: String) -> Response {
    (status, Json(json!({ "error": code, "message": message }))).into_response()
}

fn internal_error(context: &str, err: impl std::fmt::Display) -> Response {
    tracing::error!("{}: {}", context, err);
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        format!("{}.", context),
    )
}

fn upstream_error(context: &str, err: impl std::fmt::Display) -> Response {
    tracing::error!("{}: {}", context, err);
    error_response(
        StatusCode::BAD_GATEWAY,
        "UPSTREAM_ERROR",
        format!("{}.", context),
    )
}

async fn health() -> &'static str {
    "Server is up and running!"
}

async fn schedule(State(state): State<AppState>) -> Response {
    match state.nhl.upcoming_games(&state.team, chrono::Utc::now()).await {
        Ok(games) => Json(json!({ "games": games })).into_response(),
        Err(e) => upstream_error("Failed to fetch NHL schedule", e),
    }
}

async fn results(State(state): State<AppState>) -> Response {
    match state.nhl.past_games(&state.team, chrono::Utc::now()).await {
        Ok(games) => Json(json!({ "games": games })).into_response(),
        Err(e) => upstream_error("Failed to fetch game results", e),
    }
}

async fn roster(State(state): State<AppState>, Path(team): Path<String>) -> Response {
    match state.nhl.fetch_roster(&team).await {
        Ok(roster) => Json(roster).into_response(),
        Err(e) => upstream_error("Failed to fetch roster", e),
    }
}

async fn leaderboard(State(state): State<AppState>) -> Response {
    match state.store.leaderboard(LEADERBOARD_SIZE) {
        Ok(board) => Json(board).into_response(),
        Err(e) => internal_error("Failed to fetch leaderboard", e),
    }
}

async fn my_predictions(State(state): State<AppState>, Path(user_id): Path<String>) -> Response {
    match state.store.predictions_for_user(&user_id) {
        Ok(by_game) => Json(by_game).into_response(),
        Err(e) => internal_error("Failed to fetch user predictions", e),
    }
}

async fn community_picks(State(state): State<AppState>, Path(game_id): Path<i64>) -> Response {
    match state.store.community_picks(game_id) {
        Ok(picks) => Json(picks).into_response(),
        Err(e) => internal_error("Failed to fetch community predictions", e),
    }
}

async fn submit_prediction(
    State(state): State<AppState>,
    Json(body): Json<SubmissionBody>,
) -> Response {
    let (user_id, username, game_id, candidate, start_time_utc) = match body.into_parts() {
        Ok(parts) => parts,
        Err(reason) => {
            return error_response(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", reason);
        }
    };

    let result = state.store.submit_prediction(
        &user_id,
        username.as_deref(),
        game_id,
        &candidate,
        start_time_utc,
        chrono::Utc::now(),
    );

    match result {
        Ok(()) => (
            StatusCode::CREATED,
            Json(json!({ "message": "Prediction saved successfully!" })),
        )
            .into_response(),
        Err(err) => {
            let status = match &err {
                SubmitError::Validation(_) => StatusCode::BAD_REQUEST,
                SubmitError::DeadlinePassed => StatusCode::FORBIDDEN,
                SubmitError::PlayerTaken | SubmitError::ShotsTaken => StatusCode::CONFLICT,
                SubmitError::Storage(e) => {
                    return internal_error("Error in prediction transaction", e);
                }
            };
            error_response(status, err.code(), err.to_string())
        }
    }
}

#[derive(Deserialize)]
struct ScoreTrigger {
    secret: String,
}

async fn score_game(
    State(state): State<AppState>,
    Path(game_id): Path<i64>,
    Json(trigger): Json<ScoreTrigger>,
) -> Response {
    if trigger.secret != state.scoring_secret {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "Invalid scoring secret.".to_string(),
        );
    }

    tracing::info!("Starting scoring process for game {}", game_id);
    match score_finished_game(&state.store, &state.nhl, game_id).await {
        Ok(ScoringRun::Applied(report)) => Json(json!({
            "message": format!("Scoring complete for game {}.", game_id),
            "report": report,
        }))
        .into_response(),
        Ok(ScoringRun::NoPredictions) => Json(json!({
            "message": "Scoring finished: No predictions to score.",
        }))
        .into_response(),
        Ok(ScoringRun::AlreadyScored) => error_response(
            StatusCode::CONFLICT,
            "ALREADY_SCORED",
            format!("Game {} has already been scored.", game_id),
        ),
        Err(e) => upstream_error("An error occurred during scoring", e),
    }
}

fn cors_layer() -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);
    match std::env::var("ALLOWED_ORIGINS") {
        Ok(origins) => {
            let origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|origin| origin.trim().parse().ok())
                .collect();
            layer.allow_origin(AllowOrigin::list(origins))
        }
        Err(_) => layer.allow_origin(Any),
    }
}

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt::init();

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3001);
    let db_path = std::env::var("DATABASE_PATH").unwrap_or_else(|_| "predictions.db".to_string());
    let team = std::env::var("TEAM").unwrap_or_else(|_| "CBJ".to_string());
    let scoring_secret =
        std::env::var("SCORING_SECRET").unwrap_or_else(|_| "supersecret".to_string());

    let store = match Store::open(&db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("Error opening database {}: {}", db_path, e);
            std::process::exit(1);
        }
    };

    let state = AppState {
        store,
        nhl: Arc::new(NhlApiClient::new()),
        team,
        scoring_secret,
    };

    let app = Router::new()
        .route("/", get(health))
        .route("/api/schedule", get(schedule))
        .route("/api/results", get(results))
        .route("/api/roster/:team", get(roster))
        .route("/api/leaderboard", get(leaderboard))
        .route("/api/my-predictions/:user_id", get(my_predictions))
        .route("/api/predictions/:game_id", get(community_picks))
        .route("/api/predictions", post(submit_prediction))
        .route("/api/score-game/:game_id", post(score_game))
        .layer(cors_layer())
        .with_state(state);

    println!("Server is running on port {}", port);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .unwrap();

    axum::serve(listener, app).await.unwrap();
}

use anyhow::Result;
use clap::{Parser, Subcommand};
use puck_pickem::nhl_api::NhlApiClient;
use puck_pickem::store::Store;
use puck_pickem::{score_finished_game, ScoringRun};

#[derive(Parser)]
#[command(name = "puck_pickem", about = "Operator tools for the prediction game")]
struct Cli {
    /// Path to the SQLite database (falls back to DATABASE_PATH, then predictions.db)
    #[arg(long)]
    database: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Score one finished game by id
    ScoreGame { game_id: i64 },
    /// Score every finished game on a calendar day (the nightly job)
    ScoreDate { date: String },
    /// Print the leaderboard
    Leaderboard {
        #[arg(long, default_value_t = 25)]
        limit: u32,
    },
    /// Rebuild pick ledgers from the prediction table (predictions win)
    AuditLedger { game_id: Option<i64> },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let db_path = cli
        .database
        .or_else(|| std::env::var("DATABASE_PATH").ok())
        .unwrap_or_else(|| "predictions.db".to_string());
    let store = Store::open(&db_path)?;
    let nhl = NhlApiClient::new();

    match cli.command {
        Command::ScoreGame { game_id } => {
            report_run(game_id, score_finished_game(&store, &nhl, game_id).await?);
        }
        Command::ScoreDate { date } => {
            let games = nhl.games_on_date(&date).await?;
            println!("Found {} games for {}.\n", games.len(), date);
            for game in games {
                match score_finished_game(&store, &nhl, game.id).await {
                    Ok(run) => report_run(game.id, run),
                    // One bad game must not sink the rest of the night.
                    Err(e) => eprintln!("Failed to score game {}: {:#}", game.id, e),
                }
            }
        }
        Command::Leaderboard { limit } => {
            let board = store.leaderboard(limit)?;
            if board.is_empty() {
                println!("No scored users yet.");
            }
            for (i, user) in board.iter().enumerate() {
                println!("{}. {} - {} points", i + 1, user.username, user.total_score);
            }
        }
        Command::AuditLedger { game_id } => {
            let game_ids = match game_id {
                Some(id) => vec![id],
                None => store.games_with_predictions()?,
            };
            for id in game_ids {
                let (ledger, drifted) = store.rebuild_ledger(id)?;
                if drifted {
                    println!(
                        "Game {}: ledger rebuilt ({} scorers, {} shot totals)",
                        id,
                        ledger.taken_gwg_scorers.len(),
                        ledger.taken_shot_totals.len()
                    );
                } else {
                    println!("Game {}: ledger consistent", id);
                }
            }
        }
    }

    Ok(())
}

fn report_run(game_id: i64, run: ScoringRun) {
    match run {
        ScoringRun::Applied(report) => {
            println!(
                "Game {}: {} {} - {} {} ({} shots), scored {} predictions",
                game_id,
                report.outcome.away_team,
                report.outcome.away_score,
                report.outcome.home_score,
                report.outcome.home_team,
                report.outcome.total_shots,
                report.deltas.len()
            );
            for (user_id, delta) in &report.deltas {
                println!("  {:+} points -> {}", delta, user_id);
            }
        }
        ScoringRun::NoPredictions => {
            println!("Game {}: no predictions to score", game_id);
        }
        ScoringRun::AlreadyScored => {
            println!("Game {}: already scored, skipping", game_id);
        }
    }
}

use crate::models::{EndCondition, GameOutcome, Prediction};
use std::collections::BTreeMap;

// Point values, part of the game's contract with its players.
const EXACT_SCORE_POINTS: i64 = 5;
const CLOSEST_SCORE_SOLO_POINTS: i64 = 2;
const CLOSEST_SCORE_SHARED_POINTS: i64 = 1;
const SHOOTOUT_POINTS: i64 = 5;
const OVERTIME_POINTS: i64 = 3;
const REGULATION_POINTS: i64 = 1;
const EMPTY_NET_STAKE: i64 = 2;
const EXACT_SHOTS_POINTS: i64 = 4;
const CLOSEST_SHOTS_POINTS: i64 = 2;

/// Compute per-user point deltas for a finished game.
///
/// Pure function of the outcome and the prediction set; the result does
/// not depend on the order predictions are passed in. Every predictor
/// appears in the returned map, even at zero points.
pub fn score_game(outcome: &GameOutcome, predictions: &[Prediction]) -> BTreeMap<String, i64> {
    let mut deltas: BTreeMap<String, i64> = predictions
        .iter()
        .map(|p| (p.user_id.clone(), 0))
        .collect();

    let winner = outcome.winner();

    // Winner + score. Exact scores are paid outright; everyone else who
    // called the winner competes for the closest-score bonus.
    let mut closest_score_diff = u32::MAX;
    let mut closest_score_users: Vec<&str> = Vec::new();
    for p in predictions.iter().filter(|p| p.candidate.winning_team == winner) {
        let predicted = p.candidate.score;
        if predicted.away == outcome.away_score && predicted.home == outcome.home_score {
            *deltas.get_mut(&p.user_id).unwrap() += EXACT_SCORE_POINTS;
        } else {
            let diff = predicted.away.abs_diff(outcome.away_score)
                + predicted.home.abs_diff(outcome.home_score);
            if diff < closest_score_diff {
                closest_score_diff = diff;
                closest_score_users = vec![&p.user_id];
            } else if diff == closest_score_diff {
                closest_score_users.push(&p.user_id);
            }
        }
    }
    if closest_score_users.len() == 1 {
        *deltas.get_mut(closest_score_users[0]).unwrap() += CLOSEST_SCORE_SOLO_POINTS;
    } else {
        for user_id in &closest_score_users {
            *deltas.get_mut(*user_id).unwrap() += CLOSEST_SCORE_SHARED_POINTS;
        }
    }

    // End condition and the empty-net side bet apply to every prediction,
    // right or wrong on the winner.
    let mut exact_shots_users: Vec<&str> = Vec::new();
    let mut closest_shots_diff = u32::MAX;
    let mut closest_shots_users: Vec<&str> = Vec::new();
    for p in predictions {
        let delta = deltas.get_mut(&p.user_id).unwrap();

        if p.candidate.end_condition == outcome.end_condition {
            *delta += match outcome.end_condition {
                EndCondition::Shootout => SHOOTOUT_POINTS,
                EndCondition::Overtime => OVERTIME_POINTS,
                EndCondition::Regulation => REGULATION_POINTS,
            };
        }

        // Checking the empty-net box is a bet with symmetric risk.
        // Leaving it unchecked is never scored.
        if p.candidate.is_empty_net {
            if outcome.empty_net_final_goal {
                *delta += EMPTY_NET_STAKE;
            } else {
                *delta -= EMPTY_NET_STAKE;
            }
        }

        // Shot totals are unique per game, so at most one exact match can
        // exist. Ties are still collected rather than dropped in case the
        // ledger was ever rebuilt around a duplicate. Exact matchers take
        // the exact bonus and leave the closeness pool to everyone else.
        let shots = p.candidate.total_shots;
        if shots == outcome.total_shots {
            exact_shots_users.push(&p.user_id);
        } else {
            let diff = shots.abs_diff(outcome.total_shots);
            if diff < closest_shots_diff {
                closest_shots_diff = diff;
                closest_shots_users = vec![&p.user_id];
            } else if diff == closest_shots_diff {
                closest_shots_users.push(&p.user_id);
            }
        }
    }

    for user_id in &exact_shots_users {
        *deltas.get_mut(*user_id).unwrap() += EXACT_SHOTS_POINTS;
    }
    for user_id in &closest_shots_users {
        *deltas.get_mut(*user_id).unwrap() += CLOSEST_SHOTS_POINTS;
    }

    deltas
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PredictionCandidate, ScoreLine};
    use chrono::Utc;

    fn outcome() -> GameOutcome {
        GameOutcome {
            home_team: "CBJ".to_string(),
            away_team: "PIT".to_string(),
            home_score: 4,
            away_score: 3,
            total_shots: 65,
            end_condition: EndCondition::Overtime,
            empty_net_final_goal: false,
        }
    }

    fn prediction(
        user_id: &str,
        winning_team: &str,
        score: &str,
        total_shots: u32,
        end_condition: EndCondition,
        is_empty_net: bool,
    ) -> Prediction {
        Prediction {
            user_id: user_id.to_string(),
            game_id: 2024020001,
            candidate: PredictionCandidate {
                winning_team: winning_team.to_string(),
                gwg_scorer: 8478460,
                score: score.parse::<ScoreLine>().unwrap(),
                end_condition,
                is_empty_net,
                total_shots,
            },
            start_time_utc: Utc::now(),
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn test_exact_score_exact_shots_and_overtime() {
        // A hits everything: exact score, exact shots, right end condition.
        // B called the winner, is closest among the non-exact scores, and
        // is closest on shots among the non-exact shot picks.
        let predictions = vec![
            prediction("a", "CBJ", "3-4", 65, EndCondition::Overtime, false),
            prediction("b", "CBJ", "2-4", 60, EndCondition::Regulation, false),
        ];
        let deltas = score_game(&outcome(), &predictions);
        assert_eq!(deltas["a"], 5 + 4 + 3);
        assert_eq!(deltas["b"], 2 + 2);
    }

    #[test]
    fn test_closest_shots_bonus_when_nobody_is_exact() {
        let predictions = vec![
            prediction("a", "CBJ", "3-4", 70, EndCondition::Overtime, false),
            prediction("b", "CBJ", "2-4", 60, EndCondition::Regulation, false),
        ];
        let deltas = score_game(&outcome(), &predictions);
        // a: exact score 5 + overtime 3 + shots diff 5 tied with b 2
        assert_eq!(deltas["a"], 10);
        // b: sole closest non-exact score 2, shots diff 5 tied with a 2
        assert_eq!(deltas["b"], 4);
    }

    #[test]
    fn test_tied_closest_score_pays_one_each() {
        let predictions = vec![
            prediction("a", "CBJ", "2-4", 60, EndCondition::Regulation, false),
            prediction("b", "CBJ", "3-5", 50, EndCondition::Regulation, false),
        ];
        let deltas = score_game(&outcome(), &predictions);
        // Both diff=1 from 3-4, so +1 each instead of +2.
        assert_eq!(deltas["a"], 1 + 2); // plus sole closest shots
        assert_eq!(deltas["b"], 1);
    }

    #[test]
    fn test_wrong_winner_gets_nothing_from_score_rule() {
        let predictions = vec![
            prediction("a", "PIT", "4-3", 64, EndCondition::Overtime, false),
            prediction("b", "CBJ", "1-2", 40, EndCondition::Shootout, false),
        ];
        let deltas = score_game(&outcome(), &predictions);
        // a missed the winner: only overtime (3) and closest shots (2).
        assert_eq!(deltas["a"], 5);
        // b is the only correct-winner pick, so sole closest score.
        assert_eq!(deltas["b"], 2);
    }

    #[test]
    fn test_empty_net_bet_is_symmetric() {
        let mut actual = outcome();
        actual.end_condition = EndCondition::Regulation;
        actual.empty_net_final_goal = true;

        let predictions = vec![
            prediction("a", "PIT", "5-2", 60, EndCondition::Overtime, true),
            prediction("b", "PIT", "5-2", 74, EndCondition::Overtime, false),
        ];
        let deltas = score_game(&actual, &predictions);
        assert_eq!(deltas["a"], 2 + 2); // won the bet, closest shots
        assert_eq!(deltas["b"], 0); // declined the bet, never penalized

        actual.empty_net_final_goal = false;
        let deltas = score_game(&actual, &predictions);
        assert_eq!(deltas["a"], -2 + 2);
        assert_eq!(deltas["b"], 0);
    }

    #[test]
    fn test_negative_total_delta_is_allowed() {
        let mut actual = outcome();
        actual.end_condition = EndCondition::Regulation;

        let predictions = vec![
            prediction("a", "PIT", "5-2", 20, EndCondition::Shootout, true),
            prediction("b", "CBJ", "3-4", 65, EndCondition::Regulation, false),
            prediction("c", "CBJ", "2-4", 60, EndCondition::Overtime, false),
        ];
        let deltas = score_game(&actual, &predictions);
        // a: lost empty-net bet, wrong winner, c beats them on shots.
        assert_eq!(deltas["a"], -2);
        assert!(deltas["a"] < 0);
        // b: exact score, regulation, exact shots.
        assert_eq!(deltas["b"], 5 + 1 + 4);
        // c: sole closest non-exact score, closest non-exact shots.
        assert_eq!(deltas["c"], 2 + 2);
    }

    #[test]
    fn test_result_is_order_independent() {
        let mut predictions = vec![
            prediction("a", "CBJ", "3-4", 65, EndCondition::Overtime, false),
            prediction("b", "CBJ", "2-4", 60, EndCondition::Regulation, false),
            prediction("c", "PIT", "4-1", 55, EndCondition::Shootout, true),
        ];
        let forward = score_game(&outcome(), &predictions);
        predictions.reverse();
        let backward = score_game(&outcome(), &predictions);
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_no_predictions_yields_empty_map() {
        let deltas = score_game(&outcome(), &[]);
        assert!(deltas.is_empty());
    }
}

/// Scoring policies
///
/// A runner picks one policy; the policy turns validation outcomes (plus
/// whatever track extras it cares about) into a score out of `max_score`
/// and a pass/fail decision. Thresholds come from configuration.

use crate::config::InsightConfig;
use gradebox_common::types::{CommandRecord, ValidationOutcome, DEFAULT_MAX_SCORE};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default)]
pub struct ScoreInput<'a> {
    pub outcomes: &'a [ValidationOutcome],
    /// The submission ran to completion without raising or failing a phase
    pub run_clean: bool,
    pub output: &'a str,
    /// Names of variables created by a data submission
    pub variables: &'a [String],
    pub commands: &'a [CommandRecord],
}

#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub score: f64,
    pub max_score: f64,
    pub success: bool,
    pub insights: Option<Vec<String>>,
}

pub trait ScoringPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    fn score(&self, input: &ScoreInput<'_>) -> Score;
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn clamp(value: f64) -> f64 {
    round2(value.clamp(0.0, DEFAULT_MAX_SCORE))
}

/// Fraction of passed rules. No rules counts as full marks for a clean run.
fn pass_rate(outcomes: &[ValidationOutcome], run_clean: bool) -> f64 {
    if outcomes.is_empty() {
        return if run_clean { 1.0 } else { 0.0 };
    }
    let passed = outcomes.iter().filter(|o| o.passed).count();
    passed as f64 / outcomes.len() as f64
}

/// `passed / total * 100`
#[derive(Debug, Clone)]
pub struct RulePassRate {
    pub pass_threshold: f64,
}

impl ScoringPolicy for RulePassRate {
    fn name(&self) -> &'static str {
        "rule_pass_rate"
    }

    fn score(&self, input: &ScoreInput<'_>) -> Score {
        let score = clamp(pass_rate(input.outcomes, input.run_clean) * DEFAULT_MAX_SCORE);
        Score {
            score,
            max_score: DEFAULT_MAX_SCORE,
            success: score >= self.pass_threshold,
            insights: None,
        }
    }
}

/// Rule pass rate plus a heuristic bonus for analysis markers in the output
/// and for result-like variable names. Only a clean run earns the bonus.
#[derive(Debug, Clone)]
pub struct InsightBonus {
    pub pass_threshold: f64,
    pub config: InsightConfig,
}

impl InsightBonus {
    fn markers_found(&self, input: &ScoreInput<'_>) -> Vec<String> {
        let output = input.output.to_lowercase();
        let names: Vec<String> = input.variables.iter().map(|v| v.to_lowercase()).collect();

        let mut found = BTreeSet::new();
        for marker in &self.config.markers {
            let needle = marker.to_lowercase();
            if output.contains(&needle) || names.iter().any(|n| n.contains(&needle)) {
                found.insert(marker.clone());
            }
        }
        found.into_iter().collect()
    }

    fn result_names(&self, input: &ScoreInput<'_>) -> usize {
        let vocabulary: Vec<String> = self
            .config
            .result_names
            .iter()
            .map(|n| n.to_lowercase())
            .collect();

        input
            .variables
            .iter()
            .filter(|v| {
                let name = v.to_lowercase();
                vocabulary.iter().any(|word| name.contains(word.as_str()))
            })
            .count()
    }
}

impl ScoringPolicy for InsightBonus {
    fn name(&self) -> &'static str {
        "insight_bonus"
    }

    fn score(&self, input: &ScoreInput<'_>) -> Score {
        let base = pass_rate(input.outcomes, input.run_clean) * DEFAULT_MAX_SCORE;
        let insights = self.markers_found(input);

        let bonus = if input.run_clean {
            let marker_bonus =
                (insights.len() as f64 * self.config.marker_points).min(self.config.bonus_cap);
            let name_bonus = self.result_names(input) as f64 * self.config.result_name_points;
            marker_bonus + name_bonus
        } else {
            0.0
        };

        let score = clamp(base + bonus);
        Score {
            score,
            max_score: DEFAULT_MAX_SCORE,
            success: score >= self.pass_threshold,
            insights: Some(insights),
        }
    }
}

/// Half command success rate, half rule pass rate
#[derive(Debug, Clone)]
pub struct CommandBlend {
    pub pass_threshold: f64,
}

impl ScoringPolicy for CommandBlend {
    fn name(&self) -> &'static str {
        "command_blend"
    }

    fn score(&self, input: &ScoreInput<'_>) -> Score {
        let command_rate = if input.commands.is_empty() {
            0.0
        } else {
            let ok = input.commands.iter().filter(|c| c.succeeded()).count();
            ok as f64 / input.commands.len() as f64
        };
        let rule_rate = if input.outcomes.is_empty() {
            command_rate
        } else {
            pass_rate(input.outcomes, input.run_clean)
        };

        let score = clamp((command_rate * 0.5 + rule_rate * 0.5) * DEFAULT_MAX_SCORE);
        Score {
            score,
            max_score: DEFAULT_MAX_SCORE,
            success: score >= self.pass_threshold,
            insights: None,
        }
    }
}

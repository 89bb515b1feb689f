//! Window scoring models.
//!
//! A [`Scorer`] is a pure function of a window and its own model: the same
//! window scored by the same model version always yields the same score.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;

use crate::anomaly::template::TemplateId;
use crate::anomaly::window::Window;
use crate::idempotency::content_fingerprint;

pub trait Scorer: Send + Sync + Debug {
    /// Anomaly score in `[0, 1]`; higher is more anomalous
    fn score(&self, window: &Window) -> f64;

    fn model_version(&self) -> &str;

    /// Threshold derived from the training distribution, if the model has one
    fn calibrated_threshold(&self) -> Option<f64> {
        None
    }
}

const ERROR_KEYWORDS: &[&str] = &["error", "exception", "fail", "critical", "fatal", "timeout"];
const WARNING_KEYWORDS: &[&str] = &["warn", "warning", "retry", "slow"];

/// Rule-based fallback used when no trained model is available: +0.3 per
/// line with an error keyword, +0.1 per line with a warning keyword.
#[derive(Debug, Clone, Default)]
pub struct KeywordScorer;

impl KeywordScorer {
    pub const MODEL_VERSION: &'static str = "keyword-v1";
}

impl Scorer for KeywordScorer {
    fn score(&self, window: &Window) -> f64 {
        let score: f64 = window
            .events
            .iter()
            .map(|event| {
                let text = event.raw_text.to_lowercase();
                if ERROR_KEYWORDS.iter().any(|kw| text.contains(kw)) {
                    0.3
                } else if WARNING_KEYWORDS.iter().any(|kw| text.contains(kw)) {
                    0.1
                } else {
                    0.0
                }
            })
            .sum();
        score.min(1.0)
    }

    fn model_version(&self) -> &str {
        Self::MODEL_VERSION
    }
}

/// First-order template transition model trained offline on normal windows.
///
/// The score is `1 - exp(-mean NLL)` of the window's template transitions
/// under additive smoothing, so unseen transitions push it towards 1.
#[derive(Debug, Clone)]
pub struct TransitionScorer {
    transitions: HashMap<(TemplateId, TemplateId), u64>,
    outgoing: HashMap<TemplateId, u64>,
    vocabulary: usize,
    smoothing: f64,
    threshold: Option<f64>,
    version: String,
}

impl TransitionScorer {
    /// Train on windows assumed normal and calibrate the threshold at
    /// `percentile` of their scores.
    pub fn train(windows: &[Window], smoothing: f64, percentile: f64) -> Self {
        let mut transitions: HashMap<(TemplateId, TemplateId), u64> = HashMap::new();
        let mut outgoing: HashMap<TemplateId, u64> = HashMap::new();
        let mut vocabulary: BTreeSet<TemplateId> = BTreeSet::new();

        for window in windows {
            let ids = window.template_ids();
            vocabulary.extend(ids.iter().copied());
            for pair in ids.windows(2) {
                *transitions.entry((pair[0], pair[1])).or_insert(0) += 1;
                *outgoing.entry(pair[0]).or_insert(0) += 1;
            }
        }

        let mut ordered: Vec<((TemplateId, TemplateId), u64)> =
            transitions.iter().map(|(k, v)| (*k, *v)).collect();
        ordered.sort();
        let version = format!("transition-{}", content_fingerprint(&(smoothing, &ordered)));

        let mut scorer = Self {
            transitions,
            outgoing,
            // one extra slot for templates never seen in training
            vocabulary: vocabulary.len() + 1,
            smoothing,
            threshold: None,
            version,
        };

        let mut training_scores: Vec<f64> = windows.iter().map(|w| scorer.score(w)).collect();
        scorer.threshold = percentile_of(&mut training_scores, percentile);
        scorer
    }

    fn transition_probability(&self, from: TemplateId, to: TemplateId) -> f64 {
        let count = self.transitions.get(&(from, to)).copied().unwrap_or(0) as f64;
        let total = self.outgoing.get(&from).copied().unwrap_or(0) as f64;
        (count + self.smoothing) / (total + self.smoothing * self.vocabulary as f64)
    }

    pub fn vocabulary_size(&self) -> usize {
        self.vocabulary - 1
    }
}

impl Scorer for TransitionScorer {
    fn score(&self, window: &Window) -> f64 {
        let ids = window.template_ids();
        if ids.len() < 2 {
            return 0.0;
        }

        let total_nll: f64 = ids
            .windows(2)
            .map(|pair| -self.transition_probability(pair[0], pair[1]).ln())
            .sum();
        let mean_nll = total_nll / (ids.len() - 1) as f64;

        let score = 1.0 - (-mean_nll).exp();
        if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            1.0
        }
    }

    fn model_version(&self) -> &str {
        &self.version
    }

    fn calibrated_threshold(&self) -> Option<f64> {
        self.threshold
    }
}

/// Nearest-rank percentile; `None` for an empty sample
fn percentile_of(values: &mut [f64], percentile: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let rank = (percentile * values.len() as f64).ceil() as usize;
    let index = rank.clamp(1, values.len()) - 1;
    Some(values[index])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::event::{LogLevel, LogParser};
    use crate::anomaly::template::MaskingTemplateExtractor;
    use crate::anomaly::window::tumbling_windows;
    use chrono::Utc;
    use std::sync::Arc;

    fn parser() -> LogParser {
        LogParser::new(Arc::new(MaskingTemplateExtractor::new().unwrap())).unwrap()
    }

    fn window(parser: &LogParser, lines: &[&str]) -> Window {
        let events = lines
            .iter()
            .map(|line| parser.event(line, "scraper", Utc::now(), LogLevel::Info))
            .collect();
        Window::new("scraper-000001", "scraper", lines.len(), events)
    }

    const NORMAL_CYCLE: [&str; 4] = [
        "Fetching page 1",
        "Parsed 20 links",
        "Stored snapshot 7",
        "Fetch cycle complete",
    ];

    fn training(parser: &LogParser) -> Vec<Window> {
        let events: Vec<_> = (0..50)
            .flat_map(|_| NORMAL_CYCLE.iter())
            .map(|line| parser.event(line, "scraper", Utc::now(), LogLevel::Info))
            .collect();
        tumbling_windows(&events, 8)
    }

    #[test]
    fn test_keyword_scorer_rules() {
        let parser = parser();
        let scorer = KeywordScorer;

        let quiet = window(&parser, &["all good", "still good"]);
        assert_eq!(scorer.score(&quiet), 0.0);

        let mixed = window(&parser, &["Request failed", "retry scheduled", "ok"]);
        assert!((scorer.score(&mixed) - 0.4).abs() < 1e-9);

        let noisy = window(&parser, &["ERROR a", "ERROR b", "ERROR c", "ERROR d"]);
        assert_eq!(scorer.score(&noisy), 1.0);
    }

    #[test]
    fn test_transition_scorer_separates_unseen_sequences() {
        let parser = parser();
        let scorer = TransitionScorer::train(&training(&parser), 1.0, 0.99);
        let threshold = scorer.calibrated_threshold().unwrap();

        let normal = window(&parser, &NORMAL_CYCLE);
        let broken = window(
            &parser,
            &[
                "Fetching page 1",
                "Connection refused by 10.1.1.1",
                "Connection refused by 10.1.1.2",
                "Worker crashed",
            ],
        );

        assert!(scorer.score(&normal) <= threshold);
        assert!(scorer.score(&broken) > threshold);
        assert_eq!(scorer.vocabulary_size(), 4);
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let parser = parser();
        let first = TransitionScorer::train(&training(&parser), 1.0, 0.95);
        let second = TransitionScorer::train(&training(&parser), 1.0, 0.95);
        let sample = window(&parser, &["Fetching page 3", "Worker crashed", "Parsed 1 links"]);

        assert_eq!(first.model_version(), second.model_version());
        assert_eq!(first.score(&sample).to_bits(), second.score(&sample).to_bits());
        assert_eq!(first.score(&sample).to_bits(), first.score(&sample).to_bits());
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let mut values = vec![0.5, 0.1, 0.9, 0.3];
        assert_eq!(percentile_of(&mut values, 0.5), Some(0.3));
        assert_eq!(percentile_of(&mut values, 1.0), Some(0.9));
        assert_eq!(percentile_of(&mut [], 0.9), None);
    }
}

//! # Log Anomaly Detection
//!
//! Raw log lines are parsed into [`LogEvent`]s, masked into templates, grouped
//! into fixed-size windows per source component and scored by a pluggable
//! [`Scorer`]. Windows scoring above the threshold become anomalies that the
//! incident manager turns into incidents.

pub mod detector;
pub mod event;
pub mod scorer;
pub mod template;
pub mod window;

pub use detector::{AnomalyScore, LogAnomalyDetector, WindowEvaluation};
pub use event::{LogEvent, LogLevel, LogParser};
pub use scorer::{KeywordScorer, Scorer, TransitionScorer};
pub use template::{MaskingTemplateExtractor, TemplateExtractor, TemplateId};
pub use window::{tumbling_windows, Window};

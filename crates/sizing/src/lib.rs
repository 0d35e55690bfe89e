//! Size recommendation for apparel orders.
//!
//! Pure and deterministic: measurements in, a size label with a confidence
//! score out. No IO, no clocks, no randomness.

pub mod chart;
pub mod engine;

pub use chart::{AdultChart, AgeBracket, Chart, ChartError, KidsChart, Lookup, SizeBracket, SizeCharts};
pub use engine::{fit_label, Gender, ParseGenderError, RecommendationEngine, SizeRecommendation};

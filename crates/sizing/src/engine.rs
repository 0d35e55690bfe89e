//! Recommendation scoring.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chart::{distance, AdultChart, Chart, KidsChart, Lookup, SizeCharts};

/// Weight of a perfect height match (and of a perfect weight match).
const HALF: f64 = 0.5;
const HEIGHT_DIVISOR: f64 = 20.0;
const WEIGHT_DIVISOR: f64 = 10.0;
/// Minimum score for a bracket to be listed as an alternative.
const ALTERNATIVE_THRESHOLD: f64 = 0.3;
const MAX_ALTERNATIVES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Gender {
    Men,
    Women,
    Kids,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Men => "Men",
            Gender::Women => "Women",
            Gender::Kids => "Kids",
        }
    }
}

impl core::fmt::Display for Gender {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown gender: {0:?} (expected Men, Women or Kids)")]
pub struct ParseGenderError(pub String);

impl core::str::FromStr for Gender {
    type Err = ParseGenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "men" | "man" | "male" => Ok(Gender::Men),
            "women" | "woman" | "female" => Ok(Gender::Women),
            "kids" | "kid" | "child" => Ok(Gender::Kids),
            _ => Err(ParseGenderError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeRecommendation {
    pub recommended_size: String,
    /// 0..=1; how well the measurements fit the chosen bracket.
    pub confidence: f64,
    pub reasoning: String,
    /// Other plausible sizes, best first.
    pub alternatives: Vec<String>,
}

impl SizeRecommendation {
    fn new(size: impl Into<String>, confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            recommended_size: size.into(),
            confidence,
            reasoning: reasoning.into(),
            alternatives: Vec::new(),
        }
    }

    fn with_alternatives<I, S>(mut self, alternatives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let recommended = self.recommended_size.clone();
        self.alternatives = alternatives
            .into_iter()
            .map(Into::into)
            .filter(|s| *s != recommended)
            .collect();
        self
    }
}

/// Deterministic size recommender over a set of charts.
#[derive(Debug, Clone)]
pub struct RecommendationEngine {
    charts: SizeCharts,
    default_size: String,
    default_kids_size: String,
}

impl Default for RecommendationEngine {
    fn default() -> Self {
        Self::new(SizeCharts::builtin())
    }
}

impl RecommendationEngine {
    pub fn new(charts: SizeCharts) -> Self {
        Self {
            charts,
            default_size: "M".to_string(),
            default_kids_size: "26".to_string(),
        }
    }

    /// Size returned when no adult bracket scores above zero.
    pub fn with_default_size(mut self, size: impl Into<String>) -> Self {
        self.default_size = size.into();
        self
    }

    pub fn with_default_kids_size(mut self, size: impl Into<String>) -> Self {
        self.default_kids_size = size.into();
        self
    }

    pub fn charts(&self) -> &SizeCharts {
        &self.charts
    }

    pub fn recommend(
        &self,
        height_cm: u32,
        weight_kg: u32,
        gender: Gender,
        product_type: &str,
        age: Option<u32>,
    ) -> SizeRecommendation {
        match self.charts.lookup(product_type, gender) {
            Lookup::UnknownProduct => SizeRecommendation::new(
                &self.default_size,
                0.1,
                format!("Unknown product type: {product_type}"),
            )
            .with_alternatives(["S", "L"]),
            Lookup::UnknownGender => SizeRecommendation::new(
                &self.default_size,
                0.1,
                format!("Unknown gender: {gender}"),
            )
            .with_alternatives(["S", "L"]),
            Lookup::Found(Chart::Adult(chart)) => self.recommend_adult(chart, height_cm, weight_kg),
            Lookup::Found(Chart::Kids(chart)) => self.recommend_kids(chart, height_cm, age),
        }
    }

    fn recommend_adult(&self, chart: &AdultChart, height_cm: u32, weight_kg: u32) -> SizeRecommendation {
        let scored: Vec<(&str, f64)> = chart
            .brackets()
            .iter()
            .map(|b| {
                let score = proximity(distance(&b.height, height_cm), HEIGHT_DIVISOR)
                    + proximity(distance(&b.weight, weight_kg), WEIGHT_DIVISOR);
                (b.size.as_str(), score)
            })
            .collect();

        // First bracket with the strictly highest score wins.
        let mut best: Option<(&str, f64)> = None;
        for &(size, score) in &scored {
            if score > best.map_or(0.0, |(_, s)| s) {
                best = Some((size, score));
            }
        }

        let Some((size, confidence)) = best else {
            return SizeRecommendation::new(
                &self.default_size,
                0.2,
                format!(
                    "No exact match for height {height_cm}cm, weight {weight_kg}kg - using default"
                ),
            )
            .with_alternatives(["S", "L", "XL"]);
        };

        let mut candidates: Vec<(&str, f64)> = scored
            .into_iter()
            .filter(|&(s, score)| s != size && score > ALTERNATIVE_THRESHOLD)
            .collect();
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        let mut alternatives: Vec<String> = Vec::with_capacity(MAX_ALTERNATIVES);
        for (s, _) in candidates {
            if alternatives.len() == MAX_ALTERNATIVES {
                break;
            }
            if !alternatives.iter().any(|a| a == s) {
                alternatives.push(s.to_string());
            }
        }

        let reasoning = format!(
            "Based on height {height_cm}cm and weight {weight_kg}kg - {} fit",
            fit_label(confidence)
        );
        SizeRecommendation::new(size, confidence, reasoning).with_alternatives(alternatives)
    }

    fn recommend_kids(&self, chart: &KidsChart, height_cm: u32, age: Option<u32>) -> SizeRecommendation {
        if let Some(age) = age {
            let exact = chart
                .by_age()
                .iter()
                .find(|b| b.age.contains(&age) && b.height.contains(&height_cm));
            if let Some(bracket) = exact {
                return SizeRecommendation::new(
                    &bracket.size,
                    0.9,
                    format!("Perfect match for age {age} and height {height_cm}cm"),
                );
            }
        }

        let mut closest: Option<(&str, u32)> = None;
        for (size, range) in chart.by_height() {
            let d = distance(range, height_cm);
            if d == 0 {
                return SizeRecommendation::new(
                    size,
                    0.8,
                    format!("Good fit for height {height_cm}cm"),
                );
            }
            if closest.is_none_or(|(_, best)| d < best) {
                closest = Some((size.as_str(), d));
            }
        }

        match closest {
            Some((size, d)) => SizeRecommendation::new(
                size,
                (1.0 - f64::from(d) / HEIGHT_DIVISOR).max(0.3),
                format!("Approximate fit for height {height_cm}cm (closest available size)"),
            ),
            None => SizeRecommendation::new(
                &self.default_kids_size,
                0.1,
                "Default kids size - please verify",
            )
            .with_alternatives(["24", "28"]),
        }
    }
}

fn proximity(distance: u32, divisor: f64) -> f64 {
    if distance == 0 {
        HALF
    } else {
        (HALF - f64::from(distance) / divisor).max(0.0)
    }
}

/// Customer-facing wording for a confidence score.
pub fn fit_label(confidence: f64) -> &'static str {
    if confidence > 0.8 {
        "excellent"
    } else if confidence > 0.6 {
        "good"
    } else {
        "approximate"
    }
}

//! Size charts as data.
//!
//! A chart is selected by `(product_type, gender)`. Adult charts map a
//! height range × weight range to a label; kids charts map age × height, with
//! a height-only table as the fallback.
//!
//! All ranges are half-open (`170..175` covers 170 through 174), so adjacent
//! brackets never claim the same measurement.

use std::collections::BTreeMap;
use std::ops::Range;

use thiserror::Error;

use crate::engine::Gender;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChartError {
    #[error("empty {dimension} range {start}..{end} for size {size}")]
    EmptyRange {
        dimension: &'static str,
        start: u32,
        end: u32,
        size: String,
    },
}

fn check_range(dimension: &'static str, range: &Range<u32>, size: &str) -> Result<(), ChartError> {
    if range.is_empty() {
        return Err(ChartError::EmptyRange {
            dimension,
            start: range.start,
            end: range.end,
            size: size.to_string(),
        });
    }
    Ok(())
}

/// Distance from `value` to the nearest value inside `range` (0 when inside).
///
/// Bracket fields are public, so `range` may be empty; an empty range is
/// measured from its bounds and never underflows.
pub(crate) fn distance(range: &Range<u32>, value: u32) -> u32 {
    if range.contains(&value) {
        0
    } else if value < range.start {
        range.start - value
    } else {
        value.saturating_sub(range.end.saturating_sub(1))
    }
}

/// One row of an adult height × weight chart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeBracket {
    pub height: Range<u32>,
    pub weight: Range<u32>,
    pub size: String,
}

impl SizeBracket {
    pub fn new(
        height: Range<u32>,
        weight: Range<u32>,
        size: impl Into<String>,
    ) -> Result<Self, ChartError> {
        let size = size.into();
        check_range("height", &height, &size)?;
        check_range("weight", &weight, &size)?;
        Ok(Self { height, weight, size })
    }
}

/// Adult chart; row order is significant (earlier rows win ties).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdultChart {
    brackets: Vec<SizeBracket>,
}

impl AdultChart {
    pub fn new(brackets: Vec<SizeBracket>) -> Self {
        Self { brackets }
    }

    pub fn brackets(&self) -> &[SizeBracket] {
        &self.brackets
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgeBracket {
    pub age: Range<u32>,
    pub height: Range<u32>,
    pub size: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KidsChart {
    by_age: Vec<AgeBracket>,
    by_height: Vec<(String, Range<u32>)>,
}

impl KidsChart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_age_bracket(
        mut self,
        age: Range<u32>,
        height: Range<u32>,
        size: impl Into<String>,
    ) -> Result<Self, ChartError> {
        let size = size.into();
        check_range("age", &age, &size)?;
        check_range("height", &height, &size)?;
        self.by_age.push(AgeBracket { age, height, size });
        Ok(self)
    }

    pub fn with_height_bracket(
        mut self,
        height: Range<u32>,
        size: impl Into<String>,
    ) -> Result<Self, ChartError> {
        let size = size.into();
        check_range("height", &height, &size)?;
        self.by_height.push((size, height));
        Ok(self)
    }

    pub fn by_age(&self) -> &[AgeBracket] {
        &self.by_age
    }

    pub fn by_height(&self) -> &[(String, Range<u32>)] {
        &self.by_height
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chart {
    Adult(AdultChart),
    Kids(KidsChart),
}

/// Result of looking up a chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    Found(&'a Chart),
    UnknownProduct,
    UnknownGender,
}

/// All charts, keyed by product type then gender.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SizeCharts {
    products: BTreeMap<String, BTreeMap<Gender, Chart>>,
}

// (h_min, h_max, w_min, w_max, size)
type AdultRow = (u32, u32, u32, u32, &'static str);

const CL_MEN: &[AdultRow] = &[
    (165, 170, 60, 70, "S"),
    (165, 170, 70, 80, "M"),
    (165, 170, 80, 90, "L"),
    (170, 175, 60, 70, "S"),
    (170, 175, 70, 80, "M"),
    (170, 175, 80, 90, "L"),
    (170, 175, 90, 100, "XL"),
    (175, 180, 65, 75, "M"),
    (175, 180, 75, 85, "L"),
    (175, 180, 85, 95, "XL"),
    (175, 180, 95, 105, "2XL"),
    (180, 185, 70, 80, "L"),
    (180, 185, 80, 90, "XL"),
    (180, 185, 90, 100, "2XL"),
    (180, 185, 100, 110, "3XL"),
    (185, 195, 75, 85, "XL"),
    (185, 195, 85, 95, "2XL"),
    (185, 195, 95, 110, "3XL"),
    (185, 195, 110, 125, "4XL"),
];

const CL_WOMEN: &[AdultRow] = &[
    (155, 165, 45, 55, "S"),
    (155, 165, 55, 65, "M"),
    (155, 165, 65, 75, "L"),
    (165, 170, 50, 60, "S"),
    (165, 170, 60, 70, "M"),
    (165, 170, 70, 80, "L"),
    (165, 170, 80, 90, "XL"),
    (170, 175, 55, 65, "M"),
    (170, 175, 65, 75, "L"),
    (170, 175, 75, 85, "XL"),
    (170, 175, 85, 95, "2XL"),
    (175, 180, 60, 70, "L"),
    (175, 180, 70, 80, "XL"),
    (175, 180, 80, 90, "2XL"),
];

// (age_min, age_max, h_min, h_max, size)
const CL_KIDS_BY_AGE: &[(u32, u32, u32, u32, &str)] = &[
    (2, 3, 85, 95, "22"),
    (3, 4, 95, 105, "24"),
    (4, 5, 105, 115, "26"),
    (5, 6, 115, 125, "28"),
    (6, 7, 125, 135, "30"),
    (7, 8, 135, 145, "32"),
    (8, 9, 145, 155, "34"),
];

const CL_KIDS_BY_HEIGHT: &[(&str, u32, u32)] = &[
    ("22", 85, 95),
    ("24", 95, 105),
    ("26", 105, 115),
    ("28", 115, 125),
    ("30", 125, 135),
    ("32", 135, 145),
    ("34", 145, 155),
];

fn adult(rows: &[AdultRow]) -> Result<AdultChart, ChartError> {
    rows.iter()
        .map(|&(h0, h1, w0, w1, size)| SizeBracket::new(h0..h1, w0..w1, size))
        .collect::<Result<Vec<_>, _>>()
        .map(AdultChart::new)
}

fn kids() -> Result<KidsChart, ChartError> {
    let mut chart = KidsChart::new();
    for &(a0, a1, h0, h1, size) in CL_KIDS_BY_AGE {
        chart = chart.with_age_bracket(a0..a1, h0..h1, size)?;
    }
    for &(size, h0, h1) in CL_KIDS_BY_HEIGHT {
        chart = chart.with_height_bracket(h0..h1, size)?;
    }
    Ok(chart)
}

impl SizeCharts {
    pub fn new() -> Self {
        Self::default()
    }

    /// The charts shipped with the service (clothing, product type `CL`).
    pub fn builtin() -> Self {
        let mut charts = Self::new();
        // The literal tables above are non-empty by construction.
        if let (Ok(men), Ok(women), Ok(kids)) = (adult(CL_MEN), adult(CL_WOMEN), kids()) {
            charts.insert("CL", Gender::Men, Chart::Adult(men));
            charts.insert("CL", Gender::Women, Chart::Adult(women));
            charts.insert("CL", Gender::Kids, Chart::Kids(kids));
        }
        charts
    }

    pub fn insert(&mut self, product_type: impl Into<String>, gender: Gender, chart: Chart) {
        self.products
            .entry(product_type.into())
            .or_default()
            .insert(gender, chart);
    }

    pub fn lookup(&self, product_type: &str, gender: Gender) -> Lookup<'_> {
        match self.products.get(product_type) {
            None => Lookup::UnknownProduct,
            Some(by_gender) => match by_gender.get(&gender) {
                Some(chart) => Lookup::Found(chart),
                None => Lookup::UnknownGender,
            },
        }
    }

    pub fn product_types(&self) -> impl Iterator<Item = &str> {
        self.products.keys().map(String::as_str)
    }
}

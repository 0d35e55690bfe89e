//! Free-text reply parsing (Russian, Kazakh, English).
//!
//! Missing fields stay `None`. Downstream code treats `None` as "not yet
//! provided", never as zero or "no".

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static HEIGHT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)([0-9]{2,3})\s*(см|cm)").expect("regex for height"));
static WEIGHT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)([0-9]{2,3})\s*(кг|kg)").expect("regex for weight"));
// `\w` is Unicode-aware, so Kazakh letters (ә, қ, ң, ө, ұ, ү, һ, і) stay inside tokens.
static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").expect("regex for word tokens"));

const YES_WORDS: &[&str] = &["да", "иә", "иа", "yes", "y"];
const NO_WORDS: &[&str] = &["нет", "жоқ", "joq", "no", "n"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confirmation {
    Yes,
    No,
}

impl Confirmation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confirmation::Yes => "yes",
            Confirmation::No => "no",
        }
    }
}

/// Structured content of one customer message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height_cm: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_kg: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<Confirmation>,
}

impl ParsedReply {
    /// Height and weight, if both were given.
    pub fn measurements(&self) -> Option<(u32, u32)> {
        Some((self.height_cm?, self.weight_kg?))
    }

    pub fn is_empty(&self) -> bool {
        self.height_cm.is_none() && self.weight_kg.is_none() && self.confirmation.is_none()
    }
}

pub fn parse(text: &str) -> ParsedReply {
    ParsedReply {
        height_cm: first_number(&HEIGHT_RE, text),
        weight_kg: first_number(&WEIGHT_RE, text),
        confirmation: parse_confirmation(text),
    }
}

fn first_number(re: &Regex, text: &str) -> Option<u32> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// First yes/no token, scanning left to right.
pub fn parse_confirmation(text: &str) -> Option<Confirmation> {
    let lowered = text.trim().to_lowercase();
    TOKEN_RE.find_iter(&lowered).find_map(|token| {
        let token = token.as_str();
        if YES_WORDS.contains(&token) {
            Some(Confirmation::Yes)
        } else if NO_WORDS.contains(&token) {
            Some(Confirmation::No)
        } else {
            None
        }
    })
}

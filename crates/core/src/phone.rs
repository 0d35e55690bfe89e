//! Customer phone numbers in canonical E.164 form.
//!
//! Vendors disagree on formatting: the form-encoded webhook sends
//! `whatsapp:+77011234567`, the Cloud API sends `77011234567`, and the
//! marketplace export has `8 (701) 123-45-67`. Everything is normalised here
//! so that phone lookups compare like with like.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

const VENDOR_PREFIX: &str = "whatsapp:";

/// A normalised phone number (`+` followed by digits).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Normalise a raw phone string.
    ///
    /// Kazakhstan numbers (country code 7) in national or international
    /// spelling become `+7XXXXXXXXXX`; anything else with digits becomes
    /// `+<digits>`.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let stripped = raw.trim().trim_start_matches(VENDOR_PREFIX);
        let digits: String = stripped.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return Err(DomainError::invalid_phone(raw));
        }

        if let Some(kz) = normalize_kz(&digits) {
            return Ok(Self(kz));
        }
        Ok(Self(format!("+{digits}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Digits only, as the Cloud API expects in `to`.
    pub fn digits(&self) -> &str {
        self.0.trim_start_matches('+')
    }
}

impl core::fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl core::str::FromStr for PhoneNumber {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn normalize_kz(digits: &str) -> Option<String> {
    let mut d = digits.to_string();

    // International prefix 00.
    if d.starts_with("007") && d.len() >= 13 {
        d = d[2..].to_string();
    }
    // National trunk prefix 8.
    if d.len() == 11 && d.starts_with('8') {
        d = format!("7{}", &d[1..]);
    }
    // Operator code without country code (701..., 777...).
    if d.len() == 10 && d.starts_with('7') {
        d = format!("7{d}");
    }

    (d.len() == 11 && d.starts_with('7')).then(|| format!("+{d}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_kz_spellings() {
        for raw in [
            "+7 701 123-45-67",
            "8 (701) 123 45 67",
            "7011234567",
            "0077011234567",
            "77011234567",
            "whatsapp:+77011234567",
        ] {
            assert_eq!(PhoneNumber::parse(raw).unwrap().as_str(), "+77011234567", "{raw}");
        }
    }

    #[test]
    fn non_kz_numbers_keep_their_digits() {
        let phone = PhoneNumber::parse("+49 30 1234567").unwrap();
        assert_eq!(phone.as_str(), "+49301234567");
        assert_eq!(phone.digits(), "49301234567");
    }

    #[test]
    fn rejects_input_without_digits() {
        assert!(matches!(
            PhoneNumber::parse("whatsapp:"),
            Err(DomainError::InvalidPhone(_))
        ));
    }
}

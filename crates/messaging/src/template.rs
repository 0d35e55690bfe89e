//! Outbound customer messages.
//!
//! The template name doubles as the outbox idempotency key: an order never
//! receives the same template twice.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateName {
    SizeCheck,
    SizeConfirm,
    SizeCheckAgain,
}

impl TemplateName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateName::SizeCheck => "size_check",
            TemplateName::SizeConfirm => "size_confirm",
            TemplateName::SizeCheckAgain => "size_check_again",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "size_check" => Some(TemplateName::SizeCheck),
            "size_confirm" => Some(TemplateName::SizeConfirm),
            "size_check_again" => Some(TemplateName::SizeCheckAgain),
            _ => None,
        }
    }
}

impl core::fmt::Display for TemplateName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageTemplate {
    /// Ask for height and weight.
    SizeCheck,
    /// Propose a size and ask for a yes/no.
    SizeConfirm {
        size: String,
        alternatives: Vec<String>,
    },
    /// Ask for measurements again after a "no".
    SizeCheckAgain,
}

impl MessageTemplate {
    pub fn name(&self) -> TemplateName {
        match self {
            MessageTemplate::SizeCheck => TemplateName::SizeCheck,
            MessageTemplate::SizeConfirm { .. } => TemplateName::SizeConfirm,
            MessageTemplate::SizeCheckAgain => TemplateName::SizeCheckAgain,
        }
    }

    /// Message text as sent to the customer.
    pub fn render(&self) -> String {
        match self {
            MessageTemplate::SizeCheck => {
                "Здравствуйте! Чтобы подобрать размер, пожалуйста, напишите ваш рост (см) и вес (кг)."
                    .to_string()
            }
            MessageTemplate::SizeConfirm { size, alternatives } => {
                let mut text =
                    format!("Спасибо! Рекомендуем размер {size}. Подтвердите, пожалуйста: {size}? (Да/Нет)");
                if !alternatives.is_empty() {
                    text.push_str("\nДругие подходящие размеры: ");
                    text.push_str(&alternatives.join(", "));
                }
                text
            }
            MessageTemplate::SizeCheckAgain => {
                "Пожалуйста, укажите точные рост (см) и вес (кг), чтобы подобрать другой размер."
                    .to_string()
            }
        }
    }

    /// Template variables recorded alongside the send.
    pub fn variables(&self) -> JsonValue {
        match self {
            MessageTemplate::SizeConfirm { size, alternatives } => {
                json!({ "size": size, "alternatives": alternatives })
            }
            _ => json!({}),
        }
    }
}

//! Transition rules.
//!
//! | From              | Condition                     | Step                 | To                |
//! |-------------------|-------------------------------|----------------------|-------------------|
//! | NEW               | customer phone known          | send `size_check`    | WAITING_SIZE_INFO |
//! | WAITING_SIZE_INFO | reply with height and weight  | recommend, send `size_confirm` | WAITING_CONFIRM |
//! | WAITING_CONFIRM   | reply "yes"                   | record final size    | CONFIRMED         |
//! | WAITING_CONFIRM   | reply "no"                    | send `size_check_again` | WAITING_SIZE_INFO |
//!
//! Only the rule for the order's current state is consulted; a message that
//! carries both measurements and a "yes" advances whichever state the order
//! is in, never both.

use sizeflow_messaging::{Confirmation, ParsedReply, TemplateName};

use crate::state::WorkflowState;

/// What the tick knows about an order.
///
/// Replies are only those received since the order entered its current
/// state, so an answer to an earlier question cannot re-trigger a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Facts {
    pub has_phone: bool,
    /// Measurements from the newest reply that carries both.
    pub measurements: Option<(u32, u32)>,
    /// The newest yes/no.
    pub confirmation: Option<Confirmation>,
}

impl Facts {
    /// Build facts from replies ordered newest first.
    pub fn from_replies<'a, I>(has_phone: bool, newest_first: I) -> Self
    where
        I: IntoIterator<Item = &'a ParsedReply>,
    {
        let mut facts = Facts {
            has_phone,
            ..Facts::default()
        };
        for reply in newest_first {
            if facts.measurements.is_none() {
                facts.measurements = reply.measurements();
            }
            if facts.confirmation.is_none() {
                facts.confirmation = reply.confirmation;
            }
            if facts.measurements.is_some() && facts.confirmation.is_some() {
                break;
            }
        }
        facts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StayReason {
    NoPhone,
    AwaitingMeasurements,
    AwaitingConfirmation,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Stay(StayReason),
    /// Send a measurement request and wait for measurements.
    AskForMeasurements(TemplateName),
    /// Compute a recommendation, send it, wait for the answer.
    ProposeSize { height_cm: u32, weight_kg: u32 },
    /// Record the latest recommendation as final.
    ConfirmSize,
}

impl Step {
    /// The state the order moves to when this step commits.
    pub fn target(&self) -> Option<WorkflowState> {
        match self {
            Step::Stay(_) => None,
            Step::AskForMeasurements(_) => Some(WorkflowState::WaitingSizeInfo),
            Step::ProposeSize { .. } => Some(WorkflowState::WaitingConfirm),
            Step::ConfirmSize => Some(WorkflowState::Confirmed),
        }
    }

    /// The template this step sends, if any.
    pub fn template(&self) -> Option<TemplateName> {
        match self {
            Step::AskForMeasurements(name) => Some(*name),
            Step::ProposeSize { .. } => Some(TemplateName::SizeConfirm),
            Step::Stay(_) | Step::ConfirmSize => None,
        }
    }
}

pub fn decide(state: WorkflowState, facts: &Facts) -> Step {
    if state.is_terminal() {
        return Step::Stay(StayReason::Terminal);
    }
    if !facts.has_phone {
        return Step::Stay(StayReason::NoPhone);
    }

    match state {
        WorkflowState::New => Step::AskForMeasurements(TemplateName::SizeCheck),
        WorkflowState::WaitingSizeInfo => match facts.measurements {
            Some((height_cm, weight_kg)) => Step::ProposeSize { height_cm, weight_kg },
            None => Step::Stay(StayReason::AwaitingMeasurements),
        },
        WorkflowState::WaitingConfirm => match facts.confirmation {
            Some(Confirmation::Yes) => Step::ConfirmSize,
            Some(Confirmation::No) => Step::AskForMeasurements(TemplateName::SizeCheckAgain),
            None => Step::Stay(StayReason::AwaitingConfirmation),
        },
        WorkflowState::Confirmed | WorkflowState::Failed => Step::Stay(StayReason::Terminal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sizeflow_messaging::parse;

    fn facts(texts_newest_first: &[&str]) -> Facts {
        let replies: Vec<ParsedReply> = texts_newest_first.iter().map(|t| parse(t)).collect();
        Facts::from_replies(true, &replies)
    }

    #[test]
    fn new_without_phone_stays() {
        let step = decide(WorkflowState::New, &Facts::default());
        assert_eq!(step, Step::Stay(StayReason::NoPhone));
        assert_eq!(step.target(), None);
    }

    #[test]
    fn new_with_phone_asks_for_measurements() {
        let step = decide(WorkflowState::New, &facts(&[]));
        assert_eq!(step, Step::AskForMeasurements(TemplateName::SizeCheck));
        assert_eq!(step.target(), Some(WorkflowState::WaitingSizeInfo));
        assert_eq!(step.template(), Some(TemplateName::SizeCheck));
    }

    #[test]
    fn waiting_size_info_uses_newest_complete_measurements() {
        let f = facts(&["рост 180 см", "180 см 90 кг", "170 см 70 кг"]);
        assert_eq!(
            decide(WorkflowState::WaitingSizeInfo, &f),
            Step::ProposeSize { height_cm: 180, weight_kg: 90 }
        );
    }

    #[test]
    fn waiting_size_info_ignores_partial_replies() {
        let f = facts(&["рост 180 см", "а вес не скажу"]);
        assert_eq!(
            decide(WorkflowState::WaitingSizeInfo, &f),
            Step::Stay(StayReason::AwaitingMeasurements)
        );
    }

    #[test]
    fn waiting_confirm_yes_and_no() {
        assert_eq!(decide(WorkflowState::WaitingConfirm, &facts(&["Да"])), Step::ConfirmSize);
        let step = decide(WorkflowState::WaitingConfirm, &facts(&["Нет, не подходит"]));
        assert_eq!(step, Step::AskForMeasurements(TemplateName::SizeCheckAgain));
        assert_eq!(step.target(), Some(WorkflowState::WaitingSizeInfo));
    }

    #[test]
    fn newest_confirmation_wins() {
        let f = facts(&["нет", "да"]);
        assert_eq!(
            decide(WorkflowState::WaitingConfirm, &f),
            Step::AskForMeasurements(TemplateName::SizeCheckAgain)
        );
    }

    #[test]
    fn state_is_authoritative_over_message_content() {
        let f = facts(&["175 см 80 кг, да"]);
        assert!(matches!(decide(WorkflowState::WaitingSizeInfo, &f), Step::ProposeSize { .. }));
        assert_eq!(decide(WorkflowState::WaitingConfirm, &f), Step::ConfirmSize);
        assert_eq!(
            decide(WorkflowState::New, &f),
            Step::AskForMeasurements(TemplateName::SizeCheck)
        );
    }

    fn any_state() -> impl Strategy<Value = WorkflowState> {
        prop::sample::select(WorkflowState::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn terminal_states_never_move(
            state in any_state(),
            has_phone in any::<bool>(),
            h in proptest::option::of(100u32..220),
            yes in proptest::option::of(any::<bool>()),
        ) {
            let f = Facts {
                has_phone,
                measurements: h.map(|h| (h, 80)),
                confirmation: yes.map(|y| if y { Confirmation::Yes } else { Confirmation::No }),
            };
            let step = decide(state, &f);
            if state.is_terminal() || !has_phone {
                prop_assert_eq!(step.target(), None);
            }
            if let Some(target) = step.target() {
                prop_assert_ne!(target, state);
            }
        }
    }
}

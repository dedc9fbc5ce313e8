//! Popup trigger state machine.
//!
//! A visit starts in `Loading` and becomes `ContentReady` once both the
//! destination frame has loaded and the popup content is resolved, in either
//! order. The configured delay is counted from that point, one tick per
//! second. The machine is pure: timers live in [`crate::session`].

use serde::Serialize;

use crate::{content::ResolvedPopupContent, models::Trigger};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TriggerState {
    Loading,
    ContentReady,
    Counting { remaining: u32 },
    /// Waiting for a scroll or exit-intent signal from the page.
    Armed,
    ShowingPopup,
    Closed { reason: CloseReason },
    /// Never left `Loading` within the grace period.
    Abandoned,
}

impl TriggerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TriggerState::Closed { .. } | TriggerState::Abandoned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Dismissed,
    ClickedThrough,
    /// Armed or on screen with no word from the page for the idle period.
    Expired,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerEvent {
    FrameLoaded,
    DataReady(Box<ResolvedPopupContent>),
    Tick,
    Scrolled { percent: u8 },
    ExitIntent,
    Dismiss,
    ClickThrough,
    GraceElapsed,
    IdleElapsed,
}

#[derive(Debug, Clone)]
pub struct PopupTrigger {
    state: TriggerState,
    frame_loaded: bool,
    content: Option<Box<ResolvedPopupContent>>,
}

impl Default for PopupTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl PopupTrigger {
    pub fn new() -> Self {
        Self {
            state: TriggerState::Loading,
            frame_loaded: false,
            content: None,
        }
    }

    pub fn state(&self) -> &TriggerState {
        &self.state
    }

    pub fn content(&self) -> Option<&ResolvedPopupContent> {
        self.content.as_deref()
    }

    /// Apply `event` and return every state entered, in order. Events that do
    /// not apply to the current state are ignored and return an empty list.
    pub fn handle(&mut self, event: TriggerEvent) -> Vec<TriggerState> {
        let mut entered = Vec::new();

        match (self.state.clone(), event) {
            (TriggerState::Loading, TriggerEvent::FrameLoaded) => {
                self.frame_loaded = true;
                self.advance_if_ready(&mut entered);
            }
            (TriggerState::Loading, TriggerEvent::DataReady(content)) => {
                self.content = Some(content);
                self.advance_if_ready(&mut entered);
            }
            (TriggerState::Loading, TriggerEvent::GraceElapsed) => {
                self.enter(TriggerState::Abandoned, &mut entered);
            }
            (TriggerState::Counting { remaining }, TriggerEvent::Tick) => {
                let remaining = remaining.saturating_sub(1);
                if remaining == 0 {
                    self.enter(TriggerState::ShowingPopup, &mut entered);
                } else {
                    self.enter(TriggerState::Counting { remaining }, &mut entered);
                }
            }
            (TriggerState::Armed, TriggerEvent::Scrolled { percent }) => {
                let threshold = match self.content.as_deref().map(|c| c.trigger) {
                    Some(Trigger::Scroll { percent }) => percent,
                    _ => 0,
                };
                if percent >= threshold {
                    self.enter(TriggerState::ShowingPopup, &mut entered);
                }
            }
            (TriggerState::Armed, TriggerEvent::ExitIntent) => {
                if matches!(
                    self.content.as_deref().map(|c| c.trigger),
                    Some(Trigger::ExitIntent)
                ) {
                    self.enter(TriggerState::ShowingPopup, &mut entered);
                }
            }
            (TriggerState::ShowingPopup, TriggerEvent::Dismiss) => {
                self.enter(
                    TriggerState::Closed {
                        reason: CloseReason::Dismissed,
                    },
                    &mut entered,
                );
            }
            (TriggerState::ShowingPopup, TriggerEvent::ClickThrough) => {
                self.enter(
                    TriggerState::Closed {
                        reason: CloseReason::ClickedThrough,
                    },
                    &mut entered,
                );
            }
            (TriggerState::Armed | TriggerState::ShowingPopup, TriggerEvent::IdleElapsed) => {
                self.enter(
                    TriggerState::Closed {
                        reason: CloseReason::Expired,
                    },
                    &mut entered,
                );
            }
            _ => {}
        }

        entered
    }

    fn advance_if_ready(&mut self, entered: &mut Vec<TriggerState>) {
        if !self.frame_loaded {
            return;
        }
        let Some((trigger, delay)) = self.content.as_deref().map(|c| (c.trigger, c.delay_seconds))
        else {
            return;
        };

        self.enter(TriggerState::ContentReady, entered);

        let next = match trigger {
            Trigger::Delay if delay > 0 => TriggerState::Counting { remaining: delay },
            Trigger::Delay => TriggerState::ShowingPopup,
            Trigger::Scroll { .. } | Trigger::ExitIntent => TriggerState::Armed,
        };
        self.enter(next, entered);
    }

    fn enter(&mut self, state: TriggerState, entered: &mut Vec<TriggerState>) {
        tracing::debug!("Popup trigger: {:?} -> {:?}", self.state, state);
        self.state = state.clone();
        entered.push(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        content,
        models::{Popup, ShortLink},
    };

    fn content_with(trigger_type: &str, trigger_value: Option<&str>, delay: Option<u32>) -> Box<ResolvedPopupContent> {
        let link = ShortLink::new("user-1", "abc123", "https://example.com");
        let mut popup = Popup::new("user-1", "Promo");
        popup.trigger_type = trigger_type.into();
        popup.trigger_value = trigger_value.map(str::to_owned);
        popup.content = delay.map(|d| format!(r#"{{"delay_seconds":{d}}}"#));
        Box::new(content::resolve(&popup, &link))
    }

    fn ready(machine: &mut PopupTrigger, content: Box<ResolvedPopupContent>) -> Vec<TriggerState> {
        let mut entered = machine.handle(TriggerEvent::DataReady(content));
        entered.extend(machine.handle(TriggerEvent::FrameLoaded));
        entered
    }

    #[test]
    fn waits_for_both_preconditions() {
        let mut machine = PopupTrigger::new();
        assert!(machine.handle(TriggerEvent::FrameLoaded).is_empty());
        assert_eq!(machine.state(), &TriggerState::Loading);

        let entered = machine.handle(TriggerEvent::DataReady(content_with("delay", None, Some(2))));
        assert_eq!(
            entered,
            vec![
                TriggerState::ContentReady,
                TriggerState::Counting { remaining: 2 }
            ]
        );
    }

    #[test]
    fn data_first_then_frame_also_works() {
        let mut machine = PopupTrigger::new();
        assert!(machine
            .handle(TriggerEvent::DataReady(content_with("delay", None, Some(1))))
            .is_empty());
        assert_eq!(
            machine.handle(TriggerEvent::FrameLoaded),
            vec![
                TriggerState::ContentReady,
                TriggerState::Counting { remaining: 1 }
            ]
        );
    }

    #[test]
    fn zero_delay_skips_counting() {
        let mut machine = PopupTrigger::new();
        let entered = ready(&mut machine, content_with("delay", None, Some(0)));

        assert_eq!(
            entered,
            vec![TriggerState::ContentReady, TriggerState::ShowingPopup]
        );
        assert!(!entered
            .iter()
            .any(|s| matches!(s, TriggerState::Counting { .. })));
    }

    #[test]
    fn popup_shows_after_exactly_n_ticks() {
        let mut machine = PopupTrigger::new();
        ready(&mut machine, content_with("delay", None, Some(3)));

        assert_eq!(
            machine.handle(TriggerEvent::Tick),
            vec![TriggerState::Counting { remaining: 2 }]
        );
        assert_eq!(
            machine.handle(TriggerEvent::Tick),
            vec![TriggerState::Counting { remaining: 1 }]
        );
        assert_eq!(
            machine.handle(TriggerEvent::Tick),
            vec![TriggerState::ShowingPopup]
        );
        // Extra ticks never push the countdown below zero.
        assert!(machine.handle(TriggerEvent::Tick).is_empty());
        assert_eq!(machine.state(), &TriggerState::ShowingPopup);
    }

    #[test]
    fn ticks_before_content_ready_are_ignored() {
        let mut machine = PopupTrigger::new();
        assert!(machine.handle(TriggerEvent::Tick).is_empty());
        assert_eq!(machine.state(), &TriggerState::Loading);
    }

    #[test]
    fn dismiss_and_click_through_close_the_overlay() {
        let mut machine = PopupTrigger::new();
        ready(&mut machine, content_with("delay", None, Some(0)));
        assert_eq!(
            machine.handle(TriggerEvent::Dismiss),
            vec![TriggerState::Closed {
                reason: CloseReason::Dismissed
            }]
        );
        assert!(machine.state().is_terminal());

        let mut machine = PopupTrigger::new();
        ready(&mut machine, content_with("delay", None, Some(0)));
        machine.handle(TriggerEvent::ClickThrough);
        assert_eq!(
            machine.state(),
            &TriggerState::Closed {
                reason: CloseReason::ClickedThrough
            }
        );
    }

    #[test]
    fn dismiss_while_counting_is_ignored() {
        let mut machine = PopupTrigger::new();
        ready(&mut machine, content_with("delay", None, Some(5)));
        assert!(machine.handle(TriggerEvent::Dismiss).is_empty());
        assert_eq!(machine.state(), &TriggerState::Counting { remaining: 5 });
    }

    #[test]
    fn grace_elapsed_abandons_only_while_loading() {
        let mut machine = PopupTrigger::new();
        assert_eq!(
            machine.handle(TriggerEvent::GraceElapsed),
            vec![TriggerState::Abandoned]
        );

        let mut machine = PopupTrigger::new();
        ready(&mut machine, content_with("delay", None, Some(2)));
        assert!(machine.handle(TriggerEvent::GraceElapsed).is_empty());
    }

    #[test]
    fn idle_visits_expire_once_waiting_on_the_page() {
        let mut machine = PopupTrigger::new();
        assert!(machine.handle(TriggerEvent::IdleElapsed).is_empty());
        ready(&mut machine, content_with("delay", None, Some(2)));
        assert!(machine.handle(TriggerEvent::IdleElapsed).is_empty());

        for trigger in ["delay", "exit"] {
            let mut machine = PopupTrigger::new();
            ready(&mut machine, content_with(trigger, None, Some(0)));
            assert_eq!(
                machine.handle(TriggerEvent::IdleElapsed),
                vec![TriggerState::Closed {
                    reason: CloseReason::Expired
                }]
            );
            assert!(machine.state().is_terminal());
        }
    }

    #[test]
    fn scroll_trigger_waits_for_threshold() {
        let mut machine = PopupTrigger::new();
        let entered = ready(&mut machine, content_with("scroll", Some("60"), None));
        assert_eq!(entered.last(), Some(&TriggerState::Armed));

        assert!(machine
            .handle(TriggerEvent::Scrolled { percent: 30 })
            .is_empty());
        assert_eq!(
            machine.handle(TriggerEvent::Scrolled { percent: 61 }),
            vec![TriggerState::ShowingPopup]
        );
    }

    #[test]
    fn exit_intent_only_fires_exit_triggers() {
        let mut machine = PopupTrigger::new();
        ready(&mut machine, content_with("scroll", Some("90"), None));
        assert!(machine.handle(TriggerEvent::ExitIntent).is_empty());

        let mut machine = PopupTrigger::new();
        ready(&mut machine, content_with("exit", None, None));
        assert_eq!(
            machine.handle(TriggerEvent::ExitIntent),
            vec![TriggerState::ShowingPopup]
        );
    }

    #[test]
    fn states_serialize_with_a_tag() {
        let json = serde_json::to_value(TriggerState::Counting { remaining: 2 }).unwrap();
        assert_eq!(json, serde_json::json!({ "state": "counting", "remaining": 2 }));

        let json = serde_json::to_value(TriggerState::Closed {
            reason: CloseReason::Dismissed,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "state": "closed", "reason": "dismissed" })
        );
    }
}

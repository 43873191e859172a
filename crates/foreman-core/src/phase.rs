use serde_json::json;

use foreman_types::{EngineEvent, RunPhase};

use crate::event_bus::EventBus;

/// Drives the coarse run lifecycle: thinking → working → verifying →
/// {complete, failed}. Transitions are idempotent and forward-only; each
/// state entered emits exactly one `phase_change` event.
#[derive(Debug, Clone)]
pub struct PhaseMachine {
    run_id: String,
    current: RunPhase,
}

impl PhaseMachine {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            current: RunPhase::Thinking,
        }
    }

    pub fn current(&self) -> RunPhase {
        self.current
    }

    /// Advances to `next` if the transition is legal. Re-entering the current
    /// phase is a no-op; backward or skipping transitions are ignored and
    /// logged rather than panicking, since the loop drives this machine from
    /// multiple exit paths.
    pub fn transition(&mut self, next: RunPhase, message: &str, bus: &EventBus) -> bool {
        if next == self.current {
            return false;
        }
        if !is_legal_transition(self.current, next) {
            tracing::warn!(
                run_id = %self.run_id,
                from = self.current.as_str(),
                to = next.as_str(),
                "ignoring illegal phase transition"
            );
            return false;
        }
        self.current = next;
        bus.publish(EngineEvent::new(
            "phase_change",
            json!({
                "runID": self.run_id,
                "phase": next.as_str(),
                "message": message,
            }),
        ));
        true
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.current, RunPhase::Complete | RunPhase::Failed)
    }
}

fn is_legal_transition(from: RunPhase, to: RunPhase) -> bool {
    matches!(
        (from, to),
        (RunPhase::Thinking, RunPhase::Working)
            | (RunPhase::Thinking, RunPhase::Verifying)
            | (RunPhase::Thinking, RunPhase::Complete)
            | (RunPhase::Thinking, RunPhase::Failed)
            | (RunPhase::Working, RunPhase::Verifying)
            | (RunPhase::Working, RunPhase::Complete)
            | (RunPhase::Working, RunPhase::Failed)
            | (RunPhase::Verifying, RunPhase::Complete)
            | (RunPhase::Verifying, RunPhase::Failed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn happy_path_emits_one_event_per_phase() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let mut machine = PhaseMachine::new("run-1");

        assert!(machine.transition(RunPhase::Working, "first tool call", &bus));
        assert!(machine.transition(RunPhase::Verifying, "loop done, checking", &bus));
        assert!(machine.transition(RunPhase::Complete, "validation passed", &bus));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.event_type == "phase_change"));
        let phases = events
            .iter()
            .map(|e| e.properties["phase"].as_str().unwrap_or("").to_string())
            .collect::<Vec<_>>();
        assert_eq!(phases, vec!["working", "verifying", "complete"]);
    }

    #[test]
    fn reentering_a_phase_is_a_no_op() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let mut machine = PhaseMachine::new("run-1");

        assert!(machine.transition(RunPhase::Working, "go", &bus));
        assert!(!machine.transition(RunPhase::Working, "go again", &bus));
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn no_backward_transitions() {
        let bus = EventBus::new();
        let mut machine = PhaseMachine::new("run-1");
        machine.transition(RunPhase::Working, "go", &bus);
        machine.transition(RunPhase::Verifying, "check", &bus);
        assert!(!machine.transition(RunPhase::Working, "back", &bus));
        assert_eq!(machine.current(), RunPhase::Verifying);
    }

    #[test]
    fn terminal_phases_accept_nothing_further() {
        let bus = EventBus::new();
        let mut machine = PhaseMachine::new("run-1");
        machine.transition(RunPhase::Working, "go", &bus);
        machine.transition(RunPhase::Failed, "validation failed", &bus);
        assert!(machine.is_terminal());
        assert!(!machine.transition(RunPhase::Complete, "late", &bus));
        assert_eq!(machine.current(), RunPhase::Failed);
    }

    #[test]
    fn thinking_can_complete_directly_when_nothing_mutated() {
        let bus = EventBus::new();
        let mut machine = PhaseMachine::new("run-1");
        assert!(machine.transition(RunPhase::Complete, "no tool calls needed", &bus));
        assert!(machine.is_terminal());
    }
}

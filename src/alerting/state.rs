/// In-memory breach tracking for one (rule, machine) pair.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RuleEvaluationState {
    pub consecutive_breaches: u32,
    pub open_event_id: Option<i64>,
    /// Whether the open event has been looked up since the state was created.
    pub loaded: bool,
}

/// What the evaluator must persist after a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Open,
    Resolve(i64),
}

impl RuleEvaluationState {
    pub fn load(open_event_id: Option<i64>) -> Self {
        Self {
            consecutive_breaches: 0,
            open_event_id,
            loaded: true,
        }
    }

    /// Feeds one sample into the counter. The caller confirms a transition
    /// with `mark_opened` or `mark_resolved` once it is persisted, so a failed
    /// write is retried on the next sample.
    pub fn apply(&mut self, breached: bool, required_breaches: u32) -> Transition {
        if breached {
            self.consecutive_breaches = self.consecutive_breaches.saturating_add(1);
            if self.open_event_id.is_none() && self.consecutive_breaches >= required_breaches.max(1) {
                Transition::Open
            } else {
                Transition::None
            }
        } else {
            self.consecutive_breaches = 0;
            match self.open_event_id {
                Some(id) => Transition::Resolve(id),
                None => Transition::None,
            }
        }
    }

    pub fn mark_opened(&mut self, event_id: i64) {
        self.open_event_id = Some(event_id);
        self.consecutive_breaches = 0;
    }

    pub fn mark_resolved(&mut self) {
        self.open_event_id = None;
    }
}

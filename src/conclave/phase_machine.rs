//! The phase lattice and the gatekeeper that validates transition requests.

use std::time::{Duration, Instant};

use crate::conclave::error::{EngineError, EngineResult};

/// The six canonical phases (`spec.md` §9 Open Question (b): the spec
/// canonicalizes to exactly these, resolving the teacher material's two
/// rival phase sets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Chat,
    Plan,
    Execute,
    Review,
    Reflect,
    Done,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Chat => "chat",
            Phase::Plan => "plan",
            Phase::Execute => "execute",
            Phase::Review => "review",
            Phase::Reflect => "reflect",
            Phase::Done => "done",
        }
    }
}

/// A decision previously recorded by the Supervisor, consulted when the
/// current phase is `review` (`spec.md` §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approve,
    Reject,
    Revise,
}

/// Whether the edge `from -> to` exists in the lattice (`spec.md` §4.5):
/// - chat -> plan, chat -> done
/// - plan -> execute, plan -> chat
/// - execute -> review, execute -> plan (only if supervisor.requiredActions
///   non-empty — checked by the caller, not here)
/// - review -> reflect, review -> execute (on reject), review -> done (on
///   approve)
/// - reflect -> done
fn is_lattice_edge(from: Phase, to: Phase) -> bool {
    matches!(
        (from, to),
        (Phase::Chat, Phase::Plan)
            | (Phase::Chat, Phase::Done)
            | (Phase::Plan, Phase::Execute)
            | (Phase::Plan, Phase::Chat)
            | (Phase::Execute, Phase::Review)
            | (Phase::Execute, Phase::Plan)
            | (Phase::Review, Phase::Reflect)
            | (Phase::Review, Phase::Execute)
            | (Phase::Review, Phase::Done)
            | (Phase::Reflect, Phase::Done)
    )
}

/// Emitted on a successful transition, per `spec.md` §4.5: "record a
/// `phase_transition_executed` log event with duration since the prior
/// transition".
#[derive(Debug, Clone)]
pub struct PhaseTransitionExecuted {
    pub from: Phase,
    pub to: Phase,
    pub decision_by: String,
    pub reason: String,
    pub since_prior_transition: Duration,
}

/// Per-conversation phase state plus the timestamp of the last transition,
/// used to compute `since_prior_transition`.
pub struct PhaseMachine {
    current: Phase,
    last_transition_at: Instant,
    /// The Supervisor's most recent decision for this conversation's active
    /// milestone, if any; consulted when `current == Review`.
    pending_review_decision: Option<ReviewDecision>,
    /// Set by the Supervisor to veto any transition out of the current
    /// phase (`spec.md` §4.5 "block the transition").
    intervention_required: Option<String>,
    /// Whether `execute -> plan` is legal right now — only true when the
    /// Supervisor's `requiredActions` is non-empty for the active
    /// milestone.
    execute_to_plan_allowed: bool,
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            current: Phase::Chat,
            last_transition_at: Instant::now(),
            pending_review_decision: None,
            intervention_required: None,
            execute_to_plan_allowed: false,
        }
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    pub fn set_review_decision(&mut self, decision: ReviewDecision) {
        self.pending_review_decision = Some(decision);
    }

    pub fn set_intervention_required(&mut self, reason: Option<String>) {
        self.intervention_required = reason;
    }

    pub fn set_execute_to_plan_allowed(&mut self, allowed: bool) {
        self.execute_to_plan_allowed = allowed;
    }

    /// `spec.md` §4.5 `requestTransition`.
    pub fn request_transition(
        &mut self,
        new_phase: Phase,
        decision_by: impl Into<String>,
        reason: impl Into<String>,
    ) -> EngineResult<PhaseTransitionExecuted> {
        let from = self.current;

        if !is_lattice_edge(from, new_phase) {
            return Err(EngineError::IllegalPhase {
                from: from.as_str().to_string(),
                to: new_phase.as_str().to_string(),
            });
        }

        if from == Phase::Execute && new_phase == Phase::Plan && !self.execute_to_plan_allowed {
            return Err(EngineError::IllegalPhase {
                from: from.as_str().to_string(),
                to: new_phase.as_str().to_string(),
            });
        }

        if let Some(reason) = &self.intervention_required {
            return Err(EngineError::InterventionRequired {
                reason: reason.clone(),
            });
        }

        if from == Phase::Review {
            let decision = self.pending_review_decision;
            let allowed_target = match decision {
                Some(ReviewDecision::Approve) => Phase::Done,
                Some(ReviewDecision::Reject) => Phase::Execute,
                Some(ReviewDecision::Revise) => Phase::Execute,
                None => {
                    return Err(EngineError::IllegalPhase {
                        from: from.as_str().to_string(),
                        to: new_phase.as_str().to_string(),
                    })
                }
            };
            if new_phase != allowed_target {
                return Err(EngineError::IllegalPhase {
                    from: from.as_str().to_string(),
                    to: new_phase.as_str().to_string(),
                });
            }
        }

        let now = Instant::now();
        let since_prior_transition = now.duration_since(self.last_transition_at);
        self.current = new_phase;
        self.last_transition_at = now;
        self.pending_review_decision = None;

        Ok(PhaseTransitionExecuted {
            from,
            to: new_phase,
            decision_by: decision_by.into(),
            reason: reason.into(),
            since_prior_transition,
        })
    }
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

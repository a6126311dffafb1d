//! Pure phase-transition table for the Session Lifecycle Controller (C2,
//! §4.2). Deliberately free of any I/O or `kube` types so the full
//! transition table, the terminal-restart behavior, and the timeout check
//! can be exercised as plain unit tests (§8's "boundary behaviors" and
//! "invariants" sections are tested here, not against a live cluster).

use std::time::Duration;

use crate::resource::Phase;

/// What the reconciler observed about the owned pod this pass. `Absent`
/// covers both "never created" and "deleted out-of-band".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodObservation {
    Absent,
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// The user-requested target phase, read from the `desired-phase`
/// annotation. Any value other than `Running`/`Stopped` is undefined per
/// spec §9 Open Questions; this implementation logs and ignores it, which
/// `parse` encodes by returning `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredPhase {
    Running,
    Stopped,
}

impl DesiredPhase {
    pub fn parse(annotation: Option<&str>) -> Option<Self> {
        match annotation {
            Some("Running") => Some(DesiredPhase::Running),
            Some("Stopped") => Some(DesiredPhase::Stopped),
            _ => None,
        }
    }
}

/// What to do with the owned pod as a result of this reconcile's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodAction {
    None,
    Compose,
    Delete,
}

/// Comparison between `.metadata.generation` and `status.observedGeneration`
/// for a `Running` session (§4.2's "Running" rule), used to decide whether a
/// spec change can be absorbed in place or needs a fresh pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationDrift {
    /// `observedGeneration` already matches `generation`; nothing changed.
    None,
    /// `generation` moved, but only in fields explicitly called out as hot
    /// (timeout, free-form environment additions) -- absorbed without
    /// touching the pod.
    Hot,
    /// `generation` moved in a field that isn't explicitly hot. Per §9's
    /// Open Question, anything not called out as hot errs on the side of
    /// replacement.
    Cold,
}

/// Pure classification of [`GenerationDrift`] from the two generation
/// numbers plus a before/after hash of the fields that require replacement
/// ([`crate::resource::SessionSpec::cold_fields_hash`]). `pod_cold_hash` is
/// the hash stamped on the currently-running pod at compose time; `None`
/// when no such annotation was found (pod predates this mechanism).
pub fn classify_drift(
    generation: Option<i64>,
    observed_generation: Option<i64>,
    current_cold_hash: u64,
    pod_cold_hash: Option<u64>,
) -> GenerationDrift {
    if generation.is_none() || generation == observed_generation {
        return GenerationDrift::None;
    }
    match pod_cold_hash {
        Some(hash) if hash == current_cold_hash => GenerationDrift::Hot,
        _ => GenerationDrift::Cold,
    }
}

/// The phase the record should move to, and the status-field side effects
/// that accompany that move. `None` means "stay in the current phase".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTransition {
    pub next: Phase,
    pub set_start_time: bool,
    pub set_completion_time: bool,
    pub clear_completion_time: bool,
    pub increment_restart_count: bool,
    pub message: Option<String>,
}

impl PhaseTransition {
    fn to(next: Phase) -> Self {
        PhaseTransition {
            next,
            set_start_time: false,
            set_completion_time: false,
            clear_completion_time: false,
            increment_restart_count: false,
            message: None,
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    fn starting(mut self) -> Self {
        self.set_start_time = true;
        self
    }

    fn completing(mut self) -> Self {
        self.set_completion_time = true;
        self
    }

    fn restarting(mut self) -> Self {
        self.clear_completion_time = true;
        self.increment_restart_count = true;
        self
    }
}

/// The full output of one FSM decision: an optional phase transition, a pod
/// side-effect, and how long to wait before the next reconcile if nothing
/// else triggers it sooner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub transition: Option<PhaseTransition>,
    pub pod_action: PodAction,
    pub requeue_after: Option<Duration>,
    /// True only for the `Running`-with-pod-absent self-heal path (§8:
    /// "results in exactly one reset to Pending... not a loop"); distinct
    /// from a user-requested restart so the reconciler can attribute the
    /// right counter (`pod_restarts` vs `restart_count`).
    pub self_heal: bool,
    /// Whether this pass should stamp `status.observedGeneration` to the
    /// current generation. False only while a cold-drift replacement is
    /// in flight (the delete-and-wait-for-absent step): the new pod hasn't
    /// been composed against the new spec yet, so the generation isn't
    /// actually "observed" until it comes back up (§4.2, §9).
    pub bump_observed_generation: bool,
}

impl Decision {
    fn stay(requeue_after: Duration) -> Self {
        Decision {
            transition: None,
            pod_action: PodAction::None,
            requeue_after: Some(requeue_after),
            self_heal: false,
            bump_observed_generation: true,
        }
    }

    fn terminal_noop() -> Self {
        Decision {
            transition: None,
            pod_action: PodAction::None,
            requeue_after: None,
            self_heal: false,
            bump_observed_generation: true,
        }
    }

    fn transition(transition: PhaseTransition, pod_action: PodAction, requeue_after: Option<Duration>) -> Self {
        Decision {
            transition: Some(transition),
            pod_action,
            requeue_after,
            self_heal: false,
            bump_observed_generation: true,
        }
    }

    /// A cold spec change on a `Running` session: delete the pod and stay
    /// put. The next reconcile observes the pod absent and falls into the
    /// existing self-heal path, which resets to `Pending` and recomposes
    /// against the now-current spec.
    fn replace_pod(requeue_after: Duration) -> Self {
        Decision {
            transition: None,
            pod_action: PodAction::Delete,
            requeue_after: Some(requeue_after),
            self_heal: false,
            bump_observed_generation: false,
        }
    }
}

const CREATING_POLL_INTERVAL: Duration = Duration::from_secs(2);
const RUNNING_POLL_INTERVAL: Duration = Duration::from_secs(30);
const STOPPING_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// The core per-phase rule table from spec §4.2. Given the session's
/// current phase, the observed pod state, and the desired-phase annotation
/// (already parsed), decides the next phase (if any), what to do with the
/// pod, and the requeue interval.
pub fn decide(current: Phase, pod: PodObservation, desired: Option<DesiredPhase>, drift: GenerationDrift) -> Decision {
    match current {
        Phase::Pending => {
            if desired == Some(DesiredPhase::Stopped) {
                Decision::transition(
                    PhaseTransition::to(Phase::Stopped).completing(),
                    PodAction::None,
                    None,
                )
            } else {
                Decision::transition(
                    PhaseTransition::to(Phase::Creating),
                    PodAction::Compose,
                    Some(CREATING_POLL_INTERVAL),
                )
            }
        }

        Phase::Creating => match pod {
            PodObservation::Absent => {
                if desired == Some(DesiredPhase::Stopped) {
                    Decision::transition(
                        PhaseTransition::to(Phase::Stopped).completing(),
                        PodAction::None,
                        None,
                    )
                } else {
                    // Pod was lost before we ever observed it; go back to
                    // Pending so the next reconcile recomposes it.
                    Decision::transition(PhaseTransition::to(Phase::Pending), PodAction::None, None)
                }
            }
            PodObservation::Pending => Decision::stay(CREATING_POLL_INTERVAL),
            PodObservation::Running => Decision::transition(
                PhaseTransition::to(Phase::Running).starting(),
                PodAction::None,
                Some(RUNNING_POLL_INTERVAL),
            ),
            PodObservation::Succeeded => Decision::transition(
                PhaseTransition::to(Phase::Completed).completing(),
                PodAction::Delete,
                None,
            ),
            PodObservation::Failed => Decision::transition(
                PhaseTransition::to(Phase::Failed)
                    .completing()
                    .with_message("workload pod failed during startup"),
                PodAction::Delete,
                None,
            ),
        },

        Phase::Running => match pod {
            PodObservation::Absent => Decision {
                transition: Some(PhaseTransition::to(Phase::Pending)),
                pod_action: PodAction::None,
                requeue_after: None,
                self_heal: true,
                bump_observed_generation: true,
            },
            PodObservation::Succeeded => Decision::transition(
                PhaseTransition::to(Phase::Completed).completing(),
                PodAction::Delete,
                None,
            ),
            PodObservation::Failed => Decision::transition(
                PhaseTransition::to(Phase::Failed)
                    .completing()
                    .with_message("workload pod failed while running"),
                PodAction::Delete,
                None,
            ),
            PodObservation::Pending | PodObservation::Running => {
                if desired == Some(DesiredPhase::Stopped) {
                    Decision::transition(PhaseTransition::to(Phase::Stopping), PodAction::Delete, None)
                } else {
                    match drift {
                        GenerationDrift::Cold => Decision::replace_pod(RUNNING_POLL_INTERVAL),
                        GenerationDrift::Hot | GenerationDrift::None => Decision::stay(RUNNING_POLL_INTERVAL),
                    }
                }
            }
        },

        Phase::Stopping => match pod {
            PodObservation::Absent => Decision::transition(
                PhaseTransition::to(Phase::Stopped).completing(),
                PodAction::None,
                None,
            ),
            _ => Decision {
                transition: None,
                pod_action: PodAction::Delete,
                requeue_after: Some(STOPPING_POLL_INTERVAL),
                self_heal: false,
                bump_observed_generation: true,
            },
        },

        Phase::Stopped | Phase::Completed | Phase::Failed => {
            if desired == Some(DesiredPhase::Running) {
                Decision::transition(
                    PhaseTransition::to(Phase::Pending).restarting(),
                    PodAction::None,
                    None,
                )
            } else {
                Decision::terminal_noop()
            }
        }
    }
}

/// Session-level timeout enforcement (§5): a `Running` session whose
/// `timeout` has elapsed since `start_time` transitions to `Failed`,
/// independent of pod status. Pure function of elapsed-vs-configured.
pub fn timeout_exceeded(elapsed_since_start: Duration, timeout: Duration) -> bool {
    elapsed_since_start >= timeout
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decide_no_drift(current: Phase, pod: PodObservation, desired: Option<DesiredPhase>) -> Decision {
        decide(current, pod, desired, GenerationDrift::None)
    }

    #[test]
    fn pending_composes_pod_and_moves_to_creating() {
        let d = decide_no_drift(Phase::Pending, PodObservation::Absent, None);
        assert_eq!(d.transition.unwrap().next, Phase::Creating);
        assert_eq!(d.pod_action, PodAction::Compose);
    }

    #[test]
    fn pending_with_desired_stopped_goes_directly_to_stopped() {
        let d = decide_no_drift(Phase::Pending, PodObservation::Absent, Some(DesiredPhase::Stopped));
        let t = d.transition.unwrap();
        assert_eq!(t.next, Phase::Stopped);
        assert!(t.set_completion_time);
        assert_eq!(d.pod_action, PodAction::None);
    }

    #[test]
    fn creating_pod_absent_without_stop_resets_to_pending() {
        let d = decide_no_drift(Phase::Creating, PodObservation::Absent, None);
        assert_eq!(d.transition.unwrap().next, Phase::Pending);
    }

    #[test]
    fn creating_pod_absent_with_stop_terminates() {
        let d = decide_no_drift(Phase::Creating, PodObservation::Absent, Some(DesiredPhase::Stopped));
        assert_eq!(d.transition.unwrap().next, Phase::Stopped);
    }

    #[test]
    fn creating_pod_running_sets_start_time_and_moves_to_running() {
        let d = decide_no_drift(Phase::Creating, PodObservation::Running, None);
        let t = d.transition.unwrap();
        assert_eq!(t.next, Phase::Running);
        assert!(t.set_start_time);
    }

    #[test]
    fn creating_pod_succeeded_completes_and_deletes_pod() {
        let d = decide_no_drift(Phase::Creating, PodObservation::Succeeded, None);
        let t = d.transition.unwrap();
        assert_eq!(t.next, Phase::Completed);
        assert!(t.set_completion_time);
        assert_eq!(d.pod_action, PodAction::Delete);
    }

    #[test]
    fn creating_pod_failed_fails_and_deletes_pod() {
        let d = decide_no_drift(Phase::Creating, PodObservation::Failed, None);
        assert_eq!(d.transition.unwrap().next, Phase::Failed);
        assert_eq!(d.pod_action, PodAction::Delete);
    }

    #[test]
    fn creating_pod_still_pending_just_requeues() {
        let d = decide_no_drift(Phase::Creating, PodObservation::Pending, None);
        assert!(d.transition.is_none());
        assert_eq!(d.requeue_after, Some(CREATING_POLL_INTERVAL));
    }

    #[test]
    fn running_pod_absent_self_heals_to_pending_exactly_once() {
        let d = decide_no_drift(Phase::Running, PodObservation::Absent, None);
        assert_eq!(d.transition.unwrap().next, Phase::Pending);
        assert!(d.self_heal);
    }

    #[test]
    fn running_honors_desired_stopped_by_moving_to_stopping_and_deleting() {
        let d = decide_no_drift(Phase::Running, PodObservation::Running, Some(DesiredPhase::Stopped));
        assert!(d.transition.is_none() || d.transition.as_ref().unwrap().next == Phase::Stopping);
        // Stopping is a transition in this design (changes phase) unlike the
        // idempotent re-delete case in the Stopping phase itself.
        assert_eq!(d.transition.unwrap().next, Phase::Stopping);
        assert_eq!(d.pod_action, PodAction::Delete);
    }

    #[test]
    fn running_pod_succeeded_completes() {
        let d = decide_no_drift(Phase::Running, PodObservation::Succeeded, None);
        assert_eq!(d.transition.unwrap().next, Phase::Completed);
    }

    #[test]
    fn running_pod_failed_fails() {
        let d = decide_no_drift(Phase::Running, PodObservation::Failed, None);
        assert_eq!(d.transition.unwrap().next, Phase::Failed);
    }

    #[test]
    fn running_steady_state_requeues_after_30s() {
        let d = decide_no_drift(Phase::Running, PodObservation::Running, None);
        assert!(d.transition.is_none());
        assert_eq!(d.requeue_after, Some(RUNNING_POLL_INTERVAL));
        assert!(d.bump_observed_generation);
    }

    #[test]
    fn running_hot_drift_absorbed_in_place() {
        let d = decide(Phase::Running, PodObservation::Running, None, GenerationDrift::Hot);
        assert!(d.transition.is_none());
        assert_eq!(d.pod_action, PodAction::None);
        assert!(d.bump_observed_generation);
    }

    #[test]
    fn running_cold_drift_deletes_pod_and_withholds_observed_generation() {
        let d = decide(Phase::Running, PodObservation::Running, None, GenerationDrift::Cold);
        assert!(d.transition.is_none());
        assert_eq!(d.pod_action, PodAction::Delete);
        assert!(!d.bump_observed_generation);
    }

    #[test]
    fn running_cold_drift_then_pod_absent_self_heals_like_any_other_loss() {
        // The pod disappearing after the cold-drift delete is handled by the
        // ordinary Absent-in-Running self-heal path, not a special case.
        let d = decide(Phase::Running, PodObservation::Absent, None, GenerationDrift::Cold);
        assert_eq!(d.transition.unwrap().next, Phase::Pending);
        assert!(d.self_heal);
        assert!(d.bump_observed_generation);
    }

    #[test]
    fn classify_drift_is_none_when_generations_match() {
        assert_eq!(classify_drift(Some(3), Some(3), 42, Some(42)), GenerationDrift::None);
    }

    #[test]
    fn classify_drift_is_hot_when_cold_hash_unchanged() {
        assert_eq!(classify_drift(Some(4), Some(3), 42, Some(42)), GenerationDrift::Hot);
    }

    #[test]
    fn classify_drift_is_cold_when_hash_changed_or_unknown() {
        assert_eq!(classify_drift(Some(4), Some(3), 42, Some(99)), GenerationDrift::Cold);
        assert_eq!(classify_drift(Some(4), Some(3), 42, None), GenerationDrift::Cold);
    }

    #[test]
    fn classify_drift_is_none_without_a_generation() {
        assert_eq!(classify_drift(None, Some(3), 42, Some(42)), GenerationDrift::None);
    }

    #[test]
    fn stopping_reissues_delete_while_pod_present() {
        let d = decide_no_drift(Phase::Stopping, PodObservation::Running, None);
        assert!(d.transition.is_none());
        assert_eq!(d.pod_action, PodAction::Delete);
    }

    #[test]
    fn stopping_completes_once_pod_gone() {
        let d = decide_no_drift(Phase::Stopping, PodObservation::Absent, None);
        let t = d.transition.unwrap();
        assert_eq!(t.next, Phase::Stopped);
        assert!(t.set_completion_time);
    }

    #[test]
    fn terminal_phases_ignore_everything_but_restart_request() {
        for phase in [Phase::Stopped, Phase::Completed, Phase::Failed] {
            let noop = decide_no_drift(phase, PodObservation::Absent, None);
            assert!(noop.transition.is_none());
            assert!(noop.requeue_after.is_none());

            let stop_is_noop = decide_no_drift(phase, PodObservation::Absent, Some(DesiredPhase::Stopped));
            assert!(stop_is_noop.transition.is_none(), "stop on terminal must be a no-op");

            let restart = decide_no_drift(phase, PodObservation::Absent, Some(DesiredPhase::Running));
            let t = restart.transition.unwrap();
            assert_eq!(t.next, Phase::Pending);
            assert!(t.clear_completion_time);
            assert!(t.increment_restart_count);
        }
    }

    #[test]
    fn desired_phase_parse_ignores_unrecognized_values() {
        assert_eq!(DesiredPhase::parse(Some("Paused")), None);
        assert_eq!(DesiredPhase::parse(None), None);
        assert_eq!(DesiredPhase::parse(Some("Running")), Some(DesiredPhase::Running));
        assert_eq!(DesiredPhase::parse(Some("Stopped")), Some(DesiredPhase::Stopped));
    }

    #[test]
    fn decide_is_a_pure_function_replaying_twice_is_identical() {
        let a = decide_no_drift(Phase::Creating, PodObservation::Running, None);
        let b = decide_no_drift(Phase::Creating, PodObservation::Running, None);
        assert_eq!(a, b);
    }

    #[test]
    fn timeout_not_exceeded_before_deadline() {
        assert!(!timeout_exceeded(Duration::from_secs(599), Duration::from_secs(600)));
    }

    #[test]
    fn timeout_exceeded_at_and_past_deadline() {
        assert!(timeout_exceeded(Duration::from_secs(600), Duration::from_secs(600)));
        assert!(timeout_exceeded(Duration::from_secs(700), Duration::from_secs(600)));
    }
}

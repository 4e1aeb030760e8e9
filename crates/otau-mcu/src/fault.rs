//! Deterministic fault injection.
//!
//! Faults are armed against named injection points in the DFU flow and
//! consulted every time the flow passes one. A consult either fires a
//! fault (suppress the response, or send it with an injected status) or
//! reports nothing. Matching is driven by a per-point call counter that
//! starts at 1, so "fail the 3rd page store" is expressible and
//! repeatable against a live peer.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use otau_wire::DfuStatus;
use tracing::debug;

/// Where in the DFU flow a fault can fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InjectionPoint {
    /// Before Init processes the peer's request.
    PreValidation,
    /// Before a state response is sent.
    AfterPreValidation,
    /// Before a Page Create is accepted.
    PageCreate,
    /// Before a stored page is finalised.
    PageStore,
    /// After a successful full-image SHA match, before declaring success.
    PostValidation,
}

/// What a fired fault does to the pending response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Suppress the response entirely.
    NoResponse,
    /// Send the response, but carrying this status.
    RespondWithStatus(DfuStatus),
}

/// When a fault fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTrigger {
    /// Every consult; never consumed.
    Always,
    /// The nth consult of the point (counting from 1); consumed once.
    OnCall(u32),
}

type FaultCallback = Box<dyn FnMut() + Send>;

pub struct FaultSpec {
    pub trigger: FaultTrigger,
    pub kind: FaultKind,
    /// Synchronous delay before the fault takes effect. Blocking the core
    /// for the whole interval is the point: the emulated MCU must appear
    /// unresponsive to the peer.
    pub delay: Duration,
    callback: Option<FaultCallback>,
}

impl FaultSpec {
    pub fn no_response(trigger: FaultTrigger) -> Self {
        Self {
            trigger,
            kind: FaultKind::NoResponse,
            delay: Duration::ZERO,
            callback: None,
        }
    }

    pub fn with_status(trigger: FaultTrigger, status: DfuStatus) -> Self {
        Self {
            trigger,
            kind: FaultKind::RespondWithStatus(status),
            delay: Duration::ZERO,
            callback: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn on_fire(mut self, callback: impl FnMut() + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }
}

struct PointState {
    /// Next consult ordinal; the first consult of a point is call 1.
    call_counter: u32,
    specs: Vec<FaultSpec>,
}

impl Default for PointState {
    fn default() -> Self {
        Self {
            call_counter: 1,
            specs: Vec::new(),
        }
    }
}

/// Per-injection-point registry of armed faults.
#[derive(Default)]
pub struct FaultRegistry {
    points: HashMap<InjectionPoint, PointState>,
}

impl FaultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a fault at a point. Order of arming is matching order.
    pub fn arm(&mut self, point: InjectionPoint, spec: FaultSpec) {
        self.points.entry(point).or_default().specs.push(spec);
    }

    /// Consult a point: bump its call counter and fire the first matching
    /// fault, if any. An `OnCall` match is removed; `Always` never is.
    /// At most one fault fires per consult.
    pub fn consult(&mut self, point: InjectionPoint) -> Option<FaultKind> {
        let state = self.points.entry(point).or_default();
        let call = state.call_counter;
        state.call_counter += 1;

        let idx = state.specs.iter().position(|spec| match spec.trigger {
            FaultTrigger::Always => true,
            FaultTrigger::OnCall(n) => n == call,
        })?;

        let consumed = matches!(state.specs[idx].trigger, FaultTrigger::OnCall(_));
        let (kind, delay) = if consumed {
            let mut spec = state.specs.remove(idx);
            fire(&mut spec);
            (spec.kind, spec.delay)
        } else {
            let spec = &mut state.specs[idx];
            fire(spec);
            (spec.kind, spec.delay)
        };

        debug!(?point, call, ?kind, ?delay, consumed, "fault fired");
        Some(kind)
    }
}

fn fire(spec: &mut FaultSpec) {
    if !spec.delay.is_zero() {
        thread::sleep(spec.delay);
    }
    if let Some(callback) = spec.callback.as_mut() {
        callback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn empty_point_reports_no_fault() {
        let mut reg = FaultRegistry::new();
        for _ in 0..10 {
            assert_eq!(reg.consult(InjectionPoint::PreValidation), None);
        }
    }

    #[test]
    fn always_fault_fires_every_consult_and_is_never_consumed() {
        let mut reg = FaultRegistry::new();
        reg.arm(
            InjectionPoint::PageStore,
            FaultSpec::no_response(FaultTrigger::Always),
        );

        for _ in 0..100 {
            assert_eq!(
                reg.consult(InjectionPoint::PageStore),
                Some(FaultKind::NoResponse)
            );
        }
    }

    #[test]
    fn call_number_fault_fires_exactly_on_its_ordinal() {
        let call_number = 7;
        let mut reg = FaultRegistry::new();
        reg.arm(
            InjectionPoint::PageStore,
            FaultSpec::with_status(
                FaultTrigger::OnCall(call_number),
                DfuStatus::InvalidObject,
            ),
        );

        for _ in 1..call_number {
            assert_eq!(reg.consult(InjectionPoint::PageStore), None);
        }
        assert_eq!(
            reg.consult(InjectionPoint::PageStore),
            Some(FaultKind::RespondWithStatus(DfuStatus::InvalidObject))
        );
        for _ in 0..50 {
            assert_eq!(reg.consult(InjectionPoint::PageStore), None);
        }
    }

    #[test]
    fn first_consult_is_call_one() {
        let mut reg = FaultRegistry::new();
        reg.arm(
            InjectionPoint::PreValidation,
            FaultSpec::no_response(FaultTrigger::OnCall(1)),
        );
        assert_eq!(
            reg.consult(InjectionPoint::PreValidation),
            Some(FaultKind::NoResponse)
        );
    }

    #[test]
    fn points_count_independently() {
        let mut reg = FaultRegistry::new();
        reg.arm(
            InjectionPoint::PageCreate,
            FaultSpec::no_response(FaultTrigger::OnCall(2)),
        );

        // Burning consults on another point must not advance PageCreate.
        for _ in 0..5 {
            assert_eq!(reg.consult(InjectionPoint::PageStore), None);
        }
        assert_eq!(reg.consult(InjectionPoint::PageCreate), None);
        assert_eq!(
            reg.consult(InjectionPoint::PageCreate),
            Some(FaultKind::NoResponse)
        );
    }

    #[test]
    fn single_match_per_consult() {
        let mut reg = FaultRegistry::new();
        reg.arm(
            InjectionPoint::PageStore,
            FaultSpec::with_status(FaultTrigger::OnCall(1), DfuStatus::InvalidObject),
        );
        reg.arm(
            InjectionPoint::PageStore,
            FaultSpec::with_status(FaultTrigger::OnCall(1), DfuStatus::OperationFailed),
        );

        // First consult matches (and removes) only the first spec; the
        // second spec's ordinal has passed, so it never fires.
        assert_eq!(
            reg.consult(InjectionPoint::PageStore),
            Some(FaultKind::RespondWithStatus(DfuStatus::InvalidObject))
        );
        assert_eq!(reg.consult(InjectionPoint::PageStore), None);
    }

    #[test]
    fn callback_invoked_when_fault_fires() {
        let hits = Arc::new(AtomicU32::new(0));
        let hits_in_callback = hits.clone();

        let mut reg = FaultRegistry::new();
        reg.arm(
            InjectionPoint::PostValidation,
            FaultSpec::no_response(FaultTrigger::Always).on_fire(move || {
                hits_in_callback.fetch_add(1, Ordering::SeqCst);
            }),
        );

        reg.consult(InjectionPoint::PostValidation);
        reg.consult(InjectionPoint::PostValidation);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}

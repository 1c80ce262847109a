//! Cooperative step protocol
//!
//! Every long running instrument operation is a step function called repeatedly from the control
//! loop. A call never blocks: it returns the step it is waiting in and expects to be called again.
//!
//! An operation owns its instrument through [Ownership] for as long as it runs. Another operation
//! asking for the same instrument meanwhile receives [Status::Waiting] and does nothing.
use arbitrary_int::u4;
use bitbybit::{bitenum, bitfield};

use crate::{buffer_index, timeout, trigger};

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Buffer index: {0}")]
    BufferIndex(#[from] buffer_index::Error),
    #[error("Timeout: {0}")]
    Timeout(#[from] timeout::Error),
    #[error("Trigger: {0}")]
    Trigger(#[from] trigger::Error),
    #[error("Hardware did not become ready in time")]
    HardwareTimeout,
    #[error("Invalid parameter")]
    InvalidParameter,
}

impl Error {
    /// Error code reported in a [StateCode].
    pub fn code(&self) -> u16 {
        match self {
            Self::BufferIndex(e) => 0x100 + *e as u16,
            Self::Timeout(e) => 0x200 + *e as u16,
            Self::Trigger(e) => 0x300 + e.code(),
            Self::HardwareTimeout => 1,
            Self::InvalidParameter => 2,
        }
    }
}

/// The outcome of one call of a step function.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status<S> {
    /// Complete, or not started.
    Idle,
    /// The instrument is owned by another operation. Retry later.
    Waiting,
    /// In progress. Call again.
    Step(S),
    Error(Error),
}

impl<S> Status<S> {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Map the in-progress step, keeping all other outcomes.
    pub fn map<T>(self, f: impl FnOnce(S) -> T) -> Status<T> {
        match self {
            Self::Idle => Status::Idle,
            Self::Waiting => Status::Waiting,
            Self::Step(s) => Status::Step(f(s)),
            Self::Error(e) => Status::Error(e),
        }
    }
}

impl<S, E: Into<Error>> From<Result<S, E>> for Status<S> {
    fn from(value: Result<S, E>) -> Self {
        match value {
            Ok(s) => Self::Step(s),
            Err(e) => Self::Error(e.into()),
        }
    }
}

/// Result of a pure step transition, applied by the step function.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Next<S> {
    Stay,
    Go(S),
    Done,
    Fail(Error),
}

/// Mutual exclusion of operations on one instrument.
///
/// `F` identifies the operations. While a parent owns the instrument it can nest a single child
/// operation, which then passes [Ownership::claim] as well.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ownership<F> {
    active: Option<F>,
    child: Option<F>,
    depth: u8,
}

impl<F> Default for Ownership<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> Ownership<F> {
    pub const fn new() -> Self {
        Self {
            active: None,
            child: None,
            depth: 0,
        }
    }

    /// Drop all ownership, on error or abort.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }
}

impl<F: Copy + PartialEq> Ownership<F> {
    /// The operation owning the instrument.
    pub fn active(&self) -> Option<F> {
        self.active
    }

    /// Take or confirm ownership for `func`.
    ///
    /// # Returns
    /// Whether `func` may proceed. Nothing changes if it may not.
    pub fn claim(&mut self, func: F) -> bool {
        match self.active {
            None => {
                self.active = Some(func);
                true
            }
            Some(owner) if owner == func => true,
            Some(_) => self.depth > 0 && self.child == Some(func),
        }
    }

    /// Give up ownership at completion.
    ///
    /// A nested child releasing is a no-op, the parent keeps the instrument.
    pub fn release(&mut self, func: F) {
        if self.depth == 0 && self.active == Some(func) {
            self.active = None;
        }
    }

    /// Admit `child` while `parent` owns the instrument.
    pub fn nest(&mut self, parent: F, child: F) -> bool {
        if self.active != Some(parent) || self.depth == u8::MAX {
            return false;
        }
        self.child = Some(child);
        self.depth += 1;
        true
    }

    /// Revoke the most recent [Ownership::nest].
    pub fn unnest(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 {
            self.child = None;
        }
    }
}

/// Components reporting state codes.
#[bitenum(u4, exhaustive = false)]
#[derive(Debug, PartialEq, Eq)]
pub enum Origin {
    Core = 0,
    Dc = 1,
    Awg = 2,
    Trigger = 3,
    Timeout = 4,
}

/// A step enumeration of an operation.
pub trait Step: Copy + Into<u16> {
    const ORIGIN: Origin;
}

/// Compact status word handed to the command layer.
#[bitfield(u32, default = 0)]
#[derive(Debug, PartialEq, Eq)]
pub struct StateCode {
    /// Step or error code.
    #[bits(0..=15, rw)]
    code: u16,
    #[bits(24..=27, rw)]
    origin: Option<Origin>,
    #[bit(29, rw)]
    waiting: bool,
    #[bit(30, rw)]
    error: bool,
    /// Error raised outside this core (filesystem or configuration layer).
    #[bit(31, rw)]
    external: bool,
}

impl StateCode {
    pub const IDLE: Self = Self::DEFAULT;

    /// An error code of the configuration or persistence layer.
    pub fn external_error(code: u16) -> Self {
        Self::DEFAULT
            .with_code(code)
            .with_error(true)
            .with_external(true)
    }

    pub fn is_idle(&self) -> bool {
        self.raw_value() == 0
    }

    pub fn origin_bits(&self) -> u4 {
        u4::new(((self.raw_value() >> 24) & 0xf) as u8)
    }
}

impl<S: Step> From<Status<S>> for StateCode {
    fn from(status: Status<S>) -> Self {
        let code = Self::DEFAULT.with_origin(S::ORIGIN);
        match status {
            Status::Idle => Self::IDLE,
            Status::Waiting => code.with_waiting(true),
            Status::Step(s) => code.with_code(s.into()),
            Status::Error(e) => code.with_code(e.code()).with_error(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq)]
    enum F {
        Run,
        Offset,
        Calibrate,
    }

    #[derive(Copy, Clone, Debug, PartialEq)]
    struct S(u16);

    impl From<S> for u16 {
        fn from(s: S) -> u16 {
            s.0
        }
    }

    impl Step for S {
        const ORIGIN: Origin = Origin::Awg;
    }

    #[test]
    fn exclusive() {
        let mut o = Ownership::new();
        assert!(o.claim(F::Run));
        assert!(o.claim(F::Run));
        assert!(!o.claim(F::Calibrate));
        assert_eq!(o.active(), Some(F::Run));
        o.release(F::Calibrate);
        assert_eq!(o.active(), Some(F::Run));
        o.release(F::Run);
        assert!(o.claim(F::Calibrate));
    }

    #[test]
    fn nesting() {
        let mut o = Ownership::new();
        assert!(!o.nest(F::Run, F::Offset));
        assert!(o.claim(F::Run));
        assert!(!o.claim(F::Offset));
        assert!(o.nest(F::Run, F::Offset));
        assert!(o.claim(F::Offset));
        assert!(!o.claim(F::Calibrate));
        // The child finishing leaves the parent in charge.
        o.release(F::Offset);
        assert_eq!(o.active(), Some(F::Run));
        o.unnest();
        assert_eq!(o.depth(), 0);
        assert!(!o.claim(F::Offset));
        o.release(F::Run);
        assert_eq!(o.active(), None);
    }

    #[test]
    fn state_codes() {
        assert!(StateCode::from(Status::<S>::Idle).is_idle());

        let c = StateCode::from(Status::Step(S(3)));
        assert_eq!(c.code(), 3);
        assert_eq!(c.origin(), Ok(Origin::Awg));
        assert!(!c.error());
        assert_eq!(c.raw_value(), 0x0200_0003);

        let c = StateCode::from(Status::<S>::Waiting);
        assert!(c.waiting());
        assert_eq!(c.raw_value(), 0x2200_0000);

        let c = StateCode::from(Status::<S>::Error(Error::HardwareTimeout));
        assert!(c.error() && !c.external());
        assert_eq!(c.code(), 1);

        let c = StateCode::external_error(17);
        assert!(c.error() && c.external());
        assert_eq!(c.raw_value(), 0xc000_0011);
        assert_eq!(c.origin_bits().value(), 0);
    }

    #[test]
    fn from_result() {
        let s: Status<u8> = Err::<u8, _>(timeout::Error::Full).into();
        assert_eq!(s, Status::Error(Error::Timeout(timeout::Error::Full)));
        assert_eq!(
            Status::Error::<u8>(timeout::Error::Full.into()).map(|_| ()),
            Status::Error(Error::Timeout(timeout::Error::Full))
        );
    }
}

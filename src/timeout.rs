//! Capture stop deadlines on a shared countdown timer
//!
//! # Design
//! Several instruments each need to be halted a precise number of timer ticks after their
//! trigger. A single 16-bit [CountdownTimer] serves all of them: the deadlines are kept sorted in
//! a short list, each [Entry] relative to the deadline before it. The hardware counter holds the
//! sub-period part of the earliest deadline and the head entry counts the remaining full periods.
//!
//! On every rollover interrupt [TimeoutTimer::on_rollover] either consumes one of the head's
//! periods or halts the head instrument and programs the counter for the next entry.
//!
//! Entries are added from the control loop while the interrupt mutates the list. The critical
//! sections stay short: [TimeoutTimer::add] snapshots the list, computes the new schedule outside
//! of the critical section and only commits it if no rollover was serviced in the meantime and the
//! counter is not about to roll over. Otherwise it starts over.
//!
//! Cancelled entries stay in the list without an instrument until they are either due or the
//! list is rebuilt. Their ticks are carried into the following entry so the rest of the schedule
//! is not disturbed.
use core::cell::RefCell;
use critical_section::Mutex;
use heapless::Vec;

use crate::hardware::design_parameters::ROLLOVER_MARGIN;
use crate::hardware::{CountdownTimer, Halt, Instrument};

/// Ticks per counter period.
const PERIOD: u64 = 1 << 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Too many pending timeouts")]
    Full,
    #[error("Timeout must be at least one tick")]
    ZeroTicks,
    #[error("Instrument already has a timeout")]
    Duplicate,
}

/// One deadline, relative to the previous one in the list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub rollovers: u64,
    pub offset: u16,
    /// `None` once cancelled.
    pub instrument: Option<Instrument>,
}

impl Entry {
    fn new(ticks: u64, instrument: Option<Instrument>) -> Self {
        Self {
            rollovers: ticks >> 16,
            offset: ticks as u16,
            instrument,
        }
    }

    pub fn ticks(&self) -> u64 {
        (self.rollovers << 16) | self.offset as u64
    }
}

struct Inner<const N: usize> {
    /// While armed the head offset lives in the hardware counter and only its rollovers are kept.
    entries: Vec<Entry, N>,
    armed: bool,
    version: u32,
}

/// The list captured outside of a pending rollover.
struct Snapshot<const N: usize> {
    entries: Vec<Entry, N>,
    counter: u16,
    armed: bool,
    version: u32,
}

/// A schedule computed from a snapshot. The head holds its full ticks from the snapshot time.
struct Plan<const N: usize> {
    entries: Vec<Entry, N>,
    counter: u16,
    armed: bool,
    version: u32,
}

pub struct TimeoutTimer<const N: usize = 4> {
    inner: Mutex<RefCell<Inner<N>>>,
}

impl<const N: usize> Default for TimeoutTimer<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Load the counter so that it rolls over in `ticks` and return the additional full periods.
fn program<H: CountdownTimer + ?Sized>(hw: &mut H, ticks: u64) -> u64 {
    let ticks = ticks.max(1);
    let first = (ticks - 1) % PERIOD + 1;
    hw.set_counter((PERIOD - first) as u16);
    (ticks - 1) / PERIOD
}

/// Insert a deadline into a list of relative entries.
///
/// `head` is the remaining ticks of the first entry. Cancelled entries are dropped, their ticks
/// are absorbed into the following entry.
fn schedule<const N: usize>(
    entries: &[Entry],
    head: u64,
    instrument: Instrument,
    ticks: u64,
) -> Result<Vec<Entry, N>, Error> {
    let mut deadlines: Vec<(u64, Instrument), N> = Vec::new();
    let mut deadline = 0;
    for (i, entry) in entries.iter().enumerate() {
        deadline += if i == 0 { head } else { entry.ticks() };
        let Some(inst) = entry.instrument else {
            continue;
        };
        if inst == instrument {
            return Err(Error::Duplicate);
        }
        // Capacity is shared with the source list.
        deadlines.push((deadline, inst)).map_err(|_| Error::Full)?;
    }
    let pos = deadlines.partition_point(|(d, _)| *d <= ticks);
    deadlines
        .insert(pos, (ticks, instrument))
        .map_err(|_| Error::Full)?;

    let mut out = Vec::new();
    let mut previous = 0;
    for (d, inst) in deadlines {
        // Same length as `deadlines`
        out.push(Entry::new(d - previous, Some(inst)))
            .map_err(|_| Error::Full)?;
        previous = d;
    }
    Ok(out)
}

impl<const N: usize> TimeoutTimer<N> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                entries: Vec::new(),
                armed: false,
                version: 0,
            })),
        }
    }

    /// Schedule halting `instrument` `ticks` from now, or from [Self::start] if not yet armed.
    pub fn add<H: CountdownTimer + ?Sized>(
        &self,
        hw: &mut H,
        instrument: Instrument,
        ticks: u64,
    ) -> Result<(), Error> {
        if ticks == 0 {
            return Err(Error::ZeroTicks);
        }
        loop {
            let Some(snapshot) = self.snapshot(hw) else {
                continue;
            };
            let plan = Self::plan(&snapshot, instrument, ticks)?;
            if self.commit(hw, plan) {
                return Ok(());
            }
        }
    }

    fn snapshot<H: CountdownTimer + ?Sized>(
        &self,
        hw: &mut H,
    ) -> Option<Snapshot<N>> {
        critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            if inner.armed && hw.rollover_pending() {
                return None;
            }
            Some(Snapshot {
                entries: inner.entries.clone(),
                counter: hw.counter(),
                armed: inner.armed,
                version: inner.version,
            })
        })
    }

    fn plan(
        snapshot: &Snapshot<N>,
        instrument: Instrument,
        ticks: u64,
    ) -> Result<Plan<N>, Error> {
        let head = snapshot.entries.first().map_or(0, |e| {
            if snapshot.armed {
                (PERIOD - snapshot.counter as u64) + e.rollovers * PERIOD
            } else {
                e.ticks()
            }
        });
        Ok(Plan {
            entries: schedule(&snapshot.entries, head, instrument, ticks)?,
            counter: snapshot.counter,
            armed: snapshot.armed,
            version: snapshot.version,
        })
    }

    fn commit<H: CountdownTimer + ?Sized>(
        &self,
        hw: &mut H,
        mut plan: Plan<N>,
    ) -> bool {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.version != plan.version || inner.armed != plan.armed {
                return false;
            }
            if !plan.armed {
                inner.entries = plan.entries;
                inner.version = inner.version.wrapping_add(1);
                return true;
            }
            let counter = hw.counter();
            if hw.rollover_pending() || counter > u16::MAX - ROLLOVER_MARGIN {
                return false;
            }
            let elapsed = counter.wrapping_sub(plan.counter) as u64;
            let Some(head) = plan.entries.first().copied() else {
                return false;
            };
            let due = head.ticks().saturating_sub(elapsed);
            let remaining = due.max(ROLLOVER_MARGIN as u64);
            if let Some(next) = plan.entries.get_mut(1) {
                let ticks = next.ticks().saturating_sub(remaining - due);
                *next = Entry::new(ticks, next.instrument);
            }
            let rollovers = program(hw, remaining);
            if let Some(first) = plan.entries.first_mut() {
                first.rollovers = rollovers;
                first.offset = 0;
            }
            inner.entries = plan.entries;
            inner.version = inner.version.wrapping_add(1);
            true
        })
    }

    /// Arm the timer for the scheduled entries.
    ///
    /// # Returns
    /// False if already armed or nothing is scheduled.
    pub fn start<H: CountdownTimer + ?Sized>(&self, hw: &mut H) -> bool {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.armed {
                return false;
            }
            // Fold cancelled entries into their successors.
            let mut entries: Vec<Entry, N> = Vec::new();
            let mut carry = 0;
            for entry in inner.entries.iter() {
                carry += entry.ticks();
                if entry.instrument.is_some() {
                    entries.push(Entry::new(carry, entry.instrument)).ok();
                    carry = 0;
                }
            }
            let Some(head) = entries.first_mut() else {
                inner.entries.clear();
                return false;
            };
            hw.disable();
            hw.clear_rollover();
            head.rollovers = program(hw, head.ticks());
            head.offset = 0;
            hw.enable();
            inner.entries = entries;
            inner.armed = true;
            inner.version = inner.version.wrapping_add(1);
            true
        })
    }

    /// Cancel the timeout of an instrument without halting it.
    ///
    /// # Returns
    /// Whether the instrument had a timeout.
    pub fn cancel(&self, instrument: Instrument) -> bool {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let Some(entry) = inner
                .entries
                .iter_mut()
                .find(|e| e.instrument == Some(instrument))
            else {
                return false;
            };
            entry.instrument = None;
            inner.version = inner.version.wrapping_add(1);
            true
        })
    }

    /// Halt every scheduled instrument now and disarm.
    pub fn abort<H: CountdownTimer + Halt + ?Sized>(&self, hw: &mut H) {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            hw.disable();
            hw.clear_rollover();
            for instrument in
                inner.entries.iter().filter_map(|e| e.instrument)
            {
                hw.halt(instrument);
            }
            inner.entries.clear();
            inner.armed = false;
            inner.version = inner.version.wrapping_add(1);
        })
    }

    /// Countdown timer rollover interrupt handler.
    pub fn on_rollover<H: CountdownTimer + Halt + ?Sized>(&self, hw: &mut H) {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            inner.version = inner.version.wrapping_add(1);
            hw.clear_rollover();
            if !inner.armed {
                hw.disable();
                return;
            }

            // Ticks since the deadline that just expired.
            let mut late = hw.counter() as u64;
            loop {
                let Some(head) = inner.entries.first_mut() else {
                    hw.disable();
                    inner.armed = false;
                    return;
                };
                if head.rollovers > 0 {
                    head.rollovers -= 1;
                    return;
                }
                let expired = inner.entries.remove(0);
                if let Some(instrument) = expired.instrument {
                    hw.halt(instrument);
                }

                let Some(next) = inner.entries.first_mut() else {
                    hw.disable();
                    inner.armed = false;
                    return;
                };
                let ticks = next.ticks();
                if ticks <= late {
                    // Already due
                    late -= ticks;
                    next.rollovers = 0;
                    continue;
                }
                next.rollovers = program(hw, ticks - late);
                next.offset = 0;
                return;
            }
        })
    }

    pub fn is_armed(&self) -> bool {
        critical_section::with(|cs| self.inner.borrow_ref(cs).armed)
    }

    pub fn contains(&self, instrument: Instrument) -> bool {
        critical_section::with(|cs| {
            self.inner
                .borrow_ref(cs)
                .entries
                .iter()
                .any(|e| e.instrument == Some(instrument))
        })
    }

    /// Scheduled instruments with their ticks from now (from start when not armed), in order.
    pub fn pending<H: CountdownTimer + ?Sized>(
        &self,
        hw: &H,
    ) -> Vec<(Instrument, u64), N> {
        critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            let mut out = Vec::new();
            let mut deadline = 0;
            for (i, entry) in inner.entries.iter().enumerate() {
                deadline += if i == 0 && inner.armed {
                    (PERIOD - hw.counter() as u64) + entry.rollovers * PERIOD
                } else {
                    entry.ticks()
                };
                if let Some(instrument) = entry.instrument {
                    out.push((instrument, deadline)).ok();
                }
            }
            out
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::SimTimer;
    use rand_core::{RngCore, SeedableRng};
    use rand_xorshift::XorShiftRng;
    use Instrument::*;

    #[test]
    fn reverse_order() {
        let mux: TimeoutTimer = TimeoutTimer::new();
        let mut hw = SimTimer::default();
        mux.add(&mut hw, LogicAnalyzer, 70_000).unwrap();
        mux.add(&mut hw, Osc1, 5000).unwrap();
        assert_eq!(
            mux.pending(&hw).as_slice(),
            &[(Osc1, 5000), (LogicAnalyzer, 70_000)]
        );
        assert!(mux.start(&mut hw));
        assert!(!mux.start(&mut hw));
        hw.run(&mux, 100_000);
        assert_eq!(hw.halts, [(Osc1, 5000), (LogicAnalyzer, 70_000)]);
        assert!(!mux.is_armed());
        assert!(!hw.enabled);
    }

    #[test]
    fn any_order() {
        let mut rng = XorShiftRng::seed_from_u64(0x7123);
        for _ in 0..200 {
            let mux: TimeoutTimer = TimeoutTimer::new();
            let mut hw = SimTimer::default();
            let mut order = [Osc1, Osc2, LogicAnalyzer];
            order.swap(0, rng.next_u32() as usize % 3);
            order.swap(1, 1 + rng.next_u32() as usize % 2);
            let mut expect = std::vec::Vec::new();
            for inst in order {
                let ticks = 1 + rng.next_u64() % 300_000;
                mux.add(&mut hw, inst, ticks).unwrap();
                expect.push((inst, ticks));
            }
            let deadlines: std::vec::Vec<_> =
                mux.pending(&hw).iter().map(|(_, t)| *t).collect();
            assert!(deadlines.windows(2).all(|w| w[0] <= w[1]));

            mux.start(&mut hw);
            hw.run(&mux, 400_000);
            expect.sort_by_key(|(_, t)| *t);
            assert_eq!(hw.halts.len(), 3);
            for (inst, t) in expect {
                assert!(hw.halts.contains(&(inst, t)), "{inst:?} at {t}");
            }
            assert!(hw.halts.windows(2).all(|w| w[0].1 <= w[1].1));
        }
    }

    #[test]
    fn add_while_armed() {
        let mux: TimeoutTimer = TimeoutTimer::new();
        let mut hw = SimTimer::default();
        mux.add(&mut hw, LogicAnalyzer, 100_000).unwrap();
        mux.start(&mut hw);
        hw.run(&mux, 30_000);
        assert_eq!(mux.pending(&hw).as_slice(), &[(LogicAnalyzer, 70_000)]);
        mux.add(&mut hw, Osc1, 20_000).unwrap();
        mux.add(&mut hw, Osc2, 100_000).unwrap();
        assert_eq!(mux.add(&mut hw, Osc2, 10), Err(Error::Duplicate));
        hw.run(&mux, 200_000);
        assert_eq!(
            hw.halts,
            [(Osc1, 50_000), (LogicAnalyzer, 100_000), (Osc2, 130_000)]
        );
    }

    #[test]
    fn imminent_deadline_is_deferred() {
        let mux: TimeoutTimer = TimeoutTimer::new();
        let mut hw = SimTimer::default();
        mux.add(&mut hw, LogicAnalyzer, 100_000).unwrap();
        mux.start(&mut hw);
        hw.run(&mux, 10);
        mux.add(&mut hw, Osc1, 50).unwrap();
        hw.run(&mux, 200_000);
        assert_eq!(
            hw.halts,
            [(Osc1, 10 + ROLLOVER_MARGIN as u64), (LogicAnalyzer, 100_000)]
        );
    }

    #[test]
    fn cancel_keeps_schedule() {
        let mux: TimeoutTimer = TimeoutTimer::new();
        let mut hw = SimTimer::default();
        mux.add(&mut hw, Osc1, 10_000).unwrap();
        mux.add(&mut hw, Osc2, 40_000).unwrap();
        mux.add(&mut hw, LogicAnalyzer, 90_000).unwrap();
        assert!(mux.cancel(Osc2));
        assert!(!mux.cancel(Osc2));
        assert!(!mux.contains(Osc2));
        mux.start(&mut hw);
        hw.run(&mux, 100_000);
        assert_eq!(hw.halts, [(Osc1, 10_000), (LogicAnalyzer, 90_000)]);
    }

    #[test]
    fn cancel_while_armed() {
        let mux: TimeoutTimer = TimeoutTimer::new();
        let mut hw = SimTimer::default();
        mux.add(&mut hw, Osc1, 10_000).unwrap();
        mux.add(&mut hw, Osc2, 80_000).unwrap();
        mux.add(&mut hw, LogicAnalyzer, 150_000).unwrap();
        mux.start(&mut hw);
        hw.run(&mux, 1000);
        assert!(mux.cancel(Osc1));
        assert!(mux.cancel(Osc2));
        hw.run(&mux, 200_000);
        assert_eq!(hw.halts, [(LogicAnalyzer, 150_000)]);
    }

    #[test]
    fn cancelled_head_then_add() {
        let mux: TimeoutTimer = TimeoutTimer::new();
        let mut hw = SimTimer::default();
        mux.add(&mut hw, Osc1, 10_000).unwrap();
        mux.add(&mut hw, Osc2, 40_000).unwrap();
        mux.start(&mut hw);
        mux.cancel(Osc1);
        hw.run(&mux, 500);
        // The cancelled head is dropped and the instrument can be scheduled again.
        mux.add(&mut hw, Osc1, 30_000).unwrap();
        mux.add(&mut hw, LogicAnalyzer, 19_500).unwrap();
        hw.run(&mux, 100_000);
        assert_eq!(
            hw.halts,
            [(LogicAnalyzer, 20_000), (Osc1, 30_500), (Osc2, 40_000)]
        );
    }

    #[test]
    fn abort_is_idempotent() {
        let mux: TimeoutTimer = TimeoutTimer::new();
        let mut hw = SimTimer::default();
        mux.add(&mut hw, Osc1, 10_000).unwrap();
        mux.add(&mut hw, Osc2, 20_000).unwrap();
        mux.start(&mut hw);
        hw.run(&mux, 5);
        mux.abort(&mut hw);
        mux.abort(&mut hw);
        hw.run(&mux, 100_000);
        assert_eq!(hw.halts, [(Osc1, 5), (Osc2, 5)]);
        assert!(!mux.is_armed());
        assert!(mux.pending(&hw).is_empty());
        assert!(!mux.start(&mut hw));
    }

    #[test]
    fn limits() {
        let mux = TimeoutTimer::<2>::new();
        let mut hw = SimTimer::default();
        assert_eq!(mux.add(&mut hw, Osc1, 0), Err(Error::ZeroTicks));
        mux.add(&mut hw, Osc1, 1).unwrap();
        mux.add(&mut hw, Osc2, 2).unwrap();
        assert_eq!(mux.add(&mut hw, LogicAnalyzer, 3), Err(Error::Full));
        assert_eq!(mux.add(&mut hw, Osc1, 3), Err(Error::Duplicate));
        // Equal deadlines fire together.
        let mux: TimeoutTimer = TimeoutTimer::new();
        mux.add(&mut hw, Osc1, 1).unwrap();
        mux.add(&mut hw, Osc2, 1).unwrap();
        mux.start(&mut hw);
        hw.run(&mux, 10);
        assert_eq!(hw.halts, [(Osc1, 1), (Osc2, 1)]);
    }

    #[test]
    fn retry_on_rollover() {
        let mux: TimeoutTimer = TimeoutTimer::new();
        let mut hw = SimTimer::default();
        mux.add(&mut hw, LogicAnalyzer, 300_000).unwrap();
        mux.start(&mut hw);

        hw.pending = true;
        assert!(mux.snapshot(&mut hw).is_none());
        hw.pending = false;

        // A rollover serviced between snapshot and commit invalidates the plan.
        let snapshot = mux.snapshot(&mut hw).unwrap();
        let plan = TimeoutTimer::plan(&snapshot, Osc1, 50_000).unwrap();
        hw.run(&mux, 40_000);
        assert!(!mux.commit(&mut hw, plan));

        // So does a counter about to roll over.
        hw.run(&mux, 65_536 - 100 - hw.counter as u64);
        let snapshot = mux.snapshot(&mut hw).unwrap();
        let plan = TimeoutTimer::plan(&snapshot, Osc1, 50_000).unwrap();
        assert!(!mux.commit(&mut hw, plan));

        let snapshot = mux.snapshot(&mut hw).unwrap();
        hw.run(&mux, 200);
        let plan = TimeoutTimer::plan(&snapshot, Osc1, 1000).unwrap();
        assert!(!mux.commit(&mut hw, plan));

        // Ticks elapsed since the snapshot are accounted for.
        let snapshot = mux.snapshot(&mut hw).unwrap();
        let plan = TimeoutTimer::plan(&snapshot, Osc1, 1000).unwrap();
        let at = hw.now;
        hw.run(&mux, 30);
        assert!(mux.commit(&mut hw, plan));
        hw.run(&mux, 300_000);
        assert_eq!(hw.halts, [(Osc1, at + 1000), (LogicAnalyzer, 300_000)]);
    }
}

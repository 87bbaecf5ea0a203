//! Simulated cartridge bus.
//!
//! The firmware's service loops poll the bus; [`SimBus`] feeds them scripted
//! transactions instead of electrical signals. Every scripted cycle is
//! presented as a run of PHI2-high samples followed by PHI2-low samples,
//! wide enough to satisfy every polling pattern in the loops, and whatever
//! the firmware drove during the cycle is recorded. When the script (and
//! the optional refill source) runs dry the bus reports reset, which is how
//! the otherwise non-returning loops are unwound host-side.

use std::collections::VecDeque;

use crate::cart::bus::{Bus, BusSample, CCTL, OverlayLine, PHI2, RST, RW, S4, S5};
use crate::cart::mailbox::CMD_TRIGGER;

/// Samples presented per phase of each scripted cycle. Three high samples
/// cover the deepest polling chain (wait-for-high plus a data latch); two
/// low samples cover the trailing wait-for-low of the next iteration.
const HIGH_POLLS: u8 = 3;
const LOW_POLLS: u8 = 2;

const DESELECTED: u8 = S4 | S5 | CCTL;

/// One host bus transaction: the control lines, address and (for writes)
/// data held stable across a full PHI2 cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cycle {
    pub ctrl: u8,
    pub addr: u16,
    pub data: u8,
}

impl Cycle {
    pub fn idle() -> Cycle {
        Cycle { ctrl: DESELECTED | RW, addr: 0, data: 0 }
    }

    /// Read in the /S4 window; `addr` is the 13-bit window address.
    pub fn s4_read(addr: u16) -> Cycle {
        Cycle { ctrl: (DESELECTED & !S4) | RW, addr: addr & 0x1FFF, data: 0 }
    }

    pub fn s5_read(addr: u16) -> Cycle {
        Cycle { ctrl: (DESELECTED & !S5) | RW, addr: addr & 0x1FFF, data: 0 }
    }

    /// Read of control-space register $D5xx.
    pub fn cctl_read(offset: u8) -> Cycle {
        Cycle { ctrl: (DESELECTED & !CCTL) | RW, addr: 0x1500 | offset as u16, data: 0 }
    }

    pub fn cctl_write(offset: u8, value: u8) -> Cycle {
        Cycle { ctrl: DESELECTED & !CCTL, addr: 0x1500 | offset as u16, data: value }
    }
}

/// A completed transaction: the cycle, what the firmware drove during it
/// (if anything), and the overlay line levels as the cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Served {
    pub cycle: Cycle,
    pub driven: Option<u8>,
    pub rd4: bool,
    pub rd5: bool,
}

/// Produces further bus cycles once the queued script is exhausted.
/// `completed` holds every transaction finished since the previous call;
/// returning `None` asserts reset.
pub trait CycleSource {
    fn next_batch(&mut self, completed: &[Served]) -> Option<Vec<Cycle>>;
}

pub struct SimBus {
    queue: VecDeque<Cycle>,
    source: Option<Box<dyn CycleSource>>,
    current: Option<Cycle>,
    in_high: bool,
    high_polls: u8,
    low_polls: u8,
    driven: Option<u8>,
    output_mode: bool,
    served: Vec<Served>,
    reported: usize,
    done: bool,
    rd4: bool,
    rd5: bool,
}

impl SimBus {
    pub fn new(script: Vec<Cycle>) -> SimBus {
        SimBus::build(script, None)
    }

    pub fn with_source(source: Box<dyn CycleSource>) -> SimBus {
        SimBus::build(Vec::new(), Some(source))
    }

    fn build(script: Vec<Cycle>, source: Option<Box<dyn CycleSource>>) -> SimBus {
        SimBus {
            queue: script.into(),
            source,
            current: None,
            in_high: true,
            high_polls: 0,
            low_polls: 0,
            driven: None,
            output_mode: false,
            served: Vec::new(),
            reported: 0,
            done: false,
            rd4: false,
            rd5: false,
        }
    }

    /// Every transaction completed so far, in script order.
    pub fn served(&self) -> &[Served] {
        &self.served
    }

    pub fn rd4(&self) -> bool {
        self.rd4
    }

    pub fn rd5(&self) -> bool {
        self.rd5
    }

    fn advance(&mut self) -> bool {
        if self.queue.is_empty() {
            if let Some(mut source) = self.source.take() {
                let batch = source.next_batch(&self.served[self.reported..]);
                self.reported = self.served.len();
                match batch {
                    Some(cycles) => {
                        self.queue.extend(cycles);
                        self.source = Some(source);
                    }
                    None => return false,
                }
            }
        }
        match self.queue.pop_front() {
            Some(cycle) => {
                self.current = Some(cycle);
                self.in_high = true;
                self.high_polls = 0;
                self.low_polls = 0;
                self.driven = None;
                true
            }
            None => false,
        }
    }

    fn finish_current(&mut self) {
        if let Some(cycle) = self.current.take() {
            self.served.push(Served {
                cycle,
                driven: self.driven.take(),
                rd4: self.rd4,
                rd5: self.rd5,
            });
        }
    }

    fn live_sample(cycle: Cycle, high: bool) -> BusSample {
        let phase = if high { PHI2 } else { 0 };
        BusSample {
            ctrl: (cycle.ctrl & !(PHI2 | RST)) | phase,
            addr: cycle.addr,
            data: cycle.data,
        }
    }

    fn reset_sample() -> BusSample {
        BusSample { ctrl: RST | DESELECTED | RW, addr: 0, data: 0 }
    }
}

impl Bus for SimBus {
    fn sample(&mut self) -> BusSample {
        loop {
            if self.done {
                return SimBus::reset_sample();
            }
            let Some(cycle) = self.current else {
                if !self.advance() {
                    self.done = true;
                }
                continue;
            };
            if self.in_high {
                if self.high_polls < HIGH_POLLS {
                    self.high_polls += 1;
                    return SimBus::live_sample(cycle, true);
                }
                self.in_high = false;
            }
            if self.low_polls < LOW_POLLS {
                self.low_polls += 1;
                return SimBus::live_sample(cycle, false);
            }
            self.finish_current();
        }
    }

    fn drive_data(&mut self, value: u8) {
        self.output_mode = true;
        if self.current.is_some() {
            self.driven = Some(value);
        }
    }

    fn release_data(&mut self) {
        self.output_mode = false;
    }

    fn set_overlay(&mut self, line: OverlayLine, high: bool) {
        match line {
            OverlayLine::Rd4 => self.rd4 = high,
            OverlayLine::Rd5 => self.rd5 = high,
        }
    }
}

/// Cycles that issue one mailbox command: parameter writes at their offsets
/// followed by the opcode written to the trigger register.
pub fn command_cycles(opcode: u8, params: &[(u8, u8)]) -> Vec<Cycle> {
    let mut cycles: Vec<Cycle> = params
        .iter()
        .map(|&(offset, value)| Cycle::cctl_write(offset, value))
        .collect();
    cycles.push(Cycle::cctl_write(CMD_TRIGGER, opcode));
    cycles
}

/// Reads of `len` consecutive mailbox bytes from `offset`.
pub fn read_mailbox_cycles(offset: u8, len: usize) -> Vec<Cycle> {
    (0..len)
        .map(|i| Cycle::cctl_read(offset.wrapping_add(i as u8)))
        .collect()
}

/// Parameter list placing a NUL-terminated string at mailbox offset 0.
pub fn string_param(s: &str) -> Vec<(u8, u8)> {
    let mut params: Vec<(u8, u8)> = s
        .bytes()
        .take(31)
        .enumerate()
        .map(|(i, b)| (i as u8, b))
        .collect();
    params.push((params.len() as u8, 0));
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_cycles_phase_through_high_then_low() {
        let mut bus = SimBus::new(vec![Cycle::s5_read(0x0040)]);
        for _ in 0..HIGH_POLLS {
            let s = bus.sample();
            assert!(s.phi2_high());
            assert!(s.s5_asserted());
            assert_eq!(s.window_addr(), 0x0040);
        }
        for _ in 0..LOW_POLLS {
            assert!(!bus.sample().phi2_high());
        }
        assert!(bus.sample().reset_asserted());
        assert_eq!(bus.served().len(), 1);
    }

    #[test]
    fn driven_byte_is_recorded_per_transaction() {
        let mut bus = SimBus::new(vec![Cycle::cctl_read(0x00), Cycle::idle()]);
        bus.sample();
        bus.drive_data(0x11);
        while !bus.sample().reset_asserted() {}
        assert_eq!(bus.served()[0].driven, Some(0x11));
        assert_eq!(bus.served()[1].driven, None);
    }

    #[test]
    fn source_refills_and_sees_completed_batch() {
        struct Echo {
            rounds: u8,
        }
        impl CycleSource for Echo {
            fn next_batch(&mut self, completed: &[Served]) -> Option<Vec<Cycle>> {
                match self.rounds {
                    0 => {
                        assert!(completed.is_empty());
                        self.rounds = 1;
                        Some(vec![Cycle::idle(), Cycle::idle()])
                    }
                    1 => {
                        assert_eq!(completed.len(), 2);
                        self.rounds = 2;
                        None
                    }
                    _ => None,
                }
            }
        }

        let mut bus = SimBus::with_source(Box::new(Echo { rounds: 0 }));
        while !bus.sample().reset_asserted() {}
        assert_eq!(bus.served().len(), 2);
    }

    #[test]
    fn command_cycles_end_with_the_trigger_write() {
        let cycles = command_cycles(0x01, &[(0x00, 0x07)]);
        assert_eq!(cycles.len(), 2);
        assert_eq!(cycles[1], Cycle::cctl_write(CMD_TRIGGER, 0x01));
    }
}

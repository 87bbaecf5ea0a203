//! Real-time cartridge mapper emulation.
//!
//! Once the host activates a cartridge image the firmware stops being a
//! mailbox and becomes the cartridge: every PHI2 cycle it decodes the
//! select lines and answers reads from the memory banks under the active
//! mapper's bank-selection rule. [`service_loop`] owns the cycle timing
//! (wait for PHI2 high, serve, wait for PHI2 low, release); each [`Mapper`]
//! implementation only supplies the mapping rule and its bank state.

use crate::cart::bus::{Bus, OverlayLine, latch_data, wait_phi2_high, wait_phi2_low};
use crate::cart::{BANK_LEN, CartMemory, CartType};

const BANK_4K: usize = 0x1000;
const BANK_8K: usize = 0x2000;
const BANK_16K: usize = 0x4000;

/// Current levels of the two overlay select lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overlay {
    pub rd4: bool,
    pub rd5: bool,
}

impl Overlay {
    pub const NONE: Overlay = Overlay { rd4: false, rd5: false };
    pub const RD5: Overlay = Overlay { rd4: false, rd5: true };
    pub const BOTH: Overlay = Overlay { rd4: true, rd5: true };
}

/// One cartridge class's bank-selection rule.
///
/// `s4_read`/`s5_read` get the 13-bit window address and may mutate bank
/// state (some carts switch banks on reads of trigger addresses). Returning
/// `None` leaves the data lines alone, which is how a disabled overlay
/// reports "no data". `cctl_*` handle accesses in the $D5xx control space;
/// several carts decode only the address there, for reads and writes alike.
pub trait Mapper {
    fn overlay(&self) -> Overlay;

    fn s4_read(&mut self, _addr: u16, _mem: &CartMemory) -> Option<u8> {
        None
    }

    fn s5_read(&mut self, _addr: u16, _mem: &CartMemory) -> Option<u8> {
        None
    }

    fn cctl_read(&mut self, _offset: u8, _mem: &CartMemory) -> Option<u8> {
        None
    }

    /// Control-space write with the value latched at the falling edge.
    fn cctl_write(&mut self, _offset: u8, _value: u8) {}
}

/// Build the mapper for a cartridge class. `None` means the class has no
/// bus personality of its own (no cartridge, or ATR disk mode, which is
/// serviced by the mailbox protocol instead).
pub fn for_type(kind: CartType) -> Option<Box<dyn Mapper>> {
    let mapper: Box<dyn Mapper> = match kind {
        CartType::None | CartType::Atr => return None,
        CartType::Std8k => Box::new(Standard8k),
        CartType::Std16k => Box::new(Standard16k),
        CartType::Xegs32k => Box::new(Xegs::new(0x03, 0x6000, false)),
        CartType::Xegs64k => Box::new(Xegs::new(0x07, 0xE000, false)),
        CartType::Xegs128k => Box::new(Xegs::new(0x0F, BANK_LEN + 0xE000, false)),
        CartType::SwXegs32k => Box::new(Xegs::new(0x03, 0x6000, true)),
        CartType::SwXegs64k => Box::new(Xegs::new(0x07, 0xE000, true)),
        CartType::SwXegs128k => Box::new(Xegs::new(0x0F, BANK_LEN + 0xE000, true)),
        CartType::Megacart16k => Box::new(Megacart::new(0x00)),
        CartType::Megacart32k => Box::new(Megacart::new(0x01)),
        CartType::Megacart64k => Box::new(Megacart::new(0x03)),
        CartType::Megacart128k => Box::new(Megacart::new(0x07)),
        CartType::BountyBob => Box::new(BountyBob::new()),
        CartType::Atarimax1Mbit => Box::new(Atarimax::new()),
        CartType::Williams => Box::new(Williams::new()),
        CartType::OssTypeB16k | CartType::Oss8k => Box::new(OssTypeB::new()),
        CartType::Oss034m => Box::new(OssTypeA::new(true)),
        CartType::Oss043m => Box::new(OssTypeA::new(false)),
        CartType::Sic128k => Box::new(Sic::new()),
        CartType::Sdx64k => Box::new(Sdx::new(false)),
        CartType::Sdx128k => Box::new(Sdx::new(true)),
        CartType::Diamond64k => Box::new(DiamondExpress::new(0xD0)),
        CartType::Express64k => Box::new(DiamondExpress::new(0x70)),
        CartType::Blizzard16k => Box::new(Blizzard::new()),
        CartType::Xex => Box::new(XexLoader::new()),
    };
    Some(mapper)
}

/// Hand the bus to the mapper for `kind`. Returns only when the host asserts
/// reset. With no mapper to run, both overlay lines are dropped and the
/// firmware parks until reset.
pub fn emulate(kind: CartType, mem: &mut CartMemory, bus: &mut dyn Bus) {
    match for_type(kind) {
        Some(mut mapper) => service_loop(mapper.as_mut(), mem, bus),
        None => park(bus),
    }
}

fn park(bus: &mut dyn Bus) {
    bus.set_overlay(OverlayLine::Rd4, false);
    bus.set_overlay(OverlayLine::Rd5, false);
    loop {
        if bus.sample().reset_asserted() {
            return;
        }
    }
}

fn apply_overlay(bus: &mut dyn Bus, overlay: Overlay) {
    bus.set_overlay(OverlayLine::Rd4, overlay.rd4);
    bus.set_overlay(OverlayLine::Rd5, overlay.rd5);
}

/// The shared per-cycle service loop. Must finish its read-side response
/// within one PHI2 period: drive while the clock is high, hold to the
/// falling edge, release before the next cycle.
pub fn service_loop(mapper: &mut dyn Mapper, mem: &mut CartMemory, bus: &mut dyn Bus) {
    let mut overlay = mapper.overlay();
    apply_overlay(bus, overlay);

    loop {
        let Some(c) = wait_phi2_high(bus) else { return };
        let mut driving = false;

        if c.cctl_asserted() {
            let offset = c.cctl_offset();
            if c.is_read() {
                if let Some(value) = mapper.cctl_read(offset, mem) {
                    bus.drive_data(value);
                    driving = true;
                }
            } else {
                let Some(value) = latch_data(bus, c) else { return };
                mapper.cctl_write(offset, value);
            }
        } else if c.is_read() {
            let served = if c.s4_asserted() {
                mapper.s4_read(c.window_addr(), mem)
            } else if c.s5_asserted() {
                mapper.s5_read(c.window_addr(), mem)
            } else {
                None
            };
            if let Some(value) = served {
                bus.drive_data(value);
                driving = true;
            }
        }

        let done = wait_phi2_low(bus).is_none();
        if driving {
            bus.release_data();
        }
        if done {
            return;
        }

        let now = mapper.overlay();
        if now != overlay {
            overlay = now;
            apply_overlay(bus, overlay);
        }
    }
}

/// 8 KiB in the /S5 window, no bank register.
struct Standard8k;

impl Mapper for Standard8k {
    fn overlay(&self) -> Overlay {
        Overlay::RD5
    }

    fn s5_read(&mut self, addr: u16, mem: &CartMemory) -> Option<u8> {
        Some(mem.bank_a[addr as usize])
    }
}

/// 16 KiB split across both select windows.
struct Standard16k;

impl Mapper for Standard16k {
    fn overlay(&self) -> Overlay {
        Overlay::BOTH
    }

    fn s4_read(&mut self, addr: u16, mem: &CartMemory) -> Option<u8> {
        Some(mem.bank_a[addr as usize])
    }

    fn s5_read(&mut self, addr: u16, mem: &CartMemory) -> Option<u8> {
        Some(mem.bank_a[0x2000 | addr as usize])
    }
}

/// XEGS family: an 8 KiB switched window at /S4, a fixed window at /S5.
/// The switchable variants drop both overlay lines while the sign bit of
/// the bank register is set.
struct Xegs {
    bank: usize,
    bank_mask: u8,
    fixed_base: usize,
    switchable: bool,
    enabled: bool,
}

impl Xegs {
    fn new(bank_mask: u8, fixed_base: usize, switchable: bool) -> Self {
        Xegs { bank: 0, bank_mask, fixed_base, switchable, enabled: true }
    }
}

impl Mapper for Xegs {
    fn overlay(&self) -> Overlay {
        if self.enabled { Overlay::BOTH } else { Overlay::NONE }
    }

    fn s4_read(&mut self, addr: u16, mem: &CartMemory) -> Option<u8> {
        self.enabled
            .then(|| mem.flat(self.bank * BANK_8K + addr as usize))
    }

    fn s5_read(&mut self, addr: u16, mem: &CartMemory) -> Option<u8> {
        self.enabled.then(|| mem.flat(self.fixed_base + addr as usize))
    }

    fn cctl_write(&mut self, _offset: u8, value: u8) {
        self.bank = (value & self.bank_mask) as usize;
        if self.switchable {
            self.enabled = value & 0x80 == 0;
        }
    }
}

/// Megacart: one 16 KiB window spanning both select lines, sign bit of the
/// bank register removes the cartridge.
struct Megacart {
    bank: usize,
    bank_mask: u8,
    enabled: bool,
}

impl Megacart {
    fn new(bank_mask: u8) -> Self {
        Megacart { bank: 0, bank_mask, enabled: true }
    }
}

impl Mapper for Megacart {
    fn overlay(&self) -> Overlay {
        if self.enabled { Overlay::BOTH } else { Overlay::NONE }
    }

    fn s4_read(&mut self, addr: u16, mem: &CartMemory) -> Option<u8> {
        self.enabled
            .then(|| mem.flat(self.bank * BANK_16K + addr as usize))
    }

    fn s5_read(&mut self, addr: u16, mem: &CartMemory) -> Option<u8> {
        self.enabled
            .then(|| mem.flat(self.bank * BANK_16K + (0x2000 | addr as usize)))
    }

    fn cctl_write(&mut self, _offset: u8, value: u8) {
        self.bank = (value & self.bank_mask) as usize;
        self.enabled = value & 0x80 == 0;
    }
}

/// Bounty Bob: two independent 4 KiB windows in /S4 space, each switched by
/// reads of trigger addresses inside its own window, plus a fixed /S5 bank.
/// The trigger read itself is served from the outgoing bank.
struct BountyBob {
    bank_lo: usize,
    bank_hi: usize,
}

impl BountyBob {
    fn new() -> Self {
        BountyBob { bank_lo: 0, bank_hi: 0 }
    }
}

impl Mapper for BountyBob {
    fn overlay(&self) -> Overlay {
        Overlay::BOTH
    }

    fn s4_read(&mut self, addr: u16, mem: &CartMemory) -> Option<u8> {
        let offset = (addr & 0xFFF) as usize;
        if addr & 0x1000 != 0 {
            let value = mem.bank_a[0x4000 + self.bank_hi * BANK_4K + offset];
            match addr {
                0x1FF6 => self.bank_hi = 0,
                0x1FF7 => self.bank_hi = 1,
                0x1FF8 => self.bank_hi = 2,
                0x1FF9 => self.bank_hi = 3,
                _ => {}
            }
            Some(value)
        } else {
            let value = mem.bank_a[self.bank_lo * BANK_4K + offset];
            match addr {
                0x0FF6 => self.bank_lo = 0,
                0x0FF7 => self.bank_lo = 1,
                0x0FF8 => self.bank_lo = 2,
                0x0FF9 => self.bank_lo = 3,
                _ => {}
            }
            Some(value)
        }
    }

    fn s5_read(&mut self, addr: u16, mem: &CartMemory) -> Option<u8> {
        Some(mem.bank_a[0x8000 | addr as usize])
    }
}

/// Atarimax 1 Mbit: sixteen 8 KiB banks selected by the low address bits of
/// any control-space access; bit 4 of the address disables the cartridge.
struct Atarimax {
    bank: usize,
    enabled: bool,
}

impl Atarimax {
    fn new() -> Self {
        Atarimax { bank: 0, enabled: true }
    }

    fn select(&mut self, offset: u8) {
        if offset & 0xE0 == 0 {
            self.bank = (offset & 0x0F) as usize;
            self.enabled = offset & 0x10 == 0;
        }
    }
}

impl Mapper for Atarimax {
    fn overlay(&self) -> Overlay {
        Overlay { rd4: false, rd5: self.enabled }
    }

    fn s5_read(&mut self, addr: u16, mem: &CartMemory) -> Option<u8> {
        self.enabled
            .then(|| mem.flat(self.bank * BANK_8K + addr as usize))
    }

    fn cctl_read(&mut self, offset: u8, _mem: &CartMemory) -> Option<u8> {
        self.select(offset);
        None
    }

    fn cctl_write(&mut self, offset: u8, _value: u8) {
        self.select(offset);
    }
}

/// Williams 32K/64K: eight 8 KiB banks, address-only switching in $D50x.
struct Williams {
    bank: usize,
    enabled: bool,
}

impl Williams {
    fn new() -> Self {
        Williams { bank: 0, enabled: true }
    }

    fn select(&mut self, offset: u8) {
        if offset & 0xF0 == 0 {
            self.bank = (offset & 0x07) as usize;
            self.enabled = offset & 0x08 == 0;
        }
    }
}

impl Mapper for Williams {
    fn overlay(&self) -> Overlay {
        Overlay { rd4: false, rd5: self.enabled }
    }

    fn s5_read(&mut self, addr: u16, mem: &CartMemory) -> Option<u8> {
        self.enabled
            .then(|| mem.bank_a[self.bank * BANK_8K + addr as usize])
    }

    fn cctl_read(&mut self, offset: u8, _mem: &CartMemory) -> Option<u8> {
        self.select(offset);
        None
    }

    fn cctl_write(&mut self, offset: u8, _value: u8) {
        self.select(offset);
    }
}

/// OSS type B: 4 KiB bank 0 fixed in the window's upper half, switched bank
/// in the lower half. Bank selection decodes address bits 0 and 3 only.
struct OssTypeB {
    bank: usize,
    enabled: bool,
}

impl OssTypeB {
    fn new() -> Self {
        OssTypeB { bank: 1, enabled: true }
    }

    fn select(&mut self, offset: u8) {
        let a0 = offset & 0x01 != 0;
        let a3 = offset & 0x08 != 0;
        if a3 && !a0 {
            self.enabled = false;
        } else {
            self.enabled = true;
            self.bank = match (a3, a0) {
                (false, false) => 1,
                (false, true) => 3,
                _ => 2,
            };
        }
    }
}

impl Mapper for OssTypeB {
    fn overlay(&self) -> Overlay {
        Overlay { rd4: false, rd5: self.enabled }
    }

    fn s5_read(&mut self, addr: u16, mem: &CartMemory) -> Option<u8> {
        if !self.enabled {
            return None;
        }
        let value = if addr & 0x1000 != 0 {
            mem.bank_a[(addr & 0xFFF) as usize]
        } else {
            mem.bank_a[self.bank * BANK_4K + addr as usize]
        };
        Some(value)
    }

    fn cctl_read(&mut self, offset: u8, _mem: &CartMemory) -> Option<u8> {
        self.select(offset);
        None
    }

    fn cctl_write(&mut self, offset: u8, _value: u8) {
        self.select(offset);
    }
}

/// OSS type A (034M/043M): 4 KiB bank 3 fixed in the window's upper half;
/// the two layouts differ only in which address maps to which bank.
struct OssTypeA {
    bank: usize,
    is_034m: bool,
    enabled: bool,
}

impl OssTypeA {
    fn new(is_034m: bool) -> Self {
        OssTypeA { bank: 0, is_034m, enabled: true }
    }

    fn select(&mut self, offset: u8) {
        let n = offset & 0x0F;
        if n & 0x08 != 0 {
            self.enabled = false;
            return;
        }
        self.enabled = true;
        match n {
            0x0 => self.bank = 0,
            0x3 | 0x7 => self.bank = if self.is_034m { 1 } else { 2 },
            0x4 => self.bank = if self.is_034m { 2 } else { 1 },
            _ => {}
        }
    }
}

impl Mapper for OssTypeA {
    fn overlay(&self) -> Overlay {
        Overlay { rd4: false, rd5: self.enabled }
    }

    fn s5_read(&mut self, addr: u16, mem: &CartMemory) -> Option<u8> {
        if !self.enabled {
            return None;
        }
        let value = if addr & 0x1000 != 0 {
            mem.bank_a[addr as usize | 0x2000]
        } else {
            mem.bank_a[self.bank * BANK_4K + addr as usize]
        };
        Some(value)
    }

    fn cctl_read(&mut self, offset: u8, _mem: &CartMemory) -> Option<u8> {
        self.select(offset);
        None
    }

    fn cctl_write(&mut self, offset: u8, _value: u8) {
        self.select(offset);
    }
}

/// SIC 128K: a readable control byte with independent enables for each
/// overlay line and a 16 KiB bank window spanning both.
struct Sic {
    control: u8,
}

impl Sic {
    fn new() -> Self {
        Sic { control: 0 }
    }

    fn bank(&self) -> usize {
        (self.control & 0x07) as usize
    }
}

impl Mapper for Sic {
    fn overlay(&self) -> Overlay {
        Overlay {
            rd4: self.control & 0x20 != 0,
            rd5: self.control & 0x40 == 0,
        }
    }

    fn s4_read(&mut self, addr: u16, mem: &CartMemory) -> Option<u8> {
        (self.control & 0x20 != 0)
            .then(|| mem.flat(self.bank() * BANK_16K + addr as usize))
    }

    fn s5_read(&mut self, addr: u16, mem: &CartMemory) -> Option<u8> {
        (self.control & 0x40 == 0)
            .then(|| mem.flat(self.bank() * BANK_16K + (0x2000 | addr as usize)))
    }

    fn cctl_read(&mut self, offset: u8, _mem: &CartMemory) -> Option<u8> {
        (offset & 0xE0 == 0).then_some(self.control)
    }

    fn cctl_write(&mut self, offset: u8, value: u8) {
        if offset & 0xE0 == 0 {
            self.control = value;
        }
    }
}

/// SDX 64K/128K: bank from the complement of the low address bits in the
/// $D5Ex range (plus $D5Fx for the second bank array on 128K).
struct Sdx {
    window: usize,
    enabled: bool,
    dual: bool,
}

impl Sdx {
    fn new(dual: bool) -> Self {
        Sdx { window: 0, enabled: true, dual }
    }

    fn select(&mut self, offset: u8) {
        if offset & 0xF0 == 0xE0 {
            let base = if self.dual { BANK_LEN } else { 0 };
            self.window = base + (!offset & 0x07) as usize * BANK_8K;
            self.enabled = offset & 0x08 == 0;
        }
        if self.dual && offset & 0xF0 == 0xF0 {
            self.window = (!offset & 0x07) as usize * BANK_8K;
            self.enabled = offset & 0x08 == 0;
        }
    }
}

impl Mapper for Sdx {
    fn overlay(&self) -> Overlay {
        Overlay { rd4: false, rd5: self.enabled }
    }

    fn s5_read(&mut self, addr: u16, mem: &CartMemory) -> Option<u8> {
        self.enabled.then(|| mem.flat(self.window + addr as usize))
    }

    fn cctl_read(&mut self, offset: u8, _mem: &CartMemory) -> Option<u8> {
        self.select(offset);
        None
    }

    fn cctl_write(&mut self, offset: u8, _value: u8) {
        self.select(offset);
    }
}

/// Diamond and Express 64K: SDX-style complement banking at a different
/// control-space base.
struct DiamondExpress {
    window: usize,
    enabled: bool,
    cctl_base: u8,
}

impl DiamondExpress {
    fn new(cctl_base: u8) -> Self {
        DiamondExpress { window: 0, enabled: true, cctl_base }
    }

    fn select(&mut self, offset: u8) {
        if offset & 0xF0 == self.cctl_base {
            self.window = (!offset & 0x07) as usize * BANK_8K;
            self.enabled = offset & 0x08 == 0;
        }
    }
}

impl Mapper for DiamondExpress {
    fn overlay(&self) -> Overlay {
        Overlay { rd4: false, rd5: self.enabled }
    }

    fn s5_read(&mut self, addr: u16, mem: &CartMemory) -> Option<u8> {
        self.enabled
            .then(|| mem.bank_a[self.window + addr as usize])
    }

    fn cctl_read(&mut self, offset: u8, _mem: &CartMemory) -> Option<u8> {
        self.select(offset);
        None
    }

    fn cctl_write(&mut self, offset: u8, _value: u8) {
        self.select(offset);
    }
}

/// Blizzard 16K: two fixed windows; the first control-space access of any
/// kind removes the cartridge until it is reactivated.
struct Blizzard {
    enabled: bool,
}

impl Blizzard {
    fn new() -> Self {
        Blizzard { enabled: true }
    }
}

impl Mapper for Blizzard {
    fn overlay(&self) -> Overlay {
        if self.enabled { Overlay::BOTH } else { Overlay::NONE }
    }

    fn s4_read(&mut self, addr: u16, mem: &CartMemory) -> Option<u8> {
        self.enabled.then(|| mem.bank_a[addr as usize])
    }

    fn s5_read(&mut self, addr: u16, mem: &CartMemory) -> Option<u8> {
        self.enabled.then(|| mem.bank_a[0x2000 | addr as usize])
    }

    fn cctl_read(&mut self, _offset: u8, _mem: &CartMemory) -> Option<u8> {
        self.enabled = false;
        None
    }

    fn cctl_write(&mut self, _offset: u8, _value: u8) {
        self.enabled = false;
    }
}

/// XEX loader: no cartridge ROM at all. Control-space offsets 0 and 1 set a
/// 16-bit bank index selecting a 256-byte window over the banks, which the
/// loader running in host RAM reads back through the control space.
struct XexLoader {
    bank: u16,
}

impl XexLoader {
    fn new() -> Self {
        XexLoader { bank: 0 }
    }

    fn window(&self) -> usize {
        let base = if self.bank & 0xFF00 != 0 { BANK_LEN } else { 0 };
        base + (self.bank & 0x00FF) as usize * 0x100
    }
}

impl Mapper for XexLoader {
    fn overlay(&self) -> Overlay {
        Overlay::NONE
    }

    fn cctl_read(&mut self, offset: u8, mem: &CartMemory) -> Option<u8> {
        Some(mem.flat(self.window() + offset as usize))
    }

    fn cctl_write(&mut self, offset: u8, value: u8) {
        match offset {
            0 => self.bank = (self.bank & 0xFF00) | value as u16,
            1 => self.bank = (self.bank & 0x00FF) | ((value as u16) << 8),
            _ => {}
        }
    }
}

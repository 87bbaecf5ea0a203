//! Boot-ROM mailbox protocol.
//!
//! While no cartridge image is active the host runs a menu program out of
//! the 8 KiB boot image served at /S5, drops into its own RAM, and talks to
//! the firmware through the 256-byte mailbox mapped over the control space.
//! The host polls offset 0x00 until it reads the ready sentinel, writes any
//! command parameters from offset 0x00 up, and finally writes the opcode to
//! the trigger offset. That last write completes the command and hands
//! control back to the dispatch loop.

use crate::cart::CartMemory;
use crate::cart::bus::{Bus, OverlayLine, latch_data, wait_phi2_high, wait_phi2_low};

/// Sentinel the host polls for at mailbox offset 0x00.
pub const READY: u8 = 0x11;

/// Writing this mailbox offset ($D5DF) completes a command. Offsets above it
/// belong to the SDX mapper's control range and are never used for commands.
pub const CMD_TRIGGER: u8 = 0xDF;

/// One past the last mailbox offset a response may occupy.
pub const CMD_WINDOW_END: usize = 0xE0;

pub const BOOT_ROM_LEN: usize = 0x2000;

/// Block until the host has written a full command and return its opcode,
/// or `None` if the host resets instead.
///
/// Every PHI2-high phase is serviced three ways: control-space reads are
/// answered from the mailbox, control-space writes are latched into it (the
/// trigger offset ending the loop), and /S5 reads are answered from the boot
/// image the host's menu code is executing from. In `atr_mode` RD5 is held
/// low so the host sees no cartridge ROM while disk commands are serviced.
pub fn await_command(
    bus: &mut dyn Bus,
    mem: &mut CartMemory,
    boot_rom: &[u8; BOOT_ROM_LEN],
    atr_mode: bool,
) -> Option<u8> {
    bus.set_overlay(OverlayLine::Rd5, !atr_mode);
    bus.set_overlay(OverlayLine::Rd4, false);
    mem.mailbox[0] = READY;

    loop {
        let c = wait_phi2_high(bus)?;

        if c.cctl_asserted() {
            let offset = c.cctl_offset();
            if c.is_read() {
                bus.drive_data(mem.mailbox[offset as usize]);
                wait_phi2_low(bus)?;
                bus.release_data();
            } else {
                let value = latch_data(bus, c)?;
                mem.mailbox[offset as usize] = value;
                if offset == CMD_TRIGGER {
                    return Some(value);
                }
            }
        }

        // The boot image stays visible in the same cycle loop so the host
        // can fall back into menu code the instant the mailbox is idle.
        if c.s5_asserted() && c.is_read() {
            bus.drive_data(boot_rom[c.window_addr() as usize]);
            wait_phi2_low(bus)?;
            bus.release_data();
        }
    }
}

/// Write a NUL-terminated response string, truncated so it never crosses the
/// end of the command window.
pub fn write_str(mailbox: &mut [u8; 256], offset: usize, s: &str) {
    let cap = CMD_WINDOW_END.saturating_sub(offset + 1);
    let n = s.len().min(cap);
    mailbox[offset..offset + n].copy_from_slice(&s.as_bytes()[..n]);
    mailbox[offset + n] = 0;
}

/// Read a NUL-terminated parameter string of at most `max` bytes.
pub fn read_str(mailbox: &[u8; 256], offset: usize, max: usize) -> String {
    let end = (offset + max).min(mailbox.len());
    let slice = &mailbox[offset..end];
    let len = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
    String::from_utf8_lossy(&slice[..len]).into_owned()
}

pub mod atr;
pub mod browse;
pub mod bus;
pub mod image;
pub mod mailbox;
pub mod mapper;

use std::path::PathBuf;

use atr::{DiskError, MountedAtr, PAGE_LEN};
use bus::Bus;
use image::LoadError;
use mailbox::{BOOT_ROM_LEN, write_str};

pub const BANK_LEN: usize = 0x10000;
pub const OS_ROM_LEN: usize = 0x4000;

/// OS image the host can pull in 128-byte chunks; looked up on the media
/// first, with the built-in image as fallback.
pub const SOFT_OS_FILENAME: &str = "ANODE_OS.ROM";

pub const CMD_OPEN_ITEM: u8 = 0x00;
pub const CMD_READ_CUR_DIR: u8 = 0x01;
pub const CMD_GET_DIR_ENTRY: u8 = 0x02;
pub const CMD_UP_DIR: u8 = 0x03;
pub const CMD_ROOT_DIR: u8 = 0x04;
pub const CMD_SEARCH: u8 = 0x05;
pub const CMD_LOAD_SOFT_OS: u8 = 0x10;
pub const CMD_SOFT_OS_CHUNK: u8 = 0x11;
pub const CMD_READ_ATR_SECTOR: u8 = 0x21;
pub const CMD_WRITE_ATR_SECTOR: u8 = 0x22;
pub const CMD_ATR_HEADER: u8 = 0x23;
pub const CMD_NO_CART: u8 = 0xFE;
pub const CMD_ACTIVATE_CART: u8 = 0xFF;

/// Everything the cartridge can address: the two 64 KiB banks holding the
/// image (or directory records, or loader payload) and the 256-byte mailbox
/// register file. Exactly one actor touches this at a time — the dispatch
/// loop between commands, or the active bus-facing loop.
pub struct CartMemory {
    pub bank_a: Box<[u8; BANK_LEN]>,
    pub bank_b: Box<[u8; BANK_LEN]>,
    pub mailbox: [u8; 256],
}

impl CartMemory {
    pub fn new() -> CartMemory {
        CartMemory {
            bank_a: Box::new([0; BANK_LEN]),
            bank_b: Box::new([0; BANK_LEN]),
            mailbox: [0; 256],
        }
    }

    /// The banks viewed as one flat 128 KiB image, for mappers whose bank
    /// register spans both. Offsets are masked into range.
    pub fn flat(&self, offset: usize) -> u8 {
        let offset = offset & (2 * BANK_LEN - 1);
        if offset < BANK_LEN {
            self.bank_a[offset]
        } else {
            self.bank_b[offset - BANK_LEN]
        }
    }
}

impl Default for CartMemory {
    fn default() -> Self {
        CartMemory::new()
    }
}

/// Every cartridge class the firmware can impersonate, plus the two
/// pseudo-classes: `Atr` (disk mode, serviced by the mailbox) and `Xex`
/// (the loader's paging window).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CartType {
    None,
    Std8k,
    Std16k,
    Xegs32k,
    Xegs64k,
    Xegs128k,
    SwXegs32k,
    SwXegs64k,
    SwXegs128k,
    Megacart16k,
    Megacart32k,
    Megacart64k,
    Megacart128k,
    BountyBob,
    Atarimax1Mbit,
    Williams,
    OssTypeB16k,
    Oss8k,
    Oss034m,
    Oss043m,
    Sic128k,
    Sdx64k,
    Sdx128k,
    Diamond64k,
    Express64k,
    Blizzard16k,
    Atr,
    Xex,
}

impl CartType {
    pub fn describe(self) -> &'static str {
        match self {
            CartType::None => "no cartridge",
            CartType::Std8k => "standard 8K",
            CartType::Std16k => "standard 16K",
            CartType::Xegs32k => "XEGS 32K",
            CartType::Xegs64k => "XEGS 64K",
            CartType::Xegs128k => "XEGS 128K",
            CartType::SwXegs32k => "switchable XEGS 32K",
            CartType::SwXegs64k => "switchable XEGS 64K",
            CartType::SwXegs128k => "switchable XEGS 128K",
            CartType::Megacart16k => "Megacart 16K",
            CartType::Megacart32k => "Megacart 32K",
            CartType::Megacart64k => "Megacart 64K",
            CartType::Megacart128k => "Megacart 128K",
            CartType::BountyBob => "Bounty Bob 40K",
            CartType::Atarimax1Mbit => "Atarimax 1 Mbit",
            CartType::Williams => "Williams 32K/64K",
            CartType::OssTypeB16k => "OSS 16K type B",
            CartType::Oss8k => "OSS 8K",
            CartType::Oss034m => "OSS 16K 034M",
            CartType::Oss043m => "OSS 16K 043M",
            CartType::Sic128k => "SIC! 128K",
            CartType::Sdx64k => "SpartaDOS X 64K",
            CartType::Sdx128k => "SpartaDOS X 128K",
            CartType::Diamond64k => "Diamond 64K",
            CartType::Express64k => "Express 64K",
            CartType::Blizzard16k => "Blizzard 16K",
            CartType::Atr => "ATR disk image",
            CartType::Xex => "XEX loader",
        }
    }
}

/// The firmware proper: memory, the boot and fallback OS images, and the
/// state the dispatch loop carries between commands.
pub struct Firmware {
    pub mem: CartMemory,
    boot_rom: Box<[u8; BOOT_ROM_LEN]>,
    os_rom: Box<[u8; OS_ROM_LEN]>,
    root: PathBuf,
    cur_path: String,
    pending_path: String,
    cart_type: CartType,
    atr_mode: bool,
    mounted: Option<MountedAtr>,
    num_entries: usize,
}

impl Firmware {
    pub fn new(
        root: impl Into<PathBuf>,
        boot_rom: Box<[u8; BOOT_ROM_LEN]>,
        os_rom: Box<[u8; OS_ROM_LEN]>,
    ) -> Firmware {
        Firmware {
            mem: CartMemory::new(),
            boot_rom,
            os_rom,
            root: root.into(),
            cur_path: String::new(),
            pending_path: String::new(),
            cart_type: CartType::None,
            atr_mode: false,
            mounted: None,
            num_entries: 0,
        }
    }

    pub fn cart_type(&self) -> CartType {
        self.cart_type
    }

    /// Run from power-on (or reset) until the host resets the machine.
    ///
    /// One command is serviced per pass: the mailbox protocol blocks until a
    /// full command arrives, the command runs to completion (writing its
    /// response), and only then is the protocol re-entered. ACTIVATE_CART
    /// breaks the cycle by handing the bus to the selected mapper, which
    /// holds it until reset; ATR images instead re-enter the mailbox with
    /// disk commands serviceable.
    pub fn run(&mut self, bus: &mut dyn Bus) {
        self.cart_type = CartType::None;
        self.atr_mode = false;
        self.cur_path.clear();
        self.pending_path.clear();
        self.mounted = None;
        self.num_entries = 0;

        while let Some(cmd) =
            mailbox::await_command(bus, &mut self.mem, &self.boot_rom, self.atr_mode)
        {
            match cmd {
                CMD_OPEN_ITEM => self.cmd_open_item(),
                CMD_READ_CUR_DIR => self.cmd_read_dir(),
                CMD_GET_DIR_ENTRY => self.cmd_get_entry(),
                CMD_UP_DIR => self.cmd_up_dir(),
                CMD_ROOT_DIR => self.cur_path.clear(),
                CMD_SEARCH => self.cmd_search(),
                CMD_LOAD_SOFT_OS => self.cmd_load_soft_os(),
                CMD_SOFT_OS_CHUNK => self.cmd_soft_os_chunk(),
                CMD_READ_ATR_SECTOR => self.cmd_read_sector(),
                CMD_WRITE_ATR_SECTOR => self.cmd_write_sector(),
                CMD_ATR_HEADER => self.cmd_atr_header(),
                CMD_NO_CART => self.cart_type = CartType::None,
                CMD_ACTIVATE_CART => {
                    if self.cart_type == CartType::Atr {
                        self.activate_disk();
                    } else {
                        mapper::emulate(self.cart_type, &mut self.mem, bus);
                        return;
                    }
                }
                // Unknown opcodes are host-trusted input; nothing to do.
                _ => {}
            }
        }
    }

    fn host_path(&self, rel: &str) -> PathBuf {
        self.root.join(rel.trim_start_matches('/'))
    }

    fn media_present(&self) -> bool {
        self.root.is_dir()
    }

    fn cmd_open_item(&mut self) {
        let index = self.mem.mailbox[0] as usize;
        if index >= self.num_entries {
            self.mem.mailbox[1] = 4;
            write_str(&mut self.mem.mailbox, 2, "Bad item index");
            return;
        }
        let entry = browse::entry_at(&self.mem.bank_a, index);

        if entry.is_dir {
            self.cur_path.push('/');
            self.cur_path.push_str(&entry.long_name);
            self.mem.mailbox[1] = 0;
            return;
        }

        // Search results carry their own directory; plain listings live in
        // the current one.
        let dir = if entry.full_path.is_empty() {
            self.cur_path.as_str()
        } else {
            entry.full_path.as_str()
        };
        self.pending_path = format!("{}/{}", dir, entry.long_name);

        let is_atr = entry
            .long_name
            .rsplit_once('.')
            .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case("atr"));
        if is_atr {
            // Mounting happens at activation; the banks are left alone.
            self.cart_type = CartType::Atr;
            self.mem.mailbox[1] = 3;
            return;
        }

        let loaded = if self.media_present() {
            image::load_image(&self.host_path(&self.pending_path), &mut self.mem)
        } else {
            Err(LoadError::NoMedia)
        };
        match loaded {
            Ok(kind) => {
                self.cart_type = kind;
                self.mem.mailbox[1] = if kind == CartType::Xex { 2 } else { 1 };
            }
            Err(err) => {
                self.cart_type = CartType::None;
                self.mem.mailbox[1] = 4;
                write_str(&mut self.mem.mailbox, 2, &err.to_string());
            }
        }
    }

    fn cmd_read_dir(&mut self) {
        self.num_entries = 0;
        let listed = if self.media_present() {
            browse::read_directory(&self.host_path(&self.cur_path))
                .map_err(|_| "Can't read directory")
        } else {
            Err("Can't read media")
        };
        match listed {
            Ok(entries) => {
                browse::pack_listing(&entries, &mut self.mem.bank_a);
                self.num_entries = entries.len();
                self.mem.mailbox[1] = 0;
                self.mem.mailbox[2] = self.num_entries as u8;
            }
            Err(msg) => {
                self.mem.mailbox[1] = 1;
                write_str(&mut self.mem.mailbox, 2, msg);
            }
        }
    }

    fn cmd_get_entry(&mut self) {
        let index = self.mem.mailbox[0] as usize;
        if index >= self.num_entries {
            self.mem.mailbox[1] = 0;
            write_str(&mut self.mem.mailbox, 2, "");
            return;
        }
        let entry = browse::entry_at(&self.mem.bank_a, index);
        self.mem.mailbox[1] = entry.is_dir as u8;
        write_str(&mut self.mem.mailbox, 2, &entry.long_name);
    }

    fn cmd_up_dir(&mut self) {
        match self.cur_path.rfind('/') {
            Some(at) => self.cur_path.truncate(at),
            None => self.cur_path.clear(),
        }
    }

    fn cmd_search(&mut self) {
        let term = mailbox::read_str(&self.mem.mailbox, 0, 31);
        self.num_entries = 0;
        let found = if self.media_present() {
            browse::search_directory(&self.root, &self.cur_path, &term)
                .map_err(|_| "Problem searching media")
        } else {
            Err("Can't read media")
        };
        match found {
            Ok(entries) => {
                browse::pack_listing(&entries, &mut self.mem.bank_a);
                self.num_entries = entries.len();
                self.mem.mailbox[1] = 0;
                self.mem.mailbox[2] = self.num_entries as u8;
            }
            Err(msg) => {
                self.mem.mailbox[1] = 1;
                write_str(&mut self.mem.mailbox, 2, msg);
            }
        }
    }

    fn cmd_load_soft_os(&mut self) {
        let loaded = self.media_present()
            && image::load_image(&self.host_path(SOFT_OS_FILENAME), &mut self.mem).is_ok();
        if !loaded {
            self.mem.bank_a[..OS_ROM_LEN].copy_from_slice(&self.os_rom[..]);
        }
        self.mem.mailbox[1] = 0;
    }

    fn cmd_soft_os_chunk(&mut self) {
        let chunk = self.mem.mailbox[0] as usize;
        let at = chunk * PAGE_LEN;
        self.mem.mailbox[1..1 + PAGE_LEN].copy_from_slice(&self.mem.bank_a[at..at + PAGE_LEN]);
    }

    fn cmd_read_sector(&mut self) {
        let sector = u16::from_le_bytes([self.mem.mailbox[1], self.mem.mailbox[2]]);
        let page = self.mem.mailbox[3];
        let status = match self.mounted.as_mut() {
            None => 1,
            Some(disk) => {
                let mut buf = [0u8; PAGE_LEN];
                match disk.read_sector(sector, page, &mut buf) {
                    Ok(()) => {
                        self.mem.mailbox[2..2 + PAGE_LEN].copy_from_slice(&buf);
                        0
                    }
                    Err(err) => err.sector_status(),
                }
            }
        };
        self.mem.mailbox[1] = status;
    }

    fn cmd_write_sector(&mut self) {
        let sector = u16::from_le_bytes([self.mem.mailbox[1], self.mem.mailbox[2]]);
        let page = self.mem.mailbox[3];
        let mut buf = [0u8; PAGE_LEN];
        buf.copy_from_slice(&self.mem.mailbox[4..4 + PAGE_LEN]);
        let status = match self.mounted.as_mut() {
            None => 1,
            Some(disk) => match disk.write_sector(sector, page, &buf) {
                Ok(()) => 0,
                Err(err) => err.sector_status(),
            },
        };
        self.mem.mailbox[1] = status;
    }

    fn cmd_atr_header(&mut self) {
        match &self.mounted {
            None => self.mem.mailbox[1] = 1,
            Some(disk) => {
                self.mem.mailbox[2..2 + atr::ATR_HEADER_LEN]
                    .copy_from_slice(disk.header().raw());
                self.mem.mailbox[1] = 0;
            }
        }
    }

    fn activate_disk(&mut self) {
        self.atr_mode = true;
        let mounted = if self.media_present() {
            MountedAtr::mount(&self.host_path(&self.pending_path))
        } else {
            Err(DiskError::NoMedia)
        };
        match mounted {
            Ok(disk) => {
                self.mem.mailbox[2..2 + atr::ATR_HEADER_LEN]
                    .copy_from_slice(disk.header().raw());
                self.mem.mailbox[1] = 0;
                self.mounted = Some(disk);
            }
            Err(err) => self.mem.mailbox[1] = err.mount_status(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testfs {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};

    static NEXT: AtomicU32 = AtomicU32::new(0);

    /// Fresh scratch directory under the system temp dir.
    pub fn dir(tag: &str) -> PathBuf {
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("anode8-{}-{tag}-{n}", std::process::id()));
        fs::create_dir_all(&path).expect("create scratch dir");
        path
    }

    pub fn subdir(parent: &Path, name: &str) -> PathBuf {
        let path = parent.join(name);
        fs::create_dir_all(&path).expect("create subdir");
        path
    }

    pub fn file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, bytes).expect("write fixture");
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::atr::{ATR_HEADER_LEN, ATR_SIGNATURE};
    use crate::cart::mailbox::READY;
    use crate::sim::{Cycle, SimBus, command_cycles, read_mailbox_cycles, string_param};
    use std::path::Path;

    fn test_firmware(root: &Path) -> Firmware {
        let mut boot = Box::new([0u8; BOOT_ROM_LEN]);
        for (i, b) in boot.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let os = Box::new([0xC3u8; OS_ROM_LEN]);
        Firmware::new(root, boot, os)
    }

    fn run_script(fw: &mut Firmware, script: Vec<Cycle>) -> SimBus {
        let mut bus = SimBus::new(script);
        fw.run(&mut bus);
        bus
    }

    fn atr_bytes(sector_size: u16, sectors: usize) -> Vec<u8> {
        let data_len = 3 * PAGE_LEN + sectors.saturating_sub(3) * sector_size as usize;
        let pars = (data_len / 16) as u32;
        let mut bytes = vec![0u8; ATR_HEADER_LEN];
        bytes[0..2].copy_from_slice(&ATR_SIGNATURE.to_le_bytes());
        bytes[2..4].copy_from_slice(&(pars as u16).to_le_bytes());
        bytes[4..6].copy_from_slice(&sector_size.to_le_bytes());
        bytes.extend(std::iter::repeat_n(0u8, data_len));
        bytes
    }

    #[test]
    fn boot_protocol_serves_sentinel_and_boot_image() {
        let root = testfs::dir("fw-boot");
        let mut fw = test_firmware(&root);
        let bus = run_script(
            &mut fw,
            vec![
                Cycle::cctl_read(0x00),
                Cycle::s5_read(0x0123),
                Cycle::s4_read(0x0010),
            ],
        );
        let served = bus.served();
        assert_eq!(served[0].driven, Some(READY));
        assert_eq!(served[1].driven, Some((0x0123 % 251) as u8));
        // /S4 space is not decoded while the boot protocol runs.
        assert_eq!(served[2].driven, None);
        // Boot mode: RD5 high, RD4 low.
        assert!(served[0].rd5 && !served[0].rd4);
    }

    #[test]
    fn read_dir_and_get_entry_round_trip() {
        let root = testfs::dir("fw-readdir");
        testfs::subdir(&root, "GAMES");
        testfs::file(&root, "demo.rom", &[0u8; 0x2000]);

        let mut fw = test_firmware(&root);
        let mut script = command_cycles(CMD_READ_CUR_DIR, &[]);
        let dir_resp = script.len();
        script.extend(read_mailbox_cycles(0x01, 2));
        script.extend(command_cycles(CMD_GET_DIR_ENTRY, &[(0x00, 0)]));
        let entry0 = script.len();
        script.extend(read_mailbox_cycles(0x01, 7));
        script.extend(command_cycles(CMD_GET_DIR_ENTRY, &[(0x00, 1)]));
        let entry1 = script.len();
        script.extend(read_mailbox_cycles(0x01, 2));

        let bus = run_script(&mut fw, script);
        let served = bus.served();
        assert_eq!(served[dir_resp].driven, Some(0));
        assert_eq!(served[dir_resp + 1].driven, Some(2));
        // Directories come first.
        assert_eq!(served[entry0].driven, Some(1));
        let name: Vec<u8> = served[entry0 + 1..entry0 + 7]
            .iter()
            .map(|s| s.driven.unwrap())
            .collect();
        assert_eq!(&name, b"GAMES\0");
        assert_eq!(served[entry1].driven, Some(0));
    }

    #[test]
    fn open_item_descends_into_directories() {
        let root = testfs::dir("fw-descend");
        let sub = testfs::subdir(&root, "GAMES");
        testfs::file(&sub, "pitfall.rom", &[0u8; 0x2000]);
        testfs::file(&root, "top.rom", &[0u8; 0x2000]);

        let mut fw = test_firmware(&root);
        let mut script = command_cycles(CMD_READ_CUR_DIR, &[]);
        script.extend(command_cycles(CMD_OPEN_ITEM, &[(0x00, 0)]));
        let open_resp = script.len();
        script.extend(read_mailbox_cycles(0x01, 1));
        script.extend(command_cycles(CMD_READ_CUR_DIR, &[]));
        let dir_resp = script.len();
        script.extend(read_mailbox_cycles(0x01, 2));
        script.extend(command_cycles(CMD_GET_DIR_ENTRY, &[(0x00, 0)]));
        let entry_resp = script.len();
        script.extend(read_mailbox_cycles(0x02, 8));

        let bus = run_script(&mut fw, script);
        let served = bus.served();
        assert_eq!(served[open_resp].driven, Some(0));
        assert_eq!(served[dir_resp].driven, Some(0));
        assert_eq!(served[dir_resp + 1].driven, Some(1));
        let name: Vec<u8> = served[entry_resp..entry_resp + 8]
            .iter()
            .map(|s| s.driven.unwrap())
            .collect();
        assert_eq!(&name[..7], b"pitfall");
    }

    #[test]
    fn up_dir_and_root_dir_walk_back() {
        let root = testfs::dir("fw-updir");
        let sub = testfs::subdir(&root, "A");
        testfs::subdir(&sub, "B");
        testfs::file(&root, "top.rom", &[0u8; 0x2000]);

        let mut fw = test_firmware(&root);
        let mut script = command_cycles(CMD_READ_CUR_DIR, &[]);
        script.extend(command_cycles(CMD_OPEN_ITEM, &[(0x00, 0)]));
        script.extend(command_cycles(CMD_READ_CUR_DIR, &[]));
        script.extend(command_cycles(CMD_OPEN_ITEM, &[(0x00, 0)]));
        script.extend(command_cycles(CMD_UP_DIR, &[]));
        script.extend(command_cycles(CMD_READ_CUR_DIR, &[]));
        let after_up = script.len();
        script.extend(read_mailbox_cycles(0x02, 1));
        script.extend(command_cycles(CMD_ROOT_DIR, &[]));
        script.extend(command_cycles(CMD_READ_CUR_DIR, &[]));
        let after_root = script.len();
        script.extend(read_mailbox_cycles(0x02, 1));

        let bus = run_script(&mut fw, script);
        let served = bus.served();
        // Back in /A: one entry (B). At the root: A and top.rom.
        assert_eq!(served[after_up].driven, Some(1));
        assert_eq!(served[after_root].driven, Some(2));
    }

    #[test]
    fn open_item_with_bad_index_fails_closed() {
        let root = testfs::dir("fw-badindex");
        testfs::file(&root, "only.rom", &[0u8; 0x2000]);

        let mut fw = test_firmware(&root);
        let mut script = command_cycles(CMD_READ_CUR_DIR, &[]);
        script.extend(command_cycles(CMD_OPEN_ITEM, &[(0x00, 9)]));
        let resp = script.len();
        script.extend(read_mailbox_cycles(0x01, 4));

        let bus = run_script(&mut fw, script);
        let served = bus.served();
        assert_eq!(served[resp].driven, Some(4));
        assert_eq!(served[resp + 1].driven, Some(b'B'));
        assert_eq!(served[resp + 2].driven, Some(b'a'));
        assert_eq!(fw.cart_type(), CartType::None);
    }

    #[test]
    fn open_item_reports_load_errors_with_message() {
        let root = testfs::dir("fw-loaderr");
        testfs::file(&root, "odd.rom", &[0u8; 1000]);

        let mut fw = test_firmware(&root);
        let mut script = command_cycles(CMD_READ_CUR_DIR, &[]);
        script.extend(command_cycles(CMD_OPEN_ITEM, &[(0x00, 0)]));
        let resp = script.len();
        script.extend(read_mailbox_cycles(0x01, 1));

        let bus = run_script(&mut fw, script);
        assert_eq!(bus.served()[resp].driven, Some(4));
        assert_eq!(fw.cart_type(), CartType::None);
    }

    #[test]
    fn search_ranks_and_reports_matches() {
        let root = testfs::dir("fw-search");
        testfs::file(&root, "ZABC.XEX", &[0u8; 16]);
        testfs::file(&root, "ABC.XEX", &[0u8; 16]);

        let mut fw = test_firmware(&root);
        let mut script = command_cycles(CMD_SEARCH, &string_param("ABC"));
        let resp = script.len();
        script.extend(read_mailbox_cycles(0x01, 2));
        script.extend(command_cycles(CMD_GET_DIR_ENTRY, &[(0x00, 0)]));
        let first = script.len();
        script.extend(read_mailbox_cycles(0x02, 4));

        let bus = run_script(&mut fw, script);
        let served = bus.served();
        assert_eq!(served[resp].driven, Some(0));
        assert_eq!(served[resp + 1].driven, Some(2));
        let name: Vec<u8> = served[first..first + 4]
            .iter()
            .map(|s| s.driven.unwrap())
            .collect();
        assert_eq!(&name, b"ABC.");
    }

    #[test]
    fn open_atr_marks_disk_mode_without_touching_banks() {
        let root = testfs::dir("fw-atrmark");
        testfs::file(&root, "disk.atr", &atr_bytes(128, 8));

        let mut fw = test_firmware(&root);
        let mut script = command_cycles(CMD_READ_CUR_DIR, &[]);
        script.extend(command_cycles(CMD_OPEN_ITEM, &[(0x00, 0)]));
        let resp = script.len();
        script.extend(read_mailbox_cycles(0x01, 1));

        let bus = run_script(&mut fw, script);
        assert_eq!(bus.served()[resp].driven, Some(3));
        assert_eq!(fw.cart_type(), CartType::Atr);
        // The listing is still packed in bank A.
        assert_eq!(browse::entry_at(&fw.mem.bank_a, 0).long_name, "disk.atr");
    }

    #[test]
    fn activate_atr_stays_in_mailbox_mode_and_serves_sectors() {
        let root = testfs::dir("fw-atrmode");
        let mut image = atr_bytes(128, 8);
        // Sector 2 payload.
        let at = ATR_HEADER_LEN + PAGE_LEN;
        for (i, b) in image[at..at + PAGE_LEN].iter_mut().enumerate() {
            *b = i as u8 ^ 0xD1;
        }
        testfs::file(&root, "disk.atr", &image);

        let mut fw = test_firmware(&root);
        let mut script = command_cycles(CMD_READ_CUR_DIR, &[]);
        script.extend(command_cycles(CMD_OPEN_ITEM, &[(0x00, 0)]));
        script.extend(command_cycles(CMD_ACTIVATE_CART, &[]));
        let mount_resp = script.len();
        script.extend(read_mailbox_cycles(0x01, 1));
        script.extend(command_cycles(
            CMD_READ_ATR_SECTOR,
            &[(0x01, 2), (0x02, 0), (0x03, 0)],
        ));
        let sector_resp = script.len();
        script.extend(read_mailbox_cycles(0x01, 4));
        script.extend(command_cycles(CMD_ATR_HEADER, &[]));
        let header_resp = script.len();
        script.extend(read_mailbox_cycles(0x01, 3));

        let bus = run_script(&mut fw, script);
        let served = bus.served();
        assert_eq!(served[mount_resp].driven, Some(0));
        // Disk mode keeps RD5 low so the host sees no cartridge ROM.
        assert!(!served[mount_resp].rd5);
        assert_eq!(served[sector_resp].driven, Some(0));
        assert_eq!(served[sector_resp + 1].driven, Some(0xD1));
        assert_eq!(served[sector_resp + 2].driven, Some(1 ^ 0xD1));
        assert_eq!(served[header_resp].driven, Some(0));
        let sig = u16::from_le_bytes([
            served[header_resp + 1].driven.unwrap(),
            served[header_resp + 2].driven.unwrap(),
        ]);
        assert_eq!(sig, ATR_SIGNATURE);
    }

    #[test]
    fn write_sector_round_trips_through_the_mailbox() {
        let root = testfs::dir("fw-atrwrite");
        testfs::file(&root, "disk.atr", &atr_bytes(128, 8));

        let mut fw = test_firmware(&root);
        let mut script = command_cycles(CMD_READ_CUR_DIR, &[]);
        script.extend(command_cycles(CMD_OPEN_ITEM, &[(0x00, 0)]));
        script.extend(command_cycles(CMD_ACTIVATE_CART, &[]));

        let mut params = vec![(0x01u8, 4u8), (0x02, 0), (0x03, 0)];
        for i in 0..PAGE_LEN {
            params.push((4 + i as u8, i as u8 ^ 0xA5));
        }
        script.extend(command_cycles(CMD_WRITE_ATR_SECTOR, &params));
        let write_resp = script.len();
        script.extend(read_mailbox_cycles(0x01, 1));
        script.extend(command_cycles(
            CMD_READ_ATR_SECTOR,
            &[(0x01, 4), (0x02, 0), (0x03, 0)],
        ));
        let read_resp = script.len();
        script.extend(read_mailbox_cycles(0x01, 3));

        let bus = run_script(&mut fw, script);
        let served = bus.served();
        assert_eq!(served[write_resp].driven, Some(0));
        assert_eq!(served[read_resp].driven, Some(0));
        assert_eq!(served[read_resp + 1].driven, Some(0xA5));
        assert_eq!(served[read_resp + 2].driven, Some(1 ^ 0xA5));
    }

    #[test]
    fn sector_commands_without_a_mount_fail() {
        let root = testfs::dir("fw-nomount");
        let mut fw = test_firmware(&root);
        let mut script = command_cycles(CMD_READ_ATR_SECTOR, &[(0x01, 1), (0x02, 0), (0x03, 0)]);
        let read_resp = script.len();
        script.extend(read_mailbox_cycles(0x01, 1));
        script.extend(command_cycles(CMD_ATR_HEADER, &[]));
        let header_resp = script.len();
        script.extend(read_mailbox_cycles(0x01, 1));

        let bus = run_script(&mut fw, script);
        assert_eq!(bus.served()[read_resp].driven, Some(1));
        assert_eq!(bus.served()[header_resp].driven, Some(1));
    }

    #[test]
    fn activate_cart_hands_the_bus_to_the_mapper() {
        let root = testfs::dir("fw-activate");
        let rom: Vec<u8> = (0..0x2000).map(|i| (i % 247) as u8).collect();
        testfs::file(&root, "game.rom", &rom);

        let mut fw = test_firmware(&root);
        let mut script = command_cycles(CMD_READ_CUR_DIR, &[]);
        script.extend(command_cycles(CMD_OPEN_ITEM, &[(0x00, 0)]));
        let open_resp = script.len();
        script.extend(read_mailbox_cycles(0x01, 1));
        script.extend(command_cycles(CMD_ACTIVATE_CART, &[]));
        let reads = script.len();
        script.push(Cycle::s5_read(0x0040));
        script.push(Cycle::cctl_read(0x00));

        let bus = run_script(&mut fw, script);
        let served = bus.served();
        assert_eq!(served[open_resp].driven, Some(1));
        assert_eq!(served[reads].driven, Some(rom[0x0040]));
        // An 8K cartridge has no control-space registers: the mailbox is gone.
        assert_eq!(served[reads + 1].driven, None);
        assert_eq!(fw.cart_type(), CartType::Std8k);
    }

    #[test]
    fn no_cart_deselects_and_activation_parks() {
        let root = testfs::dir("fw-nocart");
        testfs::file(&root, "game.rom", &[0x77u8; 0x2000]);

        let mut fw = test_firmware(&root);
        let mut script = command_cycles(CMD_READ_CUR_DIR, &[]);
        script.extend(command_cycles(CMD_OPEN_ITEM, &[(0x00, 0)]));
        script.extend(command_cycles(CMD_NO_CART, &[]));
        script.extend(command_cycles(CMD_ACTIVATE_CART, &[]));
        let reads = script.len();
        script.push(Cycle::s5_read(0x0000));

        let bus = run_script(&mut fw, script);
        let served = bus.served();
        assert_eq!(served[reads].driven, None);
        assert!(!served[reads].rd4 && !served[reads].rd5);
        assert_eq!(fw.cart_type(), CartType::None);
    }

    #[test]
    fn soft_os_falls_back_to_builtin_image() {
        let root = testfs::dir("fw-softos");
        let mut fw = test_firmware(&root);
        let mut script = command_cycles(CMD_LOAD_SOFT_OS, &[]);
        let os_resp = script.len();
        script.extend(read_mailbox_cycles(0x01, 1));
        script.extend(command_cycles(CMD_SOFT_OS_CHUNK, &[(0x00, 2)]));
        let chunk_resp = script.len();
        script.extend(read_mailbox_cycles(0x01, 3));

        let bus = run_script(&mut fw, script);
        let served = bus.served();
        assert_eq!(served[os_resp].driven, Some(0));
        assert_eq!(served[chunk_resp].driven, Some(0xC3));
        assert_eq!(served[chunk_resp + 1].driven, Some(0xC3));
        assert_eq!(fw.mem.bank_a[0], 0xC3);
    }

    #[test]
    fn soft_os_prefers_media_image() {
        let root = testfs::dir("fw-softos-media");
        testfs::file(&root, SOFT_OS_FILENAME, &[0x3Cu8; OS_ROM_LEN]);

        let mut fw = test_firmware(&root);
        let mut script = command_cycles(CMD_LOAD_SOFT_OS, &[]);
        script.extend(command_cycles(CMD_SOFT_OS_CHUNK, &[(0x00, 0)]));
        let chunk_resp = script.len();
        script.extend(read_mailbox_cycles(0x01, 1));

        let bus = run_script(&mut fw, script);
        assert_eq!(bus.served()[chunk_resp].driven, Some(0x3C));
    }

    #[test]
    fn read_dir_without_media_reports_error() {
        let root = testfs::dir("fw-nomedia").join("gone");
        let mut fw = test_firmware(&root);
        let mut script = command_cycles(CMD_READ_CUR_DIR, &[]);
        let resp = script.len();
        script.extend(read_mailbox_cycles(0x01, 2));

        let bus = run_script(&mut fw, script);
        assert_eq!(bus.served()[resp].driven, Some(1));
        assert_eq!(bus.served()[resp + 1].driven, Some(b'C'));
    }
}

use std::cell::Cell;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result, bail};

use anode8::cart::mailbox::BOOT_ROM_LEN;
use anode8::cart::{
    CMD_ACTIVATE_CART, CMD_ATR_HEADER, CMD_GET_DIR_ENTRY, CMD_LOAD_SOFT_OS, CMD_OPEN_ITEM,
    CMD_READ_ATR_SECTOR, CMD_READ_CUR_DIR, CMD_ROOT_DIR, CMD_SEARCH, CMD_SOFT_OS_CHUNK,
    CMD_UP_DIR, CMD_WRITE_ATR_SECTOR, Firmware, OS_ROM_LEN,
};
use anode8::sim::{
    Cycle, CycleSource, Served, SimBus, command_cycles, read_mailbox_cycles, string_param,
};

#[derive(Debug, Clone)]
struct Config {
    root: PathBuf,
    boot: Option<PathBuf>,
    os: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self { root: PathBuf::from("."), boot: None, os: None }
    }
}

fn parse_args() -> Result<Config> {
    let mut cfg = Config::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--root" => {
                let value = args
                    .next()
                    .context("--root requires a path, e.g. --root /media/sd")?;
                cfg.root = PathBuf::from(value);
            }
            "--boot" => {
                let value = args
                    .next()
                    .context("--boot requires a path to an 8K boot ROM image")?;
                cfg.boot = Some(PathBuf::from(value));
            }
            "--os" => {
                let value = args
                    .next()
                    .context("--os requires a path to a 16K OS ROM image")?;
                cfg.os = Some(PathBuf::from(value));
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                bail!("unknown argument: {other}\nUse --help to view supported options.");
            }
        }
    }

    Ok(cfg)
}

fn print_help() {
    println!(
        "Anode-8 host console\n\n\
Usage:\n\
  anode8 [options]\n\n\
Options:\n\
  --root <path>   Media directory served to the firmware (default .)\n\
  --boot <path>   8K boot ROM image (default zero-filled)\n\
  --os <path>     16K fallback OS image (default zero-filled)\n\
  -h, --help      Show this help\n\n\
Console commands: ls, open <n>, up, root, find <text>, os, chunk <n>,\n\
rsec <sector> <page>, wsec <sector> <page> <fill>, header, activate,\n\
r4/r5 <addr>, rc <off>, wc <off> <val>, reset, quit"
    );
}

fn load_fixed<const N: usize>(path: Option<&PathBuf>) -> Result<Box<[u8; N]>> {
    let mut image = Box::new([0u8; N]);
    if let Some(path) = path {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        if bytes.len() > N {
            bail!("{} is larger than {} bytes", path.display(), N);
        }
        image[..bytes.len()].copy_from_slice(&bytes);
    }
    Ok(image)
}

/// What the previous batch of cycles was for, so the response reads can be
/// decoded when the bus asks for more work.
enum Pending {
    Idle,
    Listing,
    ListEntry { next: u8, total: u8 },
    Open,
    Status(&'static str),
    Chunk,
    Sector,
    Header,
    Raw(&'static str),
}

struct Console {
    lines: io::Lines<io::StdinLock<'static>>,
    pending: Pending,
    resp_start: usize,
    mapper_mode: bool,
    atr_selected: bool,
    quit: Rc<Cell<bool>>,
}

impl Console {
    fn new(quit: Rc<Cell<bool>>) -> Console {
        Console {
            lines: io::stdin().lock().lines(),
            pending: Pending::Idle,
            resp_start: 0,
            mapper_mode: false,
            atr_selected: false,
            quit,
        }
    }

    fn batch(
        &mut self,
        pending: Pending,
        mut command: Vec<Cycle>,
        reads: Vec<Cycle>,
    ) -> Option<Vec<Cycle>> {
        self.resp_start = command.len();
        command.extend(reads);
        self.pending = pending;
        Some(command)
    }

    fn decode_str(resp: &[Served]) -> String {
        let bytes: Vec<u8> = resp
            .iter()
            .map(|s| s.driven.unwrap_or(0))
            .take_while(|&b| b != 0)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn hex_dump(resp: &[Served]) {
        for row in resp.chunks(16) {
            let line: Vec<String> = row
                .iter()
                .map(|s| format!("{:02X}", s.driven.unwrap_or(0)))
                .collect();
            println!("  {}", line.join(" "));
        }
    }

    /// Handle the completed batch; `Some` means a follow-up batch was
    /// emitted without going back to the prompt.
    fn digest_responses(&mut self, completed: &[Served]) -> Option<Option<Vec<Cycle>>> {
        let resp = &completed[self.resp_start.min(completed.len())..];
        match std::mem::replace(&mut self.pending, Pending::Idle) {
            Pending::Idle => {}
            Pending::Listing => {
                let status = resp.first().and_then(|s| s.driven).unwrap_or(0xFF);
                let total = resp.get(1).and_then(|s| s.driven).unwrap_or(0);
                if status != 0 {
                    println!("error: {}", Self::decode_str(resp.get(1..).unwrap_or(&[])));
                } else if total == 0 {
                    println!("(empty)");
                } else {
                    return Some(self.batch(
                        Pending::ListEntry { next: 0, total },
                        command_cycles(CMD_GET_DIR_ENTRY, &[(0x00, 0)]),
                        read_mailbox_cycles(0x01, 33),
                    ));
                }
            }
            Pending::ListEntry { next, total } => {
                let is_dir = resp.first().and_then(|s| s.driven).unwrap_or(0) != 0;
                let name = Self::decode_str(resp.get(1..).unwrap_or(&[]));
                let marker = if is_dir { "<DIR>" } else { "     " };
                println!("{next:3} {marker} {name}");
                let next = next + 1;
                if next < total {
                    return Some(self.batch(
                        Pending::ListEntry { next, total },
                        command_cycles(CMD_GET_DIR_ENTRY, &[(0x00, next)]),
                        read_mailbox_cycles(0x01, 33),
                    ));
                }
            }
            Pending::Open => {
                let status = resp.first().and_then(|s| s.driven).unwrap_or(0xFF);
                self.atr_selected = status == 3;
                match status {
                    0 => println!("directory changed"),
                    1 => println!("cartridge image loaded"),
                    2 => println!("XEX staged for the loader"),
                    3 => println!("ATR selected; activate to mount"),
                    _ => println!("error: {}", Self::decode_str(resp.get(1..).unwrap_or(&[]))),
                }
            }
            Pending::Status(label) => {
                let status = resp.first().and_then(|s| s.driven).unwrap_or(0xFF);
                println!("{label}: status {status}");
            }
            Pending::Chunk => Self::hex_dump(resp),
            Pending::Sector => {
                let status = resp.first().and_then(|s| s.driven).unwrap_or(0xFF);
                if status == 0 {
                    Self::hex_dump(resp.get(1..).unwrap_or(&[]));
                } else {
                    println!("sector read failed: status {status}");
                }
            }
            Pending::Header => {
                let status = resp.first().and_then(|s| s.driven).unwrap_or(0xFF);
                if status == 0 {
                    Self::hex_dump(resp.get(1..).unwrap_or(&[]));
                } else {
                    println!("no disk mounted: status {status}");
                }
            }
            Pending::Raw(what) => match resp.first().and_then(|s| s.driven) {
                Some(value) => println!("{what} -> ${value:02X}"),
                None => println!("{what} -> bus not driven"),
            },
        }
        None
    }

    fn prompt(&mut self) -> Option<Vec<Cycle>> {
        loop {
            print!("a8> ");
            let _ = io::stdout().flush();
            let line = match self.lines.next() {
                Some(Ok(line)) => line,
                _ => return None,
            };
            let words: Vec<&str> = line.split_whitespace().collect();
            let Some(&cmd) = words.first() else { continue };

            if self.mapper_mode {
                match cmd {
                    "r4" | "r5" => {
                        let Some(addr) = words.get(1).and_then(|w| parse_num(w)) else {
                            println!("usage: {cmd} <addr>");
                            continue;
                        };
                        let (cycle, label) = if cmd == "r4" {
                            (Cycle::s4_read(addr as u16), "/S4 read")
                        } else {
                            (Cycle::s5_read(addr as u16), "/S5 read")
                        };
                        return self.batch(Pending::Raw(label), vec![], vec![cycle]);
                    }
                    "rc" => {
                        let Some(offset) = words.get(1).and_then(|w| parse_num(w)) else {
                            println!("usage: rc <offset>");
                            continue;
                        };
                        return self.batch(
                            Pending::Raw("CCTL read"),
                            vec![],
                            vec![Cycle::cctl_read(offset as u8)],
                        );
                    }
                    "wc" => {
                        let (Some(offset), Some(value)) = (
                            words.get(1).and_then(|w| parse_num(w)),
                            words.get(2).and_then(|w| parse_num(w)),
                        ) else {
                            println!("usage: wc <offset> <value>");
                            continue;
                        };
                        return self.batch(
                            Pending::Idle,
                            vec![Cycle::cctl_write(offset as u8, value as u8)],
                            vec![],
                        );
                    }
                    "reset" => return None,
                    "quit" | "exit" => {
                        self.quit.set(true);
                        return None;
                    }
                    _ => println!(
                        "mapper is on the bus; commands: r4/r5 <addr>, rc <off>, wc <off> <val>, reset, quit"
                    ),
                }
                continue;
            }

            match cmd {
                "ls" => {
                    return self.batch(
                        Pending::Listing,
                        command_cycles(CMD_READ_CUR_DIR, &[]),
                        read_mailbox_cycles(0x01, 34),
                    );
                }
                "open" | "cd" => {
                    let Some(n) = words.get(1).and_then(|w| parse_num(w)) else {
                        println!("usage: open <index>");
                        continue;
                    };
                    return self.batch(
                        Pending::Open,
                        command_cycles(CMD_OPEN_ITEM, &[(0x00, n as u8)]),
                        read_mailbox_cycles(0x01, 41),
                    );
                }
                "up" => return self.batch(Pending::Idle, command_cycles(CMD_UP_DIR, &[]), vec![]),
                "root" => {
                    return self.batch(Pending::Idle, command_cycles(CMD_ROOT_DIR, &[]), vec![]);
                }
                "find" => {
                    let Some(term) = words.get(1) else {
                        println!("usage: find <text>");
                        continue;
                    };
                    return self.batch(
                        Pending::Listing,
                        command_cycles(CMD_SEARCH, &string_param(term)),
                        read_mailbox_cycles(0x01, 34),
                    );
                }
                "os" => {
                    return self.batch(
                        Pending::Status("soft OS load"),
                        command_cycles(CMD_LOAD_SOFT_OS, &[]),
                        read_mailbox_cycles(0x01, 1),
                    );
                }
                "chunk" => {
                    let Some(n) = words.get(1).and_then(|w| parse_num(w)) else {
                        println!("usage: chunk <index>");
                        continue;
                    };
                    return self.batch(
                        Pending::Chunk,
                        command_cycles(CMD_SOFT_OS_CHUNK, &[(0x00, n as u8)]),
                        read_mailbox_cycles(0x01, 128),
                    );
                }
                "rsec" => {
                    let (Some(sector), Some(page)) = (
                        words.get(1).and_then(|w| parse_num(w)),
                        words.get(2).and_then(|w| parse_num(w)),
                    ) else {
                        println!("usage: rsec <sector> <page>");
                        continue;
                    };
                    let [lo, hi] = (sector as u16).to_le_bytes();
                    return self.batch(
                        Pending::Sector,
                        command_cycles(
                            CMD_READ_ATR_SECTOR,
                            &[(0x01, lo), (0x02, hi), (0x03, page as u8)],
                        ),
                        read_mailbox_cycles(0x01, 129),
                    );
                }
                "wsec" => {
                    let (Some(sector), Some(page), Some(fill)) = (
                        words.get(1).and_then(|w| parse_num(w)),
                        words.get(2).and_then(|w| parse_num(w)),
                        words.get(3).and_then(|w| parse_num(w)),
                    ) else {
                        println!("usage: wsec <sector> <page> <fill>");
                        continue;
                    };
                    let [lo, hi] = (sector as u16).to_le_bytes();
                    let mut params = vec![(0x01u8, lo), (0x02, hi), (0x03, page as u8)];
                    for i in 0..128u8 {
                        params.push((4 + i, fill as u8));
                    }
                    return self.batch(
                        Pending::Status("sector write"),
                        command_cycles(CMD_WRITE_ATR_SECTOR, &params),
                        read_mailbox_cycles(0x01, 1),
                    );
                }
                "header" => {
                    return self.batch(
                        Pending::Header,
                        command_cycles(CMD_ATR_HEADER, &[]),
                        read_mailbox_cycles(0x01, 17),
                    );
                }
                "activate" => {
                    if self.atr_selected {
                        return self.batch(
                            Pending::Status("disk mount"),
                            command_cycles(CMD_ACTIVATE_CART, &[]),
                            read_mailbox_cycles(0x01, 1),
                        );
                    }
                    self.mapper_mode = true;
                    println!("bus handed to the mapper; raw bus commands only until reset");
                    return self.batch(
                        Pending::Idle,
                        command_cycles(CMD_ACTIVATE_CART, &[]),
                        vec![],
                    );
                }
                "reset" => return None,
                "quit" | "exit" => {
                    self.quit.set(true);
                    return None;
                }
                "help" => print_help(),
                _ => println!("unknown command: {cmd} (try help)"),
            }
        }
    }

}

impl CycleSource for Console {
    fn next_batch(&mut self, completed: &[Served]) -> Option<Vec<Cycle>> {
        if let Some(batch) = self.digest_responses(completed) {
            return batch;
        }
        self.prompt()
    }
}

fn parse_num(word: &str) -> Option<u32> {
    if let Some(hex) = word.strip_prefix('$').or_else(|| word.strip_prefix("0x")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        word.parse().ok()
    }
}

fn main() -> Result<()> {
    let cfg = parse_args()?;
    let boot = load_fixed::<BOOT_ROM_LEN>(cfg.boot.as_ref())?;
    let os = load_fixed::<OS_ROM_LEN>(cfg.os.as_ref())?;

    if !cfg.root.is_dir() {
        eprintln!("warning: media root {} is not a directory", cfg.root.display());
    }
    println!("Anode-8 console, media root {}", cfg.root.display());
    println!("Type help for commands.");

    let mut firmware = Firmware::new(&cfg.root, boot, os);
    let quit = Rc::new(Cell::new(false));

    while !quit.get() {
        let console = Console::new(quit.clone());
        let mut bus = SimBus::with_source(Box::new(console));
        firmware.run(&mut bus);
        if !quit.get() {
            println!(
                "-- machine reset (selected cartridge: {}) --",
                firmware.cart_type().describe()
            );
        }
    }

    Ok(())
}

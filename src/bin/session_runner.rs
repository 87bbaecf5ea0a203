//! Scripted host sessions against the firmware, for regression runs.
//!
//! A session file is a JSON description of one powered interval: the media
//! directory to serve, the commands the host issues, and per-step
//! expectations on the bytes the firmware drives back. Every driven byte is
//! also folded into a SHA-1 digest so a whole session can be pinned with a
//! single string.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::Deserialize;
use sha1::{Digest, Sha1};

use anode8::cart::mailbox::BOOT_ROM_LEN;
use anode8::cart::{
    CMD_ACTIVATE_CART, CMD_ATR_HEADER, CMD_GET_DIR_ENTRY, CMD_LOAD_SOFT_OS, CMD_NO_CART,
    CMD_OPEN_ITEM, CMD_READ_ATR_SECTOR, CMD_READ_CUR_DIR, CMD_ROOT_DIR, CMD_SEARCH,
    CMD_SOFT_OS_CHUNK, CMD_UP_DIR, CMD_WRITE_ATR_SECTOR, Firmware, OS_ROM_LEN,
};
use anode8::sim::{Cycle, Served, SimBus, command_cycles, read_mailbox_cycles, string_param};

#[derive(Debug, Deserialize)]
struct Session {
    #[serde(default)]
    name: Option<String>,
    media_root: PathBuf,
    #[serde(default)]
    boot_rom: Option<PathBuf>,
    #[serde(default)]
    os_rom: Option<PathBuf>,
    /// Expected base64(SHA-1) over every driven byte of the session.
    #[serde(default)]
    digest: Option<String>,
    steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Step {
    ReadDir {
        expect_status: Option<u8>,
        expect_count: Option<u8>,
    },
    OpenItem {
        index: u8,
        expect_status: Option<u8>,
    },
    GetEntry {
        index: u8,
        expect_dir: Option<bool>,
        expect_name: Option<String>,
    },
    UpDir,
    RootDir,
    Search {
        term: String,
        expect_status: Option<u8>,
        expect_count: Option<u8>,
    },
    LoadSoftOs,
    SoftOsChunk {
        chunk: u8,
        expect_first: Option<u8>,
    },
    /// ACTIVATE with an ATR selected: mounts and stays in mailbox mode.
    ActivateDisk {
        expect_status: Option<u8>,
    },
    /// ACTIVATE handing the bus to a mapper; no mailbox response exists.
    ActivateCart,
    ReadSector {
        sector: u16,
        page: u8,
        expect_status: Option<u8>,
        expect_first: Option<u8>,
    },
    WriteSector {
        sector: u16,
        page: u8,
        fill: u8,
        expect_status: Option<u8>,
    },
    AtrHeader {
        expect_status: Option<u8>,
    },
    NoCart,
    S4Read {
        addr: u16,
        expect: Option<u8>,
    },
    S5Read {
        addr: u16,
        expect: Option<u8>,
    },
    CctlRead {
        offset: u8,
        expect: Option<u8>,
    },
    CctlWrite {
        offset: u8,
        value: u8,
    },
}

impl Step {
    /// Cycles for this step and the index of the first response read.
    fn plan(&self) -> (Vec<Cycle>, usize) {
        match self {
            Step::ReadDir { .. } => with_reads(command_cycles(CMD_READ_CUR_DIR, &[]), 0x01, 2),
            Step::OpenItem { index, .. } => {
                with_reads(command_cycles(CMD_OPEN_ITEM, &[(0x00, *index)]), 0x01, 1)
            }
            Step::GetEntry { index, .. } => {
                with_reads(command_cycles(CMD_GET_DIR_ENTRY, &[(0x00, *index)]), 0x01, 33)
            }
            Step::UpDir => (command_cycles(CMD_UP_DIR, &[]), 0),
            Step::RootDir => (command_cycles(CMD_ROOT_DIR, &[]), 0),
            Step::Search { term, .. } => {
                with_reads(command_cycles(CMD_SEARCH, &string_param(term)), 0x01, 2)
            }
            Step::LoadSoftOs => with_reads(command_cycles(CMD_LOAD_SOFT_OS, &[]), 0x01, 1),
            Step::SoftOsChunk { chunk, .. } => {
                with_reads(command_cycles(CMD_SOFT_OS_CHUNK, &[(0x00, *chunk)]), 0x01, 128)
            }
            Step::ActivateDisk { .. } => {
                with_reads(command_cycles(CMD_ACTIVATE_CART, &[]), 0x01, 17)
            }
            Step::ActivateCart => (command_cycles(CMD_ACTIVATE_CART, &[]), 0),
            Step::ReadSector { sector, page, .. } => {
                let [lo, hi] = sector.to_le_bytes();
                with_reads(
                    command_cycles(CMD_READ_ATR_SECTOR, &[(0x01, lo), (0x02, hi), (0x03, *page)]),
                    0x01,
                    129,
                )
            }
            Step::WriteSector { sector, page, fill, .. } => {
                let [lo, hi] = sector.to_le_bytes();
                let mut params = vec![(0x01u8, lo), (0x02, hi), (0x03, *page)];
                for i in 0..128u8 {
                    params.push((4 + i, *fill));
                }
                with_reads(command_cycles(CMD_WRITE_ATR_SECTOR, &params), 0x01, 1)
            }
            Step::AtrHeader { .. } => with_reads(command_cycles(CMD_ATR_HEADER, &[]), 0x01, 17),
            Step::NoCart => (command_cycles(CMD_NO_CART, &[]), 0),
            Step::S4Read { addr, .. } => (vec![Cycle::s4_read(*addr)], 0),
            Step::S5Read { addr, .. } => (vec![Cycle::s5_read(*addr)], 0),
            Step::CctlRead { offset, .. } => (vec![Cycle::cctl_read(*offset)], 0),
            Step::CctlWrite { offset, value } => (vec![Cycle::cctl_write(*offset, *value)], 0),
        }
    }

    /// Compare the step's expectations against its completed transactions.
    fn check(&self, resp: &[Served], failures: &mut Vec<String>) {
        let byte = |i: usize| resp.get(i).and_then(|s| s.driven);
        match self {
            Step::ReadDir { expect_status, expect_count } => {
                expect_byte(failures, "read_dir status", *expect_status, byte(0));
                expect_byte(failures, "read_dir count", *expect_count, byte(1));
            }
            Step::OpenItem { expect_status, .. } => {
                expect_byte(failures, "open_item status", *expect_status, byte(0));
            }
            Step::GetEntry { expect_dir, expect_name, .. } => {
                expect_byte(failures, "get_entry is_dir", expect_dir.map(u8::from), byte(0));
                if let Some(want) = expect_name {
                    let got: Vec<u8> = resp
                        .get(1..)
                        .unwrap_or(&[])
                        .iter()
                        .map(|s| s.driven.unwrap_or(0))
                        .take_while(|&b| b != 0)
                        .collect();
                    if got != want.as_bytes() {
                        failures.push(format!(
                            "get_entry name: expected {want:?}, got {:?}",
                            String::from_utf8_lossy(&got)
                        ));
                    }
                }
            }
            Step::Search { expect_status, expect_count, .. } => {
                expect_byte(failures, "search status", *expect_status, byte(0));
                expect_byte(failures, "search count", *expect_count, byte(1));
            }
            Step::SoftOsChunk { expect_first, .. } => {
                expect_byte(failures, "soft_os_chunk first byte", *expect_first, byte(0));
            }
            Step::ActivateDisk { expect_status } => {
                expect_byte(failures, "activate_disk status", *expect_status, byte(0));
            }
            Step::ReadSector { expect_status, expect_first, .. } => {
                expect_byte(failures, "read_sector status", *expect_status, byte(0));
                expect_byte(failures, "read_sector first byte", *expect_first, byte(1));
            }
            Step::WriteSector { expect_status, .. } => {
                expect_byte(failures, "write_sector status", *expect_status, byte(0));
            }
            Step::AtrHeader { expect_status } => {
                expect_byte(failures, "atr_header status", *expect_status, byte(0));
            }
            Step::S4Read { expect, .. } => expect_byte(failures, "s4 read", *expect, byte(0)),
            Step::S5Read { expect, .. } => expect_byte(failures, "s5 read", *expect, byte(0)),
            Step::CctlRead { expect, .. } => expect_byte(failures, "cctl read", *expect, byte(0)),
            Step::UpDir
            | Step::RootDir
            | Step::LoadSoftOs
            | Step::ActivateCart
            | Step::NoCart
            | Step::CctlWrite { .. } => {}
        }
    }
}

fn expect_byte(failures: &mut Vec<String>, label: &str, want: Option<u8>, got: Option<u8>) {
    if let Some(want) = want {
        if got != Some(want) {
            failures.push(format!("{label}: expected {want}, got {got:?}"));
        }
    }
}

fn with_reads(mut cycles: Vec<Cycle>, offset: u8, len: usize) -> (Vec<Cycle>, usize) {
    let resp_at = cycles.len();
    cycles.extend(read_mailbox_cycles(offset, len));
    (cycles, resp_at)
}

fn load_fixed<const N: usize>(base: &Path, path: Option<&PathBuf>) -> Result<Box<[u8; N]>> {
    let mut image = Box::new([0u8; N]);
    if let Some(path) = path {
        let path = base.join(path);
        let bytes =
            fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        if bytes.len() > N {
            bail!("{} is larger than {} bytes", path.display(), N);
        }
        image[..bytes.len()].copy_from_slice(&bytes);
    }
    Ok(image)
}

fn session_digest(served: &[Served]) -> String {
    let mut hasher = Sha1::new();
    for s in served {
        hasher.update([s.driven.is_some() as u8, s.driven.unwrap_or(0)]);
    }
    BASE64_STANDARD.encode(hasher.finalize())
}

struct SessionOutcome {
    failures: Vec<String>,
    detail: String,
}

fn run_session(path: &Path) -> Result<SessionOutcome> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read session {}", path.display()))?;
    let session: Session = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse session {}", path.display()))?;
    let base = path.parent().unwrap_or(Path::new("."));

    let boot = load_fixed::<BOOT_ROM_LEN>(base, session.boot_rom.as_ref())?;
    let os = load_fixed::<OS_ROM_LEN>(base, session.os_rom.as_ref())?;
    let mut firmware = Firmware::new(base.join(&session.media_root), boot, os);

    // The whole session is one powered interval; reset comes when the
    // script runs out.
    let mut script = Vec::new();
    let mut spans = Vec::new();
    for step in &session.steps {
        let (cycles, resp_at) = step.plan();
        spans.push((script.len() + resp_at, script.len() + cycles.len()));
        script.extend(cycles);
    }

    let mut bus = SimBus::new(script);
    firmware.run(&mut bus);
    let served = bus.served();

    let mut failures = Vec::new();
    for (step, &(resp_at, end)) in session.steps.iter().zip(&spans) {
        let resp = &served[resp_at.min(served.len())..end.min(served.len())];
        step.check(resp, &mut failures);
    }

    let digest = session_digest(served);
    if let Some(want) = &session.digest {
        if want != &digest {
            failures.push(format!("session digest: expected {want}, got {digest}"));
        }
    }

    let name = session.name.as_deref().unwrap_or("unnamed session");
    let detail = format!(
        "{name}: {} steps, cart at exit: {}, digest {digest}",
        session.steps.len(),
        firmware.cart_type().describe()
    );
    Ok(SessionOutcome { failures, detail })
}

fn print_help() {
    println!(
        "Session runner for Anode-8\n\n\
Usage:\n\
  anode8_session <session.json>...\n\n\
Each session file describes one powered interval: media root, host\n\
commands, and expectations. Paths inside a session are relative to the\n\
session file."
    );
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let start = Instant::now();
    let mut passed = 0usize;
    let mut failed = 0usize;
    let mut skipped = 0usize;

    for arg in &args {
        let path = PathBuf::from(arg);
        let label = path.display();
        match run_session(&path) {
            Ok(outcome) if outcome.failures.is_empty() => {
                passed += 1;
                println!("PASS {label}");
                println!("  {}", outcome.detail);
            }
            Ok(outcome) => {
                failed += 1;
                println!("FAIL {label}");
                println!("  {}", outcome.detail);
                for failure in outcome.failures {
                    println!("  - {failure}");
                }
            }
            Err(err) => {
                skipped += 1;
                println!("SKIP {label} -> {err}");
            }
        }
    }

    let elapsed = start.elapsed().as_secs_f32();
    println!();
    println!("Summary:");
    println!("- Passed: {passed}");
    println!("- Failed: {failed}");
    println!("- Skipped: {skipped}");
    println!("- Runtime: {:.2}s", elapsed);

    Ok(())
}

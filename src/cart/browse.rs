//! Directory browsing over the media filesystem.
//!
//! Listings and search results are handed to the host as fixed 256-byte
//! records packed from the start of bank A, at most 255 of them; the host
//! addresses them by index through the mailbox. Directories sort before
//! files, both case-insensitively by name; search results additionally rank
//! prefix matches ahead of other substring matches.

use std::fs;
use std::io;
use std::path::Path;

use crate::cart::BANK_LEN;
use crate::cart::image::VALID_EXTENSIONS;

pub const DIR_ENTRY_LEN: usize = 256;
pub const MAX_DIR_ENTRIES: usize = 255;

const SHORT_NAME_LEN: usize = 13;
const LONG_NAME_LEN: usize = 32;
const FULL_PATH_LEN: usize = 210;

const SHORT_NAME_AT: usize = 1;
const LONG_NAME_AT: usize = SHORT_NAME_AT + SHORT_NAME_LEN;
const FULL_PATH_AT: usize = LONG_NAME_AT + LONG_NAME_LEN;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirEntry {
    pub is_dir: bool,
    /// 8.3-style display name.
    pub short_name: String,
    /// Name used for navigation and opening; capped at 31 bytes.
    pub long_name: String,
    /// Media-relative directory holding the entry; search results only.
    pub full_path: String,
}

impl DirEntry {
    pub fn pack_into(&self, record: &mut [u8]) {
        record[..DIR_ENTRY_LEN].fill(0);
        record[0] = self.is_dir as u8;
        pack_str(&mut record[SHORT_NAME_AT..LONG_NAME_AT], &self.short_name);
        pack_str(&mut record[LONG_NAME_AT..FULL_PATH_AT], &self.long_name);
        pack_str(&mut record[FULL_PATH_AT..DIR_ENTRY_LEN], &self.full_path);
    }

    pub fn unpack(record: &[u8]) -> DirEntry {
        DirEntry {
            is_dir: record[0] != 0,
            short_name: unpack_str(&record[SHORT_NAME_AT..LONG_NAME_AT]),
            long_name: unpack_str(&record[LONG_NAME_AT..FULL_PATH_AT]),
            full_path: unpack_str(&record[FULL_PATH_AT..DIR_ENTRY_LEN]),
        }
    }
}

fn pack_str(field: &mut [u8], s: &str) {
    let n = truncated_len(s, field.len() - 1);
    field[..n].copy_from_slice(&s.as_bytes()[..n]);
}

fn unpack_str(field: &[u8]) -> String {
    let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..len]).into_owned()
}

/// Longest prefix of `s` that fits `max` bytes without splitting a char.
fn truncated_len(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    let mut n = 0;
    for (i, c) in s.char_indices() {
        if i + c.len_utf8() > max {
            break;
        }
        n = i + c.len_utf8();
    }
    n
}

fn truncate_to(s: &str, max: usize) -> String {
    s[..truncated_len(s, max)].to_string()
}

/// Derive an 8.3-style display name.
fn short_name_of(name: &str) -> String {
    let upper = name.to_ascii_uppercase();
    match upper.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            format!("{}.{}", truncate_to(stem, 8), truncate_to(ext, 3))
        }
        _ => truncate_to(&upper, 12),
    }
}

pub fn is_valid_file(name: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(_, ext)| VALID_EXTENSIONS.iter().any(|v| ext.eq_ignore_ascii_case(v)))
}

fn entry_for(name: &str, is_dir: bool, full_path: &str) -> DirEntry {
    DirEntry {
        is_dir,
        short_name: short_name_of(name),
        long_name: truncate_to(name, LONG_NAME_LEN - 1),
        full_path: truncate_to(full_path, FULL_PATH_LEN - 1),
    }
}

/// List one directory level: directories first, then openable files, each
/// group sorted case-insensitively by name. Dot-prefixed entries are
/// treated as hidden.
pub fn read_directory(path: &Path) -> io::Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    for item in fs::read_dir(path)? {
        let item = item?;
        let name = item.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let is_dir = item.file_type()?.is_dir();
        if !is_dir && !is_valid_file(&name) {
            continue;
        }
        entries.push(entry_for(&name, is_dir, ""));
        if entries.len() == MAX_DIR_ENTRIES {
            break;
        }
    }
    entries.sort_by(|a, b| {
        b.is_dir
            .cmp(&a.is_dir)
            .then_with(|| a.long_name.to_ascii_lowercase().cmp(&b.long_name.to_ascii_lowercase()))
    });
    Ok(entries)
}

/// Recursively collect files under `root`/`rel` whose name contains `term`
/// (case-insensitive). Prefix matches rank before other matches, then name
/// order. `rel` is the media-relative path recorded into each result.
pub fn search_directory(root: &Path, rel: &str, term: &str) -> io::Result<Vec<DirEntry>> {
    let needle = term.to_ascii_lowercase();
    let mut matches: Vec<(usize, DirEntry)> = Vec::new();
    scan(root, rel, &needle, &mut matches)?;
    matches.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then_with(|| a.1.long_name.to_ascii_lowercase().cmp(&b.1.long_name.to_ascii_lowercase()))
    });
    Ok(matches.into_iter().map(|(_, e)| e).collect())
}

fn scan(
    root: &Path,
    rel: &str,
    needle: &str,
    matches: &mut Vec<(usize, DirEntry)>,
) -> io::Result<()> {
    let host = root.join(rel.trim_start_matches('/'));
    for item in fs::read_dir(host)? {
        if matches.len() == MAX_DIR_ENTRIES {
            break;
        }
        let item = item?;
        let name = item.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if item.file_type()?.is_dir() {
            let sub = format!("{rel}/{name}");
            // No room to record deeper paths in a packed entry.
            if sub.len() >= FULL_PATH_LEN {
                continue;
            }
            scan(root, &sub, needle, matches)?;
        } else if is_valid_file(&name) {
            let lower = name.to_ascii_lowercase();
            match lower.find(needle) {
                Some(0) => matches.push((0, entry_for(&name, false, rel))),
                Some(_) => matches.push((1, entry_for(&name, false, rel))),
                None => {}
            }
        }
    }
    Ok(())
}

/// Pack a listing into bank A, one 256-byte record per entry from offset 0.
pub fn pack_listing(entries: &[DirEntry], bank: &mut [u8; BANK_LEN]) {
    for (i, entry) in entries.iter().take(MAX_DIR_ENTRIES).enumerate() {
        entry.pack_into(&mut bank[i * DIR_ENTRY_LEN..(i + 1) * DIR_ENTRY_LEN]);
    }
}

/// Decode the record at `index` from bank A.
pub fn entry_at(bank: &[u8; BANK_LEN], index: usize) -> DirEntry {
    let at = index.min(MAX_DIR_ENTRIES - 1) * DIR_ENTRY_LEN;
    DirEntry::unpack(&bank[at..at + DIR_ENTRY_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::testfs;

    #[test]
    fn pack_unpack_round_trip() {
        let entry = DirEntry {
            is_dir: true,
            short_name: "GAMES".into(),
            long_name: "Games".into(),
            full_path: "/stuff".into(),
        };
        let mut record = [0xFFu8; DIR_ENTRY_LEN];
        entry.pack_into(&mut record);
        assert_eq!(DirEntry::unpack(&record), entry);
    }

    #[test]
    fn pack_truncates_oversized_names() {
        let entry = DirEntry {
            is_dir: false,
            short_name: "X".repeat(40),
            long_name: "Y".repeat(40),
            full_path: "Z".repeat(400),
        };
        let mut record = [0u8; DIR_ENTRY_LEN];
        entry.pack_into(&mut record);
        let back = DirEntry::unpack(&record);
        assert_eq!(back.short_name.len(), 12);
        assert_eq!(back.long_name.len(), 31);
        assert_eq!(back.full_path.len(), 209);
    }

    #[test]
    fn short_names_are_8_3_style() {
        assert_eq!(short_name_of("adventure.xex"), "ADVENTUR.XEX");
        assert_eq!(short_name_of("demo.rom"), "DEMO.ROM");
        assert_eq!(short_name_of("subdir"), "SUBDIR");
    }

    #[test]
    fn listing_sorts_directories_before_files() {
        let dir = testfs::dir("browse-order");
        testfs::file(&dir, "zeta.rom", b"z");
        testfs::file(&dir, "Alpha.xex", b"a");
        testfs::file(&dir, "notes.txt", b"n");
        testfs::file(&dir, ".hidden.rom", b"h");
        testfs::subdir(&dir, "worlds");
        testfs::subdir(&dir, "Demos");

        let names: Vec<(bool, String)> = read_directory(&dir)
            .expect("read")
            .into_iter()
            .map(|e| (e.is_dir, e.long_name))
            .collect();
        assert_eq!(
            names,
            vec![
                (true, "Demos".to_string()),
                (true, "worlds".to_string()),
                (false, "Alpha.xex".to_string()),
                (false, "zeta.rom".to_string()),
            ]
        );
    }

    #[test]
    fn search_ranks_prefix_matches_first() {
        let dir = testfs::dir("browse-rank");
        testfs::file(&dir, "ZABC.XEX", b"z");
        testfs::file(&dir, "ABC.XEX", b"a");

        let names: Vec<String> = search_directory(&dir, "", "ABC")
            .expect("search")
            .into_iter()
            .map(|e| e.long_name)
            .collect();
        assert_eq!(names, vec!["ABC.XEX".to_string(), "ZABC.XEX".to_string()]);
    }

    #[test]
    fn search_recurses_and_records_relative_paths() {
        let dir = testfs::dir("browse-recurse");
        let sub = testfs::subdir(&dir, "GAMES");
        testfs::file(&sub, "PITFALL.CAR", b"p");
        testfs::file(&dir, "PITSTOP.ROM", b"p");
        testfs::file(&dir, "README.txt", b"r");

        let found = search_directory(&dir, "", "PIT").expect("search");
        assert_eq!(found.len(), 2);
        let by_name: Vec<(String, String)> = found
            .into_iter()
            .map(|e| (e.long_name, e.full_path))
            .collect();
        assert!(by_name.contains(&("PITFALL.CAR".to_string(), "/GAMES".to_string())));
        assert!(by_name.contains(&("PITSTOP.ROM".to_string(), "".to_string())));
    }

    #[test]
    fn listing_skips_files_with_foreign_extensions() {
        let dir = testfs::dir("browse-ext");
        testfs::file(&dir, "a.rom", b"");
        testfs::file(&dir, "b.CaR", b"");
        testfs::file(&dir, "c.atr", b"");
        testfs::file(&dir, "d.xex", b"");
        testfs::file(&dir, "e.exe", b"");
        testfs::file(&dir, "noext", b"");

        let entries = read_directory(&dir).expect("read");
        assert_eq!(entries.len(), 4);
    }

    #[test]
    fn entry_at_reads_packed_records_back() {
        let entries = vec![
            DirEntry { is_dir: true, short_name: "A".into(), long_name: "a".into(), full_path: String::new() },
            DirEntry { is_dir: false, short_name: "B.ROM".into(), long_name: "b.rom".into(), full_path: "/x".into() },
        ];
        let mut bank = Box::new([0u8; BANK_LEN]);
        pack_listing(&entries, &mut bank);
        assert_eq!(entry_at(&bank, 0), entries[0]);
        assert_eq!(entry_at(&bank, 1), entries[1]);
    }
}

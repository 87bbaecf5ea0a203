//! Cartridge image loading.
//!
//! Three container formats reach the banks: `.CAR` files carry a 16-byte
//! header whose type code picks the mapper and the exact payload size,
//! `.XEX` executables are staged for the loader with a little-endian length
//! stamp in the first four bytes of bank A, and anything else is treated as
//! a raw ROM dump classified by its size alone.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::cart::{BANK_LEN, CartMemory, CartType};

pub const CAR_HEADER_LEN: usize = 16;
/// Bank A bytes reserved for the XEX length stamp.
const XEX_PREFIX: usize = 4;

/// File extensions the browser offers for opening.
pub const VALID_EXTENSIONS: [&str; 4] = ["CAR", "ROM", "XEX", "ATR"];

#[derive(Debug)]
pub enum LoadError {
    NoMedia,
    NotFound,
    BadFormat,
    WrongSize,
    TooLarge,
    Unsupported,
    Io(io::Error),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            LoadError::NoMedia => "Can't read media",
            LoadError::NotFound => "Can't open file",
            LoadError::BadFormat => "Bad CAR file",
            LoadError::WrongSize => "File is wrong size",
            LoadError::TooLarge => "File too big (>128k)",
            LoadError::Unsupported => "Unsupported CAR type",
            LoadError::Io(_) => "Can't read file",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for LoadError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            LoadError::NotFound
        } else {
            LoadError::Io(err)
        }
    }
}

/// CAR header type code to (cartridge class, expected payload size).
fn classify_car(code: u8) -> Option<(CartType, usize)> {
    let entry = match code {
        1 => (CartType::Std8k, 8 * 1024),
        2 => (CartType::Std16k, 16 * 1024),
        3 => (CartType::Oss034m, 16 * 1024),
        8 => (CartType::Williams, 64 * 1024),
        9 => (CartType::Express64k, 64 * 1024),
        10 => (CartType::Diamond64k, 64 * 1024),
        11 => (CartType::Sdx64k, 64 * 1024),
        12 => (CartType::Xegs32k, 32 * 1024),
        13 => (CartType::Xegs64k, 64 * 1024),
        14 => (CartType::Xegs128k, 128 * 1024),
        15 => (CartType::OssTypeB16k, 16 * 1024),
        18 => (CartType::BountyBob, 40 * 1024),
        22 => (CartType::Williams, 32 * 1024),
        26 => (CartType::Megacart16k, 16 * 1024),
        27 => (CartType::Megacart32k, 32 * 1024),
        28 => (CartType::Megacart64k, 64 * 1024),
        29 => (CartType::Megacart128k, 128 * 1024),
        33 => (CartType::SwXegs32k, 32 * 1024),
        34 => (CartType::SwXegs64k, 64 * 1024),
        35 => (CartType::SwXegs128k, 128 * 1024),
        40 => (CartType::Blizzard16k, 16 * 1024),
        41 => (CartType::Atarimax1Mbit, 128 * 1024),
        43 => (CartType::Sdx128k, 128 * 1024),
        44 => (CartType::Oss8k, 8 * 1024),
        45 => (CartType::Oss043m, 16 * 1024),
        54 => (CartType::Sic128k, 128 * 1024),
        _ => return None,
    };
    Some(entry)
}

/// Raw ROM dumps are classified by size alone; banked sizes default to the
/// XEGS scheme.
fn classify_raw(size: usize) -> Option<CartType> {
    match size {
        0x2000 => Some(CartType::Std8k),
        0x4000 => Some(CartType::Std16k),
        0x8000 => Some(CartType::Xegs32k),
        0x10000 => Some(CartType::Xegs64k),
        0x20000 => Some(CartType::Xegs128k),
        _ => None,
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

fn read_fully(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Read, classify and stage a cartridge image. On success the decoded image
/// is resident in the banks and the cartridge class is returned; the banks'
/// previous contents (typically the directory listing) are gone either way.
pub fn load_image(path: &Path, mem: &mut CartMemory) -> Result<CartType, LoadError> {
    let is_car = has_extension(path, "car");
    let is_xex = has_extension(path, "xex");

    let mut file = File::open(path)?;

    let mut car_kind = None;
    if is_car {
        let mut header = [0u8; CAR_HEADER_LEN];
        file.read_exact(&mut header)
            .map_err(|_| LoadError::BadFormat)?;
        car_kind = Some(classify_car(header[7]).ok_or(LoadError::Unsupported)?);
    }

    // The payload fills bank A then bank B; one readable byte past 128 KiB
    // means the image cannot fit.
    let skip = if is_xex { XEX_PREFIX } else { 0 };
    let mut size = read_fully(&mut file, &mut mem.bank_a[skip..])?;
    if skip + size == BANK_LEN {
        let second = read_fully(&mut file, &mut mem.bank_b[..])?;
        size += second;
        if second == BANK_LEN {
            let mut probe = [0u8; 1];
            if file.read(&mut probe)? != 0 {
                return Err(LoadError::TooLarge);
            }
        }
    }

    if let Some((kind, expected)) = car_kind {
        if size != expected {
            return Err(LoadError::WrongSize);
        }
        Ok(kind)
    } else if is_xex {
        mem.bank_a[0] = size as u8;
        mem.bank_a[1] = (size >> 8) as u8;
        mem.bank_a[2] = (size >> 16) as u8;
        mem.bank_a[3] = 0;
        Ok(CartType::Xex)
    } else {
        classify_raw(size).ok_or(LoadError::WrongSize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::testfs;

    fn car_bytes(code: u8, payload_len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; CAR_HEADER_LEN];
        bytes[0..4].copy_from_slice(b"CART");
        bytes[7] = code;
        bytes.extend(std::iter::repeat_n(0x5A, payload_len));
        bytes
    }

    #[test]
    fn car_header_selects_type_and_checks_size() {
        let dir = testfs::dir("image-car");
        let path = testfs::file(&dir, "GAME.CAR", &car_bytes(13, 64 * 1024));

        let mut mem = CartMemory::new();
        let kind = load_image(&path, &mut mem).expect("valid CAR");
        assert_eq!(kind, CartType::Xegs64k);
        assert_eq!(mem.bank_a[0], 0x5A);
        assert_eq!(mem.bank_a[0xFFFF], 0x5A);
    }

    #[test]
    fn car_with_wrong_payload_size_is_rejected() {
        let dir = testfs::dir("image-car-short");
        let path = testfs::file(&dir, "GAME.CAR", &car_bytes(13, 32 * 1024));

        let mut mem = CartMemory::new();
        assert!(matches!(
            load_image(&path, &mut mem),
            Err(LoadError::WrongSize)
        ));
    }

    #[test]
    fn unknown_car_type_code_is_unsupported() {
        let dir = testfs::dir("image-car-unknown");
        let path = testfs::file(&dir, "GAME.CAR", &car_bytes(200, 8 * 1024));

        let mut mem = CartMemory::new();
        assert!(matches!(
            load_image(&path, &mut mem),
            Err(LoadError::Unsupported)
        ));
    }

    #[test]
    fn truncated_car_header_is_bad_format() {
        let dir = testfs::dir("image-car-trunc");
        let path = testfs::file(&dir, "GAME.CAR", b"CART");

        let mut mem = CartMemory::new();
        assert!(matches!(
            load_image(&path, &mut mem),
            Err(LoadError::BadFormat)
        ));
    }

    #[test]
    fn raw_rom_sizes_map_to_classes() {
        let dir = testfs::dir("image-raw");
        let cases = [
            (0x2000, CartType::Std8k),
            (0x4000, CartType::Std16k),
            (0x8000, CartType::Xegs32k),
            (0x10000, CartType::Xegs64k),
            (0x20000, CartType::Xegs128k),
        ];
        for (size, expected) in cases {
            let path = testfs::file(&dir, &format!("ROM{size}.ROM"), &vec![0x11u8; size]);
            let mut mem = CartMemory::new();
            assert_eq!(load_image(&path, &mut mem).expect("raw ROM"), expected);
        }
    }

    #[test]
    fn raw_rom_with_odd_size_is_rejected() {
        let dir = testfs::dir("image-raw-odd");
        let path = testfs::file(&dir, "ODD.ROM", &vec![0u8; 12345]);
        let mut mem = CartMemory::new();
        assert!(matches!(
            load_image(&path, &mut mem),
            Err(LoadError::WrongSize)
        ));
    }

    #[test]
    fn xex_gets_length_stamp_and_spills_into_bank_b() {
        let dir = testfs::dir("image-xex");
        let len = 70_000usize;
        let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let path = testfs::file(&dir, "DEMO.XEX", &payload);

        let mut mem = CartMemory::new();
        assert_eq!(load_image(&path, &mut mem).expect("XEX"), CartType::Xex);
        let stamped = u32::from_le_bytes([
            mem.bank_a[0],
            mem.bank_a[1],
            mem.bank_a[2],
            mem.bank_a[3],
        ]);
        assert_eq!(stamped as usize, len);
        assert_eq!(mem.bank_a[4], payload[0]);
        assert_eq!(mem.bank_a[0xFFFF], payload[BANK_LEN - 5]);
        assert_eq!(mem.bank_b[0], payload[BANK_LEN - 4]);
    }

    #[test]
    fn oversized_image_is_too_large() {
        let dir = testfs::dir("image-big");
        let path = testfs::file(&dir, "BIG.ROM", &vec![0u8; 128 * 1024 + 1]);
        let mut mem = CartMemory::new();
        assert!(matches!(
            load_image(&path, &mut mem),
            Err(LoadError::TooLarge)
        ));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = testfs::dir("image-missing");
        let mut mem = CartMemory::new();
        assert!(matches!(
            load_image(&dir.join("NOPE.ROM"), &mut mem),
            Err(LoadError::NotFound)
        ));
    }
}

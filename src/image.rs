use std::{
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

use tracing::info;

use crate::{error::PlacerError, ui};

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const SECTOR_SIZES: [u64; 2] = [512, 4096];
const COPY_CHUNK: usize = 4 * 1024 * 1024;
const ENTRY_SIZES: std::ops::RangeInclusive<u32> = 128..=4096;
const MAX_ENTRIES: u32 = 1024;

// ── Data types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub number: u32,
    pub first_lba: u64,
    pub last_lba: u64,
    pub sector_size: u64,
    pub name: String,
}

impl Partition {
    pub fn size_bytes(&self) -> u64 {
        (self.last_lba + 1).saturating_sub(self.first_lba) * self.sector_size
    }

    /// One-line label shown in the partition selector.
    pub fn display(&self) -> String {
        let name = if self.name.is_empty() { "—" } else { self.name.as_str() };
        format!(
            "Partition {:<3} {:>8}MB   {}",
            self.number,
            self.size_bytes() / 1024 / 1024,
            name
        )
    }
}

struct GptHeader {
    sector_size: u64,
    entries_lba: u64,
    entry_count: u32,
    entry_size: u32,
}

// ── GPT parsing ───────────────────────────────────────────────────────────────

fn read_at(file: &mut File, offset: u64, buf: &mut [u8]) -> io::Result<bool> {
    file.seek(SeekFrom::Start(offset))?;
    match file.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn u32_le(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn u64_le(b: &[u8]) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[..8]);
    u64::from_le_bytes(a)
}

fn read_header(path: &Path) -> Result<(File, GptHeader), PlacerError> {
    let mut file = File::open(path).map_err(PlacerError::file("open image", path))?;

    // Protective MBR boot signature.
    let mut mbr = [0u8; 512];
    if !read_at(&mut file, 0, &mut mbr)? || mbr[510..512] != [0x55, 0xAA] {
        return Err(PlacerError::NotGpt(path.to_path_buf()));
    }

    for sector_size in SECTOR_SIZES {
        let mut hdr = [0u8; 92];
        if !read_at(&mut file, sector_size, &mut hdr)? {
            continue;
        }
        if &hdr[0..8] != GPT_SIGNATURE {
            continue;
        }
        let header = GptHeader {
            sector_size,
            entries_lba: u64_le(&hdr[72..80]),
            entry_count: u32_le(&hdr[80..84]),
            entry_size: u32_le(&hdr[84..88]),
        };
        return Ok((file, header));
    }

    Err(PlacerError::NotGpt(path.to_path_buf()))
}

/// Fails unless `path` is a readable image with a GPT partition table.
pub fn validate_gpt(path: &Path) -> Result<(), PlacerError> {
    read_header(path).map(|_| ())
}

/// Lists the used GPT entries of an image, numbered from 1 in table order.
pub fn list_partitions(path: &Path) -> Result<Vec<Partition>, PlacerError> {
    let (mut file, header) = read_header(path)?;
    let not_gpt = || PlacerError::NotGpt(path.to_path_buf());
    if !ENTRY_SIZES.contains(&header.entry_size) || header.entry_count > MAX_ENTRIES {
        return Err(not_gpt());
    }

    let table_len = (header.entry_count as usize)
        .checked_mul(header.entry_size as usize)
        .ok_or_else(not_gpt)?;
    let offset = header
        .entries_lba
        .checked_mul(header.sector_size)
        .ok_or_else(not_gpt)?;
    let mut table = vec![0u8; table_len];
    if !read_at(&mut file, offset, &mut table)? {
        return Err(not_gpt());
    }

    let partitions = table
        .chunks(header.entry_size as usize)
        .enumerate()
        .filter(|(_, e)| e[0..16].iter().any(|b| *b != 0)) // empty type GUID = unused slot
        .map(|(i, e)| {
            let name_units: Vec<u16> = e[56..128]
                .chunks(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .take_while(|u| *u != 0)
                .collect();
            Partition {
                number: i as u32 + 1,
                first_lba: u64_le(&e[32..40]),
                last_lba: u64_le(&e[40..48]),
                sector_size: header.sector_size,
                name: String::from_utf16_lossy(&name_units),
            }
        })
        .collect();

    Ok(partitions)
}

// ── Cloning ───────────────────────────────────────────────────────────────────

/// Copies `source` byte for byte into a new file at `target`.
/// The partition table and every partition come along unchanged.
pub fn clone_image(source: &Path, target: &Path) -> Result<(), PlacerError> {
    validate_gpt(source)?;
    info!(source = %source.display(), target = %target.display(), "cloning image");

    let mut src = File::open(source).map_err(PlacerError::file("open image", source))?;
    let total = src.metadata()?.len();
    let mut dst = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
        .map_err(PlacerError::file("create image", target))?;

    let pb = ui::byte_progress(total, "Cloning image");
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        let n = src.read(&mut buf).map_err(PlacerError::file("read image", source))?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])
            .map_err(PlacerError::file("write image", target))?;
        pb.inc(n as u64);
    }
    dst.sync_all().map_err(PlacerError::file("sync image", target))?;
    pb.finish_and_clear();

    ui::print_success(&format!("Image cloned to {}.", target.display()));
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

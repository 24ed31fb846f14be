//! File naming conventions and manifest triage
//!
//! Turns the raw `<file>` entries of a manifest into logical files:
//! split pieces are merged, repair files and archive parts are classified,
//! and archive continuation parts are ordered.

use crate::pipeline::{LogicalFile, Segment};
use crate::types::FileKind;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::LazyLock;

#[allow(clippy::expect_used)] // literal pattern
static SPLIT_PIECE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.(\d{3})$").expect("valid regex"));
#[allow(clippy::expect_used)] // literal pattern
static RAR_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(.+)\.part(\d+)\.rar$").expect("valid regex"));
#[allow(clippy::expect_used)] // literal pattern
static RAR_OLD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^(.+)\.r(\d{2,3})$").expect("valid regex"));
#[allow(clippy::expect_used)] // literal pattern
static PAR_BLOCKS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\+(\d+)\.par2$").expect("valid regex"));

/// A `<file>` entry as it appears in the manifest
#[derive(Clone, Debug)]
pub struct RawFile {
    /// Post subject
    pub subject: String,
    /// Newsgroups
    pub groups: Vec<String>,
    /// Segments in manifest order
    pub segments: Vec<Segment>,
}

/// Result of triage
#[derive(Debug, Default)]
pub struct Triaged {
    /// Logical files in manifest order
    pub files: Vec<LogicalFile>,
    /// Index of the primary repair file
    pub par_primary: Option<usize>,
    /// Indices of the other repair files
    pub par_continuations: Vec<usize>,
    /// Index of the primary archive part
    pub rar_primary: Option<usize>,
    /// Indices of archive continuation parts, in volume order
    pub rar_continuations: Vec<usize>,
    /// Base name of the winning archive set
    pub main_name: Option<String>,
}

/// Output filename carried by a post subject
///
/// The first quoted string wins; subjects without one get a stable hashed
/// name.
pub fn filename_from_subject(subject: &str) -> String {
    if let Some(start) = subject.find('"')
        && let Some(end) = subject[start + 1..].find('"')
    {
        let filename = subject[start + 1..start + 1 + end].trim();
        if !filename.is_empty() {
            return filename.to_string();
        }
    }

    let digest = format!("{:x}", Sha256::digest(subject.as_bytes()));
    format!("file_{}", &digest[..16])
}

/// PAR2 file of any kind
pub fn is_par2_file(filename: &str) -> bool {
    filename.to_lowercase().ends_with(".par2")
}

/// PAR2 index file (no recovery blocks)
pub fn is_primary_par2(filename: &str) -> bool {
    is_par2_file(filename) && !filename.to_lowercase().contains(".vol")
}

/// Recovery blocks declared by a `name.volNN+MM.par2` filename
pub fn par2_block_count(filename: &str) -> u64 {
    PAR_BLOCKS
        .captures(filename)
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(0)
}

/// Place of a file within a RAR set
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RarVolume {
    /// First volume: `name.rar` or `name.part01.rar`
    First {
        /// Set base name
        base: String,
    },
    /// Later volume, with its position key
    Continuation {
        /// Set base name
        base: String,
        /// Ordering key within the set
        order: u32,
    },
}

impl RarVolume {
    /// Base name of the set
    pub fn base(&self) -> &str {
        match self {
            RarVolume::First { base } | RarVolume::Continuation { base, .. } => base,
        }
    }
}

/// Classify a filename as a RAR volume
///
/// Recognizes `name.rar`, `name.partNN.rar` and the old-style `name.rNN`
/// continuation scheme where `.r00` follows `.rar`.
pub fn rar_volume(filename: &str) -> Option<RarVolume> {
    if let Some(caps) = RAR_PART.captures(filename) {
        let base = caps[1].to_string();
        let part: u32 = caps[2].parse().unwrap_or(0);
        return Some(if part <= 1 {
            RarVolume::First { base }
        } else {
            RarVolume::Continuation { base, order: part }
        });
    }

    if filename.to_lowercase().ends_with(".rar") {
        let base = filename[..filename.len() - 4].to_string();
        return Some(RarVolume::First { base });
    }

    if let Some(caps) = RAR_OLD.captures(filename) {
        let number: u32 = caps[2].parse().unwrap_or(0);
        return Some(RarVolume::Continuation {
            base: caps[1].to_string(),
            order: number.saturating_add(1),
        });
    }

    None
}

/// Merge, classify and order the raw entries of a manifest
pub fn triage(raw: Vec<RawFile>) -> Triaged {
    // Merge split pieces (name.001, name.002, ...) by their unsplit name
    let mut merged: Vec<(String, Vec<String>, Vec<(u32, Vec<Segment>)>)> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();

    for entry in raw {
        let mut name = filename_from_subject(&entry.subject);
        let mut piece = 0;
        if let Some(caps) = SPLIT_PIECE.captures(&name) {
            piece = caps[1].parse().unwrap_or(0);
            name.truncate(name.len() - 4);
        }

        match by_name.get(&name) {
            Some(&idx) => merged[idx].2.push((piece, entry.segments)),
            None => {
                by_name.insert(name.clone(), merged.len());
                merged.push((name, entry.groups, vec![(piece, entry.segments)]));
            }
        }
    }

    let mut out = Triaged::default();
    let mut volumes: Vec<(usize, RarVolume)> = Vec::new();
    let mut base_counts: HashMap<String, usize> = HashMap::new();
    let mut base_order: Vec<String> = Vec::new();

    for (name, groups, mut pieces) in merged {
        pieces.sort_by_key(|(piece, _)| *piece);
        let segments = pieces.into_iter().flat_map(|(_, segments)| segments).collect();
        let mut file = LogicalFile::new(name, groups, segments);
        let idx = out.files.len();

        if is_par2_file(&file.name) {
            file.kind = FileKind::Par;
            if is_primary_par2(&file.name) && out.par_primary.is_none() {
                out.par_primary = Some(idx);
            } else {
                out.par_continuations.push(idx);
            }
        } else if let Some(volume) = rar_volume(&file.name) {
            file.kind = FileKind::Rar;
            let base = volume.base().to_string();
            let count = base_counts.entry(base.clone()).or_insert(0);
            if *count == 0 {
                base_order.push(base);
            }
            *count += 1;
            volumes.push((idx, volume));
        }

        out.files.push(file);
    }

    // The set with the most members wins; first seen breaks ties
    let winner = base_order
        .iter()
        .fold(None::<(&String, usize)>, |best, base| {
            let count = base_counts.get(base).copied().unwrap_or(0);
            match best {
                Some((_, best_count)) if best_count >= count => best,
                _ => Some((base, count)),
            }
        })
        .map(|(base, _)| base.clone());

    if let Some(winner) = &winner {
        let mut continuations: Vec<(u32, usize)> = Vec::new();
        for (idx, volume) in &volumes {
            match volume {
                RarVolume::First { base } if base == winner && out.rar_primary.is_none() => {
                    out.rar_primary = Some(*idx);
                }
                RarVolume::First { base } if base == winner => continuations.push((0, *idx)),
                RarVolume::Continuation { base, order } if base == winner => continuations.push((*order, *idx)),
                _ => {}
            }
        }
        continuations.sort_by_key(|(order, _)| *order);
        out.rar_continuations = continuations.into_iter().map(|(_, idx)| idx).collect();

        if out.rar_primary.is_none() && !out.rar_continuations.is_empty() {
            out.rar_primary = Some(out.rar_continuations.remove(0));
        }

        for (position, idx) in out.rar_continuations.iter().enumerate() {
            out.files[*idx].suborder = u32::try_from(position + 1).unwrap_or(u32::MAX);
        }
    }
    out.main_name = winner;

    if out.par_primary.is_none() && !out.par_continuations.is_empty() {
        out.par_primary = Some(out.par_continuations.remove(0));
    }

    out
}

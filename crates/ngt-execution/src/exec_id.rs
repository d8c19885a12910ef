//! Execution-id correction parsing.
//!
//! A venue that corrects a fill re-sends it under the same *base* id with a
//! higher *revision* suffix (`0000e0d5.6576d2f4.01.01` → `.02`). The parser
//! splits the raw id; the store keeps the highest revision per base canonical.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecIdParts {
    pub base: String,
    pub revision: i32,
}

pub trait ExecIdParser: Send + Sync {
    /// Never fails: ids without a recognisable suffix are revision 0 with
    /// the whole id as base.
    fn parse(&self, raw: &str) -> ExecIdParts;
}

/// Last `separator`-delimited segment is the revision, read in `radix`, when
/// the id has at least `min_segments` segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuffixExecIdParser {
    pub separator: char,
    pub radix: u32,
    pub min_segments: usize,
}

impl Default for SuffixExecIdParser {
    fn default() -> Self {
        Self {
            separator: '.',
            radix: 16,
            min_segments: 2,
        }
    }
}

impl ExecIdParser for SuffixExecIdParser {
    fn parse(&self, raw: &str) -> ExecIdParts {
        let raw = raw.trim();
        let whole = || ExecIdParts {
            base: raw.to_string(),
            revision: 0,
        };

        if raw.split(self.separator).count() < self.min_segments.max(2) {
            return whole();
        }
        let Some((base, suffix)) = raw.rsplit_once(self.separator) else {
            return whole();
        };
        if base.is_empty() || suffix.is_empty() {
            return whole();
        }
        match i32::from_str_radix(suffix, self.radix) {
            Ok(revision) if revision >= 0 => ExecIdParts {
                base: base.to_string(),
                revision,
            },
            _ => whole(),
        }
    }
}

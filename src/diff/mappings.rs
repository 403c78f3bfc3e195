//! Derived lookup tables over a parsed diff.
//!
//! Built once per run in a single pass over the patches and treated as
//! read-only afterwards. Ordered collections keep serialization
//! deterministic: building twice from the same patches yields byte-identical
//! output.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use super::{FilePatch, Hunk, LineTag};

/// Aggregate counts for logging and run results.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MappingStats {
    pub total_files: usize,
    pub total_hunks: usize,
    pub total_changed_lines: usize,
}

/// Anchor lookup tables derived from the parsed diff.
#[derive(Debug, Clone, Serialize)]
pub struct DiffMappings {
    /// Hunks per file, in diff order
    file_hunks: BTreeMap<String, Vec<Hunk>>,
    pub all_file_paths: BTreeSet<String>,
    pub all_hunk_ids: BTreeSet<String>,
    /// Valid `(file_path, hunk_id)` anchor pairs
    pub allowed_anchors: BTreeSet<(String, String)>,
    /// `(file_path, absolute_new_line)` -> `(hunk_id, line_in_hunk)`
    #[serde(serialize_with = "serialize_line_lookup")]
    line_to_hunk_lookup: BTreeMap<(String, u32), (String, usize)>,
    pub stats: MappingStats,
}

/// Serialize the line lookup with `file:line` string keys so the JSON form
/// stays a plain object.
fn serialize_line_lookup<S>(
    lookup: &BTreeMap<(String, u32), (String, usize)>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(lookup.len()))?;
    for ((file, line), value) in lookup {
        map.serialize_entry(&format!("{file}:{line}"), value)?;
    }
    map.end()
}

impl DiffMappings {
    /// Build all tables in one pass over the patches.
    ///
    /// Walks each hunk's lines maintaining a running new-file counter:
    /// context and addition lines advance it and are recorded in the line
    /// lookup; deletions and no-eol markers do not.
    pub fn build(patches: &[FilePatch]) -> Self {
        let mut file_hunks: BTreeMap<String, Vec<Hunk>> = BTreeMap::new();
        let mut all_file_paths = BTreeSet::new();
        let mut all_hunk_ids = BTreeSet::new();
        let mut allowed_anchors = BTreeSet::new();
        let mut line_to_hunk_lookup = BTreeMap::new();
        let mut stats = MappingStats::default();

        for patch in patches {
            all_file_paths.insert(patch.file_path.clone());
            stats.total_files += 1;

            for hunk in &patch.hunks {
                stats.total_hunks += 1;
                all_hunk_ids.insert(hunk.hunk_id.clone());
                allowed_anchors.insert((patch.file_path.clone(), hunk.hunk_id.clone()));

                let mut new_line = hunk.new_start;
                for (idx, line) in hunk.lines.iter().enumerate() {
                    match line.tag {
                        LineTag::Context | LineTag::Addition => {
                            if line.tag == LineTag::Addition {
                                stats.total_changed_lines += 1;
                            }
                            line_to_hunk_lookup.insert(
                                (patch.file_path.clone(), new_line),
                                (hunk.hunk_id.clone(), idx),
                            );
                            new_line += 1;
                        }
                        LineTag::Deletion => {
                            stats.total_changed_lines += 1;
                        }
                        LineTag::NoEol => {}
                    }
                }
            }

            file_hunks.insert(patch.file_path.clone(), patch.hunks.clone());
        }

        Self {
            file_hunks,
            all_file_paths,
            all_hunk_ids,
            allowed_anchors,
            line_to_hunk_lookup,
            stats,
        }
    }

    /// Whether `(file_path, hunk_id)` is a valid anchor pair.
    pub fn is_valid_anchor(&self, file_path: &str, hunk_id: &str) -> bool {
        self.allowed_anchors
            .contains(&(file_path.to_string(), hunk_id.to_string()))
    }

    /// Look up a hunk by file and id.
    pub fn hunk(&self, file_path: &str, hunk_id: &str) -> Option<&Hunk> {
        self.file_hunks
            .get(file_path)?
            .iter()
            .find(|h| h.hunk_id == hunk_id)
    }

    /// Hunks of a file, in diff order.
    pub fn file_hunks(&self, file_path: &str) -> Option<&[Hunk]> {
        self.file_hunks.get(file_path).map(Vec::as_slice)
    }

    /// Map an absolute new-file line to its `(hunk_id, line_in_hunk)`.
    pub fn hunk_for_line(&self, file_path: &str, new_line: u32) -> Option<(&str, usize)> {
        self.line_to_hunk_lookup
            .get(&(file_path.to_string(), new_line))
            .map(|(id, idx)| (id.as_str(), *idx))
    }

    pub fn is_empty(&self) -> bool {
        self.file_hunks.is_empty()
    }
}

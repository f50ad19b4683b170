//! Dissimilarity matrices keyed by reward configurations

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{info, warn};

use crate::distance::SymmetricAggregation;
use crate::{RewardError, Result};

/// Denominators below this are floored when normalizing
pub const NORMALIZE_EPS: f64 = 1e-8;

/// External identifier of a reward source: a registry kind and a path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RewardCfg {
    /// Type tag, e.g. `rewcmp/PointMassDense-v0`
    pub kind: String,
    /// Location of the serialized reward, or a placeholder for built-ins
    pub path: String,
}

impl RewardCfg {
    /// Create a new reward cfg
    pub fn new(kind: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for RewardCfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.path)
    }
}

/// One entry of a dissimilarity matrix
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dissimilarity {
    /// Non-negative distance
    pub value: f64,
    /// Set when the value came from a degenerate computation
    pub flagged: bool,
}

impl From<f64> for Dissimilarity {
    fn from(value: f64) -> Self {
        Self { value, flagged: false }
    }
}

/// Flat record, one source/target pair per row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DissimilarityRecord {
    /// Source reward kind
    pub source_kind: String,
    /// Source reward path
    pub source_path: String,
    /// Target reward kind
    pub target_kind: String,
    /// Target reward path
    pub target_path: String,
    /// Distance
    pub value: f64,
    /// Degenerate computation marker
    pub flagged: bool,
}

/// Mapping from `(source, target)` to a distance. Built once, never mutated;
/// transformations return a new matrix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DissimilarityMatrix {
    entries: IndexMap<(RewardCfg, RewardCfg), Dissimilarity>,
}

impl DissimilarityMatrix {
    /// Build from entries, rejecting negative or non-finite values
    pub fn from_entries<I, D>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = ((RewardCfg, RewardCfg), D)>,
        D: Into<Dissimilarity>,
    {
        let mut out = IndexMap::new();
        for (key, d) in entries {
            let d = d.into();
            if !d.value.is_finite() || d.value < 0.0 {
                return Err(RewardError::NonFinite {
                    context: format!("dissimilarity {} -> {} is {}", key.0, key.1, d.value),
                });
            }
            out.insert(key, d);
        }
        Ok(Self { entries: out })
    }

    /// Number of pairs
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the matrix is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry for a pair
    #[must_use]
    pub fn get(&self, source: &RewardCfg, target: &RewardCfg) -> Option<Dissimilarity> {
        self.entries.get(&(source.clone(), target.clone())).copied()
    }

    /// Iterate over `((source, target), entry)` in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&(RewardCfg, RewardCfg), &Dissimilarity)> {
        self.entries.iter()
    }

    /// Distinct sources, in order of first appearance
    #[must_use]
    pub fn sources(&self) -> Vec<&RewardCfg> {
        let mut seen = indexmap::IndexSet::new();
        for (src, _) in self.entries.keys() {
            seen.insert(src);
        }
        seen.into_iter().collect()
    }

    /// Distinct targets, in order of first appearance
    #[must_use]
    pub fn targets(&self) -> Vec<&RewardCfg> {
        let mut seen = indexmap::IndexSet::new();
        for (_, tgt) in self.entries.keys() {
            seen.insert(tgt);
        }
        seen.into_iter().collect()
    }

    /// Copy without any pair whose target is `target`
    #[must_use]
    pub fn without_target(&self, target: &RewardCfg) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|((_, t), _)| t != target)
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    /// Divide each entry by the distance from `zero` to the same target and
    /// drop the rows whose source is `zero`.
    ///
    /// Targets missing a `zero` row are an error. Denominators are floored at
    /// [`NORMALIZE_EPS`] and the affected entries flagged.
    pub fn normalize_by(&self, zero: &RewardCfg) -> Result<Self> {
        let mut entries = IndexMap::with_capacity(self.entries.len());
        for ((src, tgt), d) in &self.entries {
            if src == zero {
                continue;
            }
            let denom = self.get(zero, tgt).ok_or_else(|| {
                RewardError::invalid_config("normalize_by", format!("no entry from {zero} to {tgt}"))
            })?;
            let floored = denom.value < NORMALIZE_EPS;
            if floored {
                warn!(target_cfg = %tgt, "zero reward distance below epsilon, flooring");
            }
            entries.insert(
                (src.clone(), tgt.clone()),
                Dissimilarity {
                    value: d.value / denom.value.max(NORMALIZE_EPS),
                    flagged: d.flagged || denom.flagged || floored,
                },
            );
        }
        Ok(Self { entries })
    }

    /// Combine each entry with its transpose, `d(a, b)` with `d(b, a)`.
    ///
    /// Every pair must have its transpose present. The result is flagged if
    /// either direction was.
    pub fn symmetrize(&self, aggregation: SymmetricAggregation) -> Result<Self> {
        let mut entries = IndexMap::with_capacity(self.entries.len());
        for ((src, tgt), forward) in &self.entries {
            let backward = self.get(tgt, src).ok_or_else(|| {
                RewardError::invalid_config("symmetrize", format!("no entry from {tgt} to {src}"))
            })?;
            entries.insert(
                (src.clone(), tgt.clone()),
                Dissimilarity {
                    value: aggregation.combine(forward.value, backward.value),
                    flagged: forward.flagged || backward.flagged,
                },
            );
        }
        Ok(Self { entries })
    }

    /// Flat records, one per pair
    #[must_use]
    pub fn records(&self) -> Vec<DissimilarityRecord> {
        self.entries
            .iter()
            .map(|((src, tgt), d)| DissimilarityRecord {
                source_kind: src.kind.clone(),
                source_path: src.path.clone(),
                target_kind: tgt.kind.clone(),
                target_path: tgt.path.clone(),
                value: d.value,
                flagged: d.flagged,
            })
            .collect()
    }

    /// Build from flat records
    pub fn from_records(records: impl IntoIterator<Item = DissimilarityRecord>) -> Result<Self> {
        Self::from_entries(records.into_iter().map(|r| {
            (
                (
                    RewardCfg::new(r.source_kind, r.source_path),
                    RewardCfg::new(r.target_kind, r.target_path),
                ),
                Dissimilarity {
                    value: r.value,
                    flagged: r.flagged,
                },
            )
        }))
    }

    /// Write one CSV row per pair, with a header
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        for record in self.records() {
            wtr.serialize(record)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Read a matrix written by [`Self::write_csv`]
    pub fn read_csv<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::Reader::from_reader(reader);
        let records = rdr
            .deserialize::<DissimilarityRecord>()
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Self::from_records(records)
    }

    /// Write the records as a JSON array
    pub fn write_json<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer_pretty(writer, &self.records())?;
        Ok(())
    }

    /// Save as CSV and JSON under `dir` with the given file stem
    pub fn save(&self, dir: &Path, stem: &str) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let csv_path = dir.join(format!("{stem}.csv"));
        self.write_csv(std::fs::File::create(&csv_path)?)?;
        self.write_json(std::fs::File::create(dir.join(format!("{stem}.json")))?)?;
        info!(path = %csv_path.display(), pairs = self.len(), "saved dissimilarity");
        Ok(())
    }
}

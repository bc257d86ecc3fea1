//! # Channel Table & Identifier Mapping
//!
//! The handshake table published by the spiking simulator lists, per
//! transformer instance, the contiguous channel range it owns:
//!
//! ```text
//! spike_generator.txt          ChannelTable           IdentifierMapping
//! ───────────────────          ────────────           ─────────────────
//! 5 2                          row 0: [5, 2]   ──►    region id_nest_region[0] -> 5..7
//! 7 3                          row 1: [7, 3]   ──►    region id_nest_region[1] -> 7..10
//! ```
//!
//! Each row is `[first_id, count]`; a one-entry row is a single channel.
//! A one-dimensional table (one line, or one value per line) is read as a
//! single row instead of being rejected.

use std::ops::Range;

use thiserror::Error;

/// Channel table parse and lookup errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    /// The table has no values at all.
    #[error("channel table is empty")]
    Empty,

    /// A token is not an integer.
    #[error("line {line}: `{token}` is not an integer")]
    NotAnInteger {
        /// 1-based line number.
        line: usize,
        /// Offending token.
        token: String,
    },

    /// A row has an unsupported number of entries.
    #[error("row {row}: expected [first_id, count], found {len} entries")]
    BadRow {
        /// 0-based row index.
        row: usize,
        /// Number of entries found.
        len: usize,
    },

    /// A row holds a negative id or count.
    #[error("row {row}: negative value {value}")]
    Negative {
        /// 0-based row index.
        row: usize,
        /// Offending value.
        value: i64,
    },

    /// A transformer instance has no row.
    #[error("transformer instance {instance} out of range ({rows} rows)")]
    NoSuchInstance {
        /// Requested instance.
        instance: usize,
        /// Rows available.
        rows: usize,
    },

    /// Region list and table disagree.
    #[error("{regions} region ids for {rows} table rows")]
    RegionCountMismatch {
        /// Entries in `id_nest_region`.
        regions: usize,
        /// Rows in the table.
        rows: usize,
    },
}

/// Contiguous range of low-level channel ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelRange {
    /// First channel id.
    pub first: u64,
    /// Number of channels.
    pub count: u64,
}

impl ChannelRange {
    /// Creates a range.
    #[must_use]
    pub const fn new(first: u64, count: u64) -> Self {
        Self { first, count }
    }

    /// Returns the ids as a half-open range.
    #[must_use]
    pub const fn ids(&self) -> Range<u64> {
        self.first..self.first + self.count
    }

    /// Returns true if `id` belongs to the range.
    #[must_use]
    pub const fn contains(&self, id: u64) -> bool {
        id >= self.first && id < self.first + self.count
    }
}

/// Parsed handshake table, one [`ChannelRange`] per transformer instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelTable {
    rows: Vec<ChannelRange>,
}

impl ChannelTable {
    /// Builds a table from ranges.
    #[must_use]
    pub fn from_ranges(rows: Vec<ChannelRange>) -> Self {
        Self { rows }
    }

    /// Parses the whitespace separated integer table.
    ///
    /// Integral floats such as `5.0` or `5.000000e+00` are accepted.
    ///
    /// # Errors
    ///
    /// Returns a [`TableError`] if the text is empty, holds a non-integer,
    /// or a row cannot be read as `[first_id, count]`.
    pub fn parse(text: &str) -> Result<Self, TableError> {
        let mut raw: Vec<Vec<i64>> = Vec::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let row = line
                .split(|c: char| c.is_whitespace() || c == ',')
                .filter(|t| !t.is_empty())
                .map(|token| {
                    parse_integer(token).ok_or_else(|| TableError::NotAnInteger {
                        line: n + 1,
                        token: token.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            raw.push(row);
        }

        if raw.is_empty() {
            return Err(TableError::Empty);
        }

        // One value per line is a column vector: read it as a single row.
        if raw.len() > 1 && raw.iter().all(|row| row.len() == 1) {
            raw = vec![raw.into_iter().flatten().collect()];
        }

        let rows = raw
            .iter()
            .enumerate()
            .map(|(i, row)| to_range(i, row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rows })
    }

    /// Number of rows (transformer instances).
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Range owned by a transformer instance.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::NoSuchInstance`] if the row does not exist.
    pub fn row(&self, instance: usize) -> Result<ChannelRange, TableError> {
        self.rows
            .get(instance)
            .copied()
            .ok_or(TableError::NoSuchInstance {
                instance,
                rows: self.rows.len(),
            })
    }

    /// All rows in order.
    #[must_use]
    pub fn rows(&self) -> &[ChannelRange] {
        &self.rows
    }

    /// Total number of channels over all rows.
    #[must_use]
    pub fn total_channels(&self) -> u64 {
        self.rows.iter().map(|r| r.count).sum()
    }
}

#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn parse_integer(token: &str) -> Option<i64> {
    if let Ok(value) = token.parse::<i64>() {
        return Some(value);
    }
    let value = token.parse::<f64>().ok()?;
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 {
        Some(value as i64)
    } else {
        None
    }
}

#[allow(clippy::cast_sign_loss)]
fn to_range(row: usize, values: &[i64]) -> Result<ChannelRange, TableError> {
    if let Some(&value) = values.iter().find(|v| **v < 0) {
        return Err(TableError::Negative { row, value });
    }
    match *values {
        [first] => Ok(ChannelRange::new(first as u64, 1)),
        [first, count] => Ok(ChannelRange::new(first as u64, count as u64)),
        _ => Err(TableError::BadRow {
            row,
            len: values.len(),
        }),
    }
}

/// Immutable `region id -> channel range` mapping for one pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentifierMapping {
    entries: Vec<(u64, ChannelRange)>,
}

impl IdentifierMapping {
    /// Builds a mapping from explicit entries.
    #[must_use]
    pub fn new(entries: Vec<(u64, ChannelRange)>) -> Self {
        Self { entries }
    }

    /// Pairs every region with the table row of the same index.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::RegionCountMismatch`] if there are fewer
    /// regions than rows.
    pub fn all(table: &ChannelTable, regions: &[u64]) -> Result<Self, TableError> {
        if regions.len() < table.len() {
            return Err(TableError::RegionCountMismatch {
                regions: regions.len(),
                rows: table.len(),
            });
        }
        Ok(Self {
            entries: regions.iter().copied().zip(table.rows().iter().copied()).collect(),
        })
    }

    /// Mapping for a single transformer instance.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::NoSuchInstance`] if the table or the region
    /// list has no entry for `instance`.
    pub fn instance(table: &ChannelTable, regions: &[u64], instance: usize) -> Result<Self, TableError> {
        let range = table.row(instance)?;
        let region = regions.get(instance).copied().ok_or(TableError::NoSuchInstance {
            instance,
            rows: regions.len(),
        })?;
        Ok(Self {
            entries: vec![(region, range)],
        })
    }

    /// `(region, range)` entries in table order.
    #[must_use]
    pub fn entries(&self) -> &[(u64, ChannelRange)] {
        &self.entries
    }

    /// Region ids in table order.
    pub fn regions(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|(region, _)| *region)
    }

    /// Every channel id covered by the mapping, in order.
    pub fn channels(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().flat_map(|(_, range)| range.ids())
    }

    /// Channel range of a region.
    #[must_use]
    pub fn range_of(&self, region: u64) -> Option<ChannelRange> {
        self.entries
            .iter()
            .find(|(r, _)| *r == region)
            .map(|(_, range)| *range)
    }

    /// Region owning a channel.
    #[must_use]
    pub fn region_of(&self, channel: u64) -> Option<u64> {
        self.entries
            .iter()
            .find(|(_, range)| range.contains(channel))
            .map(|(region, _)| *region)
    }
}

//! Dispense provenance models.
//!
//! Every unit of drug physically placed into a pack is recorded as a
//! provenance entry, broken down by source lot/case. Entries are
//! append-mostly: a correction supersedes the old entry instead of
//! rewriting it.

use std::fmt;
use std::str::FromStr;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use super::{DrugId, PackId};

/// Manufacturer expiry, tracked at month granularity.
///
/// The product is considered usable through the last day of the month.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Expiry {
    pub year: i32,
    pub month: u32,
}

impl Expiry {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    /// Last calendar day covered by this expiry.
    pub fn last_day(&self) -> NaiveDate {
        let (next_y, next_m) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        // Month is validated on construction paths; 1st always exists.
        NaiveDate::from_ymd_opt(next_y, next_m, 1)
            .unwrap_or(NaiveDate::MAX)
            .pred_opt()
            .unwrap_or(NaiveDate::MAX)
    }

    /// Hard safety gate: usable strictly beyond `consumption_end` plus the
    /// configured safety window.
    pub fn is_safe_beyond(&self, consumption_end: NaiveDate, window_days: u64) -> bool {
        let cutoff = consumption_end
            .checked_add_days(Days::new(window_days))
            .unwrap_or(NaiveDate::MAX);
        self.last_day() > cutoff
    }
}

impl fmt::Display for Expiry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Expiry {
    type Err = String;

    /// Parse the storage format "YYYY-MM".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (y, m) = s
            .split_once('-')
            .ok_or_else(|| format!("Invalid expiry: {}", s))?;
        let year: i32 = y.parse().map_err(|_| format!("Invalid expiry year: {}", s))?;
        let month: u32 = m.parse().map_err(|_| format!("Invalid expiry month: {}", s))?;
        if !(1..=12).contains(&month) {
            return Err(format!("Invalid expiry month: {}", s));
        }
        Ok(Self { year, month })
    }
}

/// Where the drug in a provenance entry came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SourceKind {
    /// Robot canister dispense
    Canister,
    /// Manual-fill station
    ManualFill,
    /// Drawn from another pack's leftover inventory
    Reuse,
}

/// One row of the dispense provenance ledger: a quantity of one drug,
/// from one lot/case, placed into one pack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvenanceEntry {
    pub id: i64,
    /// Destination pack credited with the quantity
    pub pack_id: PackId,
    pub drug_id: DrugId,
    pub quantity: f64,
    pub lot_number: String,
    pub case_id: Option<String>,
    pub expiry: Expiry,
    pub source: SourceKind,
    /// Logically replaced by a correction; excluded from summation
    pub superseded: bool,
    /// Source pack, set iff `source == SourceKind::Reuse`
    pub source_pack_id: Option<PackId>,
    /// Allocation batch that wrote this entry (reuse entries only)
    pub allocation_id: Option<String>,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_last_day() {
        assert_eq!(
            Expiry::new(2024, 2).last_day(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
        assert_eq!(
            Expiry::new(2024, 12).last_day(),
            NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()
        );
    }

    #[test]
    fn test_expiry_round_trip() {
        let expiry = Expiry::new(2025, 7);
        assert_eq!(expiry.to_string(), "2025-07");
        assert_eq!("2025-07".parse::<Expiry>().unwrap(), expiry);

        assert!("2025-13".parse::<Expiry>().is_err());
        assert!("garbage".parse::<Expiry>().is_err());
    }

    #[test]
    fn test_safety_window() {
        let expiry = Expiry::new(2024, 6); // usable through 2024-06-30
        let end = NaiveDate::from_ymd_opt(2024, 5, 15).unwrap();

        // 30-day window: cutoff 2024-06-14, expiry clears it
        assert!(expiry.is_safe_beyond(end, 30));
        // 46-day window: cutoff 2024-06-30, not strictly beyond
        assert!(!expiry.is_safe_beyond(end, 46));
        // 60-day window: cutoff 2024-07-14, rejected
        assert!(!expiry.is_safe_beyond(end, 60));
    }

    #[test]
    fn test_expiry_ordering() {
        assert!(Expiry::new(2024, 3) < Expiry::new(2024, 4));
        assert!(Expiry::new(2024, 12) < Expiry::new(2025, 1));
    }
}

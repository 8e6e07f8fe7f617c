//! Leftover inventory ledger models.

use serde::{Deserialize, Serialize};

use super::{DrugId, DrugProduct, Expiry, PackId, PatientId};

/// Lifecycle status of a leftover ledger row.
///
/// Transitions only move toward the terminal states:
/// `ReusePending <-> Resealed`, then either `ReuseDone` (fully consumed)
/// or `Discarded` (expired or rejected). Terminal rows never reopen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LeftoverStatus {
    ReusePending,
    Resealed,
    ReuseDone,
    Discarded,
}

impl LeftoverStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LeftoverStatus::ReuseDone | LeftoverStatus::Discarded)
    }

    /// Statuses whose rows may still supply allocations.
    pub fn is_reusable(&self) -> bool {
        matches!(self, LeftoverStatus::ReusePending | LeftoverStatus::Resealed)
    }
}

/// One leftover inventory row: unused quantity of one drug lot recovered
/// from one source pack.
///
/// `available_qty` only ever decreases; `0 <= available_qty <= total_qty`
/// holds after every operation (enforced in the store as well).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeftoverRow {
    pub id: i64,
    /// Source pack the quantity was recovered from
    pub pack_id: PackId,
    pub drug_id: DrugId,
    pub lot_number: String,
    pub case_id: Option<String>,
    /// Quantity at row creation
    pub total_qty: f64,
    /// Quantity still available for allocation
    pub available_qty: f64,
    pub expiry: Expiry,
    pub status: LeftoverStatus,
    pub created_at: String,
    pub modified_at: String,
}

impl LeftoverRow {
    /// Quantity drawn out of this row so far.
    pub fn consumed_qty(&self) -> f64 {
        self.total_qty - self.available_qty
    }
}

/// A ledger row joined with the product and source-patient context the
/// eligibility rules need.
#[derive(Debug, Clone, PartialEq)]
pub struct ReuseCandidate {
    pub row: LeftoverRow,
    pub product: DrugProduct,
    pub source_patient: PatientId,
}

/// One source pack able to supply a destination pack, as shown on the
/// operator selection screen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourcePackSummary {
    pub pack_id: PackId,
    pub display_id: i64,
    /// How many of the destination's outstanding drug classes this pack
    /// can cover
    pub matched_classes: usize,
    /// Externally-verified live stock indicator, display only
    pub in_stock: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_predicates() {
        assert!(LeftoverStatus::ReusePending.is_reusable());
        assert!(LeftoverStatus::Resealed.is_reusable());
        assert!(!LeftoverStatus::ReuseDone.is_reusable());
        assert!(!LeftoverStatus::Discarded.is_reusable());

        assert!(LeftoverStatus::ReuseDone.is_terminal());
        assert!(LeftoverStatus::Discarded.is_terminal());
        assert!(!LeftoverStatus::ReusePending.is_terminal());
    }

    #[test]
    fn test_consumed_qty() {
        let row = LeftoverRow {
            id: 1,
            pack_id: 10,
            drug_id: 20,
            lot_number: "L123".into(),
            case_id: None,
            total_qty: 12.0,
            available_qty: 7.0,
            expiry: Expiry::new(2025, 3),
            status: LeftoverStatus::ReusePending,
            created_at: "2024-01-01T00:00:00Z".into(),
            modified_at: "2024-01-02T00:00:00Z".into(),
        };
        assert_eq!(row.consumed_qty(), 5.0);
    }
}

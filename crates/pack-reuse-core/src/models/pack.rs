//! Pack models.
//!
//! Packs are owned by the surrounding packaging system; the core reads
//! their status and consumption window and writes the external usage
//! status that gates reuse eligibility.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::{PackId, PatientId};

/// Lifecycle status of a physical pack, as maintained by the filling
/// workflow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PackStatus {
    Pending,
    InProgress,
    ManuallyFilled,
    PartiallyFilled,
    Done,
    Deleted,
}

/// Where the pack physically is with respect to delivery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryStatus {
    InsidePharmacy,
    Delivered,
    ReturnedFromDelivery,
}

/// External usage status of a pack's leftover contents. Mirrored to the
/// pharmacy-side delivery-tracking record via the outbox.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UsageStatus {
    /// Pack never had reusable contents
    NotRequired,
    /// Leftover rows created, nothing consumed yet
    Pending,
    /// Some leftover quantity has been reused
    InProgress,
    /// Pack physically resealed for later reuse
    Resealed,
    /// All leftover rows fully reused
    Done,
    /// Leftover contents discarded
    Discarded,
}

/// A physical multi-dose pack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pack {
    pub id: PackId,
    /// Pharmacy-facing display identifier
    pub display_id: i64,
    pub status: PackStatus,
    pub patient_id: PatientId,
    /// First day of the consumption window
    pub consumption_start: NaiveDate,
    /// Last day of the consumption window - the expiry safety gate is
    /// measured from this date
    pub consumption_end: NaiveDate,
    pub delivery_status: DeliveryStatus,
    pub usage_status: UsageStatus,
}

impl Pack {
    /// Whether this pack's leftover rows may still supply other packs.
    pub fn usage_is_terminal(&self) -> bool {
        matches!(self.usage_status, UsageStatus::Done | UsageStatus::Discarded)
    }
}

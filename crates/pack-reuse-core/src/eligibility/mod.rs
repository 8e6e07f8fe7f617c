//! Reuse eligibility rules.
//!
//! A leftover candidate may supply a destination requirement only when the
//! clinical gates pass. The expiry gate is absolute; the substitution
//! gates relax only for the same patient, who is by definition already
//! taking the exact product in the candidate row.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::{PatientId, RequiredDrugLine, ReuseCandidate};

/// Default number of days past the destination's consumption window the
/// candidate must remain usable.
pub const DEFAULT_SAFETY_WINDOW_DAYS: u64 = 30;

/// Configured eligibility policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EligibilityPolicy {
    /// Expiry safety window in days, measured from the destination pack's
    /// last consumption day.
    pub expiry_safety_window_days: u64,
}

impl Default for EligibilityPolicy {
    fn default() -> Self {
        Self {
            expiry_safety_window_days: DEFAULT_SAFETY_WINDOW_DAYS,
        }
    }
}

impl EligibilityPolicy {
    /// Whether `candidate` may supply `req` for the destination patient.
    ///
    /// Gates, in order:
    /// 1. Both sides carry the same non-empty equivalence class.
    /// 2. The candidate stays usable past `consumption_end` plus the
    ///    safety window. Applies to every candidate, same patient or not.
    /// 3. Same patient: eligible with no further checks.
    /// 4. DAW-restricted requirement: exact product match only.
    /// 5. Otherwise: brand/generic classification must match.
    pub fn is_eligible(
        &self,
        candidate: &ReuseCandidate,
        req: &RequiredDrugLine,
        dest_patient: PatientId,
        consumption_end: NaiveDate,
    ) -> bool {
        if !candidate.product.has_equivalence_class()
            || req.equivalence_class.trim().is_empty()
            || candidate.product.equivalence_class != req.equivalence_class
        {
            return false;
        }

        if !candidate
            .row
            .expiry
            .is_safe_beyond(consumption_end, self.expiry_safety_window_days)
        {
            return false;
        }

        if candidate.source_patient == dest_patient {
            return true;
        }

        if !req.daw.allows_substitution() {
            return candidate.product.formatted_ndc == req.formatted_ndc;
        }

        candidate.product.brand == req.brand
    }
}

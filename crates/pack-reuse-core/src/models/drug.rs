//! Drug product and requirement models.

use serde::{Deserialize, Serialize};

use super::DrugId;

/// Brand/generic classification of a drug product.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BrandClass {
    Brand,
    Generic,
}

/// Dispense-as-written restriction on a prescription line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DawCode {
    /// DAW 0 - the pharmacy may substitute an equivalent product.
    SubstitutionAllowed,
    /// Substitution restricted to the exact prescribed product.
    DispenseAsWritten,
}

impl DawCode {
    /// Map a pharmacy-software DAW code to the restriction it implies.
    pub fn from_code(code: i64) -> Self {
        if code == 0 {
            DawCode::SubstitutionAllowed
        } else {
            DawCode::DispenseAsWritten
        }
    }

    pub fn allows_substitution(&self) -> bool {
        matches!(self, DawCode::SubstitutionAllowed)
    }
}

/// A drug product as known to the packaging system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DrugProduct {
    pub id: DrugId,
    /// Display name (e.g. "Metformin HCl 500mg tablets")
    pub name: String,
    /// Strength text (e.g. "500mg")
    pub strength: Option<String>,
    /// Formatted product identifier - exact product, used by the DAW rule
    pub formatted_ndc: String,
    /// Therapeutic-equivalence class tag - products sharing it are
    /// clinically interchangeable candidates
    pub equivalence_class: String,
    pub brand: BrandClass,
}

impl DrugProduct {
    /// Create a product with required identity fields.
    pub fn new(
        id: DrugId,
        name: String,
        formatted_ndc: String,
        equivalence_class: String,
        brand: BrandClass,
    ) -> Self {
        Self {
            id,
            name,
            strength: None,
            formatted_ndc,
            equivalence_class,
            brand,
        }
    }

    /// Whether the product carries a usable equivalence class.
    pub fn has_equivalence_class(&self) -> bool {
        !self.equivalence_class.trim().is_empty()
    }
}

/// One outstanding requirement line of a destination pack, aggregated
/// across its slots: how much of a drug the pack still needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequiredDrugLine {
    pub drug_id: DrugId,
    /// Class of the originally-filled product
    pub equivalence_class: String,
    /// Formatted identifier of the originally-filled product
    pub formatted_ndc: String,
    pub brand: BrandClass,
    pub daw: DawCode,
    /// Outstanding quantity, supports fractional/half units
    pub required_qty: f64,
}

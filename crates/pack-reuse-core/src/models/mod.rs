//! Domain models for the reuse engine.

mod drug;
mod ledger;
mod pack;
mod provenance;

pub use drug::*;
pub use ledger::*;
pub use pack::*;
pub use provenance::*;

/// Internal drug identifier.
pub type DrugId = i64;
/// Internal pack identifier.
pub type PackId = i64;
/// Patient identifier (owned by the surrounding system).
pub type PatientId = i64;

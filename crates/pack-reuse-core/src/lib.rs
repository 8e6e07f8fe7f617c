//! Pack Reuse Core Library
//!
//! Leftover drug reuse and allocation engine for automated medication
//! packaging.
//!
//! # Architecture
//!
//! ```text
//! Pack filled → Dispense Provenance (per drug/lot/case)
//!                        │
//!            Pack returned / deleted
//!                        │
//!        ┌───────────────▼───────────────┐
//!        │   Leftover Ledger Creation    │
//!        │  provenance in − reuse out    │
//!        └───────────────┬───────────────┘
//!                        │
//!          reseal / unseal / discard / expiry sweep
//!                        │
//!        ┌───────────────▼───────────────┐
//!        │          Allocator            │
//!        │  eligibility gates + CAS draw │
//!        │  earliest expiry first        │
//!        └───────────────┬───────────────┘
//!                        │
//!            ┌───────────┼───────────┐
//!            ▼           ▼           ▼
//!       Provenance   Usage roll-up   Outbox
//!       (dest pack)  (source pack)   (pharmacy record)
//! ```
//!
//! # Core Principle
//!
//! **Leftover quantity only moves one way.** Every draw is a
//! compare-and-swap committed together with its provenance entry, so
//! concurrent allocations can never overdraw a ledger row, and terminal
//! rows never reopen.
//!
//! # Modules
//!
//! - [`db`]: SQLite storage layer (packs, provenance, ledger, outbox)
//! - [`models`]: Domain types (Pack, LeftoverRow, ProvenanceEntry, etc.)
//! - [`eligibility`]: Clinical reuse gates (equivalence, DAW, expiry)
//! - [`allocator`]: Requirement matching and leftover draw
//! - [`lifecycle`]: Ledger creation, reseal, discard, expiry sweep

pub mod allocator;
pub mod db;
pub mod eligibility;
pub mod lifecycle;
pub mod models;

// Re-export commonly used types
pub use allocator::{
    AllocationReport, Allocator, AllocatorError, RequirementOutcome, RequirementResult,
    StockGateway,
};
pub use db::{Database, DbError, DeliveryUpdate};
pub use eligibility::EligibilityPolicy;
pub use lifecycle::{DeliveryTracker, Lifecycle, LifecycleError, ResealAdjustment};
pub use models::{
    BrandClass, DawCode, DeliveryStatus, DrugProduct, Expiry, LeftoverRow, LeftoverStatus, Pack,
    PackStatus, ProvenanceEntry, RequiredDrugLine, ReuseCandidate, SourceKind, SourcePackSummary,
    UsageStatus,
};

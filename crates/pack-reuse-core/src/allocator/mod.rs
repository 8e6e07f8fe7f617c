//! Leftover reuse allocator.
//!
//! Matches a destination pack's outstanding requirements against the
//! leftover ledger and draws eligible quantity, earliest expiry first.
//! Every draw is a compare-and-swap grouped with its provenance entry in
//! one transaction, so a concurrent allocation can never overdraw a row;
//! the loser rescans and retries a bounded number of times.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{Database, DbError};
use crate::eligibility::EligibilityPolicy;
use crate::models::{
    DrugId, LeftoverStatus, Pack, PackId, ProvenanceEntry, ReuseCandidate, SourcePackSummary,
    UsageStatus,
};

/// Rescan attempts per requirement after losing a draw race.
pub const MAX_CONFLICT_RETRIES: u32 = 3;

/// Quantity below this is treated as zero.
const QTY_EPSILON: f64 = 1e-9;

/// Allocator errors.
#[derive(Error, Debug)]
pub enum AllocatorError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Pack not found: {0}")]
    PackNotFound(PackId),
}

pub type AllocatorResult<T> = Result<T, AllocatorError>;

/// Outcome of allocating one requirement line.
#[derive(Debug, Clone, PartialEq)]
pub enum RequirementOutcome {
    /// Fully covered from leftovers.
    Satisfied { allocated: f64 },
    /// Some quantity drawn, the rest must come from regular stock.
    Partial { allocated: f64, remaining: f64 },
    /// No eligible leftover quantity at all.
    NotReusable,
    /// Concurrent allocations kept winning the rows; gave up after
    /// [`MAX_CONFLICT_RETRIES`] rescans.
    Conflict { allocated: f64, remaining: f64 },
}

impl RequirementOutcome {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, RequirementOutcome::Satisfied { .. })
    }
}

/// Per-requirement allocation result.
#[derive(Debug, Clone, PartialEq)]
pub struct RequirementResult {
    pub drug_id: DrugId,
    pub equivalence_class: String,
    pub outcome: RequirementOutcome,
}

/// Result of one allocation run against a destination pack.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationReport {
    pub pack_id: PackId,
    /// Provenance entries written (or found, when already allocated)
    pub entries: Vec<ProvenanceEntry>,
    pub results: Vec<RequirementResult>,
    /// Every requirement line fully covered
    pub fully_satisfied: bool,
    /// The pack already carried reuse entries; nothing was drawn
    pub already_allocated: bool,
}

/// External stock lookup for the operator selection screen. Display only;
/// allocation never consults it.
pub trait StockGateway {
    /// Live on-hand quantity for a product, `None` when unknown.
    fn live_stock(&self, formatted_ndc: &str) -> Option<f64>;
}

/// Allocates leftover inventory to destination packs.
pub struct Allocator<'a> {
    db: &'a Database,
    policy: EligibilityPolicy,
}

impl<'a> Allocator<'a> {
    /// Create an allocator with the default eligibility policy.
    pub fn new(db: &'a Database) -> Self {
        Self::with_policy(db, EligibilityPolicy::default())
    }

    pub fn with_policy(db: &'a Database, policy: EligibilityPolicy) -> Self {
        Self { db, policy }
    }

    /// Allocate leftovers to every outstanding requirement of `pack_id`.
    ///
    /// Idempotent: a pack that already carries non-superseded reuse
    /// entries is reported as-is instead of being drawn for again.
    pub fn allocate(&self, pack_id: PackId) -> AllocatorResult<AllocationReport> {
        let pack = self.require_pack(pack_id)?;

        let existing = self.db.reuse_entries_for_pack(pack_id)?;
        if !existing.is_empty() {
            // The earlier run may have ended partial; report what is
            // actually still outstanding, not a blanket success.
            let fully_satisfied = self.db.outstanding_requirements(pack_id)?.is_empty();
            info!(
                pack_id,
                entries = existing.len(),
                fully_satisfied,
                "pack already allocated"
            );
            return Ok(AllocationReport {
                pack_id,
                entries: existing,
                results: Vec::new(),
                fully_satisfied,
                already_allocated: true,
            });
        }

        let requirements = self.db.outstanding_requirements(pack_id)?;
        let allocation_id = Uuid::new_v4().to_string();
        info!(
            pack_id,
            allocation_id = %allocation_id,
            requirements = requirements.len(),
            "starting allocation"
        );

        let mut results = Vec::with_capacity(requirements.len());
        let mut touched_sources: BTreeSet<PackId> = BTreeSet::new();

        for req in &requirements {
            let mut remaining = req.required_qty;
            let mut allocated = 0.0;
            let mut attempts = 0u32;
            let mut conflicted = false;

            'rescan: while remaining > QTY_EPSILON {
                let candidates = self.eligible_candidates(&pack, req)?;
                if candidates.is_empty() {
                    break;
                }

                let mut drew_any = false;
                for candidate in &candidates {
                    if remaining <= QTY_EPSILON {
                        break;
                    }
                    let draw = remaining.min(candidate.row.available_qty);
                    if self.draw_into(&pack, candidate, draw, &allocation_id)? {
                        debug!(
                            pack_id,
                            source_pack = candidate.row.pack_id,
                            row = candidate.row.id,
                            draw,
                            "drew from leftover row"
                        );
                        remaining -= draw;
                        allocated += draw;
                        drew_any = true;
                        touched_sources.insert(candidate.row.pack_id);
                    } else {
                        // Lost the race on this row; rescan for fresh
                        // availability before giving up.
                        attempts += 1;
                        if attempts >= MAX_CONFLICT_RETRIES {
                            warn!(
                                pack_id,
                                row = candidate.row.id,
                                attempts,
                                "allocation conflict retries exhausted"
                            );
                            conflicted = true;
                            break 'rescan;
                        }
                        continue 'rescan;
                    }
                }

                if !drew_any {
                    break;
                }
            }

            let outcome = if remaining <= QTY_EPSILON {
                RequirementOutcome::Satisfied { allocated }
            } else if conflicted {
                RequirementOutcome::Conflict { allocated, remaining }
            } else if allocated > QTY_EPSILON {
                RequirementOutcome::Partial { allocated, remaining }
            } else {
                RequirementOutcome::NotReusable
            };
            results.push(RequirementResult {
                drug_id: req.drug_id,
                equivalence_class: req.equivalence_class.clone(),
                outcome,
            });
        }

        for source in &touched_sources {
            self.roll_up_source_usage(*source)?;
        }

        let entries: Vec<ProvenanceEntry> = self
            .db
            .reuse_entries_for_pack(pack_id)?
            .into_iter()
            .filter(|e| e.allocation_id.as_deref() == Some(allocation_id.as_str()))
            .collect();
        let fully_satisfied = results.iter().all(|r| r.outcome.is_satisfied());

        info!(
            pack_id,
            allocation_id = %allocation_id,
            entries = entries.len(),
            fully_satisfied,
            "allocation finished"
        );
        Ok(AllocationReport {
            pack_id,
            entries,
            results,
            fully_satisfied,
            already_allocated: false,
        })
    }

    /// Source packs able to cover the destination's outstanding classes,
    /// grouped by equivalence class, for the operator selection screen.
    pub fn find_reusable_sources(
        &self,
        pack_id: PackId,
        stock: Option<&dyn StockGateway>,
    ) -> AllocatorResult<BTreeMap<String, Vec<SourcePackSummary>>> {
        let pack = self.require_pack(pack_id)?;
        let requirements = self.db.outstanding_requirements(pack_id)?;

        // class -> (source pack -> stock flag for that class's product),
        // and pack -> how many classes it covers
        let mut by_class: BTreeMap<String, BTreeMap<PackId, Option<bool>>> = BTreeMap::new();
        let mut classes_per_pack: BTreeMap<PackId, usize> = BTreeMap::new();

        for req in &requirements {
            let candidates = self.eligible_candidates(&pack, req)?;
            if candidates.is_empty() {
                continue;
            }
            let sources = by_class.entry(req.equivalence_class.clone()).or_default();
            for candidate in &candidates {
                let source = candidate.row.pack_id;
                let in_stock = stock
                    .and_then(|s| s.live_stock(&candidate.product.formatted_ndc))
                    .map(|qty| qty > 0.0);
                match sources.entry(source) {
                    Entry::Vacant(slot) => {
                        slot.insert(in_stock);
                        *classes_per_pack.entry(source).or_insert(0) += 1;
                    }
                    Entry::Occupied(mut slot) => {
                        if slot.get().is_none() {
                            slot.insert(in_stock);
                        }
                    }
                }
            }
        }

        let mut out = BTreeMap::new();
        for (class, sources) in by_class {
            let mut summaries = Vec::with_capacity(sources.len());
            for (source, in_stock) in sources {
                let source_pack = self.require_pack(source)?;
                summaries.push(SourcePackSummary {
                    pack_id: source,
                    display_id: source_pack.display_id,
                    matched_classes: classes_per_pack.get(&source).copied().unwrap_or(0),
                    in_stock,
                });
            }
            out.insert(class, summaries);
        }
        Ok(out)
    }

    fn require_pack(&self, pack_id: PackId) -> AllocatorResult<Pack> {
        self.db
            .get_pack(pack_id)?
            .ok_or(AllocatorError::PackNotFound(pack_id))
    }

    /// Ledger candidates for one requirement, eligibility-filtered and
    /// never drawing a pack against itself.
    fn eligible_candidates(
        &self,
        pack: &Pack,
        req: &crate::models::RequiredDrugLine,
    ) -> AllocatorResult<Vec<ReuseCandidate>> {
        let candidates = self.db.reusable_candidates(&req.equivalence_class)?;
        Ok(candidates
            .into_iter()
            .filter(|c| c.row.pack_id != pack.id)
            .filter(|c| {
                self.policy
                    .is_eligible(c, req, pack.patient_id, pack.consumption_end)
            })
            .collect())
    }

    /// One draw: CAS the row, write the provenance entry, mark the row
    /// done when it hits zero. All or nothing.
    fn draw_into(
        &self,
        pack: &Pack,
        candidate: &ReuseCandidate,
        draw: f64,
        allocation_id: &str,
    ) -> AllocatorResult<bool> {
        let tx = self.db.shared_transaction()?;

        if !self.db.try_draw(candidate.row.id, draw)? {
            // Dropping the transaction rolls it back
            return Ok(false);
        }
        self.db.record_reuse_dispense(
            pack.id,
            candidate.row.drug_id,
            draw,
            &candidate.row.lot_number,
            candidate.row.case_id.as_deref(),
            candidate.row.expiry,
            candidate.row.pack_id,
            allocation_id,
        )?;
        if candidate.row.available_qty - draw <= QTY_EPSILON {
            self.db
                .set_leftover_status(candidate.row.id, LeftoverStatus::ReuseDone)?;
        }

        tx.commit().map_err(DbError::from)?;
        Ok(true)
    }

    /// Reflect ledger state in the source pack's usage status: `Done` once
    /// every row is terminal, otherwise `InProgress`. The change is queued
    /// for the pharmacy-side record.
    fn roll_up_source_usage(&self, source_pack_id: PackId) -> AllocatorResult<()> {
        let rows = self.db.leftover_rows_for_pack(source_pack_id)?;
        let all_terminal = !rows.is_empty() && rows.iter().all(|r| r.status.is_terminal());
        let usage = if all_terminal {
            UsageStatus::Done
        } else {
            UsageStatus::InProgress
        };

        let source = self.require_pack(source_pack_id)?;
        if source.usage_status == usage {
            return Ok(());
        }

        let tx = self.db.shared_transaction()?;
        self.db.set_usage_status(source_pack_id, usage)?;
        self.db.enqueue_delivery_update(&crate::db::DeliveryUpdate {
            pack_id: source_pack_id,
            display_id: source.display_id,
            usage,
        })?;
        tx.commit().map_err(DbError::from)?;
        debug!(source_pack_id, ?usage, "rolled up source usage status");
        Ok(())
    }
}

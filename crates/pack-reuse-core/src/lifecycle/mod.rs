//! Leftover lifecycle manager.
//!
//! Turns a finished pack's provenance into leftover ledger rows, applies
//! reseal count corrections, discards, and sweeps expired inventory. The
//! pack's external usage status tracks the ledger and is relayed to the
//! pharmacy-side delivery-tracking record through the outbox.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, info};

use crate::db::{Database, DbError, DeliveryUpdate};
use crate::eligibility::EligibilityPolicy;
use crate::models::{
    DrugId, LeftoverRow, LeftoverStatus, Pack, PackId, UsageStatus,
};

/// Lifecycle errors.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Pack not found: {0}")]
    PackNotFound(PackId),

    #[error("Leftover rows already exist for pack {0}")]
    RowsAlreadyExist(PackId),

    #[error("Reseal adjustment rejected for row {row_id}: counted {counted}, available {available}")]
    AdjustmentRejected {
        row_id: i64,
        counted: f64,
        available: f64,
    },

    #[error("Delivery tracker error: {0}")]
    Relay(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// A physical recount of one leftover row taken while resealing a pack.
#[derive(Debug, Clone, PartialEq)]
pub struct ResealAdjustment {
    pub row_id: i64,
    /// Quantity the operator actually counted in the pack
    pub counted_qty: f64,
}

/// Relays usage-status updates to the pharmacy-side record.
pub trait DeliveryTracker {
    fn push_update(
        &mut self,
        update: &DeliveryUpdate,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Manages leftover rows from creation to their terminal status.
pub struct Lifecycle<'a> {
    db: &'a Database,
    policy: EligibilityPolicy,
}

impl<'a> Lifecycle<'a> {
    /// Create a lifecycle manager with the default policy.
    pub fn new(db: &'a Database) -> Self {
        Self::with_policy(db, EligibilityPolicy::default())
    }

    pub fn with_policy(db: &'a Database, policy: EligibilityPolicy) -> Self {
        Self { db, policy }
    }

    /// Recover a finished pack's unused quantity into the leftover ledger,
    /// one row per (drug, lot, case) group. Quantity already drawn out of
    /// the pack for reuse is not recovered twice.
    ///
    /// Fails when the pack already has ledger rows; creation happens once.
    pub fn create_ledger_rows(&self, pack_id: PackId) -> LifecycleResult<Vec<LeftoverRow>> {
        let pack = self.require_pack(pack_id)?;
        if self.db.leftover_rows_exist(pack_id)? {
            return Err(LifecycleError::RowsAlreadyExist(pack_id));
        }

        let groups = self.db.leftover_groups(pack_id)?;
        if groups.is_empty() {
            debug!(pack_id, "no leftover quantity to recover");
            return Ok(Vec::new());
        }

        let tx = self.db.shared_transaction()?;
        for group in &groups {
            self.db.insert_leftover_row(
                pack_id,
                group.drug_id,
                &group.lot_number,
                group.case_id.as_deref(),
                group.quantity,
                group.expiry,
            )?;
        }
        self.db.set_usage_status(pack_id, UsageStatus::Pending)?;
        self.enqueue_update(&pack, UsageStatus::Pending)?;
        tx.commit().map_err(DbError::from)?;

        info!(pack_id, rows = groups.len(), "created leftover ledger rows");
        Ok(self.db.leftover_rows_for_pack(pack_id)?)
    }

    /// Discard a pack's remaining leftover contents. Rows already drawn to
    /// zero close as fully reused rather than discarded. Idempotent.
    pub fn discard(&self, pack_id: PackId) -> LifecycleResult<()> {
        let pack = self.require_pack(pack_id)?;
        let rows = self.db.leftover_rows_for_pack(pack_id)?;

        let tx = self.db.shared_transaction()?;
        let mut changed = 0usize;
        for row in rows.iter().filter(|r| !r.status.is_terminal()) {
            self.db.set_leftover_status(row.id, close_status(row))?;
            changed += 1;
        }
        if !pack.usage_is_terminal() {
            self.db.set_usage_status(pack_id, UsageStatus::Discarded)?;
            self.enqueue_update(&pack, UsageStatus::Discarded)?;
        }
        tx.commit().map_err(DbError::from)?;

        info!(pack_id, rows = changed, "discarded pack leftovers");
        Ok(())
    }

    /// Discard one drug's leftover rows in a pack. When that closes the
    /// last open row, the pack's usage status closes with it.
    pub fn discard_drug(&self, pack_id: PackId, drug_id: DrugId) -> LifecycleResult<()> {
        let pack = self.require_pack(pack_id)?;
        let rows = self.db.leftover_rows_for_pack(pack_id)?;

        let tx = self.db.shared_transaction()?;
        for row in rows
            .iter()
            .filter(|r| r.drug_id == drug_id && !r.status.is_terminal())
        {
            self.db.set_leftover_status(row.id, close_status(row))?;
        }
        self.roll_up_usage(&pack)?;
        tx.commit().map_err(DbError::from)?;

        debug!(pack_id, drug_id, "discarded drug leftovers");
        Ok(())
    }

    /// Physically reseal a pack after a recount. Counted quantities may
    /// only correct downwards; inventory never grows after recovery. A row
    /// counted down to zero closes as fully reused.
    pub fn reseal(
        &self,
        pack_id: PackId,
        adjustments: &[ResealAdjustment],
    ) -> LifecycleResult<()> {
        let pack = self.require_pack(pack_id)?;

        let tx = self.db.shared_transaction()?;
        for adj in adjustments {
            let row = self
                .db
                .get_leftover_row(adj.row_id)?
                .ok_or_else(|| DbError::NotFound(format!("leftover row {}", adj.row_id)))?;
            if !self.db.lower_available(adj.row_id, adj.counted_qty)? {
                return Err(LifecycleError::AdjustmentRejected {
                    row_id: adj.row_id,
                    counted: adj.counted_qty,
                    available: row.available_qty,
                });
            }
        }

        let rows = self.db.leftover_rows_for_pack(pack_id)?;
        for row in rows.iter().filter(|r| !r.status.is_terminal()) {
            let status = if row.available_qty <= 0.0 {
                LeftoverStatus::ReuseDone
            } else {
                LeftoverStatus::Resealed
            };
            if row.status != status {
                self.db.set_leftover_status(row.id, status)?;
            }
        }
        // A closed pack's external mirror never reopens
        if !pack.usage_is_terminal() {
            self.db.set_usage_status(pack_id, UsageStatus::Resealed)?;
            self.enqueue_update(&pack, UsageStatus::Resealed)?;
        }
        tx.commit().map_err(DbError::from)?;

        info!(pack_id, adjustments = adjustments.len(), "resealed pack");
        Ok(())
    }

    /// Reopen a resealed pack for allocation.
    pub fn unseal(&self, pack_id: PackId) -> LifecycleResult<()> {
        let pack = self.require_pack(pack_id)?;
        let rows = self.db.leftover_rows_for_pack(pack_id)?;

        let tx = self.db.shared_transaction()?;
        for row in rows.iter().filter(|r| r.status == LeftoverStatus::Resealed) {
            self.db
                .set_leftover_status(row.id, LeftoverStatus::ReusePending)?;
        }
        if !pack.usage_is_terminal() {
            self.db.set_usage_status(pack_id, UsageStatus::Pending)?;
            self.enqueue_update(&pack, UsageStatus::Pending)?;
        }
        tx.commit().map_err(DbError::from)?;

        debug!(pack_id, "unsealed pack");
        Ok(())
    }

    /// Discard every open leftover row that is no longer usable as of
    /// `as_of`, applying the same safety window the allocator applies.
    /// Returns the number of rows closed.
    pub fn sweep_expired(&self, as_of: NaiveDate) -> LifecycleResult<usize> {
        let window = self.policy.expiry_safety_window_days;
        let expired: Vec<LeftoverRow> = self
            .db
            .active_leftover_rows()?
            .into_iter()
            .filter(|r| !r.expiry.is_safe_beyond(as_of, window))
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let tx = self.db.shared_transaction()?;
        let mut touched: BTreeSet<PackId> = BTreeSet::new();
        for row in &expired {
            self.db.set_leftover_status(row.id, close_status(row))?;
            touched.insert(row.pack_id);
        }
        for pack_id in touched {
            let pack = self.require_pack(pack_id)?;
            self.roll_up_usage(&pack)?;
        }
        tx.commit().map_err(DbError::from)?;

        info!(swept = expired.len(), %as_of, "swept expired leftover rows");
        Ok(expired.len())
    }

    /// Relay pending usage-status updates to the external record. Entries
    /// are marked dispatched only after a successful push, so a failed
    /// relay is retried on the next drain (at-least-once).
    pub fn drain_outbox(&self, tracker: &mut dyn DeliveryTracker) -> LifecycleResult<usize> {
        let pending = self.db.pending_delivery_updates()?;
        let mut dispatched = 0usize;
        for (outbox_id, update) in pending {
            tracker
                .push_update(&update)
                .map_err(LifecycleError::Relay)?;
            self.db.mark_dispatched(outbox_id)?;
            dispatched += 1;
        }

        if dispatched > 0 {
            debug!(dispatched, "drained outbox");
        }
        Ok(dispatched)
    }

    /// Close the pack's usage status once its last ledger row is terminal:
    /// `Discarded` when anything was thrown away, `Done` when everything
    /// was fully reused. No-op while open rows remain.
    fn roll_up_usage(&self, pack: &Pack) -> LifecycleResult<()> {
        if pack.usage_is_terminal() {
            return Ok(());
        }
        let rows = self.db.leftover_rows_for_pack(pack.id)?;
        if rows.is_empty() || !rows.iter().all(|r| r.status.is_terminal()) {
            return Ok(());
        }
        let usage = if rows.iter().any(|r| r.status == LeftoverStatus::Discarded) {
            UsageStatus::Discarded
        } else {
            UsageStatus::Done
        };
        self.db.set_usage_status(pack.id, usage)?;
        self.enqueue_update(pack, usage)?;
        Ok(())
    }

    fn require_pack(&self, pack_id: PackId) -> LifecycleResult<Pack> {
        self.db
            .get_pack(pack_id)?
            .ok_or(LifecycleError::PackNotFound(pack_id))
    }

    fn enqueue_update(&self, pack: &Pack, usage: UsageStatus) -> LifecycleResult<()> {
        self.db.enqueue_delivery_update(&DeliveryUpdate {
            pack_id: pack.id,
            display_id: pack.display_id,
            usage,
        })?;
        Ok(())
    }
}

/// Terminal status for a row being closed: a row with nothing left was
/// fully reused, anything else is a discard.
fn close_status(row: &LeftoverRow) -> LeftoverStatus {
    if row.available_qty <= 0.0 {
        LeftoverStatus::ReuseDone
    } else {
        LeftoverStatus::Discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sample_pack;
    use crate::models::{BrandClass, DrugProduct, Expiry, SourceKind};

    fn setup_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.upsert_drug_product(&DrugProduct::new(
            1,
            "Metformin HCl 500mg".into(),
            "12345-678-90".into(),
            "AB1234".into(),
            BrandClass::Generic,
        ))
        .unwrap();
        db.insert_pack(&sample_pack(10, 7)).unwrap();
        db
    }

    #[test]
    fn test_create_ledger_rows_from_provenance() {
        let db = setup_db();
        db.record_dispense(10, 1, 9.0, "L1", None, Expiry::new(2026, 1), SourceKind::Canister)
            .unwrap();
        db.record_dispense(10, 1, 3.0, "L2", Some("C7"), Expiry::new(2026, 3), SourceKind::ManualFill)
            .unwrap();

        let rows = Lifecycle::new(&db).create_ledger_rows(10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].lot_number, "L1");
        assert_eq!(rows[0].available_qty, 9.0);
        assert_eq!(rows[1].case_id, Some("C7".into()));

        let pack = db.get_pack(10).unwrap().unwrap();
        assert_eq!(pack.usage_status, UsageStatus::Pending);

        // Second creation is rejected
        let result = Lifecycle::new(&db).create_ledger_rows(10);
        assert!(matches!(result, Err(LifecycleError::RowsAlreadyExist(10))));
    }

    #[test]
    fn test_create_ledger_rows_nothing_to_recover() {
        let db = setup_db();
        let rows = Lifecycle::new(&db).create_ledger_rows(10).unwrap();
        assert!(rows.is_empty());

        let pack = db.get_pack(10).unwrap().unwrap();
        assert_eq!(pack.usage_status, UsageStatus::NotRequired);
    }

    #[test]
    fn test_discard_closes_rows_and_pack() {
        let db = setup_db();
        let full = db
            .insert_leftover_row(10, 1, "L1", None, 9.0, Expiry::new(2026, 1))
            .unwrap();
        let spent = db
            .insert_leftover_row(10, 1, "L2", None, 3.0, Expiry::new(2026, 1))
            .unwrap();
        db.try_draw(spent, 3.0).unwrap();

        let lifecycle = Lifecycle::new(&db);
        lifecycle.discard(10).unwrap();

        // Untouched row discarded; fully-drawn row closed as reused
        assert_eq!(
            db.get_leftover_row(full).unwrap().unwrap().status,
            LeftoverStatus::Discarded
        );
        assert_eq!(
            db.get_leftover_row(spent).unwrap().unwrap().status,
            LeftoverStatus::ReuseDone
        );
        let pack = db.get_pack(10).unwrap().unwrap();
        assert_eq!(pack.usage_status, UsageStatus::Discarded);

        // Idempotent
        lifecycle.discard(10).unwrap();
    }

    #[test]
    fn test_discard_drug_rolls_up_when_last() {
        let db = setup_db();
        db.upsert_drug_product(&DrugProduct::new(
            2,
            "Lisinopril 10mg".into(),
            "55555-111-22".into(),
            "CD5678".into(),
            BrandClass::Generic,
        ))
        .unwrap();
        db.insert_leftover_row(10, 1, "L1", None, 9.0, Expiry::new(2026, 1))
            .unwrap();
        db.insert_leftover_row(10, 2, "L2", None, 3.0, Expiry::new(2026, 1))
            .unwrap();

        let lifecycle = Lifecycle::new(&db);
        lifecycle.discard_drug(10, 1).unwrap();

        // One open row left, pack stays open
        let pack = db.get_pack(10).unwrap().unwrap();
        assert_eq!(pack.usage_status, UsageStatus::NotRequired);

        lifecycle.discard_drug(10, 2).unwrap();
        let pack = db.get_pack(10).unwrap().unwrap();
        assert_eq!(pack.usage_status, UsageStatus::Discarded);
    }

    #[test]
    fn test_reseal_and_unseal() {
        let db = setup_db();
        let row = db
            .insert_leftover_row(10, 1, "L1", None, 12.0, Expiry::new(2026, 1))
            .unwrap();

        let lifecycle = Lifecycle::new(&db);
        lifecycle
            .reseal(10, &[ResealAdjustment { row_id: row, counted_qty: 10.0 }])
            .unwrap();

        let loaded = db.get_leftover_row(row).unwrap().unwrap();
        assert_eq!(loaded.available_qty, 10.0);
        assert_eq!(loaded.status, LeftoverStatus::Resealed);
        assert_eq!(
            db.get_pack(10).unwrap().unwrap().usage_status,
            UsageStatus::Resealed
        );

        lifecycle.unseal(10).unwrap();
        let loaded = db.get_leftover_row(row).unwrap().unwrap();
        assert_eq!(loaded.status, LeftoverStatus::ReusePending);
    }

    #[test]
    fn test_reseal_rejects_increase() {
        let db = setup_db();
        let row = db
            .insert_leftover_row(10, 1, "L1", None, 8.0, Expiry::new(2026, 1))
            .unwrap();
        db.try_draw(row, 3.0).unwrap();

        let result = Lifecycle::new(&db).reseal(
            10,
            &[ResealAdjustment { row_id: row, counted_qty: 7.0 }],
        );
        assert!(matches!(
            result,
            Err(LifecycleError::AdjustmentRejected { row_id, counted, available })
                if row_id == row && counted == 7.0 && available == 5.0
        ));

        // Rolled back, nothing changed
        let loaded = db.get_leftover_row(row).unwrap().unwrap();
        assert_eq!(loaded.available_qty, 5.0);
        assert_eq!(loaded.status, LeftoverStatus::ReusePending);
    }

    #[test]
    fn test_reseal_cannot_reopen_closed_pack() {
        let db = setup_db();
        db.insert_leftover_row(10, 1, "L1", None, 5.0, Expiry::new(2026, 1))
            .unwrap();

        let lifecycle = Lifecycle::new(&db);
        lifecycle.discard(10).unwrap();
        let before = db.pending_delivery_updates().unwrap().len();

        // Reseal and unseal against the discarded pack change nothing
        lifecycle.reseal(10, &[]).unwrap();
        assert_eq!(
            db.get_pack(10).unwrap().unwrap().usage_status,
            UsageStatus::Discarded
        );
        lifecycle.unseal(10).unwrap();
        assert_eq!(
            db.get_pack(10).unwrap().unwrap().usage_status,
            UsageStatus::Discarded
        );
        assert_eq!(db.pending_delivery_updates().unwrap().len(), before);
    }

    #[test]
    fn test_reseal_to_zero_closes_row() {
        let db = setup_db();
        let row = db
            .insert_leftover_row(10, 1, "L1", None, 8.0, Expiry::new(2026, 1))
            .unwrap();

        Lifecycle::new(&db)
            .reseal(10, &[ResealAdjustment { row_id: row, counted_qty: 0.0 }])
            .unwrap();
        assert_eq!(
            db.get_leftover_row(row).unwrap().unwrap().status,
            LeftoverStatus::ReuseDone
        );
    }

    #[test]
    fn test_sweep_expired() {
        let db = setup_db();
        let stale = db
            .insert_leftover_row(10, 1, "L-STALE", None, 5.0, Expiry::new(2024, 4))
            .unwrap();
        let fresh = db
            .insert_leftover_row(10, 1, "L-FRESH", None, 5.0, Expiry::new(2026, 1))
            .unwrap();

        let as_of = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();
        let swept = Lifecycle::new(&db).sweep_expired(as_of).unwrap();
        assert_eq!(swept, 1);

        assert_eq!(
            db.get_leftover_row(stale).unwrap().unwrap().status,
            LeftoverStatus::Discarded
        );
        assert_eq!(
            db.get_leftover_row(fresh).unwrap().unwrap().status,
            LeftoverStatus::ReusePending
        );
    }

    struct RecordingTracker {
        seen: Vec<DeliveryUpdate>,
        fail: bool,
    }

    impl DeliveryTracker for RecordingTracker {
        fn push_update(
            &mut self,
            update: &DeliveryUpdate,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            if self.fail {
                return Err("tracker offline".into());
            }
            self.seen.push(update.clone());
            Ok(())
        }
    }

    #[test]
    fn test_drain_outbox_at_least_once() {
        let db = setup_db();
        db.insert_leftover_row(10, 1, "L1", None, 5.0, Expiry::new(2026, 1))
            .unwrap();
        let lifecycle = Lifecycle::new(&db);
        lifecycle.discard(10).unwrap();

        let mut offline = RecordingTracker { seen: Vec::new(), fail: true };
        assert!(lifecycle.drain_outbox(&mut offline).is_err());
        assert_eq!(db.pending_delivery_updates().unwrap().len(), 1);

        let mut tracker = RecordingTracker { seen: Vec::new(), fail: false };
        assert_eq!(lifecycle.drain_outbox(&mut tracker).unwrap(), 1);
        assert_eq!(tracker.seen[0].usage, UsageStatus::Discarded);
        assert!(db.pending_delivery_updates().unwrap().is_empty());

        // Nothing left to drain
        assert_eq!(lifecycle.drain_outbox(&mut tracker).unwrap(), 0);
    }
}

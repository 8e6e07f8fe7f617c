//! Leftover inventory ledger operations.
//!
//! Quantity only moves one way: `try_draw` is a compare-and-swap on
//! `available_qty`, so a stale reader loses the race instead of
//! overdrawing the row. Rows are never deleted; terminal statuses are the
//! end of the line.

use rusqlite::{params, OptionalExtension};

use super::provenance::parse_expiry;
use super::{Database, DbError, DbResult};
use crate::models::{
    DrugId, Expiry, LeftoverRow, LeftoverStatus, PackId, ReuseCandidate,
};

impl Database {
    /// Insert a fresh leftover row with the full quantity available.
    pub fn insert_leftover_row(
        &self,
        pack_id: PackId,
        drug_id: DrugId,
        lot_number: &str,
        case_id: Option<&str>,
        quantity: f64,
        expiry: Expiry,
    ) -> DbResult<i64> {
        self.conn.execute(
            r#"
            INSERT INTO leftover_ledger
                (pack_id, drug_id, lot_number, case_id, total_qty, available_qty, expiry)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6)
            "#,
            params![pack_id, drug_id, lot_number, case_id, quantity, expiry.to_string()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Whether any leftover rows exist for a pack.
    pub fn leftover_rows_exist(&self, pack_id: PackId) -> DbResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM leftover_ledger WHERE pack_id = ?",
            [pack_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// All leftover rows recovered from a pack.
    pub fn leftover_rows_for_pack(&self, pack_id: PackId) -> DbResult<Vec<LeftoverRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE pack_id = ? ORDER BY id",
            SELECT_ROW
        ))?;
        let rows = stmt.query_map([pack_id], map_ledger_row)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?.try_into()?);
        }
        Ok(out)
    }

    /// Get one leftover row by id.
    pub fn get_leftover_row(&self, row_id: i64) -> DbResult<Option<LeftoverRow>> {
        self.conn
            .query_row(
                &format!("{} WHERE id = ?", SELECT_ROW),
                [row_id],
                map_ledger_row,
            )
            .optional()?
            .map(|row| row.try_into())
            .transpose()
    }

    /// Reusable ledger rows for an equivalence class, joined with their
    /// product and source-pack context, cheapest-to-waste first (earliest
    /// expiry, then oldest row).
    ///
    /// Rows whose source pack is currently out for delivery are excluded;
    /// the physical pack is not on the premises to draw from.
    pub fn reusable_candidates(&self, equivalence_class: &str) -> DbResult<Vec<ReuseCandidate>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT l.id, l.pack_id, l.drug_id, l.lot_number, l.case_id,
                   l.total_qty, l.available_qty, l.expiry, l.status,
                   l.created_at, l.modified_at,
                   d.id, d.name, d.strength, d.formatted_ndc, d.equivalence_class, d.brand,
                   k.patient_id
            FROM leftover_ledger l
            JOIN drug_products d ON d.id = l.drug_id
            JOIN packs k ON k.id = l.pack_id
            WHERE d.equivalence_class = ?1
              AND l.status IN ('reuse_pending', 'resealed')
              AND l.available_qty > 0
              AND k.delivery_status != 'delivered'
            ORDER BY l.expiry ASC, l.id ASC
            "#,
        )?;

        let rows = stmt.query_map([equivalence_class], |row| {
            let ledger = map_ledger_row(row)?;
            Ok((
                ledger,
                row.get::<_, i64>(11)?,
                row.get::<_, String>(12)?,
                row.get::<_, Option<String>>(13)?,
                row.get::<_, String>(14)?,
                row.get::<_, String>(15)?,
                row.get::<_, String>(16)?,
                row.get::<_, i64>(17)?,
            ))
        })?;

        let mut candidates = Vec::new();
        for row in rows {
            let (ledger, drug_id, name, strength, ndc, class, brand, patient) = row?;
            candidates.push(ReuseCandidate {
                row: ledger.try_into()?,
                product: crate::models::DrugProduct {
                    id: drug_id,
                    name,
                    strength,
                    formatted_ndc: ndc,
                    equivalence_class: class,
                    brand: super::drugs::string_to_brand(&brand)?,
                },
                source_patient: patient,
            });
        }
        Ok(candidates)
    }

    /// Atomically draw `quantity` from a row. Returns `false` when the row
    /// no longer has that much available or has left a reusable status,
    /// in which case the caller rescans and retries.
    pub fn try_draw(&self, row_id: i64, quantity: f64) -> DbResult<bool> {
        let changed = self.conn.execute(
            r#"
            UPDATE leftover_ledger
            SET available_qty = available_qty - ?2, modified_at = datetime('now')
            WHERE id = ?1
              AND available_qty >= ?2
              AND status IN ('reuse_pending', 'resealed')
            "#,
            params![row_id, quantity],
        )?;
        Ok(changed == 1)
    }

    /// Set a leftover row's status.
    pub fn set_leftover_status(&self, row_id: i64, status: LeftoverStatus) -> DbResult<()> {
        let changed = self.conn.execute(
            "UPDATE leftover_ledger SET status = ?2, modified_at = datetime('now') WHERE id = ?1",
            params![row_id, leftover_status_to_string(&status)],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound(format!("leftover row {}", row_id)));
        }
        Ok(())
    }

    /// Lower a row's available quantity to `new_qty` (a reseal count
    /// correction). Returns `false` when `new_qty` is not a decrease.
    pub fn lower_available(&self, row_id: i64, new_qty: f64) -> DbResult<bool> {
        let changed = self.conn.execute(
            r#"
            UPDATE leftover_ledger
            SET available_qty = ?2, modified_at = datetime('now')
            WHERE id = ?1 AND available_qty >= ?2
            "#,
            params![row_id, new_qty],
        )?;
        Ok(changed == 1)
    }

    /// All rows still in a reusable status, for the expiry sweep.
    pub fn active_leftover_rows(&self) -> DbResult<Vec<LeftoverRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE status IN ('reuse_pending', 'resealed') ORDER BY id",
            SELECT_ROW
        ))?;
        let rows = stmt.query_map([], map_ledger_row)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?.try_into()?);
        }
        Ok(out)
    }
}

const SELECT_ROW: &str = r#"
    SELECT id, pack_id, drug_id, lot_number, case_id,
           total_qty, available_qty, expiry, status, created_at, modified_at
    FROM leftover_ledger
"#;

/// Intermediate row struct for database mapping.
struct LedgerRow {
    id: i64,
    pack_id: i64,
    drug_id: i64,
    lot_number: String,
    case_id: Option<String>,
    total_qty: f64,
    available_qty: f64,
    expiry: String,
    status: String,
    created_at: String,
    modified_at: String,
}

fn map_ledger_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerRow> {
    Ok(LedgerRow {
        id: row.get(0)?,
        pack_id: row.get(1)?,
        drug_id: row.get(2)?,
        lot_number: row.get(3)?,
        case_id: row.get(4)?,
        total_qty: row.get(5)?,
        available_qty: row.get(6)?,
        expiry: row.get(7)?,
        status: row.get(8)?,
        created_at: row.get(9)?,
        modified_at: row.get(10)?,
    })
}

impl TryFrom<LedgerRow> for LeftoverRow {
    type Error = DbError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        Ok(LeftoverRow {
            id: row.id,
            pack_id: row.pack_id,
            drug_id: row.drug_id,
            lot_number: row.lot_number,
            case_id: row.case_id,
            total_qty: row.total_qty,
            available_qty: row.available_qty,
            expiry: parse_expiry(&row.expiry)?,
            status: string_to_leftover_status(&row.status)?,
            created_at: row.created_at,
            modified_at: row.modified_at,
        })
    }
}

pub(crate) fn leftover_status_to_string(status: &LeftoverStatus) -> &'static str {
    match status {
        LeftoverStatus::ReusePending => "reuse_pending",
        LeftoverStatus::Resealed => "resealed",
        LeftoverStatus::ReuseDone => "reuse_done",
        LeftoverStatus::Discarded => "discarded",
    }
}

pub(crate) fn string_to_leftover_status(s: &str) -> Result<LeftoverStatus, DbError> {
    match s {
        "reuse_pending" => Ok(LeftoverStatus::ReusePending),
        "resealed" => Ok(LeftoverStatus::Resealed),
        "reuse_done" => Ok(LeftoverStatus::ReuseDone),
        "discarded" => Ok(LeftoverStatus::Discarded),
        _ => Err(DbError::Constraint(format!(
            "Unknown leftover status: {}",
            s
        ))),
    }
}

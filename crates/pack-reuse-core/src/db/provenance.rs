//! Dispense provenance operations.
//!
//! Entries are append-mostly. A correction supersedes the old entry and
//! inserts a replacement; summation always filters superseded rows out.

use rusqlite::params;

use super::{Database, DbError, DbResult};
use crate::models::{DrugId, Expiry, PackId, ProvenanceEntry, SourceKind};

/// Leftover quantity of one (drug, lot, case) group recovered from a pack:
/// what went in, minus what was already drawn back out for reuse.
#[derive(Debug, Clone, PartialEq)]
pub struct LeftoverGroup {
    pub drug_id: DrugId,
    pub lot_number: String,
    pub case_id: Option<String>,
    pub quantity: f64,
    pub expiry: Expiry,
}

impl Database {
    /// Record a canister or manual-fill dispense into a pack.
    pub fn record_dispense(
        &self,
        pack_id: PackId,
        drug_id: DrugId,
        quantity: f64,
        lot_number: &str,
        case_id: Option<&str>,
        expiry: Expiry,
        source: SourceKind,
    ) -> DbResult<i64> {
        self.insert_entry(pack_id, drug_id, quantity, lot_number, case_id, expiry, source, None, None)
    }

    /// Record a reuse dispense: quantity drawn from `source_pack_id`'s
    /// leftover inventory into `pack_id`, tagged with its allocation batch.
    #[allow(clippy::too_many_arguments)]
    pub fn record_reuse_dispense(
        &self,
        pack_id: PackId,
        drug_id: DrugId,
        quantity: f64,
        lot_number: &str,
        case_id: Option<&str>,
        expiry: Expiry,
        source_pack_id: PackId,
        allocation_id: &str,
    ) -> DbResult<i64> {
        self.insert_entry(
            pack_id,
            drug_id,
            quantity,
            lot_number,
            case_id,
            expiry,
            SourceKind::Reuse,
            Some(source_pack_id),
            Some(allocation_id),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_entry(
        &self,
        pack_id: PackId,
        drug_id: DrugId,
        quantity: f64,
        lot_number: &str,
        case_id: Option<&str>,
        expiry: Expiry,
        source: SourceKind,
        source_pack_id: Option<PackId>,
        allocation_id: Option<&str>,
    ) -> DbResult<i64> {
        self.conn.execute(
            r#"
            INSERT INTO provenance_entries
                (pack_id, drug_id, quantity, lot_number, case_id, expiry,
                 source_kind, source_pack_id, allocation_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                pack_id,
                drug_id,
                quantity,
                lot_number,
                case_id,
                expiry.to_string(),
                source_to_string(&source),
                source_pack_id,
                allocation_id,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// All provenance entries for a pack, superseded ones included.
    pub fn entries_for_pack(&self, pack_id: PackId) -> DbResult<Vec<ProvenanceEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, pack_id, drug_id, quantity, lot_number, case_id, expiry,
                   source_kind, superseded, source_pack_id, allocation_id, created_at
            FROM provenance_entries
            WHERE pack_id = ?
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map([pack_id], map_entry_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.try_into()?);
        }
        Ok(entries)
    }

    /// Non-superseded reuse entries credited to a pack. Used to detect a
    /// pack that was already allocated and to rebuild its report.
    pub fn reuse_entries_for_pack(&self, pack_id: PackId) -> DbResult<Vec<ProvenanceEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, pack_id, drug_id, quantity, lot_number, case_id, expiry,
                   source_kind, superseded, source_pack_id, allocation_id, created_at
            FROM provenance_entries
            WHERE pack_id = ? AND source_kind = 'reuse' AND superseded = 0
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map([pack_id], map_entry_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.try_into()?);
        }
        Ok(entries)
    }

    /// Mark an entry as superseded by a correction.
    pub fn supersede_entry(&self, entry_id: i64) -> DbResult<()> {
        let changed = self.conn.execute(
            "UPDATE provenance_entries SET superseded = 1 WHERE id = ? AND superseded = 0",
            [entry_id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound(format!(
                "active provenance entry {}",
                entry_id
            )));
        }
        Ok(())
    }

    /// Leftover quantity per (drug, lot, case) recoverable from a pack:
    /// non-superseded dispenses into the pack, minus quantity already drawn
    /// out of it as a reuse source. Groups that net to zero are dropped.
    pub fn leftover_groups(&self, pack_id: PackId) -> DbResult<Vec<LeftoverGroup>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT e.drug_id, e.lot_number, e.case_id, e.expiry,
                   SUM(e.quantity) - COALESCE((
                       SELECT SUM(o.quantity) FROM provenance_entries o
                       WHERE o.source_pack_id = e.pack_id
                         AND o.drug_id = e.drug_id
                         AND o.lot_number = e.lot_number
                         AND COALESCE(o.case_id, '') = COALESCE(e.case_id, '')
                         AND o.superseded = 0
                   ), 0.0) AS leftover_qty
            FROM provenance_entries e
            WHERE e.pack_id = ?1 AND e.superseded = 0 AND e.source_kind != 'reuse'
            GROUP BY e.drug_id, e.lot_number, COALESCE(e.case_id, '')
            ORDER BY e.drug_id, e.lot_number
            "#,
        )?;

        let rows = stmt.query_map([pack_id], |row| {
            Ok((
                row.get::<_, DrugId>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, f64>(4)?,
            ))
        })?;

        let mut groups = Vec::new();
        for row in rows {
            let (drug_id, lot_number, case_id, expiry, quantity) = row?;
            if quantity <= 0.0 {
                continue;
            }
            groups.push(LeftoverGroup {
                drug_id,
                lot_number,
                case_id,
                quantity,
                expiry: parse_expiry(&expiry)?,
            });
        }
        Ok(groups)
    }
}

/// Intermediate row struct for database mapping.
struct EntryRow {
    id: i64,
    pack_id: i64,
    drug_id: i64,
    quantity: f64,
    lot_number: String,
    case_id: Option<String>,
    expiry: String,
    source_kind: String,
    superseded: i64,
    source_pack_id: Option<i64>,
    allocation_id: Option<String>,
    created_at: String,
}

fn map_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
    Ok(EntryRow {
        id: row.get(0)?,
        pack_id: row.get(1)?,
        drug_id: row.get(2)?,
        quantity: row.get(3)?,
        lot_number: row.get(4)?,
        case_id: row.get(5)?,
        expiry: row.get(6)?,
        source_kind: row.get(7)?,
        superseded: row.get(8)?,
        source_pack_id: row.get(9)?,
        allocation_id: row.get(10)?,
        created_at: row.get(11)?,
    })
}

impl TryFrom<EntryRow> for ProvenanceEntry {
    type Error = DbError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        Ok(ProvenanceEntry {
            id: row.id,
            pack_id: row.pack_id,
            drug_id: row.drug_id,
            quantity: row.quantity,
            lot_number: row.lot_number,
            case_id: row.case_id,
            expiry: parse_expiry(&row.expiry)?,
            source: string_to_source(&row.source_kind)?,
            superseded: row.superseded != 0,
            source_pack_id: row.source_pack_id,
            allocation_id: row.allocation_id,
            created_at: row.created_at,
        })
    }
}

pub(crate) fn parse_expiry(s: &str) -> Result<Expiry, DbError> {
    s.parse().map_err(DbError::Constraint)
}

pub(crate) fn source_to_string(source: &SourceKind) -> &'static str {
    match source {
        SourceKind::Canister => "canister",
        SourceKind::ManualFill => "manual_fill",
        SourceKind::Reuse => "reuse",
    }
}

pub(crate) fn string_to_source(s: &str) -> Result<SourceKind, DbError> {
    match s {
        "canister" => Ok(SourceKind::Canister),
        "manual_fill" => Ok(SourceKind::ManualFill),
        "reuse" => Ok(SourceKind::Reuse),
        _ => Err(DbError::Constraint(format!("Unknown source kind: {}", s))),
    }
}

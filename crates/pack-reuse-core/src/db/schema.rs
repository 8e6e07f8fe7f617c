//! SQLite schema definition.

/// Complete database schema for the reuse engine.
pub const SCHEMA: &str = r#"
-- Enable foreign keys
PRAGMA foreign_keys = ON;

-- ============================================================================
-- Drug Products
-- ============================================================================

CREATE TABLE IF NOT EXISTS drug_products (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    strength TEXT,
    formatted_ndc TEXT NOT NULL,
    equivalence_class TEXT NOT NULL DEFAULT '',
    brand TEXT NOT NULL CHECK (brand IN ('brand', 'generic')),
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_products_class ON drug_products(equivalence_class);
CREATE INDEX IF NOT EXISTS idx_products_ndc ON drug_products(formatted_ndc);

-- ============================================================================
-- Packs (owned externally; the core reads status/dates, writes usage status)
-- ============================================================================

CREATE TABLE IF NOT EXISTS packs (
    id INTEGER PRIMARY KEY,
    display_id INTEGER NOT NULL UNIQUE,
    status TEXT NOT NULL CHECK (status IN
        ('pending', 'in_progress', 'manually_filled', 'partially_filled', 'done', 'deleted')),
    patient_id INTEGER NOT NULL,
    consumption_start TEXT NOT NULL,
    consumption_end TEXT NOT NULL,
    delivery_status TEXT NOT NULL DEFAULT 'inside_pharmacy' CHECK (delivery_status IN
        ('inside_pharmacy', 'delivered', 'returned_from_delivery')),
    usage_status TEXT NOT NULL DEFAULT 'not_required' CHECK (usage_status IN
        ('not_required', 'pending', 'in_progress', 'resealed', 'done', 'discarded')),
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- ============================================================================
-- Pack Demand (slot-aggregated requirement lines, written by the filler)
-- ============================================================================

CREATE TABLE IF NOT EXISTS pack_demand (
    id INTEGER PRIMARY KEY,
    pack_id INTEGER NOT NULL REFERENCES packs(id),
    drug_id INTEGER NOT NULL REFERENCES drug_products(id),
    required_qty REAL NOT NULL CHECK (required_qty >= 0),
    daw_code INTEGER NOT NULL DEFAULT 0,
    UNIQUE (pack_id, drug_id)
);

CREATE INDEX IF NOT EXISTS idx_demand_pack ON pack_demand(pack_id);

-- ============================================================================
-- Dispense Provenance (append-mostly; corrections supersede, never rewrite)
-- ============================================================================

CREATE TABLE IF NOT EXISTS provenance_entries (
    id INTEGER PRIMARY KEY,
    pack_id INTEGER NOT NULL REFERENCES packs(id),
    drug_id INTEGER NOT NULL REFERENCES drug_products(id),
    quantity REAL NOT NULL CHECK (quantity > 0),
    lot_number TEXT NOT NULL,
    case_id TEXT,
    expiry TEXT NOT NULL,
    source_kind TEXT NOT NULL CHECK (source_kind IN ('canister', 'manual_fill', 'reuse')),
    superseded INTEGER NOT NULL DEFAULT 0,
    source_pack_id INTEGER REFERENCES packs(id),
    allocation_id TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Reuse entries must reference their source pack; others must not
CREATE TRIGGER IF NOT EXISTS provenance_check_source BEFORE INSERT ON provenance_entries
BEGIN
    SELECT CASE
        WHEN new.source_kind = 'reuse' AND new.source_pack_id IS NULL THEN
            RAISE(ABORT, 'Reuse entries must reference a source pack')
        WHEN new.source_kind != 'reuse' AND new.source_pack_id IS NOT NULL THEN
            RAISE(ABORT, 'Only reuse entries may reference a source pack')
    END;
END;

CREATE INDEX IF NOT EXISTS idx_provenance_pack_drug ON provenance_entries(pack_id, drug_id);
CREATE INDEX IF NOT EXISTS idx_provenance_source_pack ON provenance_entries(source_pack_id);

-- ============================================================================
-- Leftover Inventory Ledger (never deleted; discard is a status change)
-- ============================================================================

CREATE TABLE IF NOT EXISTS leftover_ledger (
    id INTEGER PRIMARY KEY,
    pack_id INTEGER NOT NULL REFERENCES packs(id),
    drug_id INTEGER NOT NULL REFERENCES drug_products(id),
    lot_number TEXT NOT NULL,
    case_id TEXT,
    total_qty REAL NOT NULL CHECK (total_qty > 0),
    available_qty REAL NOT NULL CHECK (available_qty >= 0 AND available_qty <= total_qty),
    expiry TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'reuse_pending' CHECK (status IN
        ('reuse_pending', 'resealed', 'reuse_done', 'discarded')),
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    modified_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per (source pack, drug, lot/case)
CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_identity
    ON leftover_ledger(pack_id, drug_id, lot_number, COALESCE(case_id, ''));

CREATE INDEX IF NOT EXISTS idx_ledger_status ON leftover_ledger(status);
CREATE INDEX IF NOT EXISTS idx_ledger_drug ON leftover_ledger(drug_id);

-- Terminal rows never transition again
CREATE TRIGGER IF NOT EXISTS ledger_terminal_frozen BEFORE UPDATE OF status ON leftover_ledger
WHEN old.status IN ('reuse_done', 'discarded') AND new.status != old.status
BEGIN
    SELECT RAISE(ABORT, 'Terminal leftover status cannot change');
END;

-- Available quantity is monotonically non-increasing
CREATE TRIGGER IF NOT EXISTS ledger_available_monotone BEFORE UPDATE OF available_qty ON leftover_ledger
WHEN new.available_qty > old.available_qty
BEGIN
    SELECT RAISE(ABORT, 'Available quantity cannot increase');
END;

-- ============================================================================
-- Outbox (usage-status updates relayed after the local commit)
-- ============================================================================

CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY,
    pack_id INTEGER NOT NULL REFERENCES packs(id),
    payload TEXT NOT NULL,                       -- JSON DeliveryUpdate
    dispatched INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox(dispatched);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_valid() {
        let conn = Connection::open_in_memory().unwrap();
        let result = conn.execute_batch(SCHEMA);
        assert!(result.is_ok(), "Schema should be valid SQL: {:?}", result);
    }

    fn seed_pack_and_drug(conn: &Connection) {
        conn.execute(
            "INSERT INTO packs (id, display_id, status, patient_id, consumption_start, consumption_end)
             VALUES (1, 100001, 'done', 7, '2024-03-01', '2024-03-28')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO drug_products (id, name, formatted_ndc, equivalence_class, brand)
             VALUES (1, 'Metformin 500mg', '12345-678-90', 'AB1234', 'generic')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_reuse_entry_requires_source_pack() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        seed_pack_and_drug(&conn);

        let result = conn.execute(
            "INSERT INTO provenance_entries (pack_id, drug_id, quantity, lot_number, expiry, source_kind)
             VALUES (1, 1, 5.0, 'L1', '2025-03', 'reuse')",
            [],
        );
        assert!(result.is_err());

        let result = conn.execute(
            "INSERT INTO provenance_entries (pack_id, drug_id, quantity, lot_number, expiry, source_kind, source_pack_id)
             VALUES (1, 1, 5.0, 'L1', '2025-03', 'canister', 1)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_available_cannot_exceed_total() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        seed_pack_and_drug(&conn);

        let result = conn.execute(
            "INSERT INTO leftover_ledger (pack_id, drug_id, lot_number, total_qty, available_qty, expiry)
             VALUES (1, 1, 'L1', 10.0, 12.0, '2025-03')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_available_cannot_increase() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        seed_pack_and_drug(&conn);

        conn.execute(
            "INSERT INTO leftover_ledger (id, pack_id, drug_id, lot_number, total_qty, available_qty, expiry)
             VALUES (1, 1, 1, 'L1', 10.0, 6.0, '2025-03')",
            [],
        )
        .unwrap();

        let result = conn.execute(
            "UPDATE leftover_ledger SET available_qty = 8.0 WHERE id = 1",
            [],
        );
        assert!(result.is_err());

        let result = conn.execute(
            "UPDATE leftover_ledger SET available_qty = 4.0 WHERE id = 1",
            [],
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_terminal_status_frozen() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        seed_pack_and_drug(&conn);

        conn.execute(
            "INSERT INTO leftover_ledger (id, pack_id, drug_id, lot_number, total_qty, available_qty, expiry, status)
             VALUES (1, 1, 1, 'L1', 10.0, 0.0, '2025-03', 'reuse_done')",
            [],
        )
        .unwrap();

        let result = conn.execute(
            "UPDATE leftover_ledger SET status = 'reuse_pending' WHERE id = 1",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_ledger_identity_unique() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        seed_pack_and_drug(&conn);

        conn.execute(
            "INSERT INTO leftover_ledger (pack_id, drug_id, lot_number, total_qty, available_qty, expiry)
             VALUES (1, 1, 'L1', 10.0, 10.0, '2025-03')",
            [],
        )
        .unwrap();

        // Same (pack, drug, lot, no case) rejected even with NULL case ids
        let result = conn.execute(
            "INSERT INTO leftover_ledger (pack_id, drug_id, lot_number, total_qty, available_qty, expiry)
             VALUES (1, 1, 'L1', 4.0, 4.0, '2025-03')",
            [],
        );
        assert!(result.is_err());
    }
}

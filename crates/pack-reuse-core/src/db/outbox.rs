//! Outbox for pharmacy-side delivery-tracking updates.
//!
//! Usage-status changes are committed locally first and relayed to the
//! external delivery-tracking record afterwards, so a remote failure never
//! rolls back ledger state. Delivery is at-least-once.

use rusqlite::params;

use super::{Database, DbResult};
use crate::models::{PackId, UsageStatus};
use serde::{Deserialize, Serialize};

/// Payload mirrored to the pharmacy-side delivery-tracking record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryUpdate {
    pub pack_id: PackId,
    pub display_id: i64,
    pub usage: UsageStatus,
}

impl Database {
    /// Queue a usage-status update for relay after the local commit.
    pub fn enqueue_delivery_update(&self, update: &DeliveryUpdate) -> DbResult<i64> {
        let payload = serde_json::to_string(update)?;
        self.conn.execute(
            "INSERT INTO outbox (pack_id, payload) VALUES (?1, ?2)",
            params![update.pack_id, payload],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Updates not yet relayed, oldest first.
    pub fn pending_delivery_updates(&self) -> DbResult<Vec<(i64, DeliveryUpdate)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, payload FROM outbox WHERE dispatched = 0 ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut updates = Vec::new();
        for row in rows {
            let (id, payload) = row?;
            updates.push((id, serde_json::from_str(&payload)?));
        }
        Ok(updates)
    }

    /// Mark an outbox entry as relayed.
    pub fn mark_dispatched(&self, outbox_id: i64) -> DbResult<()> {
        self.conn.execute(
            "UPDATE outbox SET dispatched = 1 WHERE id = ?",
            [outbox_id],
        )?;
        Ok(())
    }
}

//! Pack record operations.

use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};

use super::{Database, DbError, DbResult};
use crate::models::{DeliveryStatus, Pack, PackId, PackStatus, UsageStatus};

impl Database {
    /// Insert a pack record.
    pub fn insert_pack(&self, pack: &Pack) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO packs
                (id, display_id, status, patient_id, consumption_start, consumption_end,
                 delivery_status, usage_status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                pack.id,
                pack.display_id,
                pack_status_to_string(&pack.status),
                pack.patient_id,
                pack.consumption_start.to_string(),
                pack.consumption_end.to_string(),
                delivery_status_to_string(&pack.delivery_status),
                usage_status_to_string(&pack.usage_status),
            ],
        )?;
        Ok(())
    }

    /// Get a pack by id.
    pub fn get_pack(&self, pack_id: PackId) -> DbResult<Option<Pack>> {
        self.conn
            .query_row(
                r#"
                SELECT id, display_id, status, patient_id, consumption_start, consumption_end,
                       delivery_status, usage_status
                FROM packs
                WHERE id = ?
                "#,
                [pack_id],
                |row| {
                    Ok(PackRow {
                        id: row.get(0)?,
                        display_id: row.get(1)?,
                        status: row.get(2)?,
                        patient_id: row.get(3)?,
                        consumption_start: row.get(4)?,
                        consumption_end: row.get(5)?,
                        delivery_status: row.get(6)?,
                        usage_status: row.get(7)?,
                    })
                },
            )
            .optional()?
            .map(|row| row.try_into())
            .transpose()
    }

    /// Get a pack, failing if it does not exist.
    pub fn require_pack(&self, pack_id: PackId) -> DbResult<Pack> {
        self.get_pack(pack_id)?
            .ok_or_else(|| DbError::NotFound(format!("pack {}", pack_id)))
    }

    /// Update a pack's external usage status.
    pub fn set_usage_status(&self, pack_id: PackId, status: UsageStatus) -> DbResult<()> {
        let changed = self.conn.execute(
            "UPDATE packs SET usage_status = ?2 WHERE id = ?1",
            params![pack_id, usage_status_to_string(&status)],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound(format!("pack {}", pack_id)));
        }
        Ok(())
    }

    /// Update a pack's delivery status.
    pub fn set_delivery_status(&self, pack_id: PackId, status: DeliveryStatus) -> DbResult<()> {
        let changed = self.conn.execute(
            "UPDATE packs SET delivery_status = ?2 WHERE id = ?1",
            params![pack_id, delivery_status_to_string(&status)],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound(format!("pack {}", pack_id)));
        }
        Ok(())
    }
}

/// Intermediate row struct for database mapping.
struct PackRow {
    id: i64,
    display_id: i64,
    status: String,
    patient_id: i64,
    consumption_start: String,
    consumption_end: String,
    delivery_status: String,
    usage_status: String,
}

impl TryFrom<PackRow> for Pack {
    type Error = DbError;

    fn try_from(row: PackRow) -> Result<Self, Self::Error> {
        Ok(Pack {
            id: row.id,
            display_id: row.display_id,
            status: string_to_pack_status(&row.status)?,
            patient_id: row.patient_id,
            consumption_start: parse_date(&row.consumption_start)?,
            consumption_end: parse_date(&row.consumption_end)?,
            delivery_status: string_to_delivery_status(&row.delivery_status)?,
            usage_status: string_to_usage_status(&row.usage_status)?,
        })
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, DbError> {
    s.parse()
        .map_err(|_| DbError::Constraint(format!("Invalid date: {}", s)))
}

pub(crate) fn pack_status_to_string(status: &PackStatus) -> &'static str {
    match status {
        PackStatus::Pending => "pending",
        PackStatus::InProgress => "in_progress",
        PackStatus::ManuallyFilled => "manually_filled",
        PackStatus::PartiallyFilled => "partially_filled",
        PackStatus::Done => "done",
        PackStatus::Deleted => "deleted",
    }
}

pub(crate) fn string_to_pack_status(s: &str) -> Result<PackStatus, DbError> {
    match s {
        "pending" => Ok(PackStatus::Pending),
        "in_progress" => Ok(PackStatus::InProgress),
        "manually_filled" => Ok(PackStatus::ManuallyFilled),
        "partially_filled" => Ok(PackStatus::PartiallyFilled),
        "done" => Ok(PackStatus::Done),
        "deleted" => Ok(PackStatus::Deleted),
        _ => Err(DbError::Constraint(format!("Unknown pack status: {}", s))),
    }
}

pub(crate) fn delivery_status_to_string(status: &DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::InsidePharmacy => "inside_pharmacy",
        DeliveryStatus::Delivered => "delivered",
        DeliveryStatus::ReturnedFromDelivery => "returned_from_delivery",
    }
}

pub(crate) fn string_to_delivery_status(s: &str) -> Result<DeliveryStatus, DbError> {
    match s {
        "inside_pharmacy" => Ok(DeliveryStatus::InsidePharmacy),
        "delivered" => Ok(DeliveryStatus::Delivered),
        "returned_from_delivery" => Ok(DeliveryStatus::ReturnedFromDelivery),
        _ => Err(DbError::Constraint(format!(
            "Unknown delivery status: {}",
            s
        ))),
    }
}

pub(crate) fn usage_status_to_string(status: &UsageStatus) -> &'static str {
    match status {
        UsageStatus::NotRequired => "not_required",
        UsageStatus::Pending => "pending",
        UsageStatus::InProgress => "in_progress",
        UsageStatus::Resealed => "resealed",
        UsageStatus::Done => "done",
        UsageStatus::Discarded => "discarded",
    }
}

pub(crate) fn string_to_usage_status(s: &str) -> Result<UsageStatus, DbError> {
    match s {
        "not_required" => Ok(UsageStatus::NotRequired),
        "pending" => Ok(UsageStatus::Pending),
        "in_progress" => Ok(UsageStatus::InProgress),
        "resealed" => Ok(UsageStatus::Resealed),
        "done" => Ok(UsageStatus::Done),
        "discarded" => Ok(UsageStatus::Discarded),
        _ => Err(DbError::Constraint(format!("Unknown usage status: {}", s))),
    }
}

#[cfg(test)]
pub(crate) fn sample_pack(id: PackId, patient_id: i64) -> Pack {
    Pack {
        id,
        display_id: 100000 + id,
        status: PackStatus::Done,
        patient_id,
        consumption_start: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        consumption_end: NaiveDate::from_ymd_opt(2024, 3, 28).unwrap(),
        delivery_status: DeliveryStatus::InsidePharmacy,
        usage_status: UsageStatus::NotRequired,
    }
}

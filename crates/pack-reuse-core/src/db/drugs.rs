//! Drug product and pack demand operations.

use rusqlite::{params, OptionalExtension};

use super::{Database, DbError, DbResult};
use crate::models::{BrandClass, DawCode, DrugId, DrugProduct, PackId, RequiredDrugLine};

/// Demand below this is treated as satisfied (half-unit resolution with
/// float rounding slack).
const QTY_EPSILON: f64 = 1e-9;

impl Database {
    /// Insert or update a drug product.
    pub fn upsert_drug_product(&self, product: &DrugProduct) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO drug_products (id, name, strength, formatted_ndc, equivalence_class, brand)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                strength = excluded.strength,
                formatted_ndc = excluded.formatted_ndc,
                equivalence_class = excluded.equivalence_class,
                brand = excluded.brand
            "#,
            params![
                product.id,
                product.name,
                product.strength,
                product.formatted_ndc,
                product.equivalence_class,
                brand_to_string(&product.brand),
            ],
        )?;
        Ok(())
    }

    /// Get a drug product by id.
    pub fn get_drug_product(&self, drug_id: DrugId) -> DbResult<Option<DrugProduct>> {
        self.conn
            .query_row(
                r#"
                SELECT id, name, strength, formatted_ndc, equivalence_class, brand
                FROM drug_products
                WHERE id = ?
                "#,
                [drug_id],
                |row| {
                    Ok(ProductRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        strength: row.get(2)?,
                        formatted_ndc: row.get(3)?,
                        equivalence_class: row.get(4)?,
                        brand: row.get(5)?,
                    })
                },
            )
            .optional()?
            .map(|row| row.try_into())
            .transpose()
    }

    /// Record a slot-aggregated demand line for a pack. Written by the
    /// filling subsystem; the core only reads it back.
    pub fn insert_demand_line(
        &self,
        pack_id: PackId,
        drug_id: DrugId,
        required_qty: f64,
        daw_code: i64,
    ) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO pack_demand (pack_id, drug_id, required_qty, daw_code)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(pack_id, drug_id) DO UPDATE SET
                required_qty = excluded.required_qty,
                daw_code = excluded.daw_code
            "#,
            params![pack_id, drug_id, required_qty, daw_code],
        )?;
        Ok(())
    }

    /// Outstanding requirement lines of a pack: demand minus quantity
    /// already credited by non-superseded provenance entries. Lines that
    /// are already covered are dropped.
    pub fn outstanding_requirements(&self, pack_id: PackId) -> DbResult<Vec<RequiredDrugLine>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT d.drug_id, d.required_qty, d.daw_code,
                   p.equivalence_class, p.formatted_ndc, p.brand,
                   COALESCE((
                       SELECT SUM(e.quantity) FROM provenance_entries e
                       WHERE e.pack_id = d.pack_id
                         AND e.drug_id = d.drug_id
                         AND e.superseded = 0
                   ), 0.0) AS filled_qty
            FROM pack_demand d
            JOIN drug_products p ON p.id = d.drug_id
            WHERE d.pack_id = ?
            ORDER BY d.drug_id
            "#,
        )?;

        let rows = stmt.query_map([pack_id], |row| {
            Ok((
                row.get::<_, DrugId>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, f64>(6)?,
            ))
        })?;

        let mut lines = Vec::new();
        for row in rows {
            let (drug_id, required, daw_code, class, ndc, brand, filled) = row?;
            let outstanding = required - filled;
            if outstanding > QTY_EPSILON {
                lines.push(RequiredDrugLine {
                    drug_id,
                    equivalence_class: class,
                    formatted_ndc: ndc,
                    brand: string_to_brand(&brand)?,
                    daw: DawCode::from_code(daw_code),
                    required_qty: outstanding,
                });
            }
        }
        Ok(lines)
    }
}

/// Intermediate row struct for database mapping.
struct ProductRow {
    id: i64,
    name: String,
    strength: Option<String>,
    formatted_ndc: String,
    equivalence_class: String,
    brand: String,
}

impl TryFrom<ProductRow> for DrugProduct {
    type Error = DbError;

    fn try_from(row: ProductRow) -> Result<Self, Self::Error> {
        Ok(DrugProduct {
            id: row.id,
            name: row.name,
            strength: row.strength,
            formatted_ndc: row.formatted_ndc,
            equivalence_class: row.equivalence_class,
            brand: string_to_brand(&row.brand)?,
        })
    }
}

pub(crate) fn brand_to_string(brand: &BrandClass) -> &'static str {
    match brand {
        BrandClass::Brand => "brand",
        BrandClass::Generic => "generic",
    }
}

pub(crate) fn string_to_brand(s: &str) -> Result<BrandClass, DbError> {
    match s {
        "brand" => Ok(BrandClass::Brand),
        "generic" => Ok(BrandClass::Generic),
        _ => Err(DbError::Constraint(format!("Unknown brand class: {}", s))),
    }
}

//! SQLite adapter: implementation of the query-evaluation port.
//!
//! Owns the `patient_records` table: schema creation, record ingest with
//! derived-column computation, and the three read-only evaluation
//! operations. Literal values are always bound as parameters; column
//! names are interpolated only after resolving to their canonical
//! allowlist entry.
//!
//! # Mutex Behavior
//!
//! The connection is protected by `Mutex`. A poisoned mutex (from a panic
//! in another thread) causes a panic. This fail-fast behavior is
//! intentional for data integrity.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, params_from_iter, Connection};

use crate::domain::schema::{self, PatientRecord, TABLE_NAME};
use crate::domain::{AggFn, AggTarget, AggregateValue, Filter, Literal, ParsedQuery};
use crate::ports::{EvaluatorError, QueryEvaluator};

/// Error type for store maintenance operations (schema init, ingest).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(String),
}

/// SQLite-backed query evaluator.
pub struct SqliteEvaluator {
    conn: Mutex<Connection>,
}

impl SqliteEvaluator {
    /// Open (or create) a database at the given path.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or initialized.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    /// Returns error if the database cannot be created.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("Lock failed");

        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS patient_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                age INTEGER,
                sex INTEGER,
                cp INTEGER,
                trestbps INTEGER,
                chol INTEGER,
                fbs INTEGER,
                thalach INTEGER,
                target INTEGER,
                age_band TEXT,
                cp_group TEXT,
                chol_level TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_patient_records_age
                ON patient_records(age);
            ",
        )?;

        Ok(())
    }

    /// Insert one record, computing the derived generalization columns.
    ///
    /// # Errors
    /// Returns error if the insert fails.
    pub fn insert_record(&self, record: &PatientRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("Lock failed");

        conn.execute(
            r"
            INSERT INTO patient_records (
                age, sex, cp, trestbps, chol, fbs, thalach, target,
                age_band, cp_group, chol_level
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ",
            params![
                record.age,
                record.sex,
                record.cp,
                record.trestbps,
                record.chol,
                record.fbs,
                record.thalach,
                record.target,
                schema::age_band(record.age),
                schema::cp_group(record.cp),
                schema::chol_level(record.chol as f64),
            ],
        )?;

        Ok(())
    }

    /// Load records from a CSV file with a header row.
    ///
    /// Header names are matched case-insensitively; the synonyms
    /// `trtbps`, `thalachh` and `output` map to `trestbps`, `thalach` and
    /// `target`. Rows missing any of age/sex/cp/chol are skipped. Returns
    /// the number of rows inserted.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, the header lacks a
    /// required column, or an insert fails.
    pub fn import_csv_file<P: AsRef<Path>>(&self, path: P) -> Result<usize, StoreError> {
        let text = std::fs::read_to_string(path)?;
        let mut lines = text.lines();

        let header = lines
            .next()
            .ok_or_else(|| StoreError::Csv("Empty file".to_string()))?;
        let columns: Vec<String> = header
            .split(',')
            .map(|c| canonical_csv_column(c.trim()))
            .collect();

        let index_of = |name: &str| columns.iter().position(|c| c == name);
        for required in ["age", "sex", "cp", "chol"] {
            if index_of(required).is_none() {
                return Err(StoreError::Csv(format!("Missing required column: {required}")));
            }
        }

        let mut inserted = 0usize;
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let int_at = |name: &str| -> Option<i64> {
                let idx = index_of(name)?;
                // Some exports render integers as "63.0".
                fields.get(idx)?.parse::<f64>().ok().map(|v| v as i64)
            };

            let (Some(age), Some(sex), Some(cp), Some(chol)) =
                (int_at("age"), int_at("sex"), int_at("cp"), int_at("chol"))
            else {
                continue;
            };

            self.insert_record(&PatientRecord {
                age,
                sex,
                cp,
                trestbps: int_at("trestbps"),
                chol,
                fbs: int_at("fbs"),
                thalach: int_at("thalach"),
                target: int_at("target"),
            })?;
            inserted += 1;
        }

        tracing::info!("Imported {inserted} patient records");
        Ok(inserted)
    }

    /// Total rows in the table, ignoring filters.
    ///
    /// # Errors
    /// Returns error if the query fails.
    pub fn total_records(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        let count =
            conn.query_row("SELECT COUNT(*) FROM patient_records", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn canonical_csv_column(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    match lower.as_str() {
        "trtbps" => "trestbps".to_string(),
        "thalachh" => "thalach".to_string(),
        "output" => "target".to_string(),
        _ => lower,
    }
}

fn bind_value(literal: &Literal) -> rusqlite::types::Value {
    match literal {
        Literal::Int(v) => rusqlite::types::Value::Integer(*v),
        Literal::Float(v) => rusqlite::types::Value::Real(*v),
        Literal::Str(v) => rusqlite::types::Value::Text(v.clone()),
    }
}

/// Render the WHERE clause with `?` placeholders, resolving each column
/// to its canonical allowlist entry first.
fn where_clause(
    filters: &[Filter],
) -> Result<(String, Vec<rusqlite::types::Value>), EvaluatorError> {
    if filters.is_empty() {
        return Ok((String::new(), Vec::new()));
    }

    let mut predicates = Vec::with_capacity(filters.len());
    let mut values = Vec::with_capacity(filters.len());
    for filter in filters {
        let column = schema::canonical_column(&filter.column)
            .ok_or_else(|| EvaluatorError::UnknownColumn(filter.column.clone()))?;
        predicates.push(format!("{column} {} ?", filter.op.as_sql()));
        values.push(bind_value(&filter.value));
    }

    Ok((format!(" WHERE {}", predicates.join(" AND ")), values))
}

fn store_unavailable(err: rusqlite::Error) -> EvaluatorError {
    EvaluatorError::Unavailable(err.to_string())
}

impl QueryEvaluator for SqliteEvaluator {
    fn count(&self, pq: &ParsedQuery) -> Result<i64, EvaluatorError> {
        let (where_sql, values) = where_clause(&pq.filters)?;
        let sql = format!("SELECT COUNT(*) FROM {TABLE_NAME}{where_sql}");

        let conn = self.conn.lock().expect("Lock failed");
        conn.query_row(&sql, params_from_iter(values), |row| row.get(0))
            .map_err(store_unavailable)
    }

    fn distinct_count(&self, pq: &ParsedQuery, column: &str) -> Result<i64, EvaluatorError> {
        let target = schema::canonical_column(column)
            .ok_or_else(|| EvaluatorError::UnknownColumn(column.to_string()))?;
        let (where_sql, values) = where_clause(&pq.filters)?;
        let sql = format!("SELECT COUNT(DISTINCT {target}) FROM {TABLE_NAME}{where_sql}");

        let conn = self.conn.lock().expect("Lock failed");
        conn.query_row(&sql, params_from_iter(values), |row| row.get(0))
            .map_err(store_unavailable)
    }

    fn aggregate(&self, pq: &ParsedQuery) -> Result<Option<AggregateValue>, EvaluatorError> {
        let agg_expr = match (&pq.agg_fn, &pq.agg_target) {
            (AggFn::Count, AggTarget::Star) => "COUNT(*)".to_string(),
            (_, AggTarget::Star) => {
                // Unreachable for parser-produced queries.
                return Err(EvaluatorError::UnknownColumn("*".to_string()));
            }
            (agg, AggTarget::Column(name)) => {
                let column = schema::canonical_column(name)
                    .ok_or_else(|| EvaluatorError::UnknownColumn(name.clone()))?;
                format!("{}({column})", agg.as_sql())
            }
        };

        let (where_sql, values) = where_clause(&pq.filters)?;
        let sql = format!("SELECT {agg_expr} FROM {TABLE_NAME}{where_sql}");

        let conn = self.conn.lock().expect("Lock failed");
        let raw: rusqlite::types::Value = conn
            .query_row(&sql, params_from_iter(values), |row| row.get(0))
            .map_err(store_unavailable)?;

        Ok(match raw {
            rusqlite::types::Value::Null => None,
            rusqlite::types::Value::Integer(v) => Some(AggregateValue::Int(v)),
            rusqlite::types::Value::Real(v) => Some(AggregateValue::Float(v)),
            rusqlite::types::Value::Text(v) => Some(AggregateValue::Str(v)),
            rusqlite::types::Value::Blob(_) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::parse;

    fn seeded_store() -> SqliteEvaluator {
        let store = SqliteEvaluator::in_memory().expect("Should create db");
        // (age, sex, cp, chol)
        let rows = [
            (63, 1, 4, 250),
            (63, 1, 4, 180),
            (52, 0, 2, 210),
            (55, 1, 1, 190),
            (47, 0, 3, 245),
            (61, 1, 2, 199),
        ];
        for (age, sex, cp, chol) in rows {
            store
                .insert_record(&PatientRecord {
                    age,
                    sex,
                    cp,
                    trestbps: Some(130),
                    chol,
                    fbs: Some(0),
                    thalach: Some(150),
                    target: Some(1),
                })
                .expect("Should insert");
        }
        store
    }

    #[test]
    fn test_count_with_filters() {
        let store = seeded_store();

        let pq = parse("SELECT COUNT(*) FROM patient_records").expect("Should parse");
        assert_eq!(store.count(&pq).expect("Should count"), 6);

        let pq = parse("SELECT COUNT(*) FROM patient_records WHERE age = 63 AND sex = 1")
            .expect("Should parse");
        assert_eq!(store.count(&pq).expect("Should count"), 2);
    }

    #[test]
    fn test_distinct_count_over_buckets() {
        let store = seeded_store();
        let pq = parse("SELECT COUNT(*) FROM patient_records").expect("Should parse");
        // chol values above span Normal / BorderlineHigh / High.
        assert_eq!(
            store.distinct_count(&pq, "chol_level").expect("Should count"),
            3
        );
    }

    #[test]
    fn test_distinct_count_rejects_unknown_column() {
        let store = seeded_store();
        let pq = parse("SELECT COUNT(*) FROM patient_records").expect("Should parse");
        assert!(matches!(
            store.distinct_count(&pq, "ssn"),
            Err(EvaluatorError::UnknownColumn(_))
        ));
    }

    #[test]
    fn test_aggregate_avg_and_empty_cohort() {
        let store = seeded_store();

        let pq = parse("SELECT AVG(chol) FROM patient_records WHERE age = 63")
            .expect("Should parse");
        let value = store.aggregate(&pq).expect("Should aggregate");
        assert_eq!(value, Some(AggregateValue::Float(215.0)));

        let pq = parse("SELECT AVG(chol) FROM patient_records WHERE age = 99")
            .expect("Should parse");
        assert_eq!(store.aggregate(&pq).expect("Should aggregate"), None);

        let pq = parse("SELECT COUNT(*) FROM patient_records WHERE age = 99")
            .expect("Should parse");
        assert_eq!(
            store.aggregate(&pq).expect("Should aggregate"),
            Some(AggregateValue::Int(0))
        );
    }

    #[test]
    fn test_string_filters_bind_as_parameters() {
        let store = seeded_store();

        let pq = parse("SELECT COUNT(*) FROM patient_records WHERE age_band = '60-69'")
            .expect("Should parse");
        assert_eq!(store.count(&pq).expect("Should count"), 3);

        // A hostile-looking literal is bound, not spliced: it matches nothing.
        let pq = parse("SELECT COUNT(*) FROM patient_records WHERE chol_level = 'x OR 1=1'")
            .expect("Should parse");
        assert_eq!(store.count(&pq).expect("Should count"), 0);
    }

    #[test]
    fn test_missing_table_surfaces_unavailable() {
        let store = SqliteEvaluator::in_memory().expect("Should create db");
        store
            .conn
            .lock()
            .expect("Lock failed")
            .execute_batch("DROP TABLE patient_records;")
            .expect("Should drop");

        let pq = parse("SELECT COUNT(*) FROM patient_records").expect("Should parse");
        assert!(matches!(
            store.count(&pq),
            Err(EvaluatorError::Unavailable(_))
        ));
    }

    #[test]
    fn test_csv_import_skips_incomplete_rows() {
        let store = SqliteEvaluator::in_memory().expect("Should create db");
        let dir = std::env::temp_dir().join("privacyguard_csv_test");
        std::fs::create_dir_all(&dir).expect("Should create dir");
        let path = dir.join("sample.csv");
        std::fs::write(
            &path,
            "age,sex,cp,trtbps,chol,output\n63,1,4,145,233,1\n41,0,2,130,204,1\n,,1,120,250,0\n",
        )
        .expect("Should write");

        let inserted = store.import_csv_file(&path).expect("Should import");
        assert_eq!(inserted, 2);
        assert_eq!(store.total_records().expect("Should count"), 2);

        let pq = parse("SELECT COUNT(*) FROM patient_records WHERE age_band = '60-69'")
            .expect("Should parse");
        assert_eq!(store.count(&pq).expect("Should count"), 1);
    }
}

//! Idempotent bootstrap of the pipeline database.

use serde::Serialize;
use tracing::info;

use crate::config::DeploymentConfig;

use super::database::{quote_identifier, Database, DatabaseError};
use super::schema;

/// One row of the `testdata` seed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedRow {
    pub nombre: &'static str,
    pub edad: i32,
    pub ciudad: &'static str,
}

/// Rows inserted into an empty `testdata` table.
pub const SEED_ROWS: [SeedRow; 5] = [
    SeedRow { nombre: "Ana", edad: 25, ciudad: "Madrid" },
    SeedRow { nombre: "Juan", edad: 30, ciudad: "Barcelona" },
    SeedRow { nombre: "María", edad: 22, ciudad: "Sevilla" },
    SeedRow { nombre: "Carlos", edad: 35, ciudad: "Valencia" },
    SeedRow { nombre: "Elena", edad: 28, ciudad: "Bilbao" },
];

/// What a bootstrap run changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    pub database_created: bool,
    pub table_created: bool,
    pub rows_inserted: u64,
    pub row_count: i64,
}

/// Creates `testdata` and seeds it when empty.
pub struct SeedBootstrap<'a> {
    db: &'a Database,
}

impl<'a> SeedBootstrap<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Runs under a transaction-scoped advisory lock so concurrent runs
    /// serialize; the seed rows are only inserted into an empty table.
    pub async fn run(&self) -> Result<BootstrapReport, DatabaseError> {
        let mut tx = self.db.pool().begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(schema::SEED_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let (existed,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = 'testdata')",
        )
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(schema::CREATE_TESTDATA_TABLE)
            .execute(&mut *tx)
            .await?;

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM testdata")
            .fetch_one(&mut *tx)
            .await?;

        let mut rows_inserted = 0;
        if count == 0 {
            for row in SEED_ROWS {
                rows_inserted += sqlx::query(schema::INSERT_SEED_ROW)
                    .bind(row.nombre)
                    .bind(row.edad)
                    .bind(row.ciudad)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            }
        }

        tx.commit().await?;

        let report = BootstrapReport {
            database_created: false,
            table_created: !existed,
            rows_inserted,
            row_count: count + rows_inserted as i64,
        };
        info!(
            table_created = report.table_created,
            rows_inserted = report.rows_inserted,
            row_count = report.row_count,
            "Seed table ready"
        );
        Ok(report)
    }
}

/// Creates the pipeline database if needed, applies the schema and seeds
/// `testdata`.
pub async fn bootstrap_pipeline_database(config: &DeploymentConfig) -> Result<BootstrapReport, DatabaseError> {
    let admin = Database::connect(&config.metadata_database_url()).await?;
    let database_created = admin.ensure_database(&config.pipeline_db).await?;
    admin.pool().close().await;

    let db = Database::connect(&config.pipeline_database_url()).await?;
    let table_existed = db.table_exists("testdata").await?;
    db.run_migrations().await?;
    let report = SeedBootstrap::new(&db).run().await?;

    Ok(BootstrapReport {
        database_created,
        table_created: !table_existed,
        ..report
    })
}

/// SQL script for the store's init directory (`docker-entrypoint-initdb.d`),
/// run by `psql` on first start. Safe to run more than once.
pub fn bootstrap_sql(database: &str) -> Result<String, DatabaseError> {
    let quoted = quote_identifier(database)?;

    let mut sql = String::new();
    sql.push_str(&format!(
        "SELECT 'CREATE DATABASE {quoted}'\nWHERE NOT EXISTS (SELECT FROM pg_database WHERE datname = '{database}')\\gexec\n\n"
    ));
    sql.push_str(&format!("\\connect {quoted}\n"));
    sql.push_str(schema::CREATE_TESTDATA_TABLE.trim_end());
    sql.push_str(";\n\nINSERT INTO testdata (nombre, edad, ciudad)\nSELECT * FROM (VALUES\n");

    let values: Vec<String> = SEED_ROWS
        .iter()
        .map(|row| format!("    ('{}', {}, '{}')", row.nombre, row.edad, row.ciudad))
        .collect();
    sql.push_str(&values.join(",\n"));
    sql.push_str("\n) AS seed(nombre, edad, ciudad)\nWHERE NOT EXISTS (SELECT 1 FROM testdata);\n");

    Ok(sql)
}

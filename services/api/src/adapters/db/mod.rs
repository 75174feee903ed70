//! services/api/src/adapters/db/mod.rs
//!
//! This module contains the database adapter, the concrete implementation of
//! every storage and directory port from the `core` crate. It handles all
//! interactions with the PostgreSQL database using `sqlx`.
//!
//! State changes are single-statement compare-and-set updates: each `UPDATE`
//! names the state it expects in its `WHERE` clause, and the affected row
//! count tells the caller whether it won.

mod directory;
mod engagements;
mod payouts;
mod revenue;

use revshare_core::ports::PortError;
use sqlx::PgPool;
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the storage and directory ports.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    /// Distinguishes "lost the compare-and-set" from "no such row" after an
    /// update touched nothing.
    async fn require_row(&self, table: Table, id: Uuid) -> Result<(), PortError> {
        let sql = format!("SELECT EXISTS (SELECT 1 FROM {} WHERE id = $1)", table.name());
        let exists: bool = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        if exists {
            Ok(())
        } else {
            Err(PortError::NotFound(format!("{} {}", table.label(), id)))
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Table {
    Engagements,
    Revenues,
    Payouts,
}

impl Table {
    fn name(&self) -> &'static str {
        match self {
            Table::Engagements => "engagements",
            Table::Revenues => "subscription_revenues",
            Table::Payouts => "instructor_payouts",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Table::Engagements => "Engagement",
            Table::Revenues => "Revenue",
            Table::Payouts => "Payout",
        }
    }
}

/// Maps driver errors onto the port error vocabulary.
fn db_error(e: sqlx::Error) -> PortError {
    match e {
        sqlx::Error::RowNotFound => PortError::NotFound("Row not found".to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            PortError::Unavailable(e.to_string())
        }
        other => PortError::Unexpected(other.to_string()),
    }
}

/// Maps a stored value that no longer parses into a domain type.
fn corrupt(column: &str, e: impl std::fmt::Display) -> PortError {
    PortError::Unexpected(format!("Invalid value in column {}: {}", column, e))
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

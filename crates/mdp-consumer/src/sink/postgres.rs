//! Postgres sink
//!
//! One pooled connection and transaction per notification. Each insert runs
//! inside its own savepoint, so a constraint violation rolls back only that
//! row and the transaction stays usable for the rest of the batch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Acquire, PgPool, Postgres, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{Destination, RecordSink, SinkSession};
use crate::config::DatabaseConfig;
use crate::error::{SinkConnectionError, SinkRowError};
use crate::schema::{FieldKind, Value};
use crate::transform::TransformedRecord;

#[derive(Clone)]
pub struct PostgresSink {
    pool: PgPool,
}

impl PostgresSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a lazily connecting pool; connection failures surface per
    /// notification when a session is opened.
    pub fn connect_lazy(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let options = PgConnectOptions::from_str(&config.url)?.options([(
            "statement_timeout",
            format!("{}s", config.statement_timeout_secs),
        )]);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_lazy_with(options);

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// `INSERT INTO <table> (<cols>) VALUES ($1, .., $n)` for a destination.
pub fn insert_statement(destination: &Destination) -> String {
    let columns = destination.schema.destination_columns();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        destination.schema.table,
        columns.join(", "),
        placeholders.join(", ")
    )
}

#[async_trait]
impl RecordSink for PostgresSink {
    fn name(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self, destination), fields(table = destination.schema.table))]
    async fn open(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn SinkSession>, SinkConnectionError> {
        let label = format!("postgres:{}", destination.schema.table);

        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SinkConnectionError::Connect {
                destination: label.clone(),
                message: e.to_string(),
            })?;

        debug!("Opened Postgres transaction");

        Ok(Box::new(PostgresSession {
            tx,
            statement: insert_statement(destination),
            label,
        }))
    }
}

struct PostgresSession {
    tx: Transaction<'static, Postgres>,
    statement: String,
    label: String,
}

fn row_error(label: &str, e: sqlx::Error) -> SinkRowError {
    SinkRowError {
        destination: label.to_string(),
        message: e.to_string(),
    }
}

#[async_trait]
impl SinkSession for PostgresSession {
    async fn insert(&mut self, record: &TransformedRecord) -> Result<(), SinkRowError> {
        let mut savepoint = Acquire::begin(&mut self.tx)
            .await
            .map_err(|e| row_error(&self.label, e))?;

        let mut query = sqlx::query(&self.statement);
        for value in record.values() {
            query = match value {
                Value::Text(s) => query.bind(s.clone()),
                Value::Decimal(d) => query.bind(*d),
                Value::Integer(i) => query.bind(*i),
                Value::Timestamp(ts) => query.bind(*ts),
                Value::Null(FieldKind::Text) => query.bind(None::<String>),
                Value::Null(FieldKind::Decimal) => query.bind(None::<f64>),
                Value::Null(FieldKind::Integer) => query.bind(None::<i64>),
                Value::Null(FieldKind::Timestamp) => query.bind(None::<DateTime<Utc>>),
            };
        }

        match query.execute(&mut *savepoint).await {
            Ok(_) => savepoint
                .commit()
                .await
                .map_err(|e| row_error(&self.label, e)),
            Err(e) => {
                let error = row_error(&self.label, e);
                // the outer transaction is only usable again after this rollback
                savepoint
                    .rollback()
                    .await
                    .map_err(|e| row_error(&self.label, e))?;
                Err(error)
            },
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), SinkConnectionError> {
        let PostgresSession { tx, label, .. } = *self;
        tx.commit()
            .await
            .map_err(|e| SinkConnectionError::Commit {
                destination: label,
                message: e.to_string(),
            })
    }
}

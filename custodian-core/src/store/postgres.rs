use std::time::Duration;

use sqlx::error::ErrorKind;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::config::PostgresSettings;
use crate::error::Error;
use crate::message::Customer;
use crate::store::{PersistenceGateway, StoreError, StoreResult};

const CREATE_CUSTOMERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS customers (
    id TEXT PRIMARY KEY CHECK (char_length(id) > 0),
    name TEXT NOT NULL,
    email TEXT,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const UPSERT_CUSTOMER: &str = r#"
INSERT INTO customers (id, name, email, updated_at)
VALUES ($1, $2, $3, now())
ON CONFLICT (id) DO UPDATE
SET name = EXCLUDED.name, email = EXCLUDED.email, updated_at = now()
"#;

/// Stores customers in Postgres. Cheap to clone, all clones share the connection pool.
#[derive(Clone)]
pub(crate) struct PostgresGateway {
    pool: PgPool,
}

impl PostgresGateway {
    pub(crate) async fn connect(settings: &PostgresSettings) -> crate::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
            .connect(&settings.url)
            .await
            .map_err(|e| Error::Store(format!("Failed to connect to Postgres: {e}")))?;
        info!(
            max_connections = settings.max_connections,
            "Connected to Postgres"
        );
        Ok(Self::new(pool))
    }

    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the customers table if it does not exist yet.
    pub(crate) async fn ensure_schema(&self) -> crate::Result<()> {
        sqlx::query(CREATE_CUSTOMERS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Store(format!("Failed to create customers table: {e}")))?;
        Ok(())
    }
}

impl PersistenceGateway for PostgresGateway {
    async fn save(&self, customer: &Customer) -> StoreResult<()> {
        sqlx::query(UPSERT_CUSTOMER)
            .bind(customer.id.as_str())
            .bind(customer.name.as_str())
            .bind(customer.email.as_deref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// SQLSTATEs reporting that the server can not be reached or refuses the session.
/// https://www.postgresql.org/docs/current/errcodes-appendix.html
fn is_connection_sqlstate(code: &str) -> bool {
    // 08: connection exception, 28: invalid authorization specification
    code.starts_with("08")
        || code.starts_with("28")
        // admin_shutdown, crash_shutdown, cannot_connect_now, too_many_connections
        || matches!(code, "57P01" | "57P02" | "57P03" | "53300")
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connection(err.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
                if is_connection_sqlstate(&code) {
                    StoreError::Connection(db_err.message().to_string())
                } else if code.starts_with("23")
                    || matches!(
                        db_err.kind(),
                        ErrorKind::UniqueViolation
                            | ErrorKind::ForeignKeyViolation
                            | ErrorKind::NotNullViolation
                            | ErrorKind::CheckViolation
                    )
                {
                    StoreError::Constraint(db_err.message().to_string())
                } else if code.starts_with("22") {
                    StoreError::Data(db_err.message().to_string())
                } else {
                    StoreError::Other(err.to_string())
                }
            }
            sqlx::Error::Encode(_)
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::TypeNotFound { .. } => StoreError::Data(err.to_string()),
            _ => StoreError::Other(err.to_string()),
        }
    }
}

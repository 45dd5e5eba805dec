use crate::message::Customer;

/// [PostgreSQL] backed persistence of the customers.
///
/// [PostgreSQL]: https://www.postgresql.org/
pub(crate) mod postgres;

pub(crate) type StoreResult<T> = std::result::Result<T, StoreError>;

/// Cause of a failed write. The variant tells whether the store itself was unreachable
/// ([StoreError::Connection]) or whether the write was refused.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum StoreError {
    #[error("Connection Error - {0}")]
    Connection(String),

    #[error("Constraint Violation - {0}")]
    Constraint(String),

    #[error("Data Error - {0}")]
    Data(String),

    #[error("{0}")]
    Other(String),
}

/// Durable store of the customers carried by the records.
#[trait_variant::make(PersistenceGateway: Send)]
#[allow(dead_code)]
pub(crate) trait LocalPersistenceGateway {
    /// Writes the customer. Writing the same customer twice leaves the store unchanged.
    async fn save(&self, customer: &Customer) -> StoreResult<()>;
}

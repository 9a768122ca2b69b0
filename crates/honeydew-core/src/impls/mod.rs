//! Concrete implementations of the capability ports.
pub mod sqlx_repo;

pub use sqlx_repo::PgRepo;

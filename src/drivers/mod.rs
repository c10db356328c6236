// Database Drivers
// One module per supported backend, each supplying a `Driver` descriptor
// and its system-catalog reader

pub mod mssql;
pub mod postgres;
pub mod sqlite;

// Re-export drivers
pub use mssql::MssqlDriver;
pub use postgres::PostgresDriver;
pub use sqlite::SqliteDriver;

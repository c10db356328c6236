// Driver Registry and Metadata Access
// One registration-based dispatch surface over the supported SQL backends,
// plus the shared metadata query composer their catalog readers build on

pub mod drivers;
pub mod error;
pub mod meta;
pub mod registry;
pub mod stmt;
pub mod traits;
pub mod value;

// Re-export the dispatch surface
pub use error::{DatabaseError, Error, Result, VerboseError};
pub use registry::Registry;
pub use stmt::{BufferConfig, ProcessedStatement};
pub use traits::{AffectedRows, Connection, Driver, DriverUrl, ExecResult, Rows};
pub use value::Value;

// Re-export the metadata model
pub use meta::{
    Catalog, CatalogSet, Filter, Index, IndexColumn, IndexColumnSet, IndexSet, MetadataReader,
    Schema, SchemaSet, Table, TableSet,
};

// Re-export drivers
pub use drivers::{MssqlDriver, PostgresDriver, SqliteDriver};

//! Collects the DDL of every table visible to a session.

use duckdb::Connection;

use crate::error::Result;

const TABLE_DDL_QUERY: &str = "SELECT sql FROM duckdb_tables()";

/// Anything that can enumerate the `CREATE TABLE` statements of its tables.
pub trait Catalog {
    /// DDL fragments in catalog enumeration order.
    fn table_ddl(&self) -> Result<Vec<String>>;
}

impl Catalog for Connection {
    fn table_ddl(&self) -> Result<Vec<String>> {
        let mut stmt = self.prepare(TABLE_DDL_QUERY)?;
        let rows = stmt.query_map([], |row| row.get::<_, Option<String>>(0))?;

        let mut ddl = Vec::new();
        for row in rows {
            if let Some(sql) = row? {
                ddl.push(sql);
            }
        }
        Ok(ddl)
    }
}

/// Builds the schema context handed to the generator: every table's DDL,
/// concatenated with no separator. Never cached; each call re-reads the
/// catalog.
pub fn schema_context<C: Catalog + ?Sized>(catalog: &C) -> Result<String> {
    let ddl = catalog.table_ddl()?;
    tracing::debug!(tables = ddl.len(), "collected table ddl");
    Ok(ddl.concat())
}

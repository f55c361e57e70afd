use crate::{
    connection::DbConnection,
    error::{DbError, Result},
};
use tracing::{debug, info};

/// Registry of indexers and their progress, shared by every project.
pub const INDEXERS_TABLE: &str = "public.indexers";
/// Source of `indexer_<n>` schema names.
pub const SCHEMA_SEQUENCE: &str = "public.indexer_schema_seq";

/// Rejects names that would need escaping inside an identifier.
pub fn validate_schema_name(schema: &str) -> Result<()> {
    let valid = !schema.is_empty()
        && schema.len() <= 63
        && schema
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !schema.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(DbError::InvalidSchemaName(schema.to_string()))
    }
}

/// Creates the shared registry tables.
pub async fn initialize_registry(conn: &DbConnection) -> Result<()> {
    let sql = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {INDEXERS_TABLE} (
            id SERIAL PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            db_schema TEXT NOT NULL,
            next_block_height BIGINT NOT NULL,
            network TEXT,
            network_genesis TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        CREATE SEQUENCE IF NOT EXISTS {SCHEMA_SEQUENCE};
        "#
    );

    debug!("Creating indexer registry");
    conn.batch_execute(&sql).await
}

/// Schema manager for one indexer's metadata and entity tables
pub struct SchemaManager {
    schema: String,
}

impl SchemaManager {
    pub fn new(schema: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        validate_schema_name(&schema)?;
        Ok(Self { schema })
    }

    /// Get the properly quoted schema name
    pub fn schema_name(&self) -> String {
        format!("\"{}\"", self.schema)
    }

    pub fn metadata_table(&self) -> String {
        format!("{}._metadata", self.schema_name())
    }

    pub fn entities_table(&self) -> String {
        format!("{}.entities", self.schema_name())
    }

    /// Initialize the schema and its tables
    pub async fn initialize(&self, conn: &DbConnection) -> Result<()> {
        info!("Initializing schema {}", self.schema);
        conn.batch_execute(&self.create_statements()).await?;
        info!("Schema initialization complete for {}", self.schema);
        Ok(())
    }

    fn create_statements(&self) -> String {
        let schema = self.schema_name();
        let metadata = self.metadata_table();
        let entities = self.entities_table();
        format!(
            r#"
            CREATE SCHEMA IF NOT EXISTS {schema};
            CREATE TABLE IF NOT EXISTS {metadata} (
                key TEXT PRIMARY KEY,
                value JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE TABLE IF NOT EXISTS {entities} (
                entity TEXT NOT NULL,
                id TEXT NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (entity, id)
            );
            CREATE INDEX IF NOT EXISTS entities_data_idx ON {entities} USING GIN (data jsonb_path_ops);
            "#
        )
    }
}

//! SurrealDB schema initialization for execution records

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::storage_traits::StorageResult;

/// Initialize all ADI tables. Idempotent.
pub async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    info!("Initializing ADI SurrealDB schema");
    init_agent_executions_table(db).await?;
    Ok(())
}

/// Initialize `agent_executions`
///
/// Schema:
/// ```text
/// TABLE agent_executions {
///   execution_id:     STRING (unique)
///   evaluation_id:    STRING (indexed)
///   agent_name:       STRING
///   status:           STRING (pending | running | completed | failed)
///   started_at_ms:    INT
///   completed_at_ms:  INT?
///   result:           OBJECT?
///   error_message:    STRING?
///   duration_ms:      INT?
///   cancelled:        BOOL
/// }
/// ```
///
/// Transitions are enforced by the application with a conditional
/// `UPDATE ... WHERE status = $from`, so a terminal row is never rewritten.
async fn init_agent_executions_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing agent_executions table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS agent_executions
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_execution_id ON TABLE agent_executions COLUMNS execution_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_evaluation_id ON TABLE agent_executions COLUMNS evaluation_id;
        DEFINE INDEX IF NOT EXISTS idx_evaluation_status ON TABLE agent_executions COLUMNS evaluation_id, status;
    "#;

    // Statement errors live in the response, not in the query future
    db.query(sql).await?.check()?;
    info!("✓ agent_executions table initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_init_is_repeatable() {
        let db = surrealdb::engine::any::connect("mem://").await.unwrap();
        db.use_ns("adi").use_db("main").await.unwrap();

        init_schema(&db).await.unwrap();
        init_schema(&db).await.unwrap();

        // The unique index survived the second run
        let create = "CREATE agent_executions SET execution_id = 'e-1', evaluation_id = 'eval-1'";
        db.query(create).await.unwrap().check().unwrap();
        assert!(db.query(create).await.unwrap().check().is_err());
    }
}

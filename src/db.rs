use rocket_db_pools::{Database, sqlx};

#[derive(Database)]
#[database("ack_db")]
pub struct AckDb(sqlx::SqlitePool);

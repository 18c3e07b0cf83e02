use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::run_pending;
    use crate::connect;

    #[tokio::test]
    async fn migrations_create_the_session_tables() {
        let pool = connect("sqlite::memory:").await.expect("connect");
        run_pending(&pool).await.expect("migrate");

        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .expect("query sqlite_master");

        let names: Vec<String> = rows.iter().map(|row| row.get::<String, _>("name")).collect();
        assert!(names.contains(&"sessions".to_owned()));
        assert!(names.contains(&"pending_instructions".to_owned()));
    }
}

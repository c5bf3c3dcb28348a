pub mod models;
pub mod repository;

pub use models::*;
pub use repository::*;

/// Fresh in-memory database with the schema applied. A single connection
/// keeps every query on the same in-memory instance.
#[cfg(test)]
pub(crate) async fn test_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations");
    pool
}

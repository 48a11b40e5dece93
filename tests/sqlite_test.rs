use db_connection_manager::config::{DatabaseUrl, ManagerConfig};
use db_connection_manager::db::ConnectionManager;
use db_connection_manager::dialects::{AnyConnection, AnyConnector, SqliteConnector};
use db_connection_manager::models::{AcquireOptions, Dialect};
use tempfile::TempDir;

fn file_config(dir: &TempDir, name: &str) -> ManagerConfig {
    let path = dir.path().join(name);
    let url = format!("sqlite:{}?max=2&acquire=1000", path.display());
    let parsed = DatabaseUrl::parse(&url).unwrap();
    assert_eq!(parsed.dialect, Dialect::Sqlite);
    ManagerConfig::new(parsed.dialect, parsed.connection).with_pool(parsed.pool)
}

#[tokio::test]
async fn test_file_database_round_trip() {
    let dir = TempDir::new().unwrap();
    let manager = ConnectionManager::new(SqliteConnector::new(), file_config(&dir, "nested/app.db")).unwrap();

    let connection = manager.get_connection(AcquireOptions::write()).await.unwrap();
    {
        let mut native = connection.native().await.unwrap();
        sqlx::query("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .execute(&mut *native)
            .await
            .expect("CREATE TABLE should work");
        sqlx::query("INSERT INTO items (id, name) VALUES (1, 'widget')")
            .execute(&mut *native)
            .await
            .expect("INSERT should work");
    }
    manager.release_connection(connection).await.unwrap();

    let connection = manager.get_connection(AcquireOptions::read()).await.unwrap();
    let name: String = {
        let mut native = connection.native().await.unwrap();
        sqlx::query_scalar("SELECT name FROM items WHERE id = 1")
            .fetch_one(&mut *native)
            .await
            .unwrap()
    };
    assert_eq!(name, "widget");
    manager.release_connection(connection).await.unwrap();

    let version = manager.database_version().unwrap();
    assert!(!version.is_below(Dialect::Sqlite.minimum_version()));
    assert!(dir.path().join("nested/app.db").exists());

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_foreign_keys_enforced_by_default() {
    let dir = TempDir::new().unwrap();
    let manager = ConnectionManager::new(SqliteConnector::new(), file_config(&dir, "fk.db")).unwrap();

    let connection = manager.get_connection(AcquireOptions::write()).await.unwrap();
    let mut native = connection.native().await.unwrap();
    sqlx::raw_sql(
        "CREATE TABLE parent (id INTEGER PRIMARY KEY);
         CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parent(id));",
    )
    .execute(&mut *native)
    .await
    .unwrap();
    let orphan = sqlx::query("INSERT INTO child (id, parent_id) VALUES (1, 99)")
        .execute(&mut *native)
        .await;
    assert!(orphan.is_err(), "orphan insert should violate the foreign key");
    drop(native);

    manager.release_connection(connection).await.unwrap();
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_memory_database_is_shared_across_pooled_connections() {
    let config = ManagerConfig::new(Dialect::Sqlite, DatabaseUrl::parse("sqlite::memory:").unwrap().connection);
    let manager = ConnectionManager::new(AnyConnector::for_dialect(Dialect::Sqlite).unwrap(), config).unwrap();

    let writer = manager.get_connection(AcquireOptions::write()).await.unwrap();
    let reader = manager.get_connection(AcquireOptions::read()).await.unwrap();

    let (AnyConnection::Sqlite(w), AnyConnection::Sqlite(r)) = (&*writer, &*reader) else {
        panic!("expected SQLite connections");
    };
    assert!(w.is_in_memory());
    assert!(w.shares_connection_with(r));

    {
        let mut native = w.native().await.unwrap();
        sqlx::query("CREATE TABLE shared (v INTEGER)")
            .execute(&mut *native)
            .await
            .unwrap();
    }
    let count: i64 = {
        let mut native = r.native().await.unwrap();
        sqlx::query_scalar("SELECT COUNT(*) FROM shared")
            .fetch_one(&mut *native)
            .await
            .unwrap()
    };
    assert_eq!(count, 0);

    manager.destroy_connection(writer).await.unwrap();
    // Destroying one handle leaves the shared database open for the rest.
    let AnyConnection::Sqlite(r) = &*reader else {
        unreachable!()
    };
    assert!(r.is_valid());

    manager.release_connection(reader).await.unwrap();
    manager.close().await.unwrap();
}

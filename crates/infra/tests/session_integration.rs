//! Integration tests for sessions over an encrypted database
//!
//! Each test builds a `SessionFactory` from configuration the way a service
//! does at startup, then drives it through the public session API.

use std::path::Path;

use hidesync_common::storage::StorageResult;
use hidesync_domain::{Config, HideSyncError, KeyMethod, RuntimeEnvironment};
use hidesync_infra::database::{
    check_database, ColumnDef, ColumnType, Entity, Persistable, Queryable, Record, SessionFactory,
    SessionMode, TableSchema, Value,
};
use hidesync_infra::errors::conversions::to_domain;
use hidesync_infra::{InfraError, KeyManager};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq)]
struct Hide {
    id: Option<i64>,
    grade: String,
    thickness_oz: f64,
}

impl Hide {
    fn new(grade: &str, thickness_oz: f64) -> Self {
        Self { id: None, grade: grade.into(), thickness_oz }
    }
}

impl Persistable for Hide {
    fn table_name(&self) -> &str {
        "hides"
    }

    fn primary_key(&self) -> Option<Value> {
        self.id.map(Value::Integer)
    }

    fn set_primary_key(&mut self, key: Value) {
        self.id = key.as_i64();
    }

    fn to_values(&self) -> Vec<(String, Value)> {
        vec![
            ("grade".into(), self.grade.clone().into()),
            ("thickness_oz".into(), self.thickness_oz.into()),
        ]
    }
}

impl Queryable for Hide {
    fn from_record(record: Record) -> StorageResult<Self> {
        Ok(Self {
            id: record.require("id")?.as_i64(),
            grade: record.require("grade")?.as_str().unwrap_or_default().to_string(),
            thickness_oz: record.require("thickness_oz")?.as_f64().unwrap_or_default(),
        })
    }
}

impl Entity for Hide {
    fn schema() -> TableSchema {
        TableSchema::new("hides")
            .column(ColumnDef::id("id"))
            .column(ColumnDef::new("grade", ColumnType::Text).not_null())
            .column(ColumnDef::new("thickness_oz", ColumnType::Real))
    }
}

fn config(path: &Path) -> Config {
    let mut config = Config::default();
    config.environment = RuntimeEnvironment::Test;
    config.database.path = path.to_string_lossy().into_owned();
    config.encryption.development_key = Some("session-integration-passphrase".into());
    config.encryption.kdf_iter = 4000;
    config.key_management.method = KeyMethod::Environment;
    config.key_management.key_environment_variable = "HIDESYNC_SESSION_IT_UNSET".into();
    config.pool.health_check_interval_secs = 0;
    config
}

fn factory(dir: &TempDir) -> SessionFactory {
    let factory = SessionFactory::from_config(&config(&dir.path().join("hidesync.db"))).unwrap();
    assert_eq!(factory.mode(), SessionMode::Encrypted);
    factory
        .with_session(|s| {
            s.execute(&Hide::schema().create_sql(), &[]).map_err(to_domain)?;
            s.commit().map_err(to_domain).map(|_| ())
        })
        .unwrap();
    factory
}

#[test]
fn test_round_trip_across_sessions() {
    let dir = TempDir::new().unwrap();
    let factory = factory(&dir);

    let mut session = factory.get_db().unwrap();
    let key = session.add(Hide::new("full grain", 4.5));
    session.add(Hide::new("top grain", 3.0));
    let summary = session.commit().unwrap();
    assert_eq!(summary.inserted, 2);
    let id = summary.key_for(key).and_then(Value::as_i64).unwrap();
    session.close();

    let mut session = factory.get_db().unwrap();
    let hide: Hide = session.get(id).unwrap().unwrap();
    assert_eq!(hide.grade, "full grain");
    assert_eq!(session.query::<Hide>().filter_by("grade", "top grain").count().unwrap(), 1);
}

#[test]
fn test_file_is_unreadable_without_key() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("hidesync.db");
    let factory = factory(&dir);
    factory.dispose();

    let plain = rusqlite::Connection::open(&path).unwrap();
    assert!(plain.query_row("SELECT count(*) FROM hides", [], |r| r.get::<_, i64>(0)).is_err());

    let mut wrong = config(&path);
    wrong.encryption.development_key = Some("some-other-passphrase".into());
    let factory = SessionFactory::from_config(&wrong).unwrap();
    assert!(factory.get_db().is_err());

    let report = check_database(factory.encryption().unwrap(), &path).unwrap();
    assert!(report.exists);
    assert!(!report.readable);
}

#[test]
fn test_large_result_is_read_in_batches() {
    let dir = TempDir::new().unwrap();
    let factory = factory(&dir);

    let mut session = factory.get_db().unwrap();
    session
        .execute(
            "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 10000) \
             INSERT INTO hides (grade, thickness_oz) SELECT 'split', i / 100.0 FROM n",
            &[],
        )
        .unwrap();
    session.commit().unwrap();

    let before = session.stats();
    let hides = session.query::<Hide>().all().unwrap();
    let after = session.stats();

    assert_eq!(hides.len(), 10_000);
    assert_eq!(after.fetch_batches - before.fetch_batches, 20);
    assert_eq!(after.rows_fetched - before.rows_fetched, 10_000);
}

#[test]
fn test_failed_commit_leaves_database_unchanged() {
    let dir = TempDir::new().unwrap();
    let factory = factory(&dir);

    let mut session = factory.get_db().unwrap();
    session
        .execute(
            "CREATE TABLE offcuts (id INTEGER PRIMARY KEY, \
             hide_id INTEGER NOT NULL REFERENCES hides(id), area REAL)",
            &[],
        )
        .unwrap();
    let mut hide = Hide::new("full grain", 4.5);
    session.persist(&mut hide).unwrap();
    session.commit().unwrap();

    let offcut = |hide: &Hide, area: f64| {
        Record::new("offcuts").with("hide_id", Value::reference(hide)).with("area", area)
    };
    session.add(offcut(&hide, 1.5));
    // explicit key, and the parent was never saved so the reference is NULL
    session.add(offcut(&Hide::new("unsaved", 1.0), 0.5).with("id", 100_i64));
    session.add(offcut(&hide, 2.0));

    assert!(session.commit().is_err());
    assert!(session.needs_rollback());
    session.close();

    let mut session = factory.get_db().unwrap();
    assert_eq!(session.query_table("offcuts").count().unwrap(), 0);
    assert_eq!(session.query::<Hide>().count().unwrap(), 1);

    session.add(offcut(&hide, 1.5));
    session.commit().unwrap();
    let stored = session.query_table("offcuts").one().unwrap();
    assert_eq!(stored.value("hide_id"), Value::Integer(hide.id.unwrap()));
}

#[test]
fn test_nested_savepoint_keeps_outer_work() {
    let dir = TempDir::new().unwrap();
    let factory = factory(&dir);

    let mut session = factory.get_db().unwrap();
    session.add(Hide::new("outer", 2.0));
    session.flush().unwrap();

    let nested: Result<(), InfraError> = session.nested(|s| {
        s.add(Hide::new("inner", 1.0));
        s.flush()?;
        Err(HideSyncError::InvalidInput("reject inner".into()).into())
    });
    assert!(nested.is_err());
    session.commit().unwrap();

    let grades: Vec<String> =
        session.query::<Hide>().order_by("id").all().unwrap().into_iter().map(|h| h.grade).collect();
    assert_eq!(grades, vec!["outer".to_string()]);
}

#[test]
fn test_key_file_method_end_to_end() {
    let dir = TempDir::new().unwrap();
    let key_path = dir.path().join("keys").join("hidesync.key");
    KeyManager::create_key_file_at(&key_path, None).unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&key_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o400);
    }

    let mut config = config(&dir.path().join("keyed.db"));
    config.encryption.development_key = None;
    config.encryption.require_encryption = true;
    config.key_management.method = KeyMethod::File;
    config.key_management.key_file_path = key_path.to_string_lossy().into_owned();
    config.key_management.enforce_key_file_permissions = true;

    let factory = SessionFactory::from_config(&config).unwrap();
    assert_eq!(factory.mode(), SessionMode::Encrypted);
    let mut session = factory.get_db().unwrap();
    let tables = session.execute_query("SELECT count(*) FROM sqlite_master", &[]).unwrap().scalar();
    assert_eq!(tables, Some(Value::Integer(0)));
}

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicI64, Ordering};

use rusqlite::Connection;

use crate::adapters::db::{open_connection, run_migrations};
use crate::domain::time::{Clock, MINUTE_MS, TimestampMs};

const TEST_DB_DIR: &str = "./target/testdb";

/// Copies the migrated template database into a fresh file under `target/`.
pub fn open_test_connection(test_name: &str) -> Connection {
    let template = ensure_template_db();
    std::fs::create_dir_all(TEST_DB_DIR).expect("test db dir should be creatable");

    let path = tempfile::Builder::new()
        .prefix(&format!("{test_name}-"))
        .suffix(".sqlite")
        .tempfile_in(TEST_DB_DIR)
        .expect("test db file should be creatable")
        .into_temp_path()
        .keep()
        .expect("test db file should be kept");

    std::fs::copy(&template, &path).expect("template db should be copied");
    open_connection(path.to_string_lossy().as_ref()).expect("test db should open")
}

fn ensure_template_db() -> PathBuf {
    static TEMPLATE_PATH: OnceLock<PathBuf> = OnceLock::new();

    TEMPLATE_PATH
        .get_or_init(|| {
            let template_path = std::env::var("TEST_DB_TEMPLATE_PATH")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| Path::new("data").join("lounge_test.db"));

            if let Some(parent) = template_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).expect("template parent dir should be creatable");
            }

            let mut connection = open_connection(template_path.to_string_lossy().as_ref())
                .expect("template db opens");
            run_migrations(&mut connection).expect("template migrations should succeed");

            template_path
        })
        .clone()
}

/// Manually driven clock shared between the engine and the test body.
pub struct FakeClock {
    now: AtomicI64,
}

impl FakeClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, value: i64) {
        self.now.store(value, Ordering::SeqCst);
    }

    pub fn set_minutes(&self, minutes: i64) {
        self.set(minutes * MINUTE_MS);
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.now.fetch_add(minutes * MINUTE_MS, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> TimestampMs {
        TimestampMs(self.now.load(Ordering::SeqCst))
    }
}

#![allow(dead_code)]

use std::path::Path;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use sqlite_rw::{
    PrimaryKey, Row, RwDatabase, Scheduler, SchedulerConfig, SchedulerHandle, Select, StoreConfig,
};

/// Installs a test-friendly subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A primary/replica pair of file paths inside a fresh temp dir.
pub fn temp_store_config() -> (tempfile::TempDir, StoreConfig) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let config = StoreConfig::new(dir.path().join("write.db"), dir.path().join("read.db"));
    (dir, config)
}

/// A scheduler whose periodic tasks fire after `cron_interval_ms` of idleness.
pub fn start_scheduler(cron_interval_ms: u64) -> Scheduler {
    Scheduler::start(SchedulerConfig {
        cron_interval_ms,
        idle_poll_ms: 2,
        ..SchedulerConfig::default()
    })
    .expect("start scheduler")
}

/// Opens `config` and creates `user(id, name TEXT, age INTEGER)` on both stores.
pub fn open_with_users(config: StoreConfig, scheduler: &SchedulerHandle) -> RwDatabase {
    let db = RwDatabase::open(config, scheduler).expect("open database pair");
    let manager = db.table_manager("user");
    manager
        .ensure_table(&PrimaryKey::AutoIncrement)
        .expect("create user table");
    manager
        .ensure_column("name", "TEXT", None, false)
        .expect("add name column");
    manager
        .ensure_column("age", "INTEGER", None, false)
        .expect("add age column");
    db
}

pub fn open_read_write(path: &Path) -> Connection {
    let conn = Connection::open(path).expect("open read-write connection");
    conn.busy_timeout(Duration::from_secs(5)).expect("set busy timeout");
    conn
}

/// Every user row, ordered by id, from both stores.
pub fn users_on_both(db: &RwDatabase) -> (Vec<Row>, Vec<Row>) {
    let users = db.table("user");
    let all = Select::new().order_by("id");
    (
        users.select_from_write(all.clone()).expect("read primary"),
        users.select(all).expect("read replica"),
    )
}

/// Keeps the scheduler worker busy until dropped, so replication triggers
/// queue up instead of running.
pub struct WorkerGate(mpsc::Sender<()>);

pub fn hold_worker(scheduler: &SchedulerHandle) -> WorkerGate {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    scheduler.enqueue(move || {
        let _ = started_tx.send(());
        let _ = release_rx.recv();
        Ok(())
    });
    started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("worker picked up the gate task");
    WorkerGate(release_tx)
}

pub fn eventually_blocking<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        std::thread::sleep(interval);
    }
}

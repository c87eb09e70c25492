//! Replication Tests
//!
//! End-to-end behaviour of the change log and its replay:
//! - a write is logged once and reaches the replica in one pass
//! - the replica converges on the primary under the background worker
//! - replay order matters, and replay is idempotent
//! - an undecodable record stops the batch and stays in the log

mod common;

use std::time::Duration;

use sqlite_rw::changelog;
use sqlite_rw::replicator::apply_entry;
use sqlite_rw::{Error, Filter, Operation, Row, Select, Value};

#[test]
fn insert_update_delete_scenario() {
    common::init_tracing();
    let (_dir, config) = common::temp_store_config();
    let scheduler = common::start_scheduler(60_000);
    let db = common::open_with_users(config, &scheduler.handle());
    let gate = common::hold_worker(&scheduler.handle());
    let users = db.table("user");

    let id = users.insert(Row::new().with("name", "a").with("age", 1)).unwrap();
    assert_eq!(id, 1);

    let entries = db
        .primary()
        .with_conn(|c| changelog::drain_batch(c, 10))
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].table_name, "user");
    assert_eq!(entries[0].op_type, "insert");

    let report = db.copy_to_read().unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(report.remaining_in_batch, 0);
    assert_eq!(
        users.select(Filter::All).unwrap(),
        vec![Row::new().with("id", 1).with("name", "a").with("age", 1)]
    );
    assert_eq!(db.pending().unwrap(), 0);

    assert_eq!(users.update(Filter::eq("id", 1), Row::new().with("age", 2)).unwrap(), 1);
    db.copy_to_read().unwrap();
    let replica_row = users.select_first(Filter::eq("id", 1)).unwrap().unwrap();
    assert_eq!(replica_row.get_i64("age"), Some(2));

    assert_eq!(users.delete(Filter::eq("id", 1)).unwrap(), 1);
    db.copy_to_read().unwrap();
    assert!(users.select(Filter::All).unwrap().is_empty());
    assert_eq!(db.pending().unwrap(), 0);

    drop(gate);
    scheduler.shutdown();
}

#[test]
fn replica_converges_in_background() {
    common::init_tracing();
    let (_dir, config) = common::temp_store_config();
    let scheduler = common::start_scheduler(50);
    let db = common::open_with_users(config, &scheduler.handle());
    let users = db.table("user");

    for i in 0..30 {
        users
            .insert(Row::new().with("name", format!("user-{i}")).with("age", i))
            .unwrap();
    }
    users
        .update(Filter::raw("age % 3 = ?", [0]), Row::new().with("name", "fizz"))
        .unwrap();
    users.delete(Filter::raw("age > ?", [25])).unwrap();

    let (primary, replica) = common::eventually_blocking(
        Duration::from_secs(10),
        Duration::from_millis(20),
        || {
            let (primary, replica) = common::users_on_both(&db);
            (primary == replica).then_some((primary, replica))
        },
    );
    assert_eq!(primary.len(), 26);
    assert_eq!(replica.iter().filter(|r| r.get_str("name") == Some("fizz")).count(), 9);

    common::eventually_blocking(Duration::from_secs(5), Duration::from_millis(20), || {
        (db.pending().unwrap() == 0).then_some(())
    });
    scheduler.shutdown();
}

#[test]
fn batch_size_bounds_one_pass() {
    let (_dir, mut config) = common::temp_store_config();
    config.batch_size = 10;
    let scheduler = common::start_scheduler(60_000);
    let db = common::open_with_users(config, &scheduler.handle());
    let gate = common::hold_worker(&scheduler.handle());
    let users = db.table("user");

    for i in 0..25 {
        users.insert(Row::new().with("age", i)).unwrap();
    }

    assert_eq!(db.copy_to_read().unwrap().applied, 10);
    assert_eq!(db.pending().unwrap(), 15);
    assert_eq!(db.sync_now().unwrap(), 15);
    assert_eq!(users.count(Filter::All).unwrap(), 25);

    drop(gate);
    scheduler.shutdown();
}

/// Applying the same records out of order leaves the replica wrong.
#[test]
fn out_of_order_replay_diverges() {
    let (_dir, config) = common::temp_store_config();
    let scheduler = common::start_scheduler(60_000);
    let db = common::open_with_users(config.clone(), &scheduler.handle());
    let gate = common::hold_worker(&scheduler.handle());
    let users = db.table("user");

    let id = users.insert(Row::new().with("name", "a")).unwrap();
    users.delete(Filter::eq("id", id)).unwrap();

    let entries = db
        .primary()
        .with_conn(|c| changelog::drain_batch(c, 10))
        .unwrap();
    assert_eq!(entries.len(), 2);

    // delete first, then insert: the row survives on the replica only
    let replica = common::open_read_write(&config.replica_path);
    apply_entry(&replica, &entries[1]).unwrap();
    apply_entry(&replica, &entries[0]).unwrap();

    let (primary_rows, replica_rows) = common::users_on_both(&db);
    assert!(primary_rows.is_empty());
    assert_eq!(replica_rows.len(), 1);
    assert_ne!(primary_rows, replica_rows);

    drop(gate);
    scheduler.shutdown();
}

/// A crash between apply and remove means the next pass re-applies records
/// the replica already has.
#[test]
fn replay_after_partial_apply_is_idempotent() {
    let (_dir, config) = common::temp_store_config();
    let scheduler = common::start_scheduler(60_000);
    let db = common::open_with_users(config.clone(), &scheduler.handle());
    let gate = common::hold_worker(&scheduler.handle());
    let users = db.table("user");

    users.insert(Row::new().with("name", "a").with("age", 1)).unwrap();
    users.insert(Row::new().with("name", "b").with("age", 2)).unwrap();
    users.update(Filter::eq("name", "a"), Row::new().with("age", 10)).unwrap();
    users.delete(Filter::eq("name", "b")).unwrap();

    let entries = db
        .primary()
        .with_conn(|c| changelog::drain_batch(c, 10))
        .unwrap();
    let replica = common::open_read_write(&config.replica_path);
    for entry in &entries {
        apply_entry(&replica, entry).unwrap();
    }

    // Log untouched: the pass replays all four records on top.
    assert_eq!(db.pending().unwrap(), 4);
    assert_eq!(db.copy_to_read().unwrap().applied, 4);
    assert_eq!(db.pending().unwrap(), 0);

    let (primary_rows, replica_rows) = common::users_on_both(&db);
    assert_eq!(primary_rows, replica_rows);
    assert_eq!(
        replica_rows,
        vec![Row::new().with("id", 1).with("name", "a").with("age", 10)]
    );

    drop(gate);
    scheduler.shutdown();
}

#[test]
fn unknown_op_type_stops_batch_and_stays() {
    common::init_tracing();
    let (_dir, config) = common::temp_store_config();
    let scheduler = common::start_scheduler(60_000);
    let db = common::open_with_users(config.clone(), &scheduler.handle());
    let gate = common::hold_worker(&scheduler.handle());
    let users = db.table("user");

    users.insert(Row::new().with("name", "first")).unwrap();
    let primary = common::open_read_write(&config.primary_path);
    primary
        .execute(
            "INSERT INTO binlog (table_name, op_type, data) VALUES ('user', 'truncate', '{}')",
            [],
        )
        .unwrap();
    let bad_id = primary.last_insert_rowid();
    users.insert(Row::new().with("name", "second")).unwrap();

    let err = db.copy_to_read().unwrap_err();
    assert!(
        matches!(err, Error::UnknownOpType { id, ref op_type } if id == bad_id && op_type == "truncate")
    );
    assert!(!err.is_retryable());

    // The record before it was applied and removed; it and everything after stay.
    assert_eq!(db.pending().unwrap(), 2);
    let names: Vec<_> = users
        .select(Select::new().columns(["name"]))
        .unwrap()
        .into_iter()
        .map(|r| r.get_str("name").map(str::to_string))
        .collect();
    assert_eq!(names, vec![Some("first".to_string())]);

    // Retrying does not get past it.
    assert!(db.copy_to_read().unwrap_err().is_malformed_entry());
    assert_eq!(db.pending().unwrap(), 2);

    drop(gate);
    scheduler.shutdown();
}

#[test]
fn text_real_and_null_values_survive_replication() {
    let (_dir, config) = common::temp_store_config();
    let scheduler = common::start_scheduler(60_000);
    let db = common::open_with_users(config, &scheduler.handle());
    db.table_manager("user")
        .ensure_column("score", "REAL", None, false)
        .unwrap();
    let users = db.table("user");

    users
        .insert(
            Row::new()
                .with("name", "quote ' and \"double\"")
                .with("age", Value::Null)
                .with("score", 2.5),
        )
        .unwrap();
    db.sync_now().unwrap();

    let (primary_rows, replica_rows) = common::users_on_both(&db);
    assert_eq!(primary_rows, replica_rows);
    assert_eq!(replica_rows[0].get("score"), Some(&Value::Real(2.5)));
    assert_eq!(replica_rows[0].get("age"), Some(&Value::Null));
    scheduler.shutdown();
}

#[test]
fn change_log_records_carry_post_update_rows() {
    let (_dir, config) = common::temp_store_config();
    let scheduler = common::start_scheduler(60_000);
    let db = common::open_with_users(config, &scheduler.handle());
    let gate = common::hold_worker(&scheduler.handle());
    let users = db.table("user");

    users.insert(Row::new().with("name", "a").with("age", 1)).unwrap();
    users.update(Filter::eq("name", "a"), Row::new().with("age", 7)).unwrap();

    let entries = db
        .primary()
        .with_conn(|c| changelog::drain_batch(c, 10))
        .unwrap();
    assert_eq!(
        entries[1].operation().unwrap(),
        Operation::Update(Row::new().with("id", 1).with("name", "a").with("age", 7))
    );
    assert_eq!(db.pending_for_table("user").unwrap(), 2);

    drop(gate);
    scheduler.shutdown();
}

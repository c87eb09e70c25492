//! # Database Handle
//!
//! [`RwDatabase`] ties one primary/replica pair to a scheduler:
//!
//! 1. opens both stores with the configured pragmas
//! 2. checks the change-log format version on the primary
//! 3. creates the change-log table (idempotent)
//! 4. registers a periodic replication pass keyed by the primary's path
//!
//! Step 4 is what makes replication self-healing: a pass that stopped on a
//! busy store is retried the next time the scheduler goes idle, even if no
//! further writes arrive. Opening the same primary twice shares one periodic
//! task. It stays registered until every handle on that primary, clones
//! included, has been closed or dropped. [`Table`]s do not keep it alive.

use std::sync::Arc;

use crate::changelog::{self, CHANGELOG_TABLE};
use crate::config::StoreConfig;
use crate::error::Result;
use crate::replicator::{PassReport, Replicator};
use crate::router::ReadRouter;
use crate::scheduler::{PeriodicRegistration, SchedulerHandle};
use crate::schema::{self, TableManager};
use crate::store::{ConnectionOptions, Store};
use crate::table::Table;

/// One primary/replica pair and everything needed to use it.
#[derive(Debug, Clone)]
pub struct RwDatabase {
    config: StoreConfig,
    primary: Arc<Store>,
    replica: Arc<Store>,
    router: ReadRouter,
    replicator: Arc<Replicator>,
    scheduler: SchedulerHandle,
    periodic: Arc<PeriodicRegistration>,
}

impl RwDatabase {
    /// Opens the pair described by `config` and wires it to `scheduler`.
    pub fn open(config: StoreConfig, scheduler: &SchedulerHandle) -> Result<Self> {
        config.validate()?;

        let options = ConnectionOptions {
            busy_timeout: config.busy_timeout(),
            journal_mode: config.journal_mode,
        };
        let primary = Arc::new(Store::open(
            &config.primary_path,
            options,
            config.max_idle_connections,
        )?);
        let replica = Arc::new(Store::open(
            &config.replica_path,
            options,
            config.max_idle_connections,
        )?);

        schema::initialize_metadata(&primary)?;
        changelog::ensure_table(&TableManager::new(CHANGELOG_TABLE, Arc::clone(&primary), None))?;

        let replicator = Arc::new(Replicator::new(&config, scheduler.replication_lock()));
        let periodic = Arc::new(scheduler.acquire_periodic(Self::periodic_key(&config), replicator.task()));

        tracing::info!(
            primary = %config.primary_path.display(),
            replica = %config.replica_path.display(),
            default_read = ?config.default_read,
            "opened database pair"
        );

        let router = ReadRouter::new(Arc::clone(&primary), Arc::clone(&replica), config.default_read);
        Ok(Self {
            config,
            primary,
            replica,
            router,
            replicator,
            scheduler: scheduler.clone(),
            periodic,
        })
    }

    fn periodic_key(config: &StoreConfig) -> String {
        config.primary_path.display().to_string()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn primary(&self) -> &Arc<Store> {
        &self.primary
    }

    pub fn replica(&self) -> &Arc<Store> {
        &self.replica
    }

    pub fn router(&self) -> &ReadRouter {
        &self.router
    }

    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    /// A handle on table `name`. The table is not created here; use
    /// [`table_manager`](Self::table_manager) for DDL.
    pub fn table(&self, name: impl Into<String>) -> Table {
        Table::new(
            name,
            Arc::clone(&self.primary),
            self.router.clone(),
            self.scheduler.clone(),
            Arc::clone(&self.replicator),
        )
    }

    /// DDL for table `name` on both stores.
    pub fn table_manager(&self, name: impl Into<String>) -> TableManager {
        TableManager::new(name, Arc::clone(&self.primary), Some(Arc::clone(&self.replica)))
    }

    /// One replication pass on the calling thread.
    pub fn copy_to_read(&self) -> Result<PassReport> {
        self.replicator.run_pass()
    }

    /// Replicates until the change log is empty. Returns records applied.
    pub fn sync_now(&self) -> Result<usize> {
        self.replicator.drain_all()
    }

    /// Change-log records not yet replicated.
    pub fn pending(&self) -> Result<i64> {
        self.primary.with_conn(|conn| changelog::pending_count(conn))
    }

    /// Change-log records not yet replicated for one table.
    pub fn pending_for_table(&self, table: &str) -> Result<i64> {
        self.primary
            .with_conn(|conn| changelog::pending_for_table(conn, table))
    }

    /// Releases this handle. Periodic replication for the pair stops once
    /// no other handle on the same primary is open; records still in the log
    /// stay there until the pair is opened again.
    pub fn close(self) {
        tracing::debug!(
            primary = %self.config.primary_path.display(),
            periodic = self.periodic.key(),
            "closed database pair"
        );
    }
}

// =============================================================================
// Tests
// =============================================================================

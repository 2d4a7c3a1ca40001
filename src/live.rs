use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use uuid::Uuid;

use minefund_core::{Campaign, ChangeEvent, ChangeKind, FeeSchedule, Record, Table, Wallet};

use crate::storage::{StorageBackend, StorageError};

/// A row type that can be kept current from change events.
pub trait LiveRow: Clone + Send + Sync + 'static {
    const TABLE: Table;

    fn row_id(&self) -> Uuid;
    fn from_record(record: &Record) -> Option<Self>;
}

impl LiveRow for Wallet {
    const TABLE: Table = Table::Wallets;

    fn row_id(&self) -> Uuid {
        self.id
    }

    fn from_record(record: &Record) -> Option<Self> {
        match record {
            Record::Wallet(w) => Some(w.clone()),
            _ => None,
        }
    }
}

impl LiveRow for Campaign {
    const TABLE: Table = Table::Campaigns;

    fn row_id(&self) -> Uuid {
        self.id
    }

    fn from_record(record: &Record) -> Option<Self> {
        match record {
            Record::Campaign(c) => Some(c.clone()),
            _ => None,
        }
    }
}

impl LiveRow for FeeSchedule {
    const TABLE: Table = Table::FeeSchedules;

    fn row_id(&self) -> Uuid {
        self.id
    }

    fn from_record(record: &Record) -> Option<Self> {
        match record {
            Record::FeeSchedule(s) => Some(s.clone()),
            _ => None,
        }
    }
}

/// Rows of one table keyed by ID.
#[derive(Debug, Clone)]
pub struct LiveTable<T> {
    rows: BTreeMap<Uuid, T>,
}

impl<T: LiveRow> Default for LiveTable<T> {
    fn default() -> Self {
        Self { rows: BTreeMap::new() }
    }
}

impl<T: LiveRow> LiveTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_all(&mut self, rows: Vec<T>) {
        self.rows = rows.into_iter().map(|r| (r.row_id(), r)).collect();
    }

    /// Applies one event; returns whether this table changed.
    pub fn apply(&mut self, event: &ChangeEvent) -> bool {
        if event.table != T::TABLE {
            return false;
        }
        match event.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                match event.record.as_ref().and_then(T::from_record) {
                    Some(row) => {
                        self.rows.insert(row.row_id(), row);
                        true
                    }
                    None => {
                        tracing::warn!(table = %event.table, id = %event.id, "Change event without a matching row");
                        false
                    }
                }
            }
            ChangeKind::Delete => self.rows.remove(&event.id).is_some(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<&T> {
        self.rows.get(id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.rows.values()
    }
}

#[derive(Default)]
struct Tables {
    wallets: LiveTable<Wallet>,
    campaigns: LiveTable<Campaign>,
    fee_schedules: LiveTable<FeeSchedule>,
}

/// Read model for dashboards, kept current by applying change events one
/// row at a time.
#[derive(Default)]
pub struct LiveCache {
    tables: RwLock<Tables>,
}

impl LiveCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every table with a fresh snapshot.
    pub fn load(&self, storage: &dyn StorageBackend) -> Result<(), StorageError> {
        let wallets = storage.list_wallets(None)?;
        let campaigns = storage.list_campaigns()?;
        let fee_schedules = storage.list_fee_schedules()?;

        let mut tables = self.tables.write().unwrap();
        tables.wallets.replace_all(wallets);
        tables.campaigns.replace_all(campaigns);
        tables.fee_schedules.replace_all(fee_schedules);
        tracing::debug!(
            wallets = tables.wallets.len(),
            campaigns = tables.campaigns.len(),
            fee_schedules = tables.fee_schedules.len(),
            "Live cache loaded"
        );
        Ok(())
    }

    pub fn apply(&self, event: &ChangeEvent) -> bool {
        let mut tables = self.tables.write().unwrap();
        match event.table {
            Table::Wallets => tables.wallets.apply(event),
            Table::Campaigns => tables.campaigns.apply(event),
            Table::FeeSchedules => tables.fee_schedules.apply(event),
            _ => false,
        }
    }

    pub fn wallet(&self, id: Uuid) -> Option<Wallet> {
        self.tables.read().unwrap().wallets.get(&id).cloned()
    }

    pub fn wallets(&self) -> Vec<Wallet> {
        self.tables.read().unwrap().wallets.values().cloned().collect()
    }

    pub fn campaigns(&self) -> Vec<Campaign> {
        self.tables.read().unwrap().campaigns.values().cloned().collect()
    }

    pub fn fee_schedules(&self) -> Vec<FeeSchedule> {
        self.tables.read().unwrap().fee_schedules.values().cloned().collect()
    }

    /// Subscribes, snapshots, then follows the change stream on a tokio task.
    ///
    /// Subscribing before the snapshot means no change can fall between the
    /// two; events already reflected in the snapshot are idempotent upserts.
    /// A lagged receiver has lost events and falls back to a full reload.
    pub fn spawn(self: &Arc<Self>, storage: Arc<dyn StorageBackend>) -> Result<JoinHandle<()>, StorageError> {
        let mut changes = storage.subscribe();
        self.load(storage.as_ref())?;

        let cache = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(event) => {
                        cache.apply(&event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Live cache lagged behind change stream, reloading");
                        if let Err(e) = cache.load(storage.as_ref()) {
                            tracing::error!(error = %e, "Live cache reload failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        tracing::debug!("Change stream closed, live cache stopped");
                        break;
                    }
                }
            }
        }))
    }
}

//! Connector - URI から backend 接続を作る driver registry
//!
//! Driver は family ごとに登録する。ここに無い family（redis, postgresql, ...）は
//! URI としては正しくても接続できないので `BackendConnection` になる。
//! 同梱の driver は `memory://<name>` のみで、同じ name は同じ server を共有する。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::config::{BackendFamily, ConnectionInfo, Role};
use crate::domain::{Result, TaskQueueError};
use crate::ports::{Clock, DataStore, EventBroker, IdGenerator, QueueBroker, SystemClock, UlidGenerator};

use super::memory_events::MemoryEventBus;
use super::memory_queue::MemoryQueueServer;
use super::memory_store::MemoryStoreServer;

pub type QueueBrokerDriver = Arc<dyn Fn(&ConnectionInfo) -> Result<Arc<dyn QueueBroker>> + Send + Sync>;
pub type DataStoreDriver = Arc<dyn Fn(&ConnectionInfo) -> Result<Arc<dyn DataStore>> + Send + Sync>;
pub type EventBrokerDriver = Arc<dyn Fn(&ConnectionInfo) -> Result<Arc<dyn EventBroker>> + Send + Sync>;

/// Named in-memory servers, shared by every connection to the same name.
pub struct MemoryHub {
    queues: Mutex<HashMap<String, Arc<MemoryQueueServer>>>,
    stores: Mutex<HashMap<String, Arc<MemoryStoreServer>>>,
    buses: Mutex<HashMap<String, Arc<MemoryEventBus>>>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl MemoryHub {
    pub fn new(ids: Arc<dyn IdGenerator>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            stores: Mutex::new(HashMap::new()),
            buses: Mutex::new(HashMap::new()),
            ids,
            clock,
        })
    }

    /// Process-wide hub used by `Connector::new`.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<MemoryHub>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| {
            MemoryHub::new(Arc::new(UlidGenerator::default()), Arc::new(SystemClock))
        }))
    }

    pub fn queue_server(&self, name: &str) -> Arc<MemoryQueueServer> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(queues.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!(name, "creating in-memory queue server");
            MemoryQueueServer::new(Arc::clone(&self.ids), Arc::clone(&self.clock))
        }))
    }

    pub fn store_server(&self, name: &str) -> Arc<MemoryStoreServer> {
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(stores.entry(name.to_string()).or_insert_with(MemoryStoreServer::new))
    }

    pub fn event_bus(&self, name: &str) -> Arc<MemoryEventBus> {
        let mut buses = self.buses.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(buses.entry(name.to_string()).or_insert_with(MemoryEventBus::new))
    }
}

#[derive(Clone, Default)]
pub struct Connector {
    queue_brokers: HashMap<BackendFamily, QueueBrokerDriver>,
    data_stores: HashMap<BackendFamily, DataStoreDriver>,
    event_brokers: HashMap<BackendFamily, EventBrokerDriver>,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("queue_brokers", &self.queue_brokers.keys().collect::<Vec<_>>())
            .field("data_stores", &self.data_stores.keys().collect::<Vec<_>>())
            .field("event_brokers", &self.event_brokers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Connector {
    /// Connector with the `memory://` drivers backed by the global hub.
    pub fn new() -> Self {
        Self::with_memory_hub(MemoryHub::global())
    }

    /// Connector with no drivers at all.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_memory_hub(hub: Arc<MemoryHub>) -> Self {
        let queues = Arc::clone(&hub);
        let stores = Arc::clone(&hub);
        Self::empty()
            .register_queue_broker(
                BackendFamily::Memory,
                Arc::new(move |info: &ConnectionInfo| -> Result<Arc<dyn QueueBroker>> {
                    Ok(Arc::new(queues.queue_server(&info.host).connect()))
                }),
            )
            .register_data_store(
                BackendFamily::Memory,
                Arc::new(move |info: &ConnectionInfo| -> Result<Arc<dyn DataStore>> {
                    Ok(Arc::new(stores.store_server(&info.host).connect()))
                }),
            )
            .register_event_broker(
                BackendFamily::Memory,
                Arc::new(move |info: &ConnectionInfo| -> Result<Arc<dyn EventBroker>> {
                    Ok(Arc::new(hub.event_bus(&info.host).connect()))
                }),
            )
    }

    pub fn register_queue_broker(mut self, family: BackendFamily, driver: QueueBrokerDriver) -> Self {
        self.queue_brokers.insert(family, driver);
        self
    }

    pub fn register_data_store(mut self, family: BackendFamily, driver: DataStoreDriver) -> Self {
        self.data_stores.insert(family, driver);
        self
    }

    pub fn register_event_broker(mut self, family: BackendFamily, driver: EventBrokerDriver) -> Self {
        self.event_brokers.insert(family, driver);
        self
    }

    pub fn queue_broker(&self, uri: &str) -> Result<Arc<dyn QueueBroker>> {
        let info = resolve(uri, Role::QueueBroker)?;
        let driver = lookup(&self.queue_brokers, &info)?;
        connect(&info, || driver(&info))
    }

    pub fn data_store(&self, uri: &str) -> Result<Arc<dyn DataStore>> {
        let info = resolve(uri, Role::DataStore)?;
        let driver = lookup(&self.data_stores, &info)?;
        connect(&info, || driver(&info))
    }

    pub fn event_broker(&self, uri: &str) -> Result<Arc<dyn EventBroker>> {
        let info = resolve(uri, Role::EventBroker)?;
        let driver = lookup(&self.event_brokers, &info)?;
        connect(&info, || driver(&info))
    }
}

fn resolve(uri: &str, role: Role) -> Result<ConnectionInfo> {
    let info = ConnectionInfo::parse(uri)?;
    if !info.family.supports(role) {
        return Err(TaskQueueError::Configuration(format!(
            "{} cannot be used as a {role}",
            info.family
        )));
    }
    Ok(info)
}

fn lookup<'a, D>(drivers: &'a HashMap<BackendFamily, D>, info: &ConnectionInfo) -> Result<&'a D> {
    drivers
        .get(&info.family)
        .ok_or_else(|| TaskQueueError::BackendConnection {
            uri: info.redacted(),
            reason: format!("no driver available for {}", info.family),
        })
}

fn connect<T: ?Sized>(info: &ConnectionInfo, open: impl FnOnce() -> Result<Arc<T>>) -> Result<Arc<T>> {
    let conn = open().map_err(|err| match err {
        err @ TaskQueueError::BackendConnection { .. } => err,
        other => TaskQueueError::BackendConnection {
            uri: info.redacted(),
            reason: other.to_string(),
        },
    })?;
    tracing::debug!(uri = %info.redacted(), family = %info.family, "connected");
    Ok(conn)
}

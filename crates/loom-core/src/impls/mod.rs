//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **Connector**: URI → driver の registry
//! - **MemoryQueueBroker**: rq / huey 用の in-memory broker
//! - **MemoryDataStore**: apscheduler 用の in-memory store
//! - **MemoryEventBroker**: broadcast channel による通知
//!
//! redis / postgresql などの driver は `Connector::register_*` で外から差し込む。

pub mod connector;
pub mod memory_events;
pub mod memory_queue;
pub mod memory_store;

pub use self::connector::{
    Connector, DataStoreDriver, EventBrokerDriver, MemoryHub, QueueBrokerDriver,
};
pub use self::memory_events::{MemoryEventBroker, MemoryEventBus};
pub use self::memory_queue::{MemoryQueueBroker, MemoryQueueServer};
pub use self::memory_store::{MemoryDataStore, MemoryStoreServer};

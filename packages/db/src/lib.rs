//! Persistence layer for the job queue.
//!
//! This crate provides the store abstraction and the components built on it:
//! job persistence, routing, hotjob notifications and the in-process event bus.
//!
//! # Features
//!
//! - `memory` (default): in-process store for tests and single-process use
//! - `redis`: Redis-backed store for `redis://` endpoints

mod bus;
mod connection;
mod hotjob;
mod memory;
#[cfg(feature = "redis")]
mod redis_store;
pub mod repositories;
mod store;

pub use bus::EventBus;
pub use connection::{StoreConfig, StoreError, connect};
pub use hotjob::{HotjobHandle, HotjobNotifier};
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use repositories::{Created, JobStore, QueueRouter};
pub use store::{Op, PubSubMessage, Store, StoreFuture, Subscription};

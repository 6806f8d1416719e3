// Queue backends and the queue registry

pub mod backend;
pub mod memory;
pub mod redis_queue;
pub mod registry;

pub use backend::QueueBackend;
pub use memory::{InMemoryProvider, InMemoryQueueBackend};
pub use redis_queue::{RedisBackendProvider, RedisQueueBackend};
pub use registry::{BackendProvider, BoundBackend, Queue, QueueRegistry, QueueSet};

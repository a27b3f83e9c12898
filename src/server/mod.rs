//! The file server: the authoritative tree, the per-client notification
//! machinery, and the RPC service tying them together.

/// Host-filesystem helpers
pub mod fs_util;

/// Per-client bounded notification queue
pub mod queue;

/// Subscriber registry and fan-out
pub mod registry;

/// The RPC file service
pub mod service;

pub use self::registry::SubscriberRegistry;
pub use self::service::FileService;

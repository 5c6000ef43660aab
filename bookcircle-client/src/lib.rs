//! BookCircle data access: the [`DataService`] trait, its HTTP and
//! in-memory implementations, and the realtime change feed.

pub mod auth;
pub mod config;
pub mod http;
pub mod memory;
pub mod realtime;
pub mod service;

pub use auth::Auth;
pub use config::ClientConfig;
pub use http::{HttpDataService, HttpDataServiceBuilder};
pub use memory::MemoryDataService;
pub use realtime::RealtimeClient;
pub use service::{ChangeFeed, ChangeFilter, DataService, ServiceCapabilities};

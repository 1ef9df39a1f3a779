pub mod hooks;
pub mod router;
pub mod server;
pub mod service;
pub mod sql;
pub mod store;
pub mod subsystems;

pub use service::{SessionService, SessionServiceBuilder};

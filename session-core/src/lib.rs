pub mod config;
pub mod db;
pub mod error;
pub mod ipc;
pub mod models;

pub use config::SessionStoreConfig;
pub use error::{Result, ResultExt, SessionError};
pub use ipc::{SessionRequest, SessionResponse};
pub use models::{
    Event, GetOptions, Session, SessionKey, SessionOptions, StateMap, Summary, TrackEvent,
    TrackEvents, UserKey,
};

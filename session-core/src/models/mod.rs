pub mod event;
pub mod key;
pub mod session;
pub mod state;
pub mod summary;
pub mod track;

pub use event::Event;
pub use key::{SessionKey, UserKey};
pub use session::{GetOptions, Session, SessionOptions, SessionStateDoc};
pub use state::StateMap;
pub use summary::Summary;
pub use track::{TrackEvent, TrackEvents};

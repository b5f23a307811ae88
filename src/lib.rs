#![doc = include_str!("../README.md")]
#![warn(rustdoc::broken_intra_doc_links)]
pub mod clock;
pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod framer;
pub mod library;
pub mod messages;
pub mod protocol;
pub mod publication;
pub mod sequence;
pub mod session;
pub mod session_ids;
pub mod subscription;

pub use clock::{EpochClock, FakeEpochClock, SystemEpochClock};
pub use config::EngineConfiguration;
pub use engine::{FixEngine, IdleStrategy};
pub use error::{EngineError, ErrorHandler, Result};
pub use framer::Framer;
pub use messages::{
    DisconnectReason, GatewayError, GatewayEvent, LibraryCommand, SessionState, ENGINE_LIBRARY_ID,
    NO_MESSAGE_REPLAY,
};
pub use subscription::Action;

//! # Audio Module
//!
//! Everything between a resolved track and sound in a voice call.
//!
//! ### [`queue`] - Playlist
//! - Per-chat FIFO of pending tracks with a configurable cap
//! - The currently playing track is never part of it
//!
//! ### [`session`] - Session Controller contract
//! - `join` / `change_stream` / `pause` / `resume` / `leave` per chat
//! - Transport events tagged with the generation of the stream that raised them
//!
//! ### [`voice`] - Songbird backend
//! - Implements the controller over songbird calls
//! - Streams remote URLs over HTTP and materialized files from disk
//! - One reconnect attempt on unexpected driver disconnects
//!
//! ### [`artifacts`] - Temporary audio files
//! - Process-wide temp directory for materialized downloads
//! - Files released as soon as their track stops being current or is discarded

pub mod artifacts;
pub mod queue;
pub mod session;
pub mod voice;

pub use artifacts::{ArtifactStore, PendingArtifact};
pub use queue::Playlist;
pub use session::{
    event_channel, EndReason, EventSink, EventStream, SessionController, SessionEvent,
    SessionEventKind, SessionHandle, SessionState,
};
pub use voice::{SongbirdSessions, VoiceTarget};

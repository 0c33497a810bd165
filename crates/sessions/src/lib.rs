//! Session identity and durable client state.
//!
//! A [`SessionResolver`] turns the backend's session API into the session id a
//! socket binds to, persisting it to `<data_dir>/state.json` and degrading to
//! a locally generated id when the API is unreachable. [`ChatSessionStore`]
//! keeps an append-only JSONL transcript per session under
//! `<data_dir>/transcripts/`, with file locking for concurrent access.

pub mod api;
pub mod resolver;
pub mod session;
pub mod store;
pub mod transcript;

pub use {
    api::{HttpSessionApi, RemoteSession, SessionApi},
    resolver::SessionResolver,
    session::{Session, SessionOrigin},
    store::StateStore,
    transcript::ChatSessionStore,
};

//! Client-side synchronization of channels, direct messages and profile state
//! from untrusted Nostr relays.
//!
//! Relays hand back partial, duplicated and unordered slices of a signed event
//! stream. [`source`] gathers them, [`merge`] reduces them deterministically,
//! and the aggregates in [`channel`] and [`user`] hold the reconciled view.

pub mod cache;
pub mod channel;
pub mod config;
pub mod contacts;
pub mod dm;
pub mod error;
pub mod event;
pub mod filter;
pub mod identity;
pub mod merge;
pub mod naming;
pub mod profile;
pub mod relay;
pub mod source;
pub mod store;
pub mod user;

pub use error::{ClientError, Result};
pub use event::{Event, UnsignedEvent};
pub use identity::Identity;
pub use user::{LoginOutcome, UserState, UserStore};

//! Unattended multi-account live broadcasting.
//!
//! Each configured account is driven by a [`stream::Stream`]: log in, open a
//! broadcast, feed it from an external encoder while polling telemetry and
//! comments, then end and publish it, forever. The [`broadcast::Broadcast`]
//! aggregate owns every stream plus the comment relay shared between them,
//! and the [`api`] module exposes both over HTTP.

pub mod api;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod records;
pub mod stream;

pub use error::{Error, Result};

//! Headless download queue for music catalogs.
//!
//! tunepull resolves artists, releases and songs into downloadable tracks
//! and runs them through a bounded-concurrency download queue: lazy
//! expansion of collections, duplicate detection against files already on
//! disk, cooperative cancellation, hierarchical progress, and metadata
//! tagging of every produced file. The actual media transfer is delegated
//! to an external tool; search and presentation are left to frontends
//! consuming the event stream.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod config;
pub mod dedup;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod http;
pub mod item;
pub mod naming;
pub mod queue;
pub mod resolver;
pub mod tagger;

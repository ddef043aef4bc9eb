//! Multi-backend feed sync engine.
//!
//! Mirrors Fever and FreshRSS (Google Reader API) accounts alongside plain
//! RSS/Atom subscriptions into a single SQLite store, then answers filtered
//! item queries against it. [`repo`] drives one sync per account kind,
//! [`api`] speaks the wire protocols, [`storage`] owns the schema and the
//! query builder, and [`opml`] moves subscription lists in and out.

pub mod api;
pub mod config;
pub mod opml;
pub mod repo;
pub mod storage;
pub mod util;

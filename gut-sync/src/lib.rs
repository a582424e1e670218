//! gut-sync library
//!
//! Offline-first storage and synchronization core for the gut tracker
//! client: local SQLite store, server client, sync coordinator and the
//! entry/draft facades built on them.

pub mod app;
pub mod config;
pub mod database;
pub mod error;
pub mod remote;
pub mod services;
pub mod sync;

//! Feedpack - a feed fetcher and article packer
//!
//! This crate fetches feeds concurrently, drops the entries it has already
//! seen, runs the rest through a content pipeline, and packs them into
//! gzip-compressed chunks described by a single atomically committed
//! catalogue (`db.json`) on local disk or S3.

pub mod catalogue;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod history;
pub mod packer;
pub mod pipeline;
pub mod session;
pub mod storage;

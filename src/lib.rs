//! Distributed job-execution daemon: claims rows from PostgreSQL-backed
//! queues and runs them as supervised child processes across a cluster of
//! equal nodes.

pub mod array_codec;
pub mod config;
pub mod control;
pub mod db;
pub mod error;
pub mod instance;
pub mod library;
pub mod notify;
pub mod operator;
pub mod partition;
pub mod plan;
pub mod ratelimiter;
pub mod schedule;
pub mod spawn_service;
pub mod sticky;
pub mod translation;
pub mod workplace;

pub use error::{Error, Result};

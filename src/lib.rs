//! # popsubd
//!
//! `popsubd` is the single-node core of a pub/sub message broker.
//! Producers publish to named topics; every topic copies each message to all
//! of its channels, and each channel is an independently progressing
//! subscriber group with at-least-once delivery. Memory use is bounded: when a
//! buffer fills up, messages spill to a `sled`-backed queue on disk.
//!
//! ## Core Modules
//!
//! - `broker`: Node, topics, channels, the fan-out pump and the queue scanner.
//! - `client`: The capabilities a channel needs from a connected consumer.
//! - `config`: Loading settings from `config/default.toml` and the environment.
//! - `persistence`: Spill queues and the topic/channel metadata snapshot.
//! - `utils`: Shared error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod utils;

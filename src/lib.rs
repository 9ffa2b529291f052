//! `zr`: a polyglot task runner and build orchestrator. Tasks are declared
//! in a TOML catalogue, resolved into a dependency DAG, and executed
//! level-by-level with content-addressed result caching and a persistent
//! execution history.

#![deny(clippy::or_fun_call)]
#![deny(clippy::bool_to_int_with_if)]

pub mod cache;
pub mod catalog;
pub mod cli;
pub mod commands;
pub mod control;
pub mod dag;
pub mod error;
pub mod fingerprint;
pub mod history;
pub mod logging;
pub mod platform;
pub mod process;
pub mod runner;
pub mod scheduler;

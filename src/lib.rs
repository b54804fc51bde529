//! Loginguard - Adaptive brute-force protection for credential logins
//!
//! This crate guards a login path with two limiters over a shared counter
//! store: one throttling failed attempts per source address, one throttling
//! consecutive failures per identity and address. Counter store faults fail
//! closed, and a successful login forgives only the identity's failures.

pub mod auth;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

//! Windowgate - Sliding-Window Admission Control
//!
//! This crate decides whether a guarded operation may run, by counting an
//! identified caller's (or all callers') attempts over a trailing time
//! window. Windows live in Redis so limits hold across service processes,
//! with an in-process store as the fallback while Redis is unreachable.

pub mod config;
pub mod error;
pub mod ratelimit;

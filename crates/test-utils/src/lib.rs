//! Shared helpers for eventflow integration tests.

pub mod db;

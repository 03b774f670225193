//! PostgreSQL integration tests.
//!
//! Require `TEST_ADMIN_DATABASE_URL`; see the `test-utils` crate.

mod orchestrator;
mod store;
mod support;

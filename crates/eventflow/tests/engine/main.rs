//! Engine integration tests over the in-memory store.

mod support;

mod publication;
mod recovery;
mod scenarios;
mod scheduling;

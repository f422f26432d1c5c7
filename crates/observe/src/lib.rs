//! Initialization logic for the observability of the pool cache: the global
//! prometheus registry every component registers its metrics in and the
//! tracing subscriber used by binaries and tests.
pub mod metrics;
pub mod tracing;

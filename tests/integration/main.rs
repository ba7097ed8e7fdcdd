//! Integration tests for the reconciliation jobs.

mod mock_store;
mod rate_job;
mod status_job;

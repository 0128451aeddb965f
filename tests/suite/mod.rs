//! Integration test suites

mod context_pipeline;
mod durability;
mod media_iteration;
mod store_roundtrip;

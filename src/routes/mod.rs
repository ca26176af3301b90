//! Operator HTTP surface.
//!
//! Handlers are annotated with `#[openapi]` so `rocket_okapi` can derive the
//! OpenAPI document served under `/api/docs`. Mail search is not exposed here;
//! these routes only report and nudge the ingestion machinery.

pub mod accounts;
pub mod health;
pub mod index;

//! HTTP route handlers grouped by resource domain.
//!
//! Each submodule corresponds to a logical area of the API (agent
//! operations, confirmation records, health) and exposes typed Rocket
//! handlers annotated with `#[openapi]` so `rocket_okapi` can derive an
//! OpenAPI document automatically.

pub mod agent;
pub mod confirmations;
pub mod guards;
pub mod health;

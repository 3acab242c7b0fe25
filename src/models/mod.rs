mod api;

pub use api::{DurationQuery, HealthResponse};

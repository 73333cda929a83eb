mod api;

pub use api::{HealthResponse, TopupReceipt, TopupRequest};

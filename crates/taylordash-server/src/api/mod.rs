pub mod events;
pub mod health;

/// Service name reported by the health endpoints.
pub const SERVICE_NAME: &str = "taylordash-backend";

pub mod health;
pub mod meters;
pub mod metrics;

pub use meters::meter_routes;

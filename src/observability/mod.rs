// Observability: Prometheus metrics for the ETL passes

pub mod metrics;

pub use metrics::init;

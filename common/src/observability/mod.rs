//! Prometheus metrics and log setup shared by the publisher and listener.

mod metrics;
mod tracing;

pub use metrics::{MetricsContext, MetricsServerConfig};
pub use tracing::init_tracing;

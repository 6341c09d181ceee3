pub mod exporter;
pub mod hub;
pub mod labels;

pub use exporter::MetricsExporter;
pub use hub::HubMetrics;

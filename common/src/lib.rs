/// Per-cluster exclusive-action locking.
pub mod lock;
/// The admin client seam towards MySQL Shell's AdminAPI, plus GTID set
/// arithmetic and the stable error-code contract.
pub mod mysql;
/// Tracing and telemetry initialisation shared by all binaries.
pub mod tracing_telemetry;
pub mod types;

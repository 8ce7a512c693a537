// Boundary entry points: control gateway and process-wide setup.

pub mod gateway;
pub mod telemetry;

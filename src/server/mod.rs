// HTTP boundary: control and push-event endpoints.

pub mod handler;
pub mod publisher;

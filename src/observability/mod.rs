//! Observability for the bridge: structured logging and span macros

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat, LogSettings};

// Span macros for structured logging
pub use logging::{mqtt_span, session_span};

use serde::Serialize;
use std::fmt;

pub const ERR_VALIDATION: &str = "ERR_VALIDATION";
pub const ERR_DEPENDENCY: &str = "ERR_DEPENDENCY";
pub const ERR_SYSTEM: &str = "ERR_SYSTEM";
pub const ERR_PRECONDITION: &str = "ERR_PRECONDITION";
pub const ERR_PARSE: &str = "ERR_PARSE";

#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_VALIDATION, message, trace_id)
    }

    /// The device or the adb binary could not service the request.
    pub fn dependency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_DEPENDENCY, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SYSTEM, message, trace_id)
    }

    /// The operation needs a prior state that does not hold (no bound device, nothing to stop).
    pub fn precondition(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_PRECONDITION, message, trace_id)
    }

    pub fn parse(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_PARSE, message, trace_id)
    }

    pub fn is_precondition(&self) -> bool {
        self.code == ERR_PRECONDITION
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}

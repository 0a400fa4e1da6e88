//! Error types shared across the server.
//!
//! [`ProtocolError`] is what handlers return; the dispatcher turns it into an
//! `error` envelope on the wire. [`Fatal`] classifies startup and runtime
//! failures into process exit codes.

use std::process::ExitCode;

/// A per-frame failure that is reported to the client, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ProtocolError {
    pub code: u16,
    pub message: String,
}

impl ProtocolError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(401, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(403, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    pub fn rate_limited() -> Self {
        Self::new(429, "Rate limit exceeded")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    pub fn not_authenticated() -> Self {
        Self::forbidden("Not authenticated")
    }

    /// Field `name` missing or of the wrong JSON type.
    pub fn missing_field(name: &str) -> Self {
        Self::bad_request(format!("Missing or invalid field '{}'", name))
    }
}

/// Process-terminating failure, tagged with the exit code it maps to.
#[derive(Debug, thiserror::Error)]
pub enum Fatal {
    #[error("configuration error: {0:#}")]
    Config(anyhow::Error),
    #[error("failed to bind: {0:#}")]
    Bind(anyhow::Error),
    #[error("persistence init failed: {0:#}")]
    Persistence(anyhow::Error),
    #[error("fatal runtime error: {0:#}")]
    Runtime(anyhow::Error),
}

impl Fatal {
    pub fn code(&self) -> u8 {
        match self {
            Fatal::Config(_) => 1,
            Fatal::Bind(_) => 2,
            Fatal::Persistence(_) => 3,
            Fatal::Runtime(_) => 4,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_carry_wire_codes() {
        assert_eq!(ProtocolError::bad_request("x").code, 400);
        assert_eq!(ProtocolError::forbidden("x").code, 403);
        assert_eq!(ProtocolError::not_found("x").code, 404);
        assert_eq!(ProtocolError::rate_limited().code, 429);
        assert_eq!(ProtocolError::missing_field("username").message, "Missing or invalid field 'username'");
    }

    #[test]
    fn fatal_kinds_map_to_exit_codes() {
        let codes: Vec<u8> = [
            Fatal::Config(anyhow::anyhow!("a")),
            Fatal::Bind(anyhow::anyhow!("b")),
            Fatal::Persistence(anyhow::anyhow!("c")),
            Fatal::Runtime(anyhow::anyhow!("d")),
        ]
        .iter()
        .map(Fatal::code)
        .collect();
        assert_eq!(codes, vec![1, 2, 3, 4]);
    }
}

use thiserror::Error;

/// Failures an operator has to act on. Everything else travels as
/// `anyhow::Error` with context attached at the call site.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("missing prerequisite: {what}\n  hint: {hint}")]
    MissingPrerequisite { what: String, hint: String },

    #[error("command failed on {host} (exit {code}): {command}\nstderr: {stderr}")]
    RemoteCommandFailure {
        host: String,
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("{what} failed validation; the previous configuration is still active\n{diagnostic}")]
    ValidationFailure { what: String, diagnostic: String },

    #[error("{host} is locked by {holder}\n  hint: if no other operation is running, clear it with `deckhand unlock`")]
    LockHeld { host: String, holder: String },

    #[error("interrupted")]
    Interrupted,
}

impl DeployError {
    pub fn missing(what: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::MissingPrerequisite {
            what: what.into(),
            hint: hint.into(),
        }
    }
}

/// Fail with `MissingPrerequisite` when a local binary is not on PATH.
pub fn require_binary(name: &str, hint: &str) -> Result<(), DeployError> {
    which::which(name)
        .map(|_| ())
        .map_err(|_| DeployError::missing(format!("`{}` not found on PATH", name), hint))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_prerequisite_carries_hint() {
        let err = DeployError::missing("secret file", "run `deckhand secrets` first");
        assert_eq!(
            err.to_string(),
            "missing prerequisite: secret file\n  hint: run `deckhand secrets` first"
        );
    }

    #[test]
    fn remote_failure_names_host_and_exit_code() {
        let err = DeployError::RemoteCommandFailure {
            host: "203.0.113.7".into(),
            command: "nginx -t".into(),
            code: 1,
            stderr: "unexpected \"}\"".into(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("command failed on 203.0.113.7 (exit 1): nginx -t"));
        assert!(msg.contains("unexpected"));
    }

    #[test]
    fn unknown_binary_is_a_missing_prerequisite() {
        let err = require_binary("deckhand-no-such-binary", "install it").unwrap_err();
        assert!(matches!(err, DeployError::MissingPrerequisite { .. }));
    }
}

//! Session lifecycle with pure state transition logic

use super::SessionStatus;
use anyhow::{anyhow, Result};

/// Check whether a status transition is allowed
pub fn can_transition(from: &SessionStatus, to: &SessionStatus) -> bool {
    use SessionStatus::*;

    match (from, to) {
        (Pending, Running) => true,
        // The start call itself failed, or the session was stopped before
        // the backend acknowledged it
        (Pending, Error) | (Pending, Cancelled) => true,

        (Running, Success) | (Running, Error) | (Running, Cancelled) => true,

        // Same status is always valid (idempotent)
        (a, b) if a == b => true,

        // Terminal states are absorbing
        (Success, _) | (Error, _) | (Cancelled, _) => false,

        _ => false,
    }
}

/// Validate a status transition
pub fn validate_transition(from: &SessionStatus, to: &SessionStatus) -> Result<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(anyhow!(
            "Invalid status transition from {:?} to {:?}",
            from,
            to
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionStatus::*;

    #[test]
    fn test_validate_transition_valid() {
        assert!(validate_transition(&Pending, &Running).is_ok());
        assert!(validate_transition(&Pending, &Error).is_ok());
        assert!(validate_transition(&Running, &Success).is_ok());
        assert!(validate_transition(&Running, &Error).is_ok());
        assert!(validate_transition(&Running, &Cancelled).is_ok());
    }

    #[test]
    fn test_validate_transition_idempotent() {
        assert!(validate_transition(&Running, &Running).is_ok());
        assert!(validate_transition(&Cancelled, &Cancelled).is_ok());
    }

    #[test]
    fn test_terminal_states_cannot_transition() {
        for terminal in [Success, Error, Cancelled] {
            for next in [Pending, Running, Success, Error, Cancelled] {
                if next != terminal {
                    assert!(
                        validate_transition(&terminal, &next).is_err(),
                        "{terminal:?} -> {next:?} should be rejected"
                    );
                }
            }
        }
    }

    #[test]
    fn test_no_backwards_transition() {
        assert!(validate_transition(&Running, &Pending).is_err());
        assert!(validate_transition(&Pending, &Success).is_err());
    }
}

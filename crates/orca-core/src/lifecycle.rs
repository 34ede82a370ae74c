use crate::CoreError;
use orca_store::LabwareThreadStatus as S;

pub fn validate_transition(from: S, to: S) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (
            S::Created,
            S::AwaitingActionReservation | S::AwaitingMoveReservation | S::Completed
        ) | (
            S::AwaitingActionReservation,
            S::AwaitingMoveReservation | S::AwaitingCoThreads
        ) | (
            S::AwaitingMoveReservation,
            S::AwaitingMoveTargetAvailability | S::AwaitingActionReservation
        ) | (S::AwaitingMoveTargetAvailability, S::Moving)
            | (
                S::Moving,
                S::AwaitingMoveReservation
                    | S::AwaitingActionReservation
                    | S::AwaitingCoThreads
                    | S::Completed
            )
            | (S::AwaitingCoThreads, S::ExecutingAction)
            | (
                S::ExecutingAction,
                S::AwaitingActionReservation | S::AwaitingMoveReservation | S::Completed
            )
            | (
                S::Created
                    | S::AwaitingActionReservation
                    | S::AwaitingMoveReservation
                    | S::Moving
                    | S::ExecutingAction,
                S::Stopping
            )
            | (S::Stopping, S::Stopped)
    ) || (to == S::Errored && !from.is_terminal() && from != S::Stopping);

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        assert!(validate_transition(S::Created, S::AwaitingActionReservation).is_ok());
        assert!(validate_transition(S::AwaitingActionReservation, S::AwaitingMoveReservation).is_ok());
        assert!(validate_transition(S::AwaitingActionReservation, S::AwaitingCoThreads).is_ok()); // already there
        assert!(validate_transition(S::AwaitingMoveReservation, S::AwaitingMoveTargetAvailability).is_ok());
        assert!(validate_transition(S::AwaitingMoveReservation, S::AwaitingActionReservation).is_ok()); // no escape granted
        assert!(validate_transition(S::AwaitingMoveTargetAvailability, S::Moving).is_ok());
        assert!(validate_transition(S::Moving, S::AwaitingMoveReservation).is_ok());
        assert!(validate_transition(S::Moving, S::AwaitingCoThreads).is_ok());
        assert!(validate_transition(S::Moving, S::Completed).is_ok());
        assert!(validate_transition(S::AwaitingCoThreads, S::ExecutingAction).is_ok());
        assert!(validate_transition(S::ExecutingAction, S::AwaitingActionReservation).is_ok());
        assert!(validate_transition(S::ExecutingAction, S::Completed).is_ok());
        assert!(validate_transition(S::Created, S::Completed).is_ok());
        assert!(validate_transition(S::Moving, S::Stopping).is_ok());
        assert!(validate_transition(S::Stopping, S::Stopped).is_ok());
        assert!(validate_transition(S::Moving, S::Errored).is_ok());
        assert!(validate_transition(S::AwaitingCoThreads, S::Errored).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        assert!(validate_transition(S::Created, S::Moving).is_err());
        assert!(validate_transition(S::AwaitingMoveReservation, S::Moving).is_err());
        assert!(validate_transition(S::AwaitingMoveTargetAvailability, S::Stopping).is_err());
        assert!(validate_transition(S::AwaitingCoThreads, S::Stopping).is_err());
        assert!(validate_transition(S::Stopping, S::Errored).is_err());
        assert!(validate_transition(S::Completed, S::Errored).is_err());
        assert!(validate_transition(S::Completed, S::AwaitingActionReservation).is_err());
        assert!(validate_transition(S::Stopped, S::Created).is_err());
        assert!(validate_transition(S::Errored, S::Errored).is_err());
    }

    #[test]
    fn error_names_both_states() {
        let err = validate_transition(S::Completed, S::Moving).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("COMPLETED"));
        assert!(msg.contains("MOVING"));
    }
}

//! Session lifecycle state machine.

use serde::Serialize;

/// Lifecycle of one pairing + transfer session. Terminal states only ever
/// return to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Advertising,
    Scanning,
    Connecting,
    Negotiating,
    Verifying,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Advertising => "advertising",
            SessionState::Scanning => "scanning",
            SessionState::Connecting => "connecting",
            SessionState::Negotiating => "negotiating",
            SessionState::Verifying => "verifying",
            SessionState::Transferring => "transferring",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    /// Whether `self → to` is an allowed edge. Re-entering the current
    /// state is handled as a no-op by the caller, not here.
    pub fn can_transition_to(&self, to: SessionState) -> bool {
        use SessionState::*;
        match self {
            Idle => matches!(
                to,
                Advertising | Scanning | Connecting | Negotiating | Failed | Cancelled
            ),
            Advertising | Scanning => matches!(to, Connecting | Negotiating | Failed | Cancelled),
            Connecting => matches!(to, Negotiating | Failed | Cancelled),
            // A receiver whose hello lands late may skip straight into
            // transferring; sealed frames still gate on the crypto context.
            Negotiating => matches!(to, Verifying | Transferring | Failed | Cancelled),
            Verifying => matches!(to, Transferring | Failed | Cancelled),
            Transferring => matches!(to, Completed | Failed | Cancelled),
            Completed | Failed | Cancelled => matches!(to, Idle),
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    const ALL: [SessionState; 10] = [
        Idle,
        Advertising,
        Scanning,
        Connecting,
        Negotiating,
        Verifying,
        Transferring,
        Completed,
        Failed,
        Cancelled,
    ];

    #[test]
    fn happy_paths_are_allowed() {
        // sender
        for (from, to) in [
            (Idle, Scanning),
            (Scanning, Connecting),
            (Connecting, Negotiating),
            (Negotiating, Verifying),
            (Verifying, Transferring),
            (Transferring, Completed),
            (Completed, Idle),
        ] {
            assert!(from.can_transition_to(to), "{from} -> {to}");
        }
        // receiver
        for (from, to) in [
            (Idle, Advertising),
            (Advertising, Negotiating),
            (Negotiating, Transferring),
        ] {
            assert!(from.can_transition_to(to), "{from} -> {to}");
        }
    }

    #[test]
    fn terminal_states_only_reset_to_idle() {
        for terminal in [Completed, Failed, Cancelled] {
            for to in ALL {
                assert_eq!(
                    terminal.can_transition_to(to),
                    to == Idle,
                    "{terminal} -> {to}"
                );
            }
        }
    }

    #[test]
    fn transfer_cannot_restart_verification() {
        assert!(!Transferring.can_transition_to(Verifying));
        assert!(!Transferring.can_transition_to(Negotiating));
        assert!(!Completed.can_transition_to(Transferring));
    }

    #[test]
    fn any_active_state_can_fail_or_cancel() {
        for from in [Idle, Advertising, Scanning, Connecting, Negotiating, Verifying, Transferring]
        {
            assert!(from.can_transition_to(Failed), "{from} -> failed");
            assert!(from.can_transition_to(Cancelled), "{from} -> cancelled");
        }
    }
}

//! Connection lifecycle state machine.
//!
//! Pure transition logic for the gateway link: inputs come from the socket,
//! the timer wheel, and the user-facing handle; outputs are effects the
//! runtime executes (open a socket, send the connect request, schedule a
//! retry). Keeping the machine free of I/O means every race the protocol
//! cares about can be tested as plain function calls.
//!
//! The one invariant this module owes the gateway: at most one `connect`
//! request per socket attempt, no matter how the challenge event and the
//! challenge window timer interleave.

use crate::wire::ErrorShape;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

// ----------------------------------------------------------------------------
// Phases
// ----------------------------------------------------------------------------

/// Externally visible connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// No link and no retry pending
    Disconnected,
    /// Socket dialing or handshake in flight
    Connecting,
    /// Gateway knows the device but an operator has not approved it yet
    Pairing,
    /// Handshake accepted, link live
    Connected,
    /// Link lost, retry timer armed
    Reconnecting,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Disconnected => "disconnected",
            Phase::Connecting => "connecting",
            Phase::Pairing => "pairing",
            Phase::Connected => "connected",
            Phase::Reconnecting => "reconnecting",
        };
        write!(f, "{}", name)
    }
}

/// Phase plus a human-readable detail line for status surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSnapshot {
    pub phase: Phase,
    /// Why we are in this phase, when there is something worth saying
    /// (rejection message, socket close reason).
    pub detail: Option<String>,
}

impl Default for PhaseSnapshot {
    fn default() -> Self {
        Self {
            phase: Phase::Disconnected,
            detail: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Inputs and Effects
// ----------------------------------------------------------------------------

/// Everything that can drive the machine forward.
#[derive(Debug, Clone)]
pub enum ConnectionInput {
    /// User asked for a connection
    ConnectRequested,
    /// Transport reports the socket is open
    SocketOpened,
    /// Gateway offered a handshake nonce
    ChallengeReceived { nonce: String },
    /// Challenge window expired without a nonce
    ChallengeWindowElapsed,
    /// Gateway accepted the connect request
    ConnectAccepted,
    /// Gateway rejected the connect request
    ConnectRejected { error: ErrorShape },
    /// Socket closed or transport failed
    SocketClosed { reason: String },
    /// No traffic for longer than the liveness budget
    LivenessExpired,
    /// Reconnect timer fired
    RetryDue,
    /// User asked to stop
    DisconnectRequested,
}

/// Work the runtime must perform after a transition, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEffect {
    /// Dial the gateway socket
    OpenSocket,
    /// Arm the challenge wait timer
    ArmChallengeWindow,
    /// Send the connect request, signed against `nonce` when present
    SendConnectRequest { nonce: Option<String> },
    /// Arm ping and liveness timers
    StartHeartbeat,
    /// Drain the offline queue over the live link
    FlushQueue,
    /// Drop the link and its timers; every pending request is rejected
    Teardown { reason: String },
    /// Arm the reconnect timer; `attempt` is the backoff exponent
    ScheduleReconnect { attempt: u32 },
}

// ----------------------------------------------------------------------------
// Per-Phase State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum LinkState {
    Disconnected {
        detail: Option<String>,
    },
    Connecting {
        /// Consecutive failures before this attempt (backoff exponent)
        attempt: u32,
        /// Guard: set once the connect request for this attempt went out
        connect_sent: bool,
    },
    Pairing {
        attempt: u32,
        message: String,
    },
    Connected,
    Reconnecting {
        attempt: u32,
        reason: String,
    },
}

impl LinkState {
    fn phase(&self) -> Phase {
        match self {
            LinkState::Disconnected { .. } => Phase::Disconnected,
            LinkState::Connecting { .. } => Phase::Connecting,
            LinkState::Pairing { .. } => Phase::Pairing,
            LinkState::Connected => Phase::Connected,
            LinkState::Reconnecting { .. } => Phase::Reconnecting,
        }
    }
}

// ----------------------------------------------------------------------------
// Machine
// ----------------------------------------------------------------------------

/// Owns the lifecycle state and maps inputs to effects.
#[derive(Debug)]
pub struct ConnectionMachine {
    state: LinkState,
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMachine {
    pub fn new() -> Self {
        Self {
            state: LinkState::Disconnected { detail: None },
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Phase plus detail, for status channels.
    pub fn snapshot(&self) -> PhaseSnapshot {
        let detail = match &self.state {
            LinkState::Disconnected { detail } => detail.clone(),
            LinkState::Pairing { message, .. } => Some(message.clone()),
            LinkState::Reconnecting { reason, .. } => Some(reason.clone()),
            LinkState::Connecting { .. } | LinkState::Connected => None,
        };
        PhaseSnapshot {
            phase: self.state.phase(),
            detail,
        }
    }

    /// Apply one input and return the effects to execute, in order.
    ///
    /// Inputs that make no sense in the current phase (a timer that fired
    /// after its phase ended, a duplicate socket notification) produce no
    /// effects and leave the state untouched.
    pub fn handle(&mut self, input: ConnectionInput) -> Vec<ConnectionEffect> {
        let state = std::mem::replace(&mut self.state, LinkState::Disconnected { detail: None });
        let (next, effects) = Self::step(state, input);
        self.state = next;
        effects
    }

    fn step(state: LinkState, input: ConnectionInput) -> (LinkState, Vec<ConnectionEffect>) {
        use ConnectionEffect as Fx;
        use ConnectionInput as In;

        match (state, input) {
            // From Disconnected
            (LinkState::Disconnected { .. }, In::ConnectRequested) => (
                LinkState::Connecting {
                    attempt: 0,
                    connect_sent: false,
                },
                vec![Fx::OpenSocket],
            ),

            // From Connecting: socket and handshake progress
            (LinkState::Connecting { attempt, connect_sent: false }, In::SocketOpened) => (
                LinkState::Connecting {
                    attempt,
                    connect_sent: false,
                },
                vec![Fx::ArmChallengeWindow],
            ),
            (
                LinkState::Connecting { attempt, connect_sent: false },
                In::ChallengeReceived { nonce },
            ) => (
                LinkState::Connecting {
                    attempt,
                    connect_sent: true,
                },
                vec![Fx::SendConnectRequest { nonce: Some(nonce) }],
            ),
            (
                LinkState::Connecting { attempt, connect_sent: false },
                In::ChallengeWindowElapsed,
            ) => (
                LinkState::Connecting {
                    attempt,
                    connect_sent: true,
                },
                vec![Fx::SendConnectRequest { nonce: None }],
            ),
            // Once the connect request is out, late nonces and stale window
            // timers must not produce a second one.
            (
                state @ LinkState::Connecting { connect_sent: true, .. },
                In::ChallengeReceived { .. } | In::ChallengeWindowElapsed,
            ) => (state, vec![]),

            // From Connecting: handshake outcome
            (LinkState::Connecting { .. }, In::ConnectAccepted) => (
                LinkState::Connected,
                vec![Fx::StartHeartbeat, Fx::FlushQueue],
            ),
            (LinkState::Connecting { attempt, .. }, In::ConnectRejected { error })
                if error.is_not_paired() =>
            {
                let message = if error.message.is_empty() {
                    "device not paired".to_string()
                } else {
                    error.message.clone()
                };
                (
                    LinkState::Pairing { attempt, message },
                    vec![
                        Fx::Teardown {
                            reason: "pairing required".to_string(),
                        },
                        Fx::ScheduleReconnect { attempt },
                    ],
                )
            }
            (LinkState::Connecting { .. }, In::ConnectRejected { error }) => {
                let detail = if error.message.is_empty() {
                    error.code.clone()
                } else {
                    format!("{}: {}", error.code, error.message)
                };
                (
                    LinkState::Disconnected {
                        detail: Some(detail.clone()),
                    },
                    vec![Fx::Teardown {
                        reason: format!("connect rejected: {}", detail),
                    }],
                )
            }
            (LinkState::Connecting { attempt, .. }, In::SocketClosed { reason }) => (
                LinkState::Reconnecting {
                    attempt,
                    reason: reason.clone(),
                },
                vec![
                    Fx::Teardown { reason },
                    Fx::ScheduleReconnect { attempt },
                ],
            ),

            // From Connected: the attempt counter restarts at zero, so the
            // first retry after a working session waits only the base delay.
            (LinkState::Connected, In::SocketClosed { reason }) => (
                LinkState::Reconnecting {
                    attempt: 0,
                    reason: reason.clone(),
                },
                vec![
                    Fx::Teardown { reason },
                    Fx::ScheduleReconnect { attempt: 0 },
                ],
            ),
            (LinkState::Connected, In::LivenessExpired) => {
                let reason = "connection unresponsive".to_string();
                (
                    LinkState::Reconnecting {
                        attempt: 0,
                        reason: reason.clone(),
                    },
                    vec![
                        Fx::Teardown { reason },
                        Fx::ScheduleReconnect { attempt: 0 },
                    ],
                )
            }

            // Retry timer
            (
                LinkState::Reconnecting { attempt, .. } | LinkState::Pairing { attempt, .. },
                In::RetryDue,
            ) => (
                LinkState::Connecting {
                    attempt: attempt + 1,
                    connect_sent: false,
                },
                vec![Fx::OpenSocket],
            ),

            // User-initiated stop wins from every phase.
            (LinkState::Disconnected { detail }, In::DisconnectRequested) => {
                (LinkState::Disconnected { detail }, vec![])
            }
            (_, In::DisconnectRequested) => (
                LinkState::Disconnected { detail: None },
                vec![Fx::Teardown {
                    reason: "disconnect requested".to_string(),
                }],
            ),

            // Everything else is a stale or duplicate signal.
            (state, input) => {
                trace!(phase = %state.phase(), ?input, "ignoring out-of-phase input");
                (state, vec![])
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionEffect as Fx;
    use ConnectionInput as In;

    fn rejection(code: &str, message: &str) -> ErrorShape {
        ErrorShape {
            code: code.to_string(),
            message: message.to_string(),
            retryable: false,
            details: None,
        }
    }

    /// Drive a fresh machine to Connected via the challenge path.
    fn connected_machine() -> ConnectionMachine {
        let mut machine = ConnectionMachine::new();
        machine.handle(In::ConnectRequested);
        machine.handle(In::SocketOpened);
        machine.handle(In::ChallengeReceived {
            nonce: "n1".to_string(),
        });
        machine.handle(In::ConnectAccepted);
        assert_eq!(machine.phase(), Phase::Connected);
        machine
    }

    #[test]
    fn test_initial_state() {
        let machine = ConnectionMachine::new();
        assert_eq!(machine.phase(), Phase::Disconnected);
        assert_eq!(machine.snapshot().detail, None);
    }

    #[test]
    fn test_connect_flow_with_challenge() {
        let mut machine = ConnectionMachine::new();

        assert_eq!(machine.handle(In::ConnectRequested), vec![Fx::OpenSocket]);
        assert_eq!(machine.phase(), Phase::Connecting);

        assert_eq!(
            machine.handle(In::SocketOpened),
            vec![Fx::ArmChallengeWindow]
        );
        assert_eq!(
            machine.handle(In::ChallengeReceived {
                nonce: "abc".to_string()
            }),
            vec![Fx::SendConnectRequest {
                nonce: Some("abc".to_string())
            }]
        );
        assert_eq!(
            machine.handle(In::ConnectAccepted),
            vec![Fx::StartHeartbeat, Fx::FlushQueue]
        );
        assert_eq!(machine.phase(), Phase::Connected);
    }

    #[test]
    fn test_connect_flow_without_challenge() {
        let mut machine = ConnectionMachine::new();
        machine.handle(In::ConnectRequested);
        machine.handle(In::SocketOpened);

        assert_eq!(
            machine.handle(In::ChallengeWindowElapsed),
            vec![Fx::SendConnectRequest { nonce: None }]
        );
    }

    #[test]
    fn test_single_connect_request_per_attempt() {
        // Challenge first, stale window timer second.
        let mut machine = ConnectionMachine::new();
        machine.handle(In::ConnectRequested);
        machine.handle(In::SocketOpened);
        machine.handle(In::ChallengeReceived {
            nonce: "n".to_string(),
        });
        assert_eq!(machine.handle(In::ChallengeWindowElapsed), vec![]);

        // Window first, late challenge second.
        let mut machine = ConnectionMachine::new();
        machine.handle(In::ConnectRequested);
        machine.handle(In::SocketOpened);
        machine.handle(In::ChallengeWindowElapsed);
        assert_eq!(
            machine.handle(In::ChallengeReceived {
                nonce: "late".to_string()
            }),
            vec![]
        );

        // Duplicate timers and nonces stay quiet too.
        assert_eq!(machine.handle(In::ChallengeWindowElapsed), vec![]);
    }

    #[test]
    fn test_not_paired_moves_to_pairing() {
        let mut machine = ConnectionMachine::new();
        machine.handle(In::ConnectRequested);
        machine.handle(In::SocketOpened);
        machine.handle(In::ChallengeWindowElapsed);

        let effects = machine.handle(In::ConnectRejected {
            error: rejection("NOT_PAIRED", "device not paired"),
        });
        assert_eq!(machine.phase(), Phase::Pairing);
        assert!(effects.contains(&Fx::ScheduleReconnect { attempt: 0 }));
        assert_eq!(
            machine.snapshot().detail.as_deref(),
            Some("device not paired")
        );

        // Pairing keeps retrying until an operator approves the device.
        assert_eq!(machine.handle(In::RetryDue), vec![Fx::OpenSocket]);
        assert_eq!(machine.phase(), Phase::Connecting);
    }

    #[test]
    fn test_fatal_rejection_disconnects() {
        let mut machine = ConnectionMachine::new();
        machine.handle(In::ConnectRequested);
        machine.handle(In::SocketOpened);
        machine.handle(In::ChallengeWindowElapsed);

        let effects = machine.handle(In::ConnectRejected {
            error: rejection("FORBIDDEN", "token revoked"),
        });
        assert_eq!(machine.phase(), Phase::Disconnected);
        assert!(!effects
            .iter()
            .any(|fx| matches!(fx, Fx::ScheduleReconnect { .. })));
        assert_eq!(
            machine.snapshot().detail.as_deref(),
            Some("FORBIDDEN: token revoked")
        );
    }

    #[test]
    fn test_socket_loss_schedules_retry() {
        let mut machine = connected_machine();

        let effects = machine.handle(In::SocketClosed {
            reason: "eof".to_string(),
        });
        assert_eq!(machine.phase(), Phase::Reconnecting);
        assert_eq!(
            effects,
            vec![
                Fx::Teardown {
                    reason: "eof".to_string()
                },
                Fx::ScheduleReconnect { attempt: 0 },
            ]
        );
        assert_eq!(machine.snapshot().detail.as_deref(), Some("eof"));
    }

    #[test]
    fn test_liveness_expiry_tears_down() {
        let mut machine = connected_machine();

        let effects = machine.handle(In::LivenessExpired);
        assert_eq!(machine.phase(), Phase::Reconnecting);
        assert!(effects.contains(&Fx::Teardown {
            reason: "connection unresponsive".to_string()
        }));
        assert!(effects.contains(&Fx::ScheduleReconnect { attempt: 0 }));
    }

    #[test]
    fn test_backoff_attempt_grows_then_resets() {
        let mut machine = ConnectionMachine::new();
        machine.handle(In::ConnectRequested);

        // First failure schedules with exponent 0, second with exponent 1.
        let fx = machine.handle(In::SocketClosed {
            reason: "refused".to_string(),
        });
        assert!(fx.contains(&Fx::ScheduleReconnect { attempt: 0 }));
        machine.handle(In::RetryDue);
        let fx = machine.handle(In::SocketClosed {
            reason: "refused".to_string(),
        });
        assert!(fx.contains(&Fx::ScheduleReconnect { attempt: 1 }));

        // A successful session resets the exponent.
        machine.handle(In::RetryDue);
        machine.handle(In::SocketOpened);
        machine.handle(In::ChallengeWindowElapsed);
        machine.handle(In::ConnectAccepted);
        let fx = machine.handle(In::SocketClosed {
            reason: "eof".to_string(),
        });
        assert!(fx.contains(&Fx::ScheduleReconnect { attempt: 0 }));
    }

    #[test]
    fn test_disconnect_wins_from_any_phase() {
        let mut machine = connected_machine();
        let effects = machine.handle(In::DisconnectRequested);
        assert_eq!(machine.phase(), Phase::Disconnected);
        assert_eq!(
            effects,
            vec![Fx::Teardown {
                reason: "disconnect requested".to_string()
            }]
        );

        // Timers that fire after teardown do nothing.
        assert_eq!(machine.handle(In::RetryDue), vec![]);
        assert_eq!(machine.handle(In::LivenessExpired), vec![]);
        assert_eq!(machine.handle(In::ChallengeWindowElapsed), vec![]);

        // Disconnecting twice is quiet.
        assert_eq!(machine.handle(In::DisconnectRequested), vec![]);
    }

    #[test]
    fn test_stale_inputs_ignored_when_connected() {
        let mut machine = connected_machine();

        assert_eq!(machine.handle(In::RetryDue), vec![]);
        assert_eq!(machine.handle(In::SocketOpened), vec![]);
        assert_eq!(machine.handle(In::ConnectAccepted), vec![]);
        assert_eq!(machine.phase(), Phase::Connected);
    }

    #[test]
    fn test_connect_requested_is_idempotent_while_active() {
        let mut machine = connected_machine();
        assert_eq!(machine.handle(In::ConnectRequested), vec![]);
        assert_eq!(machine.phase(), Phase::Connected);
    }
}

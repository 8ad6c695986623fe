//! # Rig connection lifecycle
//!
//! Each configured rig runs the same state machine:
//!
//! ```text
//!      +--------------+   open serial    +--------------+
//!      | NotConnected | ---------------> | Initializing |
//!      +--------------+                  +--------------+
//!                                          ||         ||
//!                         init frames ok   ||         ||  retries exhausted,
//!                                          \/         ||  timeout or I/O error
//!                                    +--------+       \/
//!                                    | Online |  +---------------+
//!                                    +--------+  | NotResponding |
//!                                          ||    +---------------+
//!         F consecutive timeouts,          ||         ||
//!         or I/O error                     ||         ||  reconnect cycle
//!                                          ++=========++  (every K seconds)
//!
//!               any state --- administrative disable ---> Disabled
//! ```
//!
//! `Disabled` is terminal by request: the runtime drains in-flight I/O,
//! rejects further enqueues, and performs no further exchanges.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Connection state of one rig.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum RigState {
    /// The serial channel has not been opened yet.
    #[default]
    NotConnected,

    /// The channel is open; init frames are being exchanged.
    Initializing,

    /// Init completed; commands and status polls are being dispatched.
    Online,

    /// The radio stopped answering; reconnection attempts are scheduled.
    NotResponding,

    /// Administratively stopped. No I/O is performed.
    Disabled,
}

impl RigState {
    /// The "connected" flag reported to clients, e.g. by `list_rigs`.
    pub fn is_connected(&self) -> bool {
        matches!(self, RigState::Online)
    }

    /// Whether the runtime may accept a command in this state.
    pub fn accepts_commands(&self) -> bool {
        matches!(self, RigState::Online | RigState::Initializing)
    }
}

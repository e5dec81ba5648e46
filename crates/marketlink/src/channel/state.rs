//! Channel lifecycle as an explicit transition table.
//!
//! ```text
//! Connecting --Opened---------> Open
//! Connecting --Failed---------> Closed
//! Connecting --CloseRequested-> Closing
//! Open       --CloseRequested-> Closing
//! Open       --TransportLost--> Closing
//! Closing    --Finalized------> Closed
//! ```
//!
//! `Closed` is terminal. A new attempt for the same endpoint gets a new
//! channel.

use std::fmt;

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    /// Closing or closed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }

    /// Apply `event`, returning the next state.
    pub fn transition(self, event: ChannelEvent) -> Result<Self, InvalidTransition> {
        use ChannelEvent::*;
        use ChannelState::*;

        let next = match (self, event) {
            (Connecting, Opened) => Open,
            (Connecting, Failed) => Closed,
            (Connecting | Open, CloseRequested) => Closing,
            (Open, TransportLost) => Closing,
            (Closing, Finalized) => Closed,
            (from, event) => return Err(InvalidTransition { from, event }),
        };
        Ok(next)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the channel state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Handshake and negotiation sequence finished.
    Opened,
    /// Handshake failed or timed out.
    Failed,
    /// Local close requested.
    CloseRequested,
    /// Socket closed or errored while open.
    TransportLost,
    /// Socket fully released.
    Finalized,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("invalid channel transition from {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: ChannelState,
    pub event: ChannelEvent,
}

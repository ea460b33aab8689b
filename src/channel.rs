//! Per-channel sequencing state.
//!
//! Each channel is an independent ordering domain: its own reliable and
//! unreliable sequence spaces, and its own reorder queues feeding the
//! peer's dispatch list.

use std::collections::VecDeque;

use crate::peer::IncomingCommand;
use crate::protocol::constants::{RELIABLE_WINDOWS, RELIABLE_WINDOW_SIZE};

#[derive(Debug, Default)]
pub(crate) struct Channel {
    pub outgoing_reliable_sequence_number: u16,
    pub outgoing_unreliable_sequence_number: u16,

    /// Bitmask of reliable windows with commands still awaiting
    /// acknowledgement.
    pub used_reliable_windows: u16,
    /// Outstanding reliable commands per window.
    pub reliable_windows: [u16; RELIABLE_WINDOWS as usize],

    pub incoming_reliable_sequence_number: u16,
    pub incoming_unreliable_sequence_number: u16,

    /// Reorder buffer, sorted by reliable sequence number in wrap order.
    pub incoming_reliable_commands: VecDeque<IncomingCommand>,
    /// Reorder buffer, sorted by (reliable, unreliable) sequence numbers.
    pub incoming_unreliable_commands: VecDeque<IncomingCommand>,
}

impl Channel {
    pub fn new() -> Self {
        Self::default()
    }

    /// The window a sequence number belongs to, adjusted so that numbers
    /// behind the current incoming sequence land in the wrapped-around
    /// upper half.
    pub fn incoming_window_of(&self, sequence_number: u16) -> u16 {
        let mut window = sequence_number / RELIABLE_WINDOW_SIZE;
        if sequence_number < self.incoming_reliable_sequence_number {
            window += RELIABLE_WINDOWS;
        }
        window
    }

    /// The window the next expected incoming reliable command falls in.
    pub fn current_incoming_window(&self) -> u16 {
        self.incoming_reliable_sequence_number / RELIABLE_WINDOW_SIZE
    }
}

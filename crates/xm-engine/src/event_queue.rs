//! Command queue for interactive player mutators.
//!
//! The tick handler is the single producer of state transitions; anything
//! else (a UI thread, a test harness) that wants to call `play`, `stop`,
//! `play_note`, or similar must serialize through a queue the tick handler
//! drains at the top of each tick, or hold an equivalent single lock
//! across both the tick and the mutator. This type implements the first
//! design.

use alloc::vec::Vec;

/// A serialized interactive mutator, queued for the next tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Start song playback at a pattern-order position and row.
    Play {
        /// Pattern order table position to start at.
        pot_pos: u16,
        /// Row within that pattern to start at.
        row: u16,
        /// Whether the song should loop at its end.
        song_loop: bool,
    },
    /// Stop song playback (fades out, then halts).
    Stop,
    /// Trigger a note directly on a channel, independent of the song
    /// cursor. `channel = 255` selects "auto" (highest free channel).
    PlayNote {
        /// Note to play, `0..=95`.
        note: u8,
        /// Explicit volume, or `None` to use the sample's default.
        volume: Option<u8>,
        /// Target channel, or `255` for auto-select.
        channel: u8,
        /// 1-based instrument index.
        instrument: u8,
    },
    /// Fade out a single channel immediately.
    StopChannel(u8),
    /// Toggle whether the current pattern repeats instead of advancing.
    SetPatternLoop(bool),
    /// Preview a single sample directly, independent of any instrument or
    /// song cursor. Always preempts whatever single sample (if any) is
    /// already previewing.
    PlaySample {
        /// 1-based instrument index the sample belongs to (for lookup only;
        /// the player does not track an owning instrument once playing).
        instrument: u8,
        /// Sample index within that instrument.
        sample: u8,
        /// Note to play the sample at, `0..=95`.
        note: u8,
        /// Explicit volume, or `None` to use the sample's default.
        volume: Option<u8>,
        /// Target channel.
        channel: u8,
    },
}

/// FIFO of pending [`Command`]s, pushed by interactive callers and drained
/// by the tick handler.
#[derive(Clone, Debug, Default)]
pub struct CommandQueue {
    commands: Vec<Command>,
}

impl CommandQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self { commands: Vec::new() }
    }

    /// Enqueue a command to be applied on the next drain.
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Drain every queued command in FIFO order.
    pub fn drain(&mut self) -> alloc::vec::Drain<'_, Command> {
        self.commands.drain(..)
    }

    /// Returns true if no commands are queued.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

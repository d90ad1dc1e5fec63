//! Tick-driven playback engine for XM modules.
//!
//! This crate holds no audio data of its own: it drives a host-supplied
//! [`Mixer`] through per-channel commands and reports progress through an
//! [`Events`] sink, reading song data from `xm_ir`. A host calls
//! [`Player::on_tick`] once per tracker tick (`Song::ms_per_tick()`
//! milliseconds apart, nominally) with the wall-clock time elapsed since the
//! last call; everything else — row advance, effects, envelopes, fades — is
//! computed from that.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod channel;
mod envelope_state;
mod event_queue;
mod events;
mod mixer;
mod player;
mod vibrato;

pub use channel::{Active, ChannelState};
pub use envelope_state::EnvelopeState;
pub use event_queue::{Command, CommandQueue};
pub use events::{Events, NullEvents};
pub use mixer::Mixer;
pub use player::{Player, MAX_CHANNELS};

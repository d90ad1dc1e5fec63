//! Core IR types for XM module playback.
//!
//! This crate defines the intermediate representation shared by the XM
//! codec and the playback engine: songs, patterns, instruments, samples,
//! and the fixed-point frequency math they're built on.
//!
//! `no_std` compatible with the `alloc` crate.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod effect;
mod frequency;
mod instrument;
mod pattern;
mod sample;
pub mod song;

pub use effect::{
    split_extended, ARPEGGIO, EXTENDED, EXT_FINE_VOLUME_DOWN, EXT_FINE_VOLUME_UP, EXT_NOTE_CUT,
    EXT_NOTE_DELAY, EXT_PATTERN_DELAY, EXT_PATTERN_LOOP, PANNING_SLIDE, PATTERN_BREAK, PORTA_DOWN,
    PORTA_TONE, PORTA_UP, POSITION_JUMP, SET_PAN, SET_SPEED_TEMPO, SET_VOLUME, VIBRATO,
    VOLUME_SLIDE,
};
pub use frequency::{
    bend, clamp_note, frequency_from_porta_accumulator, linear_period, period_to_frequency,
    porta_seed, realized_note, NOTE_MAX, NOTE_MIN, PORTA_ACCUMULATOR_MAX,
};
pub use instrument::{
    Envelope, EnvelopePoint, Instrument, MAX_ENVELOPE_POINTS, MAX_SAMPLES, NOTE_MAP_LEN,
};
pub use pattern::{Cell, Note, Pattern, MAX_PATTERN_LENGTH, MAX_VOLUME};
pub use sample::{LoopType, Sample, SampleData};
pub use song::{Song, MAX_CHANNELS, MAX_POT_LENGTH};

//! Per-channel playback state.

use xm_ir::Note;

/// A channel's activity state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Active {
    /// Silent.
    #[default]
    Off,
    /// Sounding normally.
    On,
    /// Fading to silence; becomes `Off` once the fade reaches its target.
    ToBeDisabled,
}

/// Mixing and effect state for a single tracker channel.
#[derive(Clone, Debug, Default)]
pub struct ChannelState {
    /// Whether the channel currently has a note playing.
    pub active: Active,
    /// Milliseconds left until the sample naturally ends (non-looping
    /// samples only). `None` when the sample loops or the length is
    /// unbounded.
    pub ms_left: Option<u32>,
    /// Current note, realized from `(note, instrument)` at trigger time.
    pub note: Note,
    /// Note played on the previous row (used by tone portamento and effect
    /// tails).
    pub prev_note: Note,
    /// 1-based instrument index currently sounding.
    pub instrument: u8,
    /// Sample index within that instrument.
    pub sample: u8,

    /// Base channel volume (0..=64), set by note trigger, `Cxx`, and volume
    /// slides.
    pub volume: u8,
    /// Volume carried over from the previous sample on this channel, used
    /// by the volume column's `updateChannelVol` scaling.
    pub prev_sample_vol: u8,
    /// Current volume envelope amplitude, `0..=64`.
    pub env_vol: u8,
    /// Current panning envelope amplitude, `0..=64`, centered at 32.
    pub env_pan: u8,
    /// Set on a stop-note (`note == Note::Stop`); releases the volume and
    /// panning envelopes from their sustain point and starts fadeout.
    pub released: bool,

    /// Anti-click fade state.
    pub fade_active: bool,
    /// Current interpolated fade volume (0..=64).
    pub fade_vol: u8,
    /// Target volume once the fade completes.
    pub fade_target: u8,
    /// Milliseconds remaining in the fade.
    pub fade_ms_left: u32,
    /// A volume change is pending at the next tick boundary (used to delay
    /// `Cxx`/slide/note-cut application to the fade engine).
    pub setvol_requested: bool,

    /// Current effect number for this row (mirrors the pattern cell).
    pub effect: Option<u8>,
    /// Current effect parameter.
    pub effect_param: u8,
    /// Effect active on the previous row, used to detect a change of effect
    /// (which triggers tail cleanup, e.g. resetting vibrato).
    pub prev_effect: Option<u8>,

    /// Portamento (up/down/tone) accumulator, in 128ths of a semitone.
    pub porta_accumulator: u32,
    /// Tone portamento target accumulator.
    pub porta_target: u32,
    /// Per-tick portamento increment.
    pub porta_increment: u32,
    /// Tone portamento direction: true = sliding up toward the target.
    pub porta_up: bool,
    /// Whether a continuous (non-tone) portamento is currently enabled.
    pub porta_enabled: bool,

    /// Volume slide remembered across rows when the effect param is `00`.
    pub last_slide_speed: i16,

    /// Vibrato waveform table position.
    pub vib_accumulator: u8,
    /// Per-tick phase increment.
    pub vib_phase_increment: u8,
    /// Vibrato depth, from the high nibble of `4xy`.
    pub vib_depth: u8,

    /// Current panning, `0..=255`.
    pub panning: u8,
}

impl ChannelState {
    /// A fresh, silent channel.
    pub fn new() -> Self {
        Self {
            env_vol: 64,
            env_pan: 32,
            fade_vol: 64,
            panning: 128,
            ..Default::default()
        }
    }

    /// Reset all per-song state, as done when playback restarts.
    pub fn reset(&mut self) {
        let panning = self.panning;
        *self = Self::new();
        self.panning = panning;
    }

    /// Returns true if this channel is fading toward silence or another
    /// target volume.
    pub fn is_fading(&self) -> bool {
        self.fade_active
    }
}

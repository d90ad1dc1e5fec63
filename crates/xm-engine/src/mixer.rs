//! The `Mixer` trait: the audio-rendering collaborator the player drives.
//!
//! The player never touches a sample buffer or a DAC itself — it only
//! issues per-channel commands. Whatever owns real-time audio output
//! implements this trait and is handed to [`crate::Player`] at construction.

use xm_ir::Sample;

/// Sink for the player's per-channel mixing commands.
///
/// All volume/panning values are in the mixer's native `0..=31` /
/// `0..=255` ranges respectively, already rescaled from the tracker's
/// `0..=64` volume units by the player.
pub trait Mixer {
    /// Start `sample` playing on `channel` at `frequency` Hz, `volume`
    /// (0..=31) and `panning` (0..=255).
    fn start(&mut self, channel: u8, sample: &Sample, frequency: u32, volume: u8, panning: u8);

    /// Update the playback frequency of whatever is currently sounding on
    /// `channel`. No-op if the channel is silent.
    fn set_frequency(&mut self, channel: u8, frequency: u32);

    /// Update the volume (0..=31) of `channel`.
    fn set_volume(&mut self, channel: u8, volume: u8);

    /// Update the panning (0..=255) of `channel`.
    fn set_panning(&mut self, channel: u8, panning: u8);

    /// Silence `channel` immediately.
    fn stop(&mut self, channel: u8);
}

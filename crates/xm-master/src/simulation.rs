//! A `Mixer`/`Events` pair for headless, audio-free playback.
//!
//! [`SimulationMixer`] performs no rendering at all; it only counts the
//! commands the player issues it. This is the mixer `Controller` uses for
//! both the background playback thread and [`run`], and it is the same
//! collaborator an integration test reaches for when it wants to drive
//! `xm_engine::Player` over a real song without a sound card — grounded
//! in the `RecordingMixer` test double `xm-engine`'s own player tests use,
//! promoted here to a library-level type other callers can share.

use xm_engine::{Events, Mixer, Player};
use xm_ir::{Sample, Song};

/// A [`Mixer`] that renders nothing; it only counts start/stop calls. A
/// host with a real audio backend implements `Mixer` itself instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulationMixer {
    /// Number of `start` calls observed.
    pub channel_starts: u32,
    /// Number of `stop` calls observed.
    pub channel_stops: u32,
}

impl Mixer for SimulationMixer {
    fn start(&mut self, channel: u8, _sample: &Sample, frequency: u32, volume: u8, panning: u8) {
        self.channel_starts += 1;
        log::debug!("channel {channel} start freq={frequency}Hz vol={volume} pan={panning}");
    }

    fn set_frequency(&mut self, channel: u8, frequency: u32) {
        log::trace!("channel {channel} freq={frequency}Hz");
    }

    fn set_volume(&mut self, channel: u8, volume: u8) {
        log::trace!("channel {channel} vol={volume}");
    }

    fn set_panning(&mut self, channel: u8, panning: u8) {
        log::trace!("channel {channel} pan={panning}");
    }

    fn stop(&mut self, channel: u8) {
        self.channel_stops += 1;
        log::debug!("channel {channel} stop");
    }
}

/// Outcome of a [`crate::Controller::simulate`] run: how far playback got
/// and what it did along the way.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimulationReport {
    /// Number of `row_updated` events fired.
    pub row_updates: u32,
    /// Number of `pot_position_updated` events fired.
    pub pot_updates: u32,
    /// Number of single-sample previews that finished.
    pub samples_finished: u32,
    /// Whether `playback_stopped` fired before the simulated budget ran out.
    pub stopped: bool,
    /// Number of times the mixer was asked to start a channel.
    pub channel_starts: u32,
    /// `(pot_pos, pattern, row)` when the simulation ended.
    pub final_position: (u16, u8, u16),
}

#[derive(Default)]
struct ReportEvents {
    row_updates: u32,
    pot_updates: u32,
    samples_finished: u32,
    stopped: bool,
}

impl Events for ReportEvents {
    fn row_updated(&mut self, _row: u16) {
        self.row_updates += 1;
    }

    fn pot_position_updated(&mut self, _pos: u16) {
        self.pot_updates += 1;
    }

    fn playback_stopped(&mut self) {
        self.stopped = true;
    }

    fn sample_finished(&mut self) {
        self.samples_finished += 1;
    }

    fn debug(&mut self, message: &str) {
        log::debug!("{message}");
    }
}

/// Run `song` through a fresh [`Player`] for up to `budget_ms` of simulated
/// time, one millisecond at a time, and report what happened.
pub(crate) fn run(song: &Song, budget_ms: u32) -> SimulationReport {
    let mut player = Player::new(SimulationMixer::default(), ReportEvents::default());
    player.set_song(song.clone());
    player.play(0, 0, true);

    const STEP_MS: u32 = 1;
    let mut elapsed = 0u32;
    while elapsed < budget_ms && player.is_playing() {
        player.on_tick(STEP_MS);
        elapsed += STEP_MS;
    }

    let events = player.events();
    let mixer = player.mixer();
    SimulationReport {
        row_updates: events.row_updates,
        pot_updates: events.pot_updates,
        samples_finished: events.samples_finished,
        stopped: events.stopped,
        channel_starts: mixer.channel_starts,
        final_position: player.position(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xm_ir::{Instrument, Pattern, Sample as XmSample, SampleData};

    fn silent_song(rows: u16, tempo: u8, bpm: u8) -> Song {
        let mut song = Song::new("t", 2);
        song.tempo = tempo;
        song.bpm = bpm;
        song.add_pattern(Pattern::new(rows, 2));
        song.pot = alloc_vec_u8(1);
        song.restart_position = 0;
        song
    }

    fn alloc_vec_u8(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn empty_song_plays_expected_row_count() {
        // One 64-row empty pattern, tempo=6, bpm=125: 20ms/tick * 6 = 120ms
        // per row, so 1000ms should play floor(1000/120) = 8 rows.
        let song = silent_song(64, 6, 125);
        let report = run(&song, 1000);

        assert_eq!(report.row_updates, 8);
        assert_eq!(report.channel_starts, 0);
        assert!(!report.stopped);
    }

    #[test]
    fn song_without_loop_point_runs_off_the_end_and_stops() {
        let mut song = silent_song(1, 6, 125);
        song.pot = alloc_vec_u8(1);

        let mut player = Player::new(SimulationMixer::default(), ReportEvents::default());
        player.set_song(song);
        player.play(0, 0, false);

        let mut elapsed = 0u32;
        while elapsed < 500 && player.is_playing() {
            player.on_tick(1);
            elapsed += 1;
        }

        assert!(player.events().stopped);
    }

    #[test]
    fn instrument_trigger_reaches_the_mixer() {
        let mut song = Song::new("t", 1);
        song.tempo = 6;
        song.bpm = 125;

        let mut inst = Instrument::new("lead");
        let mut sample = XmSample::new("saw");
        sample.data = SampleData::Mono16(vec![0; 1000]);
        inst.samples.push(sample);
        inst.set_single_sample(0);
        song.instruments.push(inst);

        let mut pattern = Pattern::new(4, 1);
        pattern.cell_mut(0, 0).note = xm_ir::Note::On(48);
        pattern.cell_mut(0, 0).instrument = Some(0);
        song.add_pattern(pattern);
        song.pot = vec![0];

        let report = run(&song, 200);
        assert!(report.channel_starts >= 1);
    }
}

//! Allocation-free render path test.
//!
//! Verifies that `Player::on_tick` does not allocate once a song is
//! loaded and playing. Run with `cargo test --features alloc_check`.

use assert_no_alloc::{assert_no_alloc, AllocDisabler};

#[cfg(debug_assertions)]
#[global_allocator]
static A: AllocDisabler = AllocDisabler;

use xm_engine::{Events, Mixer, NullEvents, Player};
use xm_ir::{Cell, Envelope, Instrument, LoopType, Note, Pattern, Sample, SampleData, Song};

struct NullMixer;

impl Mixer for NullMixer {
    fn start(&mut self, _channel: u8, _sample: &Sample, _frequency: u32, _volume: u8, _panning: u8) {}
    fn set_frequency(&mut self, _channel: u8, _frequency: u32) {}
    fn set_volume(&mut self, _channel: u8, _volume: u8) {}
    fn set_panning(&mut self, _channel: u8, _panning: u8) {}
    fn stop(&mut self, _channel: u8) {}
}

fn playing_song() -> Song {
    let channels = 8;
    let mut song = Song::new("alloc check", channels);
    song.tempo = 6;
    song.bpm = 125;

    let mut inst = Instrument::new("lead");
    let mut sample = Sample::new("saw");
    sample.data = SampleData::Mono16(vec![0; 4000]);
    sample.loop_type = LoopType::Forward;
    sample.loop_length = 4000;
    let mut env = Envelope::new();
    env.enabled = true;
    env.add_point(0, 0);
    env.add_point(8, 64);
    inst.volume_envelope = env;
    inst.samples.push(sample);
    inst.set_single_sample(0);
    song.instruments.push(inst);

    let mut pattern = Pattern::new(64, channels);
    for row in 0..64u16 {
        for ch in 0..channels {
            let cell = pattern.cell_mut(row, ch);
            if row % 4 == 0 {
                cell.note = Note::On(40 + ch);
                cell.instrument = Some(0);
                cell.volume = Some(50);
            }
            cell.effect = Some(xm_ir::VIBRATO);
            cell.effect_param = 0x48;
        }
    }
    song.add_pattern(pattern);
    song.pot = vec![0];
    song.restart_position = 0;
    song
}

#[test]
fn on_tick_is_alloc_free_once_playing() {
    let mut player = Player::new(NullMixer, NullEvents);
    player.set_song(playing_song());
    player.play(0, 0, true);

    assert_no_alloc(|| {
        for _ in 0..(44_100 / 20) {
            player.on_tick(1);
        }
    });
}

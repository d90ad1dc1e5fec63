//! End-to-end load/save coverage against the public `xm_format` API,
//! exercising a song with real structure (multiple patterns, a looping
//! POT, envelopes, a 16-bit looped sample) rather than the single-cell
//! fixtures the unit tests use.

use xm_format::{load_xm, save_xm, XmError};
use xm_ir::{Cell, Envelope, Instrument, LoopType, Note, Pattern, Sample, SampleData, Song};

fn song_with_two_patterns_and_a_loop() -> Song {
    let mut song = Song::new("integration song", 4);
    song.tempo = 5;
    song.bpm = 140;
    song.restart_position = 1;

    let mut verse = Pattern::new(32, 4);
    *verse.cell_mut(0, 0) = Cell {
        note: Note::On(36),
        instrument: Some(1),
        volume: Some(60),
        effect: None,
        effect_param: 0,
        effect2: None,
        effect2_param: 0,
    };
    *verse.cell_mut(16, 1) = Cell {
        note: Note::On(48),
        instrument: Some(1),
        volume: None,
        effect: Some(xm_ir::PORTA_TONE),
        effect_param: 0x04,
        effect2: None,
        effect2_param: 0,
    };
    song.add_pattern(verse);

    let mut chorus = Pattern::new(16, 4);
    *chorus.cell_mut(0, 2) = Cell {
        note: Note::Stop,
        instrument: None,
        volume: None,
        effect: None,
        effect_param: 0,
        effect2: None,
        effect2_param: 0,
    };
    song.add_pattern(chorus);

    // Pattern order loops back to the chorus once the verse finishes.
    song.pot = vec![0, 0, 1, 1];

    let mut inst = Instrument::new("pad");
    let mut volume_env = Envelope::new();
    volume_env.add_point(0, 0);
    volume_env.add_point(10, 64);
    volume_env.add_point(40, 32);
    volume_env.sustain = Some(1);
    volume_env.loop_start = Some(1);
    volume_env.loop_end = Some(2);
    volume_env.enabled = true;
    inst.volume_envelope = volume_env;

    let mut sample = Sample::new("pad.16");
    let data: Vec<i16> = (0..200).map(|i| ((i * 37) % 4000) as i16 - 2000).collect();
    sample.data = SampleData::Mono16(data);
    sample.loop_start = 20;
    sample.loop_length = 100;
    sample.loop_type = LoopType::Forward;
    sample.volume = 200;
    sample.rel_note = 2;
    sample.finetune = -10;
    inst.samples.push(sample);
    inst.set_single_sample(0);
    song.instruments.push(inst);

    song
}

#[test]
fn round_trips_patterns_pot_and_envelopes() {
    let song = song_with_two_patterns_and_a_loop();
    let bytes = save_xm(&song).expect("save should succeed");
    let loaded = load_xm(&bytes).expect("load should succeed");

    assert_eq!(loaded.name.as_str(), "integration song");
    assert_eq!(loaded.tempo, 5);
    assert_eq!(loaded.bpm, 140);
    assert_eq!(loaded.restart_position, 1);
    assert_eq!(loaded.pot, vec![0, 0, 1, 1]);
    assert_eq!(loaded.patterns.len(), 2);

    let verse = loaded.pattern_at(0).unwrap();
    let kick = verse.cell(0, 0);
    assert_eq!(kick.note, Note::On(36));
    assert_eq!(kick.instrument, Some(1));
    assert_eq!(kick.volume, Some(60));

    let slide = verse.cell(16, 1);
    assert_eq!(slide.note, Note::On(48));
    assert_eq!(slide.effect, Some(xm_ir::PORTA_TONE));
    assert_eq!(slide.effect_param, 0x04);

    let chorus = loaded.pattern_at(2).unwrap();
    assert_eq!(chorus.cell(0, 2).note, Note::Stop);

    let inst = loaded.instrument(1).unwrap();
    assert!(inst.volume_envelope.enabled);
    assert_eq!(inst.volume_envelope.sustain, Some(1));
    assert_eq!(inst.volume_envelope.loop_start, Some(1));
    assert_eq!(inst.volume_envelope.loop_end, Some(2));
    assert_eq!(inst.volume_envelope.value_at(0), 0);
    assert_eq!(inst.volume_envelope.value_at(10), 64);

    let sample = &inst.samples[0];
    assert_eq!(sample.loop_start, 20);
    assert_eq!(sample.loop_length, 100);
    assert_eq!(sample.loop_type, LoopType::Forward);
    assert_eq!(sample.rel_note, 2);
    assert_eq!(sample.finetune, -10);
    assert!(sample.has_loop());

    match &sample.data {
        SampleData::Mono16(v) => assert_eq!(v.len(), 200),
        SampleData::Mono8(_) => panic!("expected a 16-bit sample"),
    }
}

#[test]
fn empty_file_is_rejected_end_to_end() {
    assert!(matches!(load_xm(&[]), Err(XmError::ZeroByteFile)));
}

#[test]
fn truncated_file_is_rejected_not_panicked_on() {
    let song = song_with_two_patterns_and_a_loop();
    let bytes = save_xm(&song).expect("save should succeed");
    let truncated = &bytes[..bytes.len() / 2];
    assert!(load_xm(truncated).is_err());
}

#[test]
fn many_channel_song_round_trips() {
    let mut song = Song::new("wide song", 32);
    song.tempo = 6;
    song.bpm = 125;
    let pattern = Pattern::new(64, 32);
    song.add_pattern(pattern);
    song.pot = vec![0];

    let bytes = save_xm(&song).expect("save should succeed");
    let loaded = load_xm(&bytes).expect("load should succeed");
    assert_eq!(loaded.channels, 32);
    assert_eq!(loaded.patterns[0].channels, 32);
}

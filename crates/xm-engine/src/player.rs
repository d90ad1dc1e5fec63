//! Tick-driven playback state machine.
//!
//! A [`Player`] owns no audio data and renders nothing itself; it reads a
//! `xm_ir::Song`, walks its pattern data one tracker tick at a time, and
//! issues per-channel commands to a [`Mixer`]. A host is expected to call
//! [`Player::on_tick`] once per tick (`Song::ms_per_tick()` milliseconds
//! apart at the song's current BPM, nominally ~1 kHz worth of calls for a
//! typical tempo) with the wall-clock milliseconds elapsed since the
//! previous call.

use alloc::vec::Vec;

use arrayvec::ArrayVec;

use xm_ir::{Cell, Note, Song};

use crate::channel::{Active, ChannelState};
use crate::envelope_state::EnvelopeState;
use crate::event_queue::{Command, CommandQueue};
use crate::events::Events;
use crate::mixer::Mixer;
use crate::vibrato;

/// Channel array size, mirroring `xm_ir::MAX_CHANNELS`.
pub const MAX_CHANNELS: u8 = xm_ir::MAX_CHANNELS;
const MAX_CH: usize = MAX_CHANNELS as usize;

/// One row's cells, one per channel. Inline capacity avoids a heap
/// allocation on `Player::on_tick`'s hot path.
type RowCells = ArrayVec<Cell, MAX_CH>;

/// Anti-click fade duration. Short enough that a fade scheduled near a tick
/// boundary completes (or nearly completes) before the next tick arrives at
/// ordinary tempos; not dictated by the file format, only by how it sounds.
const FADE_OUT_MS: u32 = 20;

/// "Auto-select a channel" sentinel used by `play_note`/`stop_channel`.
const AUTO_CHANNEL: u8 = 255;

/// Tick-accurate state machine driving a [`Mixer`] from a `Song`.
///
/// Interactive mutators (`play_note`, `play_sample`, `stop_channel`,
/// `set_pattern_loop`, ...) should be posted through [`Player::enqueue`]
/// rather than called directly while a host is concurrently ticking the
/// player from another thread; `on_tick` drains the queue before doing
/// anything else. Calling them directly is fine from the same thread/task
/// that owns the tick loop.
pub struct Player<M: Mixer, E: Events> {
    mixer: M,
    events: E,
    queue: CommandQueue,
    song: Option<Song>,

    channels: [ChannelState; MAX_CHANNELS as usize],
    vol_env: [EnvelopeState; MAX_CHANNELS as usize],
    pan_env: [EnvelopeState; MAX_CHANNELS as usize],

    playing: bool,
    just_started: bool,
    song_loop: bool,
    pattern_loop: bool,
    /// Reserved for a host-driven "stop after this row" request; never set
    /// internally. Carried for parity with the reference cursor's fields.
    wait_row: bool,
    stereo_output: bool,

    pot_pos: u16,
    pattern: u8,
    row: u16,
    row_ticks: u8,
    /// 16.16 fixed-point accumulator of elapsed time within the current tick.
    tick_ms: u64,

    pattern_loop_begin: u16,
    pattern_loop_count: u8,
    pattern_loop_jump_now: bool,
    pattern_break_requested: bool,
    pattern_break_row: u16,
    position_jump_requested: bool,
    position_jump_pos: u16,
    pattern_delay: u8,
    pattern_delay_store: u8,

    last_autochannel: u8,

    playing_single_sample: bool,
    single_sample_ms_remaining: Option<u32>,
    single_sample_channel: u8,
}

impl<M: Mixer, E: Events> Player<M, E> {
    /// Build a player bound to the given mixer and event sink, with no song
    /// loaded.
    pub fn new(mixer: M, events: E) -> Self {
        Self {
            mixer,
            events,
            queue: CommandQueue::new(),
            song: None,
            channels: core::array::from_fn(|_| ChannelState::new()),
            vol_env: core::array::from_fn(|_| EnvelopeState::new()),
            pan_env: core::array::from_fn(|_| EnvelopeState::new()),
            playing: false,
            just_started: false,
            song_loop: true,
            pattern_loop: false,
            wait_row: false,
            stereo_output: true,
            pot_pos: 0,
            pattern: 0,
            row: 0,
            row_ticks: 0,
            tick_ms: 0,
            pattern_loop_begin: 0,
            pattern_loop_count: 0,
            pattern_loop_jump_now: false,
            pattern_break_requested: false,
            pattern_break_row: 0,
            position_jump_requested: false,
            position_jump_pos: 0,
            pattern_delay: 0,
            pattern_delay_store: 0,
            last_autochannel: 0,
            playing_single_sample: false,
            single_sample_ms_remaining: None,
            single_sample_channel: 0,
        }
    }

    /// Bind a new song, clearing all playback state. Does not start playback.
    pub fn set_song(&mut self, song: Song) {
        self.song = Some(song);
        self.playing = false;
        self.just_started = false;
        for ch in self.channels.iter_mut() {
            ch.reset();
        }
        self.vol_env = core::array::from_fn(|_| EnvelopeState::new());
        self.pan_env = core::array::from_fn(|_| EnvelopeState::new());
        self.pot_pos = 0;
        self.row = 0;
        self.pattern = 0;
        self.row_ticks = 0;
        self.tick_ms = 0;
        self.init_eff_state();
    }

    /// The currently bound song, if any.
    pub fn song(&self) -> Option<&Song> {
        self.song.as_ref()
    }

    /// The mixer this player drives. Useful for a host that wants to
    /// inspect accumulated state (e.g. a recording/simulation mixer) once
    /// playback has finished.
    pub fn mixer(&self) -> &M {
        &self.mixer
    }

    /// The event sink this player reports through.
    pub fn events(&self) -> &E {
        &self.events
    }

    /// Whether song playback (as opposed to a one-off sample preview) is
    /// currently running.
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Current `(pot_pos, pattern, row)`.
    pub fn position(&self) -> (u16, u8, u16) {
        (self.pot_pos, self.pattern, self.row)
    }

    /// Force mono output: panning is reported to the mixer as dead center
    /// regardless of per-channel panning or panning-envelope state.
    pub fn set_stereo_output(&mut self, stereo: bool) {
        self.stereo_output = stereo;
    }

    /// Queue an interactive command for the next `on_tick`.
    pub fn enqueue(&mut self, command: Command) {
        self.queue.push(command);
    }

    /// Start (or seek) song playback at `pot_pos`/`row`.
    pub fn play(&mut self, pot_pos: u16, row: u16, song_loop: bool) {
        if !self.playing {
            for ch in self.channels.iter_mut() {
                ch.active = Active::Off;
                ch.ms_left = None;
            }
        }
        self.pot_pos = pot_pos;
        self.row = row;
        self.pattern = self
            .song
            .as_ref()
            .and_then(|s| s.pot_entry(pot_pos))
            .unwrap_or(0);
        self.tick_ms = 0;
        self.row_ticks = 0;
        self.just_started = true;
        self.song_loop = song_loop;
        self.init_eff_state();
        self.playing = true;
    }

    /// Stop song playback. Idempotent: a second call before the pending
    /// fade completes is a no-op. Every active channel ramps to silence
    /// over [`FADE_OUT_MS`] rather than cutting immediately.
    pub fn stop(&mut self) {
        if !self.playing {
            return;
        }
        self.playing = false;
        for ch in self.channels.iter_mut() {
            ch.fade_active = true;
            ch.fade_ms_left = FADE_OUT_MS;
            ch.fade_target = 0;
            ch.porta_enabled = false;
            ch.porta_accumulator = 0;
            ch.porta_increment = 0;
            ch.porta_up = false;
            ch.vib_accumulator = 0;
            ch.vib_phase_increment = 0;
            ch.vib_depth = 0;
        }
        self.events.playback_stopped();
    }

    /// Toggle whether the current pattern repeats in place instead of
    /// advancing to the next POT entry.
    pub fn set_pattern_loop(&mut self, on: bool) {
        self.pattern_loop = on;
    }

    /// Trigger a note directly, independent of the song cursor.
    /// `channel == 255` auto-selects the highest free channel.
    pub fn play_note(&mut self, note: u8, volume: Option<u8>, channel: u8, instrument: u8) {
        let channel = self.resolve_channel(channel);
        let idx = channel as usize;
        if idx >= self.channels.len() {
            return;
        }

        self.channels[idx].porta_enabled = false;
        self.channels[idx].porta_accumulator = 0;
        self.channels[idx].porta_target = 0;
        self.channels[idx].porta_increment = 0;
        self.channels[idx].porta_up = false;

        let Some(song) = self.song.as_ref() else {
            return;
        };
        if self.playing && song.channel_muted(channel) {
            return;
        }
        let Some(inst) = song.instrument(instrument) else {
            return;
        };
        let Some(&sample_idx) = inst.note_samples.get(note as usize) else {
            return;
        };
        let Some(sample) = inst.samples.get(sample_idx as usize) else {
            return;
        };

        let vol = volume.unwrap_or(xm_ir::MAX_VOLUME);
        let channel_volume = (vol as u32 * sample.volume as u32 / 255) as u8;
        let ms_left = if sample.has_loop() {
            None
        } else {
            sample.play_length_ms(note, song.bpm)
        };
        let freq = xm_ir::realized_note(note, sample.rel_note, sample.finetune);
        let base_panning = sample.base_panning;
        let prev_sample_vol = sample.volume;
        let mixer_vol = scale_to_mixer(channel_volume);

        self.channels[idx].fade_active = false;
        self.channels[idx].instrument = instrument;
        self.channels[idx].sample = sample_idx;
        self.channels[idx].volume = channel_volume;
        self.channels[idx].fade_vol = channel_volume;
        self.channels[idx].prev_sample_vol = prev_sample_vol;
        self.channels[idx].note = Note::On(note);
        self.channels[idx].active = Active::On;
        self.channels[idx].panning = base_panning;
        self.channels[idx].released = false;
        self.channels[idx].ms_left = ms_left;

        self.vol_env[idx].reset();
        self.pan_env[idx].reset();

        self.mixer.start(channel, sample, freq, mixer_vol, base_panning);
    }

    /// Preview a single sample, independent of any instrument or song
    /// cursor. Always preempts whatever single sample (if any) is already
    /// previewing, emitting `sample_finished` for the preempted one only.
    pub fn play_sample(&mut self, instrument: u8, sample: u8, note: u8, volume: Option<u8>, channel: u8) {
        if self.playing_single_sample {
            self.mixer.stop(self.single_sample_channel);
            self.events.sample_finished();
            self.playing_single_sample = false;
        }

        let Some(song) = self.song.as_ref() else {
            return;
        };
        let Some(inst) = song.instrument(instrument) else {
            return;
        };
        let Some(smp) = inst.samples.get(sample as usize) else {
            return;
        };

        let vol = volume.unwrap_or(xm_ir::MAX_VOLUME);
        let channel_volume = (vol as u32 * smp.volume as u32 / 255) as u8;
        let freq = xm_ir::realized_note(note, smp.rel_note, smp.finetune);
        let base_panning = smp.base_panning;
        let mixer_vol = scale_to_mixer(channel_volume);
        let remaining = if smp.has_loop() {
            None
        } else {
            smp.play_length_ms(note, song.bpm)
        };

        self.playing_single_sample = true;
        self.single_sample_channel = channel;
        self.single_sample_ms_remaining = remaining;

        self.mixer.start(channel, smp, freq, mixer_vol, base_panning);
    }

    /// Fade out a single channel. `channel == 255` resolves to the last
    /// auto-selected channel. Immediate for a previewing single sample on
    /// that exact channel; a lazy anti-click fade for a song channel.
    pub fn stop_channel(&mut self, channel: u8) {
        let channel = if channel == AUTO_CHANNEL {
            self.last_autochannel
        } else {
            channel
        };
        let idx = channel as usize;
        if idx >= self.channels.len() {
            return;
        }

        if self.playing_single_sample && self.single_sample_channel == channel {
            self.mixer.stop(channel);
            self.events.sample_finished();
            self.playing_single_sample = false;
            return;
        }

        if self.channels[idx].active != Active::Off {
            self.channels[idx].fade_active = true;
            self.channels[idx].fade_ms_left = FADE_OUT_MS;
            self.channels[idx].fade_target = 0;
        }
    }

    /// Advance playback by `elapsed_ms` milliseconds of wall-clock time.
    /// The sole entry point a host needs to call periodically; everything
    /// else is driven from here.
    pub fn on_tick(&mut self, elapsed_ms: u32) {
        self.drain_queue();
        self.handle_fade(elapsed_ms);
        self.age_single_sample(elapsed_ms);

        let Some(song) = self.song.as_ref() else {
            return;
        };
        let ms_per_tick = song.ms_per_tick() as u64;
        let tempo = song.tempo;
        let n_channels = song.channels;

        self.tick_ms = self.tick_ms.saturating_add((elapsed_ms as u64) << 16);
        let ms_per_tick_fp = ms_per_tick << 16;
        let fade_fp = (FADE_OUT_MS as u64) << 16;

        if self.tick_ms + fade_fp >= ms_per_tick_fp {
            self.apply_pending_setvol();
            if self.row_ticks as u16 + 1 >= tempo as u16 {
                self.schedule_lookahead_fades(n_channels);
            }
        }

        self.age_channels(elapsed_ms);
        self.update_envelopes_and_volumes(elapsed_ms);

        if !self.playing {
            return;
        }

        if self.just_started {
            self.play_row();
            self.handle_effects();
            self.handle_tick_effects();
            self.just_started = false;
            self.events.row_updated(self.row);
        }

        if self.tick_ms >= ms_per_tick_fp {
            self.row_ticks += 1;
            if self.row_ticks >= tempo {
                self.advance_row(ms_per_tick_fp, n_channels);
            }
            self.tick_ms -= ms_per_tick_fp;
        }
    }

    fn advance_row(&mut self, ms_per_tick_fp: u64, n_channels: u8) {
        self.row_ticks = 0;
        if self.pattern_delay_store > 0 {
            self.pattern_delay = self.pattern_delay_store;
            self.pattern_delay_store = 0;
        }

        let (next_row, next_pot, finished) = self.calc_next_pos();
        if finished {
            self.stop();
            return;
        }

        let pot_changed = next_pot != self.pot_pos;
        self.row = next_row;
        self.pot_pos = next_pot;
        if let Some(song) = self.song.as_ref() {
            self.pattern = song.pot_entry(self.pot_pos).unwrap_or(self.pattern);
        }

        if self.wait_row {
            self.wait_row = false;
            self.stop();
            return;
        }

        if pot_changed {
            self.events.pot_position_updated(self.pot_pos);
        }

        self.finish_effects();

        if self.pattern_delay > 1 {
            self.pattern_delay -= 1;
        } else {
            self.pattern_delay = 0;
            self.play_row();
        }

        self.handle_effects();
        self.events.row_updated(self.row);
        if self.row == 0 {
            self.events.pot_position_updated(self.pot_pos);
        }

        self.handle_tick_effects();

        let _ = ms_per_tick_fp;
        for ch in 0..n_channels {
            let idx = ch as usize;
            self.channels[idx].prev_note = self.channels[idx].note;
        }
    }

    fn age_single_sample(&mut self, elapsed_ms: u32) {
        if !self.playing_single_sample {
            return;
        }
        let Some(remaining) = self.single_sample_ms_remaining else {
            return;
        };
        if elapsed_ms >= remaining {
            self.mixer.stop(self.single_sample_channel);
            self.events.sample_finished();
            self.playing_single_sample = false;
            self.single_sample_ms_remaining = None;
        } else {
            self.single_sample_ms_remaining = Some(remaining - elapsed_ms);
        }
    }

    fn age_channels(&mut self, elapsed_ms: u32) {
        for ch in self.channels.iter_mut() {
            if let Some(ms_left) = ch.ms_left {
                let remaining = ms_left.saturating_sub(elapsed_ms);
                ch.ms_left = Some(remaining);
                if remaining == 0 {
                    ch.active = Active::Off;
                }
            }
        }
    }

    fn schedule_lookahead_fades(&mut self, n_channels: u8) {
        let (next_row, next_pot, finished) = self.calc_next_pos();
        if finished {
            return;
        }
        let lookahead = self.row_cells_at(next_pot, next_row);
        for ch in 0..n_channels {
            let idx = ch as usize;
            if self.channels[idx].active == Active::Off || self.channels[idx].fade_active {
                continue;
            }
            let has_note = lookahead
                .get(idx)
                .map(|c| !matches!(c.note, Note::Empty))
                .unwrap_or(false);
            if has_note {
                self.channels[idx].fade_active = true;
                self.channels[idx].fade_ms_left = FADE_OUT_MS;
                self.channels[idx].fade_target = 0;
            }
        }
    }

    fn apply_pending_setvol(&mut self) {
        for ch in self.channels.iter_mut() {
            if ch.setvol_requested {
                ch.setvol_requested = false;
                ch.fade_active = true;
                ch.fade_ms_left = FADE_OUT_MS;
            }
        }
    }

    /// Linear interpolation in 20.12 fixed point between the channel's
    /// current volume and its fade target, run before anything else each
    /// tick so a fade scheduled on the previous tick is honored even while
    /// paused.
    fn handle_fade(&mut self, elapsed_ms: u32) {
        for ch in self.channels.iter_mut() {
            if !ch.fade_active {
                continue;
            }
            let ms_left = ch.fade_ms_left.saturating_sub(elapsed_ms);
            ch.fade_ms_left = ms_left;

            let target = ch.fade_target as i32;
            let current = ch.volume as i32;
            let diff = current - target;
            let slope = (diff << 12) / FADE_OUT_MS as i32;
            let fvolume = (target << 12) + slope * ms_left as i32;
            ch.fade_vol = (fvolume >> 12).clamp(0, 64) as u8;

            if ms_left == 0 {
                ch.fade_active = false;
                ch.volume = ch.fade_target;
                ch.fade_vol = ch.fade_target;
                if ch.fade_target == 0 {
                    ch.active = Active::ToBeDisabled;
                }
            }
        }
    }

    fn update_envelopes_and_volumes(&mut self, elapsed_ms: u32) {
        let Some((n_channels, bpm)) = self.song.as_ref().map(|s| (s.channels, s.bpm)) else {
            return;
        };
        for ch in 0..n_channels {
            let idx = ch as usize;
            let released = self.channels[idx].released;
            if let Some(song) = self.song.as_ref() {
                if let Some(inst) = song.instrument(self.channels[idx].instrument) {
                    self.vol_env[idx].advance(&inst.volume_envelope, elapsed_ms, bpm, released);
                    self.pan_env[idx].advance(&inst.panning_envelope, elapsed_ms, bpm, released);
                    self.channels[idx].env_vol = self.vol_env[idx].value(&inst.volume_envelope);
                    self.channels[idx].env_pan = self.pan_env[idx].value(&inst.panning_envelope);
                }
            }

            let base = self.channels[idx].volume as u32;
            let env = self.channels[idx].env_vol as u32;
            let fade = self.channels[idx].fade_vol as u32;
            let combined = ((base * env * fade) / (64 * 64)).min(64);
            let mixer_vol = scale_to_mixer(combined as u8);

            let pan_final = if self.stereo_output {
                let pan_base = self.channels[idx].panning as i32;
                let env_pan = self.channels[idx].env_pan as i32;
                (pan_base + (env_pan - 32) * 4).clamp(0, 255) as u8
            } else {
                128
            };

            match self.channels[idx].active {
                Active::Off => {}
                Active::ToBeDisabled => {
                    self.mixer.stop(ch);
                    self.channels[idx].active = Active::Off;
                }
                Active::On => {
                    self.mixer.set_volume(ch, mixer_vol);
                    self.mixer.set_panning(ch, pan_final);
                }
            }
        }
    }

    fn play_row(&mut self) {
        let cells = self.current_row_cells();
        for (idx, cell) in cells.iter().enumerate() {
            let is_tone_porta = cell.effect == Some(xm_ir::PORTA_TONE);
            let is_note_delay = cell.effect == Some(xm_ir::EXTENDED) && {
                let (sub, subparam) = xm_ir::split_extended(cell.effect_param);
                sub == xm_ir::EXT_NOTE_DELAY && subparam != 0
            };

            match cell.note {
                Note::On(note) => {
                    if let Some(inst0) = cell.instrument {
                        if !is_tone_porta && !is_note_delay {
                            self.play_note(note, cell.volume, idx as u8, inst0 + 1);
                        }
                    }
                }
                Note::Stop => {
                    self.channels[idx].released = true;
                    self.channels[idx].note = Note::Stop;
                }
                Note::Empty => {}
            }

            self.update_channel_vol(idx, cell.volume);
        }
    }

    fn update_channel_vol(&mut self, idx: usize, volume: Option<u8>) {
        let Some(vol) = volume else {
            return;
        };
        let prev_sample_vol = self.channels[idx].prev_sample_vol as u32;
        self.channels[idx].volume = (vol as u32 * prev_sample_vol / 255) as u8;
    }

    fn handle_effects(&mut self) {
        self.pattern_loop_jump_now = false;
        self.pattern_break_requested = false;
        self.position_jump_requested = false;

        let cells = self.current_row_cells();
        let mut pending_speed: Option<(bool, u8)> = None;

        for (idx, cell) in cells.iter().enumerate() {
            if let Some(effect) = cell.effect {
                self.apply_row_start_effect(idx, effect, cell.effect_param, &mut pending_speed);
            }
            if let Some(effect2) = cell.effect2 {
                self.apply_row_start_effect(idx, effect2, cell.effect2_param, &mut pending_speed);
            }
        }

        if let Some((is_bpm, value)) = pending_speed {
            if let Some(song) = self.song.as_mut() {
                if is_bpm {
                    song.bpm = value;
                } else {
                    song.tempo = value.max(1);
                }
            }
            if is_bpm {
                if let Some(song) = self.song.as_ref() {
                    self.tick_ms = (song.ms_per_tick() as u64) << 16;
                }
            }
        }
    }

    fn apply_row_start_effect(
        &mut self,
        idx: usize,
        effect: u8,
        param: u8,
        pending_speed: &mut Option<(bool, u8)>,
    ) {
        match effect {
            xm_ir::EXTENDED => {
                let (sub, subparam) = xm_ir::split_extended(param);
                match sub {
                    xm_ir::EXT_PATTERN_LOOP => {
                        if subparam == 0 {
                            self.pattern_loop_begin = self.row;
                        } else if self.pattern_loop_count > 0 {
                            self.pattern_loop_count -= 1;
                            if self.pattern_loop_count == 0 {
                                self.pattern_loop_begin = 0;
                            }
                        } else {
                            self.pattern_loop_count = subparam;
                        }
                        if self.pattern_loop_count > 0 {
                            self.pattern_loop_jump_now = true;
                        }
                    }
                    xm_ir::EXT_PATTERN_DELAY => {
                        if self.pattern_delay == 0 {
                            self.pattern_delay_store = subparam + 1;
                        }
                    }
                    xm_ir::EXT_FINE_VOLUME_UP => {
                        self.nudge_volume(idx, subparam as i16 * 2);
                    }
                    xm_ir::EXT_FINE_VOLUME_DOWN => {
                        self.nudge_volume(idx, -(subparam as i16) * 2);
                    }
                    _ => {}
                }
            }
            xm_ir::POSITION_JUMP => {
                self.pattern_break_requested = true;
                self.position_jump_requested = true;
                self.pattern_break_row = 0;
                self.position_jump_pos = param as u16;
            }
            xm_ir::SET_VOLUME => {
                let target = (param as u16 * 2).min(xm_ir::MAX_VOLUME as u16) as u8;
                self.channels[idx].setvol_requested = true;
                self.channels[idx].fade_target = target;
            }
            xm_ir::PATTERN_BREAK => {
                let newrow = (param >> 4) as u16 * 10 + (param & 0x0F) as u16;
                self.pattern_break_requested = true;
                self.pattern_break_row = newrow;
            }
            xm_ir::SET_SPEED_TEMPO => {
                *pending_speed = Some(if param < 0x20 { (false, param) } else { (true, param) });
            }
            xm_ir::PORTA_UP | xm_ir::PORTA_DOWN => {
                self.channels[idx].porta_increment = param as u32;
                if !self.channels[idx].porta_enabled {
                    self.channels[idx].porta_enabled = true;
                    if let Some(note) = note_value(self.channels[idx].note) {
                        if let Some((rel, fine)) = self.channel_tuning(idx) {
                            self.channels[idx].porta_accumulator = xm_ir::porta_seed(note, rel, fine);
                        }
                    }
                }
            }
            xm_ir::PORTA_TONE => {
                self.channels[idx].porta_increment = param as u32;
                if !self.channels[idx].porta_enabled {
                    self.channels[idx].porta_enabled = true;
                    let prev = note_value(self.channels[idx].prev_note);
                    let note = note_value(self.channels[idx].note);
                    if let (Some(prev_note), Some(note), Some((rel, fine))) =
                        (prev, note, self.channel_tuning(idx))
                    {
                        let seed = xm_ir::porta_seed(prev_note, rel, fine);
                        let target = xm_ir::porta_seed(note, rel, fine);
                        self.channels[idx].porta_accumulator = seed;
                        self.channels[idx].porta_target = target;
                        if target > seed {
                            self.channels[idx].porta_up = true;
                        } else if target < seed {
                            self.channels[idx].porta_up = false;
                        } else {
                            self.channels[idx].porta_increment = 0;
                        }
                    }
                }
            }
            xm_ir::VIBRATO => {
                let speed = (param >> 4) & 0x0F;
                let depth = param & 0x0F;
                if speed != 0 {
                    self.channels[idx].vib_phase_increment = vibrato::phase_increment(speed);
                }
                if depth != 0 {
                    self.channels[idx].vib_depth = depth;
                }
            }
            xm_ir::SET_PAN => {
                self.channels[idx].panning = param;
            }
            _ => {}
        }
    }

    fn nudge_volume(&mut self, idx: usize, delta: i16) {
        let target = (self.channels[idx].volume as i16 + delta).clamp(0, xm_ir::MAX_VOLUME as i16) as u8;
        self.channels[idx].setvol_requested = true;
        self.channels[idx].fade_target = target;
    }

    fn handle_tick_effects(&mut self) {
        let cells = self.current_row_cells();
        let row_ticks = self.row_ticks;

        for (idx, cell) in cells.iter().enumerate() {
            if let Some(effect) = cell.effect {
                self.apply_tick_effect(idx, effect, cell.effect_param, row_ticks);
            }
            if let Some(effect2) = cell.effect2 {
                self.apply_tick_effect(idx, effect2, cell.effect2_param, row_ticks);
            }
            self.channels[idx].prev_effect = self.channels[idx].effect;
            self.channels[idx].effect = cell.effect;
            self.channels[idx].effect_param = cell.effect_param;
        }
    }

    fn apply_tick_effect(&mut self, idx: usize, effect: u8, param: u8, row_ticks: u8) {
        match effect {
            xm_ir::ARPEGGIO => {
                if self.channels[idx].instrument == 0 {
                    return;
                }
                let Some(note) = note_value(self.channels[idx].note) else {
                    return;
                };
                let (hi, lo) = xm_ir::split_extended(param);
                let offset = match row_ticks % 3 {
                    0 => 0,
                    1 => hi,
                    _ => lo,
                };
                if let Some((rel, fine)) = self.channel_tuning(idx) {
                    let bent = xm_ir::clamp_note(note.saturating_add(offset));
                    let freq = xm_ir::bend(bent, rel, fine, 0);
                    self.mixer.set_frequency(idx as u8, freq);
                }
            }
            xm_ir::PORTA_UP => {
                let inc = self.channels[idx].porta_increment;
                let acc = (self.channels[idx].porta_accumulator + inc).min(xm_ir::PORTA_ACCUMULATOR_MAX);
                self.channels[idx].porta_accumulator = acc;
                let freq = xm_ir::frequency_from_porta_accumulator(acc);
                self.mixer.set_frequency(idx as u8, freq);
            }
            xm_ir::PORTA_DOWN => {
                let inc = self.channels[idx].porta_increment;
                let acc = self.channels[idx].porta_accumulator.saturating_sub(inc);
                self.channels[idx].porta_accumulator = acc;
                let freq = xm_ir::frequency_from_porta_accumulator(acc);
                self.mixer.set_frequency(idx as u8, freq);
            }
            xm_ir::PORTA_TONE => {
                let inc = self.channels[idx].porta_increment;
                let target = self.channels[idx].porta_target;
                let mut acc = self.channels[idx].porta_accumulator;
                if self.channels[idx].porta_up {
                    acc = (acc + inc).min(target);
                } else {
                    acc = acc.saturating_sub(inc).max(target);
                }
                acc = acc.clamp(0, xm_ir::PORTA_ACCUMULATOR_MAX);
                self.channels[idx].porta_accumulator = acc;
                let freq = xm_ir::frequency_from_porta_accumulator(acc);
                self.mixer.set_frequency(idx as u8, freq);
            }
            xm_ir::VIBRATO => {
                let Some(note) = note_value(self.channels[idx].note) else {
                    return;
                };
                let depth = param & 0x0F;
                if depth != 0 {
                    self.channels[idx].vib_depth = depth;
                }
                let phase = self.channels[idx].vib_accumulator;
                let fine = vibrato::offset(phase, self.channels[idx].vib_depth);
                if let Some((rel, fine_tune)) = self.channel_tuning(idx) {
                    let freq = xm_ir::bend(note, rel, fine_tune, fine);
                    self.mixer.set_frequency(idx as u8, freq);
                }
                self.channels[idx].vib_accumulator = self.channels[idx]
                    .vib_accumulator
                    .wrapping_add(self.channels[idx].vib_phase_increment);
            }
            xm_ir::EXTENDED => {
                let (sub, subparam) = xm_ir::split_extended(param);
                match sub {
                    xm_ir::EXT_NOTE_CUT => {
                        if subparam == row_ticks {
                            self.channels[idx].setvol_requested = true;
                            self.channels[idx].fade_target = 0;
                        }
                    }
                    xm_ir::EXT_NOTE_DELAY => {
                        if subparam == row_ticks {
                            self.trigger_delayed_note(idx);
                        }
                    }
                    _ => {}
                }
            }
            xm_ir::VOLUME_SLIDE => {
                if row_ticks == 0 {
                    return;
                }
                let (hi, lo) = xm_ir::split_extended(param);
                let speed: i16 = if param == 0 {
                    self.channels[idx].last_slide_speed
                } else if lo == 0 {
                    hi as i16 * 2
                } else {
                    -(lo as i16) * 2
                };
                self.channels[idx].last_slide_speed = speed;
                self.nudge_volume(idx, speed);
            }
            xm_ir::PANNING_SLIDE => {
                if row_ticks == 0 {
                    return;
                }
                let (hi, lo) = xm_ir::split_extended(param);
                let delta: i32 = if lo == 0 { hi as i32 } else { -(lo as i32) };
                let pan = (self.channels[idx].panning as i32 + delta * 4).clamp(0, 255) as u8;
                self.channels[idx].panning = pan;
            }
            _ => {}
        }
    }

    fn trigger_delayed_note(&mut self, idx: usize) {
        let cells = self.current_row_cells();
        let Some(cell) = cells.get(idx).copied() else {
            return;
        };
        if let (Note::On(note), Some(inst0)) = (cell.note, cell.instrument) {
            self.play_note(note, cell.volume, idx as u8, inst0 + 1);
        }
    }

    fn finish_effects(&mut self) {
        let cells = self.current_row_cells();
        for (idx, cell) in cells.iter().enumerate() {
            let old_effect = self.channels[idx].effect;
            if old_effect == cell.effect {
                continue;
            }
            let Some(old_effect) = old_effect else {
                continue;
            };
            match old_effect {
                xm_ir::ARPEGGIO => {
                    if let Some(note) = note_value(self.channels[idx].note) {
                        if let Some((rel, fine)) = self.channel_tuning(idx) {
                            let freq = xm_ir::bend(note, rel, fine, 0);
                            self.mixer.set_frequency(idx as u8, freq);
                        }
                    }
                }
                xm_ir::VIBRATO => {
                    self.channels[idx].vib_accumulator = 0;
                    self.channels[idx].vib_phase_increment = 0;
                    self.channels[idx].vib_depth = 0;
                }
                _ => {}
            }
        }
    }

    /// Computes where playback would go next without mutating any state,
    /// so it can be used both as a same-tick lookahead (for anti-click
    /// fades) and as the real advance a moment later.
    fn calc_next_pos(&self) -> (u16, u16, bool) {
        let Some(song) = self.song.as_ref() else {
            return (0, 0, true);
        };

        if self.pattern_delay > 1 {
            return (self.row, self.pot_pos, false);
        }
        if self.pattern_loop_jump_now {
            return (self.pattern_loop_begin, self.pot_pos, false);
        }
        if self.pattern_break_requested {
            let next_row = self.pattern_break_row;
            let next_pos = if self.position_jump_requested {
                self.position_jump_pos
            } else {
                self.pot_pos + 1
            };
            let next_pot = if next_pos < song.pot_length() {
                next_pos
            } else {
                song.restart_position
            };
            return (next_row, next_pot, false);
        }

        let pattern_len = song.pattern_at(self.pot_pos).map(|p| p.rows).unwrap_or(1);
        if self.row + 1 >= pattern_len {
            if self.pattern_loop {
                return (0, self.pot_pos, false);
            }
            if self.pot_pos + 1 < song.pot_length() {
                return (0, self.pot_pos + 1, false);
            }
            if self.song_loop {
                return (0, song.restart_position, false);
            }
            return (0, self.pot_pos, true);
        }

        (self.row + 1, self.pot_pos, false)
    }

    fn init_eff_state(&mut self) {
        self.pattern_loop_begin = 0;
        self.pattern_loop_count = 0;
        self.pattern_loop_jump_now = false;
        self.pattern_break_requested = false;
        self.position_jump_requested = false;
        self.pattern_break_row = 0;
        self.position_jump_pos = 0;
        self.pattern_delay_store = 0;
        self.pattern_delay = 0;
        for ch in self.channels.iter_mut() {
            ch.setvol_requested = false;
            ch.last_slide_speed = 0;
        }
    }

    fn resolve_channel(&mut self, channel: u8) -> u8 {
        if channel != AUTO_CHANNEL {
            return channel;
        }
        let n = self.song.as_ref().map(|s| s.channels).unwrap_or(0);
        let mut found = n.saturating_sub(1);
        for c in (0..n).rev() {
            if self.channels[c as usize].active == Active::Off {
                found = c;
                break;
            }
        }
        self.last_autochannel = found;
        found
    }

    fn channel_tuning(&self, idx: usize) -> Option<(i8, i8)> {
        let song = self.song.as_ref()?;
        let ch = &self.channels[idx];
        let inst = song.instrument(ch.instrument)?;
        let sample = inst.samples.get(ch.sample as usize)?;
        Some((sample.rel_note, sample.finetune))
    }

    fn row_cells_at(&self, pot_pos: u16, row: u16) -> RowCells {
        let mut cells = RowCells::new();
        let Some(song) = self.song.as_ref() else {
            return cells;
        };
        let Some(pattern) = song.pattern_at(pot_pos) else {
            return cells;
        };
        if row >= pattern.rows {
            return cells;
        }
        for &cell in pattern.row(row).iter().take(MAX_CH) {
            cells.push(cell);
        }
        cells
    }

    fn current_row_cells(&self) -> RowCells {
        self.row_cells_at(self.pot_pos, self.row)
    }

    fn drain_queue(&mut self) {
        let commands: Vec<Command> = self.queue.drain().collect();
        for command in commands {
            self.apply_command(command);
        }
    }

    fn apply_command(&mut self, command: Command) {
        match command {
            Command::Play { pot_pos, row, song_loop } => self.play(pot_pos, row, song_loop),
            Command::Stop => self.stop(),
            Command::PlayNote { note, volume, channel, instrument } => {
                self.play_note(note, volume, channel, instrument)
            }
            Command::StopChannel(c) => self.stop_channel(c),
            Command::SetPatternLoop(on) => self.pattern_loop = on,
            Command::PlaySample { instrument, sample, note, volume, channel } => {
                self.play_sample(instrument, sample, note, volume, channel)
            }
        }
    }
}

fn note_value(note: Note) -> Option<u8> {
    match note {
        Note::On(n) => Some(n),
        _ => None,
    }
}

/// Rescale a tracker-domain `0..=64` volume into the mixer's `0..=31`.
fn scale_to_mixer(volume_0_64: u8) -> u8 {
    ((volume_0_64 as u32 * 31 + 32) / 64).min(31) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use xm_ir::{Envelope, Instrument, LoopType, Pattern, Sample, SampleData, Song};

    #[derive(Default)]
    struct RecordingMixer {
        started: Vec<(u8, u32, u8, u8)>,
        frequencies: Vec<(u8, u32)>,
        volumes: Vec<(u8, u8)>,
        stopped: Vec<u8>,
    }

    impl Mixer for RecordingMixer {
        fn start(&mut self, channel: u8, _sample: &xm_ir::Sample, frequency: u32, volume: u8, panning: u8) {
            self.started.push((channel, frequency, volume, panning));
        }
        fn set_frequency(&mut self, channel: u8, frequency: u32) {
            self.frequencies.push((channel, frequency));
        }
        fn set_volume(&mut self, channel: u8, volume: u8) {
            self.volumes.push((channel, volume));
        }
        fn set_panning(&mut self, _channel: u8, _panning: u8) {}
        fn stop(&mut self, channel: u8) {
            self.stopped.push(channel);
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        rows: Vec<u16>,
        stops: u32,
        samples_finished: u32,
    }

    impl Events for RecordingEvents {
        fn row_updated(&mut self, row: u16) {
            self.rows.push(row);
        }
        fn playback_stopped(&mut self) {
            self.stops += 1;
        }
        fn sample_finished(&mut self) {
            self.samples_finished += 1;
        }
    }

    fn one_instrument_song(rows: u16, channels: u8) -> Song {
        let mut song = Song::new("t", channels);
        song.tempo = 6;
        song.bpm = 125;

        let mut inst = Instrument::new("lead");
        let mut sample = Sample::new("saw");
        sample.data = SampleData::Mono16(vec![0; 8363]);
        inst.samples.push(sample);
        inst.set_single_sample(0);
        song.instruments.push(inst);

        let pattern = Pattern::new(rows, channels);
        song.add_pattern(pattern);
        song.pot = vec![0];
        song.restart_position = 0;
        song
    }

    fn test_player() -> Player<RecordingMixer, RecordingEvents> {
        Player::new(RecordingMixer::default(), RecordingEvents::default())
    }

    #[test]
    fn play_note_starts_a_channel_and_primes_the_mixer() {
        let mut p = test_player();
        p.set_song(one_instrument_song(4, 4));
        p.play_note(48, None, 0, 1);

        assert_eq!(p.channels[0].active, Active::On);
        assert_eq!(p.mixer.started.len(), 1);
        assert_eq!(p.mixer.started[0].0, 0);
    }

    #[test]
    fn auto_channel_picks_highest_free_index() {
        let mut p = test_player();
        p.set_song(one_instrument_song(4, 4));
        p.play_note(48, None, AUTO_CHANNEL, 1);
        assert_eq!(p.last_autochannel, 3);
    }

    #[test]
    fn stop_schedules_a_fade_on_every_channel() {
        let mut p = test_player();
        p.set_song(one_instrument_song(4, 4));
        p.play(0, 0, true);
        p.play_note(48, None, 0, 1);
        p.stop();

        assert!(p.channels[0].fade_active);
        assert_eq!(p.channels[0].fade_target, 0);
        assert_eq!(p.events.stops, 1);
    }

    #[test]
    fn pattern_break_param_decodes_as_bcd() {
        let mut p = test_player();
        p.set_song(one_instrument_song(8, 2));
        p.row = 0;
        p.pot_pos = 0;
        p.apply_row_start_effect(0, xm_ir::PATTERN_BREAK, 0x12, &mut None);
        assert!(p.pattern_break_requested);
        assert_eq!(p.pattern_break_row, 12);
    }

    #[test]
    fn fade_reaches_target_and_disables_at_zero() {
        let mut p = test_player();
        p.set_song(one_instrument_song(4, 2));
        p.play_note(48, None, 0, 1);
        p.channels[0].fade_active = true;
        p.channels[0].fade_ms_left = FADE_OUT_MS;
        p.channels[0].fade_target = 0;

        for _ in 0..4 {
            p.handle_fade(FADE_OUT_MS / 4);
        }

        assert!(!p.channels[0].fade_active);
        assert_eq!(p.channels[0].volume, 0);
        assert_eq!(p.channels[0].active, Active::ToBeDisabled);
    }

    #[test]
    fn arpeggio_cycles_through_base_and_two_offsets() {
        let mut p = test_player();
        p.set_song(one_instrument_song(4, 1));
        p.play_note(48, None, 0, 1);
        p.mixer.frequencies.clear();

        p.apply_tick_effect(0, xm_ir::ARPEGGIO, 0x47, 0);
        p.apply_tick_effect(0, xm_ir::ARPEGGIO, 0x47, 1);
        p.apply_tick_effect(0, xm_ir::ARPEGGIO, 0x47, 2);

        assert_eq!(p.mixer.frequencies.len(), 3);
        let base = p.mixer.frequencies[0].1;
        let up_four = p.mixer.frequencies[1].1;
        let up_seven = p.mixer.frequencies[2].1;
        assert!(up_four > base);
        assert!(up_seven > up_four);
    }

    #[test]
    fn porta_up_advances_and_clamps_the_accumulator() {
        let mut p = test_player();
        p.set_song(one_instrument_song(4, 1));
        p.play_note(24, None, 0, 1);
        p.channels[0].porta_increment = xm_ir::PORTA_ACCUMULATOR_MAX;
        p.channels[0].porta_accumulator = xm_ir::PORTA_ACCUMULATOR_MAX - 10;

        p.apply_tick_effect(0, xm_ir::PORTA_UP, 0xFF, 1);
        assert_eq!(p.channels[0].porta_accumulator, xm_ir::PORTA_ACCUMULATOR_MAX);
    }

    #[test]
    fn key_off_releases_the_envelope() {
        let mut p = test_player();
        let mut song = one_instrument_song(4, 1);
        let mut env = Envelope::new();
        env.enabled = true;
        env.add_point(0, 64);
        env.add_point(10, 0);
        env.sustain = Some(0);
        song.instruments[0].volume_envelope = env;
        p.set_song(song);

        p.play_note(48, None, 0, 1);
        assert!(!p.channels[0].released);

        p.channels[0].note = Note::Stop;
        p.channels[0].released = true;
        p.update_envelopes_and_volumes(20);
        assert!(p.channels[0].env_vol <= 64);
    }

    #[test]
    fn running_off_the_end_without_loop_stops_and_notifies() {
        let mut p = test_player();
        let mut song = one_instrument_song(1, 1);
        song.pot = vec![0];
        p.set_song(song);
        p.play(0, 0, false);

        for _ in 0..(p.song().unwrap().tempo as u32 + 2) {
            p.on_tick(p.song().unwrap().ms_per_tick());
        }

        assert!(!p.is_playing());
        assert!(p.events.stops >= 1);
    }
}

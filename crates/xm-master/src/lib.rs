//! Headless controller for XM playback.
//!
//! Glues `xm-format` (load/save), `xm-ir` (the data model), and `xm-engine`
//! (the tick-driven [`Player`]) together behind a small API a host — CLI,
//! GUI, test harness — can drive without touching the engine's `Mixer`/
//! `Events` traits directly.
//!
//! `Controller` ships a [`SimulationMixer`] rather than a real audio
//! backend: per spec.md's scope, the hardware mixer is an external
//! collaborator modeled only as the `xm_engine::Mixer` trait. A host with
//! real audio hardware implements that trait itself and drives
//! `xm_engine::Player` directly, bypassing `Controller`.

mod simulation;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use xm_engine::{Command, Events, Player};

pub use simulation::{SimulationMixer, SimulationReport};
pub use xm_format::XmError;
pub use xm_ir::Song;

/// Nominal tick period the background playback thread drives `Player` at,
/// matching spec.md §6's "periodic callback at 1 kHz" time source.
const TICK_PERIOD: Duration = Duration::from_millis(1);

/// Headless tracker controller — owns a song and manages playback.
pub struct Controller {
    song: Song,
    playback: Option<PlaybackHandle>,
}

struct PlaybackHandle {
    commands: Sender<Command>,
    stop_signal: Arc<AtomicBool>,
    position: Arc<PositionState>,
    thread: Option<JoinHandle<()>>,
}

/// Snapshot of where playback currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaybackPosition {
    /// Pattern order table position.
    pub pot_pos: u16,
    /// Pattern index at that POT position.
    pub pattern: u8,
    /// Row within that pattern.
    pub row: u16,
}

#[derive(Default)]
struct PositionState {
    pot_pos: AtomicU16,
    pattern: AtomicU8,
    row: AtomicU16,
    samples_finished: AtomicU32,
    finished: AtomicBool,
}

/// [`Events`] sink for the background playback thread: updates the shared
/// atomics a [`Controller`] reads from, and forwards diagnostic text
/// through `log` (replacing the original's cross-CPU debug message with a
/// normal logging call).
struct PositionEvents {
    state: Arc<PositionState>,
}

impl Events for PositionEvents {
    fn playback_stopped(&mut self) {
        self.state.finished.store(true, Ordering::Relaxed);
        log::info!("playback stopped");
    }

    fn sample_finished(&mut self) {
        self.state.samples_finished.fetch_add(1, Ordering::Relaxed);
    }

    fn debug(&mut self, message: &str) {
        log::debug!("{message}");
    }
}

impl Controller {
    /// A controller with an empty 4-channel song and no playback active.
    pub fn new() -> Self {
        Self {
            song: Song::new("Untitled", 4),
            playback: None,
        }
    }

    // --- Song management ---

    /// The currently loaded song.
    pub fn song(&self) -> &Song {
        &self.song
    }

    /// Load an XM file from disk, replacing the current song. Stops any
    /// active playback first.
    pub fn load_xm_file(&mut self, path: impl AsRef<Path>) -> Result<(), XmError> {
        self.stop();
        self.song = xm_format::load_xm_file(path)?;
        log::info!(
            "loaded '{}': {} channels, {} patterns, {} instruments",
            self.song.name,
            self.song.channels,
            self.song.patterns.len(),
            self.song.instruments.len()
        );
        Ok(())
    }

    /// Load an XM file already read into memory, replacing the current song.
    pub fn load_xm(&mut self, data: &[u8]) -> Result<(), XmError> {
        self.stop();
        self.song = xm_format::load_xm(data)?;
        Ok(())
    }

    /// Save the current song as an XM file at `path`.
    pub fn save_xm_file(&self, path: impl AsRef<Path>) -> Result<(), XmError> {
        xm_format::save_xm_file(path, &self.song)
    }

    /// Mute or unmute a channel for subsequent playback.
    pub fn set_channel_muted(&mut self, channel: u8, muted: bool) {
        self.song.set_channel_muted(channel, muted);
    }

    // --- Real-time playback ---

    /// Start playback on a background thread, ticking the engine at
    /// roughly 1 kHz. Stops any playback already in progress first.
    pub fn play(&mut self) {
        self.stop();

        let song = self.song.clone();
        let (tx, rx) = mpsc::channel();
        let stop_signal = Arc::new(AtomicBool::new(false));
        let position = Arc::new(PositionState::default());

        let stop = stop_signal.clone();
        let pos = position.clone();
        let thread = std::thread::spawn(move || playback_thread(song, rx, stop, pos));

        log::info!("playback started");
        self.playback = Some(PlaybackHandle {
            commands: tx,
            stop_signal,
            position,
            thread: Some(thread),
        });
    }

    /// Stop playback. Idempotent — calling it with nothing playing is a
    /// no-op. Joins the background thread before returning.
    pub fn stop(&mut self) {
        if let Some(mut pb) = self.playback.take() {
            pb.stop_signal.store(true, Ordering::Relaxed);
            if let Some(handle) = pb.thread.take() {
                let _ = handle.join();
            }
        }
    }

    /// Whether the background playback thread is still running a song.
    pub fn is_playing(&self) -> bool {
        self.playback
            .as_ref()
            .is_some_and(|p| !p.position.finished.load(Ordering::Relaxed))
    }

    /// Current playback position, if playback is active.
    pub fn position(&self) -> Option<PlaybackPosition> {
        let pb = self.playback.as_ref()?;
        if pb.position.finished.load(Ordering::Relaxed) {
            return None;
        }
        Some(PlaybackPosition {
            pot_pos: pb.position.pot_pos.load(Ordering::Relaxed),
            pattern: pb.position.pattern.load(Ordering::Relaxed),
            row: pb.position.row.load(Ordering::Relaxed),
        })
    }

    /// Number of sample previews that have finished since playback began.
    pub fn samples_finished(&self) -> u32 {
        self.playback
            .as_ref()
            .map(|p| p.position.samples_finished.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // --- Interactive commands, serialized into the playback thread ---

    /// Trigger a note directly on a channel, independent of the song
    /// cursor. Posted as a command; has no effect if nothing is playing.
    pub fn play_note(&mut self, note: u8, channel: u8, instrument: u8) {
        self.post(Command::PlayNote {
            note,
            volume: None,
            channel,
            instrument,
        });
    }

    /// Fade out a single channel immediately.
    pub fn stop_channel(&mut self, channel: u8) {
        self.post(Command::StopChannel(channel));
    }

    /// Toggle whether the current pattern repeats instead of advancing.
    pub fn set_pattern_loop(&mut self, on: bool) {
        self.post(Command::SetPatternLoop(on));
    }

    fn post(&self, command: Command) {
        if let Some(pb) = &self.playback {
            let _ = pb.commands.send(command);
        }
    }

    // --- Offline simulation ---

    /// Run the engine synchronously (no background thread, no real time)
    /// for up to `budget_ms` of simulated wall-clock time, in 1 ms steps.
    /// Used for headless inspection and testing rather than live playback;
    /// see [`SimulationReport`] for what it reports.
    pub fn simulate(&self, budget_ms: u32) -> SimulationReport {
        simulation::run(&self.song, budget_ms)
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

fn playback_thread(
    song: Song,
    commands: mpsc::Receiver<Command>,
    stop_signal: Arc<AtomicBool>,
    position: Arc<PositionState>,
) {
    let mixer = SimulationMixer::default();
    let events = PositionEvents {
        state: position.clone(),
    };
    let mut player = Player::new(mixer, events);
    player.set_song(song);
    player.play(0, 0, true);

    let mut last = Instant::now();
    while !stop_signal.load(Ordering::Relaxed) {
        while let Ok(command) = commands.try_recv() {
            player.enqueue(command);
        }

        let now = Instant::now();
        let elapsed = now.duration_since(last).as_millis().min(u32::MAX as u128) as u32;
        last = now;
        player.on_tick(elapsed);

        if !player.is_playing() {
            position.finished.store(true, Ordering::Relaxed);
            break;
        }

        let (pot_pos, pattern, row) = player.position();
        position.pot_pos.store(pot_pos, Ordering::Relaxed);
        position.pattern.store(pattern, Ordering::Relaxed);
        position.row.store(row, Ordering::Relaxed);

        std::thread::sleep(TICK_PERIOD);
    }
}

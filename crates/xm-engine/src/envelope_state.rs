//! Runtime cursor for an [`xm_ir::Envelope`].
//!
//! One of these lives per playing channel per envelope (volume, panning).
//! The envelope definition itself is shared, immutable data owned by the
//! `Instrument`; this is the only part of it that varies per note.

use xm_ir::Envelope;

/// Per-channel envelope playback cursor.
///
/// Envelope point x-values are in tracker ticks, not milliseconds, so the
/// cursor only steps once per elapsed `ms_per_tick = 2500 / bpm`; `ms_acc`
/// carries the remainder of `elapsed_ms` that hasn't yet accumulated to a
/// full tick (matching the original's `updateEnvelopePos(bpm, elapsed_ms,
/// ...)`, which scales its advance by bpm the same way).
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvelopeState {
    tick: u16,
    ms_acc: u32,
}

impl EnvelopeState {
    /// A cursor at the start of the envelope.
    pub fn new() -> Self {
        Self { tick: 0, ms_acc: 0 }
    }

    /// Restart at tick 0, as done whenever a channel triggers a new note.
    pub fn reset(&mut self) {
        self.tick = 0;
        self.ms_acc = 0;
    }

    /// Advance the cursor by `elapsed_ms` of wall-clock time at the song's
    /// current `bpm`, stepping the envelope forward by one tracker tick for
    /// every `2500 / bpm` milliseconds that elapse (carrying any remainder
    /// in `ms_acc` to the next call).
    ///
    /// While `note_released` is false the cursor holds at the envelope's
    /// sustain point rather than passing it. Once released, it continues
    /// and, absent a loop, clamps at the envelope's last point.
    pub fn advance(&mut self, envelope: &Envelope, elapsed_ms: u32, bpm: u8, note_released: bool) {
        if !envelope.enabled || envelope.points.is_empty() {
            return;
        }

        let ms_per_tick = (2500 / bpm.max(1) as u32).max(1);
        self.ms_acc = self.ms_acc.saturating_add(elapsed_ms);
        while self.ms_acc >= ms_per_tick {
            self.ms_acc -= ms_per_tick;
            self.step(envelope, note_released);
        }
    }

    fn step(&mut self, envelope: &Envelope, note_released: bool) {
        if !note_released {
            if let Some(sustain_tick) = sustain_tick(envelope) {
                if self.tick >= sustain_tick {
                    self.tick = sustain_tick;
                    return;
                }
            }
        }

        self.tick = self.tick.saturating_add(1);

        if let (Some(start), Some(end)) = loop_ticks(envelope) {
            if end > start && self.tick >= end {
                self.tick = start;
            }
        } else {
            let last = envelope.last_tick();
            if self.tick > last {
                self.tick = last;
            }
        }
    }

    /// Current interpolated amplitude, `0..=64` for volume or `0..=255`
    /// range conventions applied by the caller for panning.
    pub fn value(&self, envelope: &Envelope) -> u8 {
        envelope.value_at(self.tick)
    }
}

fn sustain_tick(envelope: &Envelope) -> Option<u16> {
    envelope
        .points
        .get(envelope.sustain? as usize)
        .map(|p| p.tick)
}

fn loop_ticks(envelope: &Envelope) -> (Option<u16>, Option<u16>) {
    let start = envelope
        .loop_start
        .and_then(|i| envelope.points.get(i as usize))
        .map(|p| p.tick);
    let end = envelope
        .loop_end
        .and_then(|i| envelope.points.get(i as usize))
        .map(|p| p.tick);
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sawtooth() -> Envelope {
        let mut env = Envelope::new();
        env.enabled = true;
        env.add_point(0, 64);
        env.add_point(10, 0);
        env
    }

    // bpm=125 gives ms_per_tick = 2500/125 = 20, so one `advance` call per
    // tick matches the tests' original per-call-equals-one-tick assumptions.
    const BPM: u8 = 125;
    const MS_PER_TICK: u32 = 20;

    #[test]
    fn advances_while_held() {
        let env = sawtooth();
        let mut state = EnvelopeState::new();
        for _ in 0..5 {
            state.advance(&env, MS_PER_TICK, BPM, false);
        }
        assert_eq!(state.value(&env), 32);
    }

    #[test]
    fn clamps_at_end_without_loop() {
        let env = sawtooth();
        let mut state = EnvelopeState::new();
        for _ in 0..50 {
            state.advance(&env, MS_PER_TICK, BPM, false);
        }
        assert_eq!(state.value(&env), 0);
    }

    #[test]
    fn holds_at_sustain_until_released() {
        let mut env = sawtooth();
        env.sustain = Some(0);
        let mut state = EnvelopeState::new();
        for _ in 0..20 {
            state.advance(&env, MS_PER_TICK, BPM, false);
        }
        assert_eq!(state.value(&env), 64);

        state.advance(&env, MS_PER_TICK, BPM, true);
        state.advance(&env, MS_PER_TICK, BPM, true);
        assert!(state.value(&env) < 64);
    }

    #[test]
    fn loops_between_loop_points() {
        let mut env = Envelope::new();
        env.enabled = true;
        env.add_point(0, 0);
        env.add_point(10, 64);
        env.add_point(20, 0);
        env.loop_start = Some(0);
        env.loop_end = Some(2);

        let mut state = EnvelopeState::new();
        for _ in 0..25 {
            state.advance(&env, MS_PER_TICK, BPM, false);
        }
        // Having looped back past tick 20, we're somewhere inside 0..20.
        assert!(state.value(&env) <= 64);
    }

    #[test]
    fn partial_elapsed_time_does_not_advance_a_full_tick() {
        let env = sawtooth();
        let mut state = EnvelopeState::new();
        state.advance(&env, MS_PER_TICK - 1, BPM, false);
        assert_eq!(state.value(&env), 64);
    }

    #[test]
    fn accumulated_partial_ticks_carry_across_calls() {
        let env = sawtooth();
        let mut state = EnvelopeState::new();
        for _ in 0..10 {
            state.advance(&env, MS_PER_TICK / 2, BPM, false);
        }
        assert_eq!(state.value(&env), 32);
    }
}

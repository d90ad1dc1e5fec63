//! XM (FastTracker II) file format codec.
//!
//! Bit-exact with the FT2 1.04/1.03 binary layout: a little-endian header,
//! a fixed 256-byte pattern order table, magic-byte-packed pattern rows,
//! instrument envelopes, and delta-encoded 8-/16-bit sample data.
//!
//! Grounded byte-for-byte in `XMTransport::load`/`XMTransport::save`.

use std::io::{Read, Write};
use std::path::Path;
use std::vec::Vec;

use xm_ir::{
    Cell, Envelope, Instrument, LoopType, Note, Pattern, Sample, SampleData, Song, ARPEGGIO,
    EXTENDED, MAX_CHANNELS, MAX_ENVELOPE_POINTS, MAX_PATTERN_LENGTH, MAX_VOLUME, NOTE_MAP_LEN,
    PANNING_SLIDE, PORTA_TONE, SET_PAN, VIBRATO, VOLUME_SLIDE,
};

use crate::XmError;

/// Upper bound on an XM file we'll attempt to load, a sanity guard against
/// hostile or corrupt input rather than a real format limit.
const MAX_XM_FILE_SIZE: usize = 64 * 1024 * 1024;

const MAGIC: &[u8; 17] = b"Extended Module: ";

// ---------------------------------------------------------------------------
// XmReader — cursor over a byte slice
// ---------------------------------------------------------------------------

struct XmReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> XmReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn skip(&mut self, n: usize) -> Result<(), XmError> {
        if self.pos + n > self.data.len() {
            return Err(XmError::PatternReadError);
        }
        self.pos += n;
        Ok(())
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], XmError> {
        if self.pos + n > self.data.len() {
            return Err(XmError::PatternReadError);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, XmError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_i8(&mut self) -> Result<i8, XmError> {
        Ok(self.read_u8()? as i8)
    }

    fn read_u16_le(&mut self) -> Result<u16, XmError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32_le(&mut self) -> Result<u32, XmError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

// ---------------------------------------------------------------------------
// XmWriter — append-only byte buffer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct XmWriter {
    buf: Vec<u8>,
}

impl XmWriter {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn i8(&mut self, v: i8) {
        self.buf.push(v as u8);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    fn zeros(&mut self, n: usize) {
        self.buf.resize(self.buf.len() + n, 0);
    }

    /// Write `s` truncated/zero-padded to exactly `len` bytes.
    fn fixed_str(&mut self, s: &str, len: usize) {
        let bytes = s.as_bytes();
        let n = bytes.len().min(len);
        self.bytes(&bytes[..n]);
        self.zeros(len - n);
    }
}

/// Trims a fixed-width name field at its first NUL and at trailing spaces.
fn ascii_trimmed(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let trimmed_len = bytes[..end]
        .iter()
        .rposition(|&b| b != b' ')
        .map(|i| i + 1)
        .unwrap_or(0);
    String::from_utf8_lossy(&bytes[..trimmed_len]).into_owned()
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Load a complete [`Song`] from an in-memory XM file.
pub fn load_xm(data: &[u8]) -> Result<Song, XmError> {
    if data.is_empty() {
        return Err(XmError::ZeroByteFile);
    }
    if data.len() > MAX_XM_FILE_SIZE {
        return Err(XmError::FileTooLarge);
    }

    let mut r = XmReader::new(data);

    if r.read_bytes(17)? != MAGIC {
        return Err(XmError::BadMagic);
    }

    let name = ascii_trimmed(r.read_bytes(20)?);
    r.skip(21)?; // 0x1A byte + 20-byte tracker name, uninteresting

    let version = r.read_u16_le()?;
    let _header_size = r.read_u32_le()?;
    let pot_size = r.read_u16_le()?;
    let restart_position = r.read_u16_le()?;
    let n_channels = r.read_u16_le()?;
    let n_patterns = r.read_u16_le()?;
    let n_inst = r.read_u16_le()?;
    let _flags = r.read_u16_le()?; // bit0 = linear freq table; the Amiga table is not supported

    let mut tempo = r.read_u16_le()?;
    if tempo == 0 {
        log::warn!("XM file has tempo=0, coercing to 1");
        tempo = 1;
    }
    let bpm = r.read_u16_le()?;

    let channels = n_channels.min(MAX_CHANNELS as u16) as u8;
    let mut song = Song::new(&name, channels);
    song.tempo = tempo as u8;
    song.bpm = bpm.max(1).min(u8::MAX as u16) as u8;
    song.restart_position = restart_position;

    let pot_len = (pot_size as usize).min(256);
    let mut pot = Vec::with_capacity(pot_len);
    for _ in 0..pot_len {
        pot.push(r.read_u8()?);
    }
    r.skip(256 - pot_len)?;
    song.pot = pot;

    log::debug!(
        "loading XM '{}': {} channels, {} patterns, {} instruments",
        song.name,
        channels,
        n_patterns,
        n_inst
    );

    for _ in 0..n_patterns {
        let pattern = load_pattern(&mut r, version, channels)?;
        song.add_pattern(pattern);
    }

    for _ in 0..n_inst {
        let instrument = load_instrument(&mut r)?;
        song.instruments.push(instrument);
    }

    Ok(song)
}

/// Read the file at `path` and load it as an XM song.
pub fn load_xm_file(path: impl AsRef<Path>) -> Result<Song, XmError> {
    let mut file = std::fs::File::open(path.as_ref()).map_err(XmError::OpenFailed)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data).map_err(XmError::OpenFailed)?;
    load_xm(&data)
}

fn load_pattern(r: &mut XmReader<'_>, version: u16, channels: u8) -> Result<Pattern, XmError> {
    let _pattern_header_length = r.read_u32_le()?;
    r.skip(1)?; // packing type, always 0

    let n_rows = if version == 0x104 || version == 0x103 {
        r.read_u16_le()?
    } else {
        r.read_u8()? as u16 + 1
    };

    if n_rows > MAX_PATTERN_LENGTH {
        return Err(XmError::PatternTooLong {
            rows: n_rows,
            max: MAX_PATTERN_LENGTH,
        });
    }

    let patterndata_size = r.read_u16_le()?;
    let mut pattern = Pattern::new(n_rows, channels);

    if patterndata_size > 0 {
        let body = r.read_bytes(patterndata_size as usize)?;
        decode_pattern_rows(body, &mut pattern)?;
    }

    Ok(pattern)
}

fn decode_pattern_rows(data: &[u8], pattern: &mut Pattern) -> Result<(), XmError> {
    let mut pos = 0usize;
    let channels = pattern.channels;

    let mut next = |pos: &mut usize| -> Result<u8, XmError> {
        let v = *data.get(*pos).ok_or(XmError::PatternReadError)?;
        *pos += 1;
        Ok(v)
    };

    for row in 0..pattern.rows {
        for chn in 0..channels {
            let magic = next(&mut pos)?;

            let (read_note, read_inst, read_vol, read_eff_type, read_eff_param, mut raw_note);
            if magic & 0x80 != 0 {
                read_note = magic & 0x01 != 0;
                read_inst = magic & 0x02 != 0;
                read_vol = magic & 0x04 != 0;
                read_eff_type = magic & 0x08 != 0;
                read_eff_param = magic & 0x10 != 0;
                raw_note = 0;
            } else {
                // The byte itself is the note.
                read_note = false;
                read_inst = true;
                read_vol = true;
                read_eff_type = true;
                read_eff_param = true;
                raw_note = magic;
            }

            if read_note {
                raw_note = next(&mut pos)?;
            }
            let raw_inst = if read_inst { next(&mut pos)? } else { 0 };
            let raw_vol = if read_vol { next(&mut pos)? } else { 0 };
            let raw_eff_type = if read_eff_type {
                Some(next(&mut pos)?)
            } else if read_eff_param {
                // Param with no type byte: assume arpeggio, per the reference.
                Some(ARPEGGIO)
            } else {
                None
            };
            let raw_eff_param = if read_eff_param { next(&mut pos)? } else { 0 };

            let cell = pattern.cell_mut(row, chn);
            cell.note = match raw_note {
                0 => Note::Empty,
                97 => Note::Stop,
                1..=96 => Note::On(raw_note - 1),
                _ => Note::Empty,
            };
            cell.instrument = if raw_inst == 0 {
                None
            } else {
                Some(raw_inst - 1)
            };
            cell.effect = raw_eff_type;
            cell.effect_param = if raw_eff_type.is_some() { raw_eff_param } else { 0 };

            decode_volume_column(raw_vol, cell);
        }
    }

    Ok(())
}

/// Splits an XM volume-column byte into a direct volume or a secondary
/// effect, per the XM standard volume-column table.
///
/// The reference's decoder has a duplicated `0xD0..=0xDF` branch for both
/// pan-slide directions, making slide-right unreachable. This implements
/// the fixed split instead: `0xD0..=0xDF` slides left, `0xE0..=0xEF` slides
/// right.
fn decode_volume_column(vol: u8, cell: &mut Cell) {
    match vol {
        0x00 => {}
        0x10..=0x50 => {
            let v = ((vol as u16 - 0x10) * 2).min(MAX_VOLUME as u16) as u8;
            cell.volume = Some(v);
        }
        0x60..=0x6F => {
            cell.effect2 = Some(VOLUME_SLIDE);
            cell.effect2_param = vol & 0x0F;
        }
        0x70..=0x7F => {
            cell.effect2 = Some(VOLUME_SLIDE);
            cell.effect2_param = (vol & 0x0F) << 4;
        }
        0x80..=0x8F => {
            cell.effect2 = Some(EXTENDED);
            cell.effect2_param = 0xB0 | (vol & 0x0F);
        }
        0x90..=0x9F => {
            cell.effect2 = Some(EXTENDED);
            cell.effect2_param = 0xA0 | (vol & 0x0F);
        }
        0xA0..=0xAF => {
            cell.effect2 = Some(VIBRATO);
            cell.effect2_param = (vol & 0x0F) << 4;
        }
        0xB0..=0xBF => {
            cell.effect2 = Some(VIBRATO);
            cell.effect2_param = vol & 0x0F;
        }
        0xC0..=0xCF => {
            cell.effect2 = Some(SET_PAN);
            cell.effect2_param = (vol & 0x0F) << 4;
        }
        0xD0..=0xDF => {
            cell.effect2 = Some(PANNING_SLIDE);
            cell.effect2_param = vol & 0x0F;
        }
        0xE0..=0xEF => {
            cell.effect2 = Some(PANNING_SLIDE);
            cell.effect2_param = (vol & 0x0F) << 4;
        }
        0xF0..=0xFF => {
            cell.effect2 = Some(PORTA_TONE);
            cell.effect2_param = (vol & 0x0F) << 4;
        }
        _ => {}
    }
}

fn load_instrument(r: &mut XmReader<'_>) -> Result<Instrument, XmError> {
    let inst_size = r.read_u32_le()?;
    let name = ascii_trimmed(r.read_bytes(22)?);
    let _inst_type = r.read_u8()?;
    let n_samples = r.read_u16_le()?;

    let mut instrument = Instrument::new(&name);

    if n_samples == 0 {
        // Consumed 4 + 22 + 1 + 2 = 29 bytes so far.
        r.skip((inst_size as i64 - 29).max(0) as usize)?;
        return Ok(instrument);
    }

    let _sample_header_size = r.read_u32_le()?;

    let note_samples = r.read_bytes(NOTE_MAP_LEN)?;
    instrument.note_samples.copy_from_slice(note_samples);

    let mut vol_points_raw = [0u16; 24];
    for slot in vol_points_raw.iter_mut() {
        *slot = r.read_u16_le()?;
    }
    let mut pan_points_raw = [0u16; 24];
    for slot in pan_points_raw.iter_mut() {
        *slot = r.read_u16_le()?;
    }

    let n_vol_points = r.read_u8()?;
    let n_pan_points = r.read_u8()?;
    let vol_sustain = r.read_u8()?;
    let vol_loop_start = r.read_u8()?;
    let vol_loop_end = r.read_u8()?;
    let pan_sustain = r.read_u8()?;
    let pan_loop_start = r.read_u8()?;
    let pan_loop_end = r.read_u8()?;
    let vol_type = r.read_u8()?;
    let pan_type = r.read_u8()?;
    r.skip(4)?; // vibrato type/sweep/depth/rate: instrument auto-vibrato, not modeled
    let volume_fadeout = r.read_u16_le()?;
    r.skip(11)?; // reserved

    instrument.volume_fadeout = volume_fadeout;

    fill_envelope(
        &mut instrument.volume_envelope,
        &vol_points_raw,
        n_vol_points,
        vol_type,
        vol_sustain,
        vol_loop_start,
        vol_loop_end,
    );
    fill_envelope(
        &mut instrument.panning_envelope,
        &pan_points_raw,
        n_pan_points,
        pan_type,
        pan_sustain,
        pan_loop_start,
        pan_loop_end,
    );

    // Consumed 29 + 223 = 252 bytes; the rest of the declared header is
    // skipped relative to `inst_size` to tolerate longer/nested headers.
    r.skip((inst_size as i64 - 252).max(0) as usize)?;

    let mut headers = Vec::with_capacity(n_samples as usize);
    for _ in 0..n_samples {
        let length = r.read_u32_le()?;
        let loop_start = r.read_u32_le()?;
        let loop_length = r.read_u32_le()?;
        let volume = r.read_u8()?;
        let finetune = r.read_i8()?;
        let type_byte = r.read_u8()?;
        let panning = r.read_u8()?;
        let rel_note = r.read_i8()?;
        r.skip(1)?; // reserved byte
        let name = ascii_trimmed(r.read_bytes(22)?);
        headers.push(RawSampleHeader {
            length,
            loop_start,
            loop_length,
            volume,
            finetune,
            type_byte,
            panning,
            rel_note,
            name,
        });
    }

    for header in &headers {
        instrument.samples.push(load_sample_data(r, header)?);
    }

    Ok(instrument)
}

struct RawSampleHeader {
    length: u32,
    loop_start: u32,
    loop_length: u32,
    volume: u8,
    finetune: i8,
    type_byte: u8,
    panning: u8,
    rel_note: i8,
    name: String,
}

fn load_sample_data(r: &mut XmReader<'_>, header: &RawSampleHeader) -> Result<Sample, XmError> {
    let is_16bit = header.type_byte & 0x10 != 0;
    let mut loop_type = match header.type_byte & 0x03 {
        1 => LoopType::Forward,
        2 => LoopType::PingPong,
        _ => LoopType::None,
    };
    if header.loop_length == 0 {
        loop_type = LoopType::None;
    }

    let volume = if header.volume >= 64 {
        255
    } else {
        (header.volume as u16 * 4).min(255) as u8
    };

    let raw = r.read_bytes(header.length as usize)?;

    let mut sample = Sample::new(&header.name);
    sample.volume = volume;
    sample.base_panning = header.panning;
    sample.panning = header.panning;
    sample.rel_note = header.rel_note;
    sample.finetune = header.finetune;
    sample.loop_type = loop_type;

    if is_16bit {
        let mut frames: Vec<i16> = Vec::new();
        frames
            .try_reserve_exact(raw.len() / 2)
            .map_err(|_| XmError::OutOfMemory)?;
        let mut last: i16 = 0;
        for chunk in raw.chunks_exact(2) {
            let delta = i16::from_le_bytes([chunk[0], chunk[1]]);
            let value = delta.wrapping_add(last);
            frames.push(value);
            last = value;
        }
        sample.loop_start = header.loop_start / 2;
        sample.loop_length = header.loop_length / 2;
        sample.data = SampleData::Mono16(frames);
    } else {
        let mut frames: Vec<i8> = Vec::new();
        frames
            .try_reserve_exact(raw.len())
            .map_err(|_| XmError::OutOfMemory)?;
        let mut last: i8 = 0;
        for &b in raw {
            let value = (b as i8).wrapping_add(last);
            frames.push(value);
            last = value;
        }
        sample.loop_start = header.loop_start;
        sample.loop_length = header.loop_length;
        sample.data = SampleData::Mono8(frames);
    }

    Ok(sample)
}

fn fill_envelope(
    envelope: &mut Envelope,
    points_raw: &[u16; 24],
    n_points: u8,
    type_byte: u8,
    sustain: u8,
    loop_start: u8,
    loop_end: u8,
) {
    envelope.enabled = type_byte & 0x01 != 0;
    let has_sustain = type_byte & 0x02 != 0;
    let has_loop = type_byte & 0x04 != 0;

    let n = (n_points as usize).min(MAX_ENVELOPE_POINTS);
    for i in 0..n {
        let tick = points_raw[2 * i];
        let value = points_raw[2 * i + 1].min(MAX_VOLUME as u16) as u8;
        envelope.add_point(tick, value);
    }

    envelope.sustain = has_sustain.then_some(sustain);
    envelope.loop_start = has_loop.then_some(loop_start);
    envelope.loop_end = has_loop.then_some(loop_end);
}

// ---------------------------------------------------------------------------
// Save
// ---------------------------------------------------------------------------

/// Save `song` into a complete in-memory XM file, bit-exact to FT2 1.04
/// except where documented normalizations apply (volume 0 collapses to
/// `NONE`, trailing sample-name spaces are stripped, volume-column effects
/// are re-packed from `effect2`).
pub fn save_xm(song: &Song) -> Result<Vec<u8>, XmError> {
    let mut w = XmWriter::new();

    w.bytes(MAGIC);
    w.fixed_str(&song.name, 20);
    w.u8(0x1A);
    w.fixed_str("NitroTracker", 20);
    w.u16(0x0104);
    w.u32(0x0114);
    w.u16(song.pot_length());
    w.u16(song.restart_position);
    w.u16(song.channels as u16);
    w.u16(song.patterns.len() as u16);
    w.u16(song.instruments.len() as u16);
    w.u16(1); // flags: linear frequency table
    w.u16(song.tempo as u16);
    w.u16(song.bpm as u16);

    let mut pot = [0u8; 256];
    for (slot, &entry) in pot.iter_mut().zip(song.pot.iter()) {
        *slot = entry;
    }
    w.bytes(&pot);

    for pattern in &song.patterns {
        write_pattern(&mut w, pattern);
    }
    for instrument in &song.instruments {
        write_instrument(&mut w, instrument)?;
    }

    Ok(w.buf)
}

/// Save `song` as an XM file at `path`.
pub fn save_xm_file(path: impl AsRef<Path>, song: &Song) -> Result<(), XmError> {
    let data = save_xm(song)?;
    let mut file = std::fs::File::create(path.as_ref()).map_err(map_write_error)?;
    file.write_all(&data).map_err(map_write_error)?;
    Ok(())
}

fn map_write_error(err: std::io::Error) -> XmError {
    if err.kind() == std::io::ErrorKind::StorageFull {
        XmError::DiskFull
    } else {
        XmError::OpenFailed(err)
    }
}

fn write_pattern(w: &mut XmWriter, pattern: &Pattern) {
    w.u32(9); // pattern header length, fixed
    w.u8(0); // packing type, always 0
    w.u16(pattern.rows);

    let mut body = XmWriter::new();
    for row in 0..pattern.rows {
        for cell in pattern.row(row) {
            encode_cell(&mut body, cell);
        }
    }

    w.u16(body.buf.len() as u16);
    w.bytes(&body.buf);
}

fn encode_cell(w: &mut XmWriter, cell: &Cell) {
    let write_note = cell.note != Note::Empty;
    let write_instrument = cell.instrument.is_some();
    let write_volume = cell.volume.is_some() || cell.effect2.is_some();
    let write_effect = cell.effect.is_some();
    // effect_param always travels with its effect in this model.
    let write_effect_param = write_effect;

    let magic = (write_note as u8)
        | (write_instrument as u8) << 1
        | (write_volume as u8) << 2
        | (write_effect as u8) << 3
        | (write_effect_param as u8) << 4;

    if magic != 0b1_1111 {
        w.u8(magic | 0x80);
    }

    if write_note {
        let raw_note = match cell.note {
            Note::Empty => 0,
            Note::Stop => 97,
            Note::On(n) => n + 1,
        };
        w.u8(raw_note);
    }
    if let Some(inst) = cell.instrument {
        w.u8(inst + 1);
    }
    if write_volume {
        let volbyte = match cell.volume {
            Some(vol) => (((vol as u16 + 1) / 2) + 16).min(0x50) as u8,
            None => encode_volume_effect(cell.effect2, cell.effect2_param),
        };
        w.u8(volbyte);
    }
    if let Some(effect) = cell.effect {
        w.u8(effect);
    }
    if write_effect_param {
        w.u8(cell.effect_param);
    }
}

fn encode_volume_effect(effect2: Option<u8>, param: u8) -> u8 {
    match effect2 {
        Some(e) if e == VOLUME_SLIDE => {
            if param > 0x0F {
                0x70 | (param >> 4)
            } else {
                0x60 | (param & 0x0F)
            }
        }
        Some(e) if e == EXTENDED => {
            if param & 0xF0 == 0xA0 {
                0x90 | (param & 0x0F)
            } else if param & 0xF0 == 0xB0 {
                0x80 | (param & 0x0F)
            } else {
                0
            }
        }
        Some(e) if e == VIBRATO => {
            if param > 0x0F {
                0xA0 | (param >> 4)
            } else {
                0xB0 | (param & 0x0F)
            }
        }
        Some(e) if e == SET_PAN => 0xC0 | (param >> 4),
        Some(e) if e == PANNING_SLIDE => {
            if param > 0x0F {
                0xE0 | (param >> 4)
            } else {
                0xD0 | (param & 0x0F)
            }
        }
        Some(e) if e == PORTA_TONE => 0xF0 | (param >> 4),
        _ => 0,
    }
}

fn write_instrument(w: &mut XmWriter, instrument: &Instrument) -> Result<(), XmError> {
    w.u32(0x107);
    w.fixed_str(&instrument.name, 22);
    w.u8(0);
    w.u16(instrument.samples.len() as u16);

    if instrument.samples.is_empty() {
        w.zeros(0x107 - 29);
        return Ok(());
    }

    w.u32(0x28);
    w.bytes(&instrument.note_samples);

    let mut vol_points = [0u16; 24];
    for (i, point) in instrument
        .volume_envelope
        .points
        .iter()
        .enumerate()
        .take(MAX_ENVELOPE_POINTS)
    {
        vol_points[2 * i] = point.tick;
        vol_points[2 * i + 1] = point.value as u16;
    }
    for v in vol_points {
        w.u16(v);
    }

    let mut pan_points = [0u16; 24];
    for (i, point) in instrument
        .panning_envelope
        .points
        .iter()
        .enumerate()
        .take(MAX_ENVELOPE_POINTS)
    {
        pan_points[2 * i] = point.tick;
        pan_points[2 * i + 1] = point.value as u16;
    }
    for v in pan_points {
        w.u16(v);
    }

    w.u8(instrument.volume_envelope.points.len() as u8);
    w.u8(instrument.panning_envelope.points.len() as u8);
    w.u8(instrument.volume_envelope.sustain.unwrap_or(0));
    w.u8(instrument.volume_envelope.loop_start.unwrap_or(0));
    w.u8(instrument.volume_envelope.loop_end.unwrap_or(0));
    w.u8(instrument.panning_envelope.sustain.unwrap_or(0));
    w.u8(instrument.panning_envelope.loop_start.unwrap_or(0));
    w.u8(instrument.panning_envelope.loop_end.unwrap_or(0));
    w.u8(envelope_type_byte(&instrument.volume_envelope));
    w.u8(envelope_type_byte(&instrument.panning_envelope));

    w.zeros(4); // vibrato type/sweep/depth/rate, not modeled
    w.u16(instrument.volume_fadeout);
    w.zeros(11); // reserved

    // 252 bytes written so far; pad out to the declared 0x107 header size.
    w.zeros(0x107 - 252);

    for sample in &instrument.samples {
        write_sample_header(w, sample);
    }
    for sample in &instrument.samples {
        write_sample_data(w, sample)?;
    }
    Ok(())
}

fn envelope_type_byte(envelope: &Envelope) -> u8 {
    let mut flags = 0u8;
    if envelope.enabled {
        flags |= 0x01;
    }
    if envelope.sustain.is_some() {
        flags |= 0x02;
    }
    if envelope.loop_start.is_some() {
        flags |= 0x04;
    }
    flags
}

fn write_sample_header(w: &mut XmWriter, sample: &Sample) {
    let is_16bit = sample.data.is_16bit();
    let (byte_length, loop_start, loop_length) = if is_16bit {
        (
            sample.n_samples() * 2,
            sample.loop_start * 2,
            sample.loop_length * 2,
        )
    } else {
        (sample.n_samples(), sample.loop_start, sample.loop_length)
    };

    w.u32(byte_length);
    w.u32(loop_start);
    w.u32(loop_length);
    w.u8(((sample.volume as u16 + 1) / 4) as u8);
    w.i8(sample.finetune);

    let mut type_byte = match sample.loop_type {
        LoopType::None => 0,
        LoopType::Forward => 1,
        LoopType::PingPong => 2,
    };
    if is_16bit {
        type_byte |= 1 << 4;
    }
    w.u8(type_byte);

    w.u8(sample.base_panning);
    w.i8(sample.rel_note);
    w.u8(0x80); // reserved byte, matches the reference's filler
    w.fixed_str(&sample.name, 22);
}

/// Delta-encode and append one sample's PCM data to `w`.
///
/// Tries to reserve the whole encoded size up front for a single
/// contiguous write; if that allocation fails (a large sample on a
/// memory-constrained target), falls back to growing the output buffer
/// one byte at a time so the save can still complete rather than failing
/// outright, per spec.md §4.5/§7.
fn write_sample_data(w: &mut XmWriter, sample: &Sample) -> Result<(), XmError> {
    let byte_len = match &sample.data {
        SampleData::Mono8(frames) => frames.len(),
        SampleData::Mono16(frames) => frames.len() * 2,
    };

    if w.buf.try_reserve(byte_len).is_ok() {
        write_sample_data_bytes(w, sample);
        Ok(())
    } else {
        write_sample_data_byte_at_a_time(w, sample)
    }
}

fn write_sample_data_bytes(w: &mut XmWriter, sample: &Sample) {
    match &sample.data {
        SampleData::Mono8(frames) => {
            let mut last = 0i8;
            for &v in frames {
                w.u8(v.wrapping_sub(last) as u8);
                last = v;
            }
        }
        SampleData::Mono16(frames) => {
            let mut last = 0i16;
            for &v in frames {
                w.u16(v.wrapping_sub(last) as u16);
                last = v;
            }
        }
    }
}

fn write_sample_data_byte_at_a_time(w: &mut XmWriter, sample: &Sample) -> Result<(), XmError> {
    match &sample.data {
        SampleData::Mono8(frames) => {
            let mut last = 0i8;
            for &v in frames {
                w.buf.try_reserve(1).map_err(|_| XmError::OutOfMemory)?;
                w.u8(v.wrapping_sub(last) as u8);
                last = v;
            }
        }
        SampleData::Mono16(frames) => {
            let mut last = 0i16;
            for &v in frames {
                w.buf.try_reserve(2).map_err(|_| XmError::OutOfMemory)?;
                w.u16(v.wrapping_sub(last) as u16);
                last = v;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_song() -> Song {
        let mut song = Song::new("test song", 4);
        song.tempo = 6;
        song.bpm = 125;
        let mut pattern = Pattern::new(16, 4);
        pattern.cell_mut(0, 0).note = Note::On(48);
        pattern.cell_mut(0, 0).instrument = Some(0);
        pattern.cell_mut(0, 0).volume = Some(40);
        song.add_pattern(pattern);
        song.pot = vec![0];

        let mut inst = Instrument::new("kick");
        let mut sample = Sample::new("kick.8");
        sample.data = SampleData::Mono8(vec![0, 10, -5, 3, 3, -20, 0]);
        inst.samples.push(sample);
        inst.set_single_sample(0);
        song.instruments.push(inst);

        song
    }

    #[test]
    fn round_trips_a_minimal_song() {
        let song = minimal_song();
        let bytes = save_xm(&song).unwrap();
        let loaded = load_xm(&bytes).unwrap();

        assert_eq!(loaded.name.as_str(), "test song");
        assert_eq!(loaded.tempo, 6);
        assert_eq!(loaded.bpm, 125);
        assert_eq!(loaded.channels, 4);
        assert_eq!(loaded.patterns.len(), 1);
        assert_eq!(loaded.pot, vec![0]);

        let cell = loaded.patterns[0].cell(0, 0);
        assert_eq!(cell.note, Note::On(48));
        assert_eq!(cell.instrument, Some(0));
        assert_eq!(cell.volume, Some(40));

        assert_eq!(loaded.instruments.len(), 1);
        let data = match &loaded.instruments[0].samples[0].data {
            SampleData::Mono8(v) => v.clone(),
            _ => panic!("expected 8-bit sample"),
        };
        assert_eq!(data, vec![0, 10, -5, 3, 3, -20, 0]);
    }

    #[test]
    fn rejects_zero_byte_file() {
        assert!(matches!(load_xm(&[]), Err(XmError::ZeroByteFile)));
    }

    #[test]
    fn rejects_bad_magic() {
        let data = vec![0u8; 64];
        assert!(matches!(load_xm(&data), Err(XmError::BadMagic)));
    }

    #[test]
    fn pattern_longer_than_max_is_rejected() {
        let mut song = minimal_song();
        song.patterns[0] = Pattern::new(MAX_PATTERN_LENGTH, 4);
        let bytes = save_xm(&song).unwrap();
        // Patch the row-count field of the (only) pattern header to exceed
        // MAX_PATTERN_LENGTH, simulating a malformed file.
        let ptn_header_offset = 80 + 256; // fixed header fields + full POT block
        let row_count_offset = ptn_header_offset + 5;
        let mut corrupted = bytes.clone();
        let too_many = (MAX_PATTERN_LENGTH + 1).to_le_bytes();
        corrupted[row_count_offset] = too_many[0];
        corrupted[row_count_offset + 1] = too_many[1];

        assert!(matches!(
            load_xm(&corrupted),
            Err(XmError::PatternTooLong { .. })
        ));
    }

    #[test]
    fn empty_pattern_round_trips_with_declared_row_count() {
        let mut song = minimal_song();
        song.patterns[0] = Pattern::new(32, 4);
        let bytes = save_xm(&song).unwrap();
        let loaded = load_xm(&bytes).unwrap();
        assert_eq!(loaded.patterns[0].rows, 32);
        assert!(loaded.patterns[0].cell(5, 2).is_empty());
    }

    #[test]
    fn tempo_zero_in_file_is_coerced_to_one() {
        let mut song = minimal_song();
        song.tempo = 0;
        // save_xm always emits the song's live tempo field (non-zero by
        // construction elsewhere); simulate a raw file with 0 directly.
        let mut bytes = save_xm(&song).unwrap();
        let tempo_offset = 17 + 20 + 21 + 2 + 4 + 2 + 2 + 2 + 2 + 2 + 2;
        bytes[tempo_offset] = 0;
        bytes[tempo_offset + 1] = 0;

        let loaded = load_xm(&bytes).unwrap();
        assert_eq!(loaded.tempo, 1);
    }

    #[test]
    fn volume_column_panning_slide_is_split_not_duplicated() {
        let mut cell = Cell::empty();
        decode_volume_column(0xD5, &mut cell);
        assert_eq!(cell.effect2, Some(PANNING_SLIDE));
        assert_eq!(cell.effect2_param, 0x05);

        let mut cell2 = Cell::empty();
        decode_volume_column(0xE5, &mut cell2);
        assert_eq!(cell2.effect2, Some(PANNING_SLIDE));
        assert_eq!(cell2.effect2_param, 0x50);
    }

    #[test]
    fn sample_delta_round_trips() {
        let mut w = XmWriter::new();
        let original: Vec<i16> = vec![0, 1000, -500, 32000, -32000, 0, 17];
        let sample = Sample {
            data: SampleData::Mono16(original.clone()),
            ..Sample::new("x")
        };
        write_sample_data(&mut w, &sample).unwrap();

        let mut last = 0i16;
        let mut decoded = Vec::new();
        for chunk in w.buf.chunks_exact(2) {
            let delta = i16::from_le_bytes([chunk[0], chunk[1]]);
            let value = delta.wrapping_add(last);
            decoded.push(value);
            last = value;
        }
        assert_eq!(decoded, original);
    }

    #[test]
    fn sample_delta_round_trips_on_the_byte_at_a_time_fallback() {
        let mut w = XmWriter::new();
        let original: Vec<i16> = vec![0, 1000, -500, 32000, -32000, 0, 17];
        let sample = Sample {
            data: SampleData::Mono16(original.clone()),
            ..Sample::new("x")
        };
        write_sample_data_byte_at_a_time(&mut w, &sample).unwrap();

        let mut last = 0i16;
        let mut decoded = Vec::new();
        for chunk in w.buf.chunks_exact(2) {
            let delta = i16::from_le_bytes([chunk[0], chunk[1]]);
            let value = delta.wrapping_add(last);
            decoded.push(value);
            last = value;
        }
        assert_eq!(decoded, original);
    }

    #[test]
    fn volume_above_max_is_clamped_on_load() {
        let mut cell = Cell::empty();
        decode_volume_column(0x50, &mut cell);
        assert_eq!(cell.volume, Some(MAX_VOLUME));
    }
}

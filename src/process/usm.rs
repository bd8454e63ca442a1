//! USM (SofDec2) demultiplexer and builder.
//!
//! A USM is a flat run of 0x20-aligned packets. The first must be a CRID
//! header packet whose @UTF payload (`CRIUSF_DIR_STREAM`) declares every
//! stream as a `(stmid, chno)` pair; payload packets then concatenate
//! into those streams, kind-1/3 packets carry @UTF metadata, and kind-2
//! packets close sections with fixed 32-byte sentinels.
//!
//! Payload scrambling derives three 0x20-byte masks from a 64-bit key.
//! The demux direction applies them in 8-byte words, the mux direction
//! byte-wise; the pair is asymmetric and stays that way until a golden
//! vector says otherwise.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use anyhow::Context;
use log::{debug, warn};

use crate::structs::adx::AdxHeader;
use crate::structs::chunk::{
    ALP_MAGIC, CRID_MAGIC, PacketKind, SBT_MAGIC, SFA_MAGIC, SFV_MAGIC, USM_STREAM_MAGICS,
    UsmPacketHeader,
};
use crate::structs::hca::Hca;
use crate::structs::ivf::Ivf;
use crate::structs::utf::{CellValue, UtfBuilder, UtfTable};
use crate::utils::bytes::ByteReader;
use crate::utils::errors::{CriError, Result};

const HEADER_END: &[u8; 32] = b"#HEADER END     ===============\x00";
const METADATA_END: &[u8; 32] = b"#METADATA END   ===============\x00";
const CONTENTS_END: &[u8; 32] = b"#CONTENTS END   ===============\x00";

const FMTVER: u32 = 16_777_984;
const AUDIO_MINBUF: u32 = 27_860;
/// Audio packet cadence is pinned to NTSC 29.97 regardless of video fps.
const AUDIO_FPS: f64 = 29.97;

pub const AUDIO_CODEC_ADX: u64 = 2;
pub const AUDIO_CODEC_HCA: u64 = 4;

/// XOR masks derived from a 64-bit USM key.
#[derive(Debug, Clone)]
pub struct UsmKey {
    video_mask1: [u8; 0x20],
    video_mask2: [u8; 0x20],
    audio_mask: [u8; 0x20],
}

impl UsmKey {
    pub fn new(key: u64) -> Self {
        let key1 = ((key & 0xFFFF_FFFF) as u32).to_be_bytes();
        let key2 = ((key >> 32) as u32).to_be_bytes();

        let mut t = [0u8; 0x20];
        t[0x00] = key1[3];
        t[0x01] = key1[2];
        t[0x02] = key1[1];
        t[0x03] = key1[0].wrapping_sub(0x34);
        t[0x04] = key2[3].wrapping_add(0xF9);
        t[0x05] = key2[2] ^ 0x13;
        t[0x06] = key2[1].wrapping_add(0x61);
        t[0x07] = key1[3] ^ 0xFF;
        t[0x08] = key1[1].wrapping_add(key1[2]);
        t[0x09] = t[0x01].wrapping_sub(t[0x07]);
        t[0x0A] = t[0x02] ^ 0xFF;
        t[0x0B] = t[0x01] ^ 0xFF;
        t[0x0C] = t[0x0B].wrapping_add(t[0x09]);
        t[0x0D] = t[0x08].wrapping_sub(t[0x03]);
        t[0x0E] = t[0x0D] ^ 0xFF;
        t[0x0F] = t[0x0A].wrapping_sub(t[0x0B]);
        t[0x10] = t[0x08].wrapping_sub(t[0x0F]);
        t[0x11] = t[0x10] ^ t[0x07];
        t[0x12] = t[0x0F] ^ 0xFF;
        t[0x13] = t[0x03] ^ 0x10;
        t[0x14] = t[0x04].wrapping_sub(0x32);
        t[0x15] = t[0x05].wrapping_add(0xED);
        t[0x16] = t[0x06] ^ 0xF3;
        t[0x17] = t[0x13].wrapping_sub(t[0x0F]);
        t[0x18] = t[0x15].wrapping_add(t[0x07]);
        t[0x19] = 0x21u8.wrapping_sub(t[0x13]);
        t[0x1A] = t[0x14] ^ t[0x17];
        t[0x1B] = t[0x16].wrapping_add(t[0x16]);
        t[0x1C] = t[0x17].wrapping_add(0x44);
        t[0x1D] = t[0x03].wrapping_add(t[0x04]);
        t[0x1E] = t[0x05].wrapping_sub(t[0x16]);
        t[0x1F] = t[0x1D] ^ t[0x13];

        let mut video_mask2 = [0u8; 0x20];
        for (dst, src) in video_mask2.iter_mut().zip(&t) {
            *dst = !*src;
        }
        let mut audio_mask = [0u8; 0x20];
        for (x, dst) in audio_mask.iter_mut().enumerate() {
            *dst = if x & 1 == 1 {
                b"URUC"[(x >> 1) & 3]
            } else {
                video_mask2[x]
            };
        }

        Self {
            video_mask1: t,
            video_mask2,
            audio_mask,
        }
    }

    /// Demux-direction video descramble: 8-byte words past the first
    /// 0x40 bytes; bodies of 0x200 bytes or less stay untouched.
    pub fn video_unmask(&self, packet: &mut [u8]) {
        if packet.len() <= 0x240 {
            return;
        }
        let body = &mut packet[0x40..];
        let words = body.len() / 8;

        let mut mask = to_words(&self.video_mask2);
        let vmask = to_words(&self.video_mask2);
        for i in 32..words {
            let w = word_at(body, i) ^ mask[i % 4];
            mask[i % 4] = w ^ vmask[i % 4];
            set_word(body, i, w);
        }

        let mut mask = to_words(&self.video_mask1);
        for i in 0..32 {
            mask[i % 4] ^= word_at(body, i + 32);
            set_word(body, i, word_at(body, i) ^ mask[i % 4]);
        }
    }

    /// Mux-direction video scramble: byte-granular over the whole body.
    pub fn video_mask(&self, packet: &mut [u8]) {
        if packet.len() <= 0x240 {
            return;
        }
        let body = &mut packet[0x40..];

        let mut mask = self.video_mask1;
        for i in 0..0x100 {
            mask[i % 32] ^= body[i + 0x100];
            body[i] ^= mask[i % 32];
        }

        let mut mask = self.video_mask2;
        for i in 0x100..body.len() {
            let plain = body[i];
            body[i] ^= mask[i % 32];
            mask[i % 32] = plain ^ self.video_mask2[i % 32];
        }
    }

    /// Demux-direction audio descramble: 8-byte words past 0x140.
    pub fn audio_unmask(&self, packet: &mut [u8]) {
        if packet.len() <= 0x140 {
            return;
        }
        let body = &mut packet[0x140..];
        let mask = to_words(&self.audio_mask);
        for i in 0..body.len() / 8 {
            set_word(body, i, word_at(body, i) ^ mask[i % 4]);
        }
    }

    /// Mux-direction audio scramble: byte-granular past 0x140.
    pub fn audio_mask(&self, packet: &mut [u8]) {
        if packet.len() <= 0x140 {
            return;
        }
        for (i, b) in packet[0x140..].iter_mut().enumerate() {
            *b ^= self.audio_mask[i % 32];
        }
    }
}

fn to_words(mask: &[u8; 0x20]) -> [u64; 4] {
    let mut out = [0u64; 4];
    for (i, w) in out.iter_mut().enumerate() {
        *w = u64::from_le_bytes(mask[i * 8..i * 8 + 8].try_into().unwrap());
    }
    out
}

fn word_at(data: &[u8], index: usize) -> u64 {
    u64::from_le_bytes(data[index * 8..index * 8 + 8].try_into().unwrap())
}

fn set_word(data: &mut [u8], index: usize, value: u64) {
    data[index * 8..index * 8 + 8].copy_from_slice(&value.to_le_bytes());
}

/// One logical stream reassembled from payload packets.
#[derive(Debug, Clone)]
pub struct UsmStream {
    pub stmid: [u8; 4],
    pub channel: u8,
    pub filename: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DemuxedUsm {
    pub crid: UtfTable,
    pub streams: Vec<UsmStream>,
    /// Header/metadata tables in packet order (VIDEO_HDRINFO,
    /// AUDIO_HDRINFO, VIDEO_SEEKINFO, AUDIO_HEADER, ...).
    pub metadata: Vec<UtfTable>,
}

impl DemuxedUsm {
    pub fn stream(&self, stmid: &[u8; 4], channel: u8) -> Option<&UsmStream> {
        self.streams
            .iter()
            .find(|s| s.stmid == *stmid && s.channel == channel)
    }

    /// Writes each stream under `dir` using its sanitized declared
    /// filename; SBT streams come out as SRT text.
    pub fn extract_to_dir(&self, dir: &Path) -> anyhow::Result<()> {
        for (index, stream) in self.streams.iter().enumerate() {
            if stream.data.is_empty() {
                continue;
            }
            let name = sanitize_filename(&stream.filename);
            let name = if name.is_empty() {
                format!("stream_{index}.bin")
            } else {
                name
            };
            if stream.stmid == *SBT_MAGIC {
                for (langid, srt) in sbt_to_srt(&stream.data)? {
                    let out = dir.join(format!("{name}_{langid}.srt"));
                    std::fs::write(&out, srt)
                        .with_context(|| format!("writing {}", out.display()))?;
                }
                continue;
            }
            let out = dir.join(name);
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            std::fs::write(&out, &stream.data)
                .with_context(|| format!("writing {}", out.display()))?;
        }
        Ok(())
    }
}

/// Strips drive prefixes, parent-directory escapes and characters that
/// cannot land on disk, keeping any interior path structure.
fn sanitize_filename(name: &str) -> String {
    let mut name = name.to_owned();
    for sep in [":\\", ":/"] {
        if let Some(pos) = name.find(sep) {
            name = name[pos + sep.len()..].to_owned();
        }
    }
    for sep in ["../", "..\\"] {
        if let Some(pos) = name.rfind(sep) {
            name = name[pos + sep.len()..].to_owned();
        }
    }
    name.chars()
        .filter(|c| !matches!(c, ':' | '?' | '*' | '<' | '>' | '|' | '"'))
        .map(|c| if c == '\\' { '/' } else { c })
        .collect()
}

#[derive(Debug)]
pub struct Usm {
    data: Vec<u8>,
    key: Option<UsmKey>,
}

impl Usm {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 || &data[..4] != CRID_MAGIC {
            return Err(CriError::InvalidMagic {
                expected: CRID_MAGIC,
                actual: data.get(..4).unwrap_or_default().to_vec(),
            });
        }
        Ok(Self {
            data: data.to_vec(),
            key: None,
        })
    }

    /// Enables payload descrambling (ADX audio and video packets).
    pub fn with_key(mut self, key: u64) -> Self {
        self.key = Some(UsmKey::new(key));
        self
    }

    pub fn demux(&self) -> Result<DemuxedUsm> {
        let data = &self.data;
        let mut r = ByteReader::new(data);

        let first = UsmPacketHeader::read(&mut r)?;
        if first.magic != *CRID_MAGIC || first.kind != PacketKind::HeaderInfo {
            return Err(CriError::invalid("USM does not open with a CRID header", 0));
        }
        let payload = packet_payload(&mut r, &first)?;
        let crid = UtfTable::parse(&payload)?;

        let mut streams: Vec<UsmStream> = Vec::new();
        let mut index: BTreeMap<([u8; 4], u8), usize> = BTreeMap::new();
        for row in 1..crid.row_count() {
            let stmid = (crid.number(row, "stmid")? as u32).to_be_bytes();
            let channel = crid.number(row, "chno")? as u8;
            index.insert((stmid, channel), streams.len());
            streams.push(UsmStream {
                stmid,
                channel,
                filename: crid.string(row, "filename").unwrap_or_default().to_owned(),
                data: Vec::new(),
            });
        }

        let mut metadata = Vec::new();
        let mut audio_codec: BTreeMap<u8, u64> = BTreeMap::new();

        while r.remaining() > 0 {
            if r.remaining() < UsmPacketHeader::SIZE {
                return Err(CriError::invalid("trailing bytes after last packet", r.pos()));
            }
            let pos = r.pos();
            let header = UsmPacketHeader::read(&mut r)?;
            let known = header.magic == *CRID_MAGIC
                || USM_STREAM_MAGICS.iter().any(|m| **m == header.magic);
            if !known {
                return Err(CriError::invalid(
                    format!("unknown packet magic {:02X?}", header.magic),
                    pos,
                ));
            }

            match header.kind {
                PacketKind::Payload => {
                    let mut payload = packet_payload_padded(&mut r, &header)?;
                    if let Some(key) = &self.key {
                        if header.magic == *SFV_MAGIC || header.magic == *ALP_MAGIC {
                            key.video_unmask(&mut payload);
                        } else if header.magic == *SFA_MAGIC
                            && audio_codec.get(&header.channel_number).copied()
                                == Some(AUDIO_CODEC_ADX)
                        {
                            key.audio_unmask(&mut payload);
                        }
                    }
                    payload.truncate(payload.len() - header.padding_size as usize);

                    let slot = *index
                        .entry((header.magic, header.channel_number))
                        .or_insert_with(|| {
                            warn!(
                                "payload for undeclared stream {:?} ch {}",
                                String::from_utf8_lossy(&header.magic),
                                header.channel_number
                            );
                            streams.push(UsmStream {
                                stmid: header.magic,
                                channel: header.channel_number,
                                filename: String::new(),
                                data: Vec::new(),
                            });
                            streams.len() - 1
                        });
                    streams[slot].data.extend_from_slice(&payload);
                }
                PacketKind::HeaderInfo | PacketKind::Metadata => {
                    let payload = packet_payload(&mut r, &header)?;
                    let table = UtfTable::parse(&payload)?;
                    if header.kind == PacketKind::HeaderInfo
                        && header.magic == *SFA_MAGIC
                        && table.has_column("audio_codec")
                    {
                        audio_codec
                            .insert(header.channel_number, table.number(0, "audio_codec")?);
                    }
                    debug!("metadata table {}", table.name);
                    metadata.push(table);
                }
                PacketKind::SectionEnd => {
                    r.skip(header.chunk_size as usize - UsmPacketHeader::INNER as usize)?;
                }
            }
        }

        Ok(DemuxedUsm {
            crid,
            streams,
            metadata,
        })
    }
}

/// Payload without trailing padding (header/metadata packets).
fn packet_payload(r: &mut ByteReader, header: &UsmPacketHeader) -> Result<Vec<u8>> {
    let padded = packet_payload_padded(r, header)?;
    Ok(padded[..padded.len() - header.padding_size as usize].to_vec())
}

/// Payload including trailing padding; masks run over this region.
fn packet_payload_padded(r: &mut ByteReader, header: &UsmPacketHeader) -> Result<Vec<u8>> {
    r.skip(header.data_offset as usize - UsmPacketHeader::INNER as usize)?;
    let len = header.chunk_size as usize - header.data_offset as usize;
    Ok(r.take(len)?.to_vec())
}

/// SBT subtitle records to SRT text, grouped per language id.
///
/// Records are big-endian `(langid, framerate, frametime, duration,
/// data_size)` plus UTF-8 text, possibly double-NUL terminated.
pub fn sbt_to_srt(data: &[u8]) -> Result<Vec<(u32, String)>> {
    let mut r = ByteReader::new(data);
    let mut groups: BTreeMap<u32, (u32, String)> = BTreeMap::new();

    while r.remaining() > 0 {
        let langid = r.u32_be()?;
        let framerate = r.u32_be()?;
        let frametime = r.u32_be()?;
        let duration = r.u32_be()?;
        let size = r.u32_be()? as usize;
        if framerate == 0 {
            return Err(CriError::invalid("SBT record with zero framerate", r.pos()));
        }
        let raw = r.take(size)?;
        let text = if raw.ends_with(b"\x00\x00") {
            format!("{}\n\n", String::from_utf8_lossy(&raw[..raw.len() - 2]))
        } else {
            String::from_utf8_lossy(raw).into_owned()
        };

        let (count, srt) = groups.entry(langid).or_insert((0, String::new()));
        *count += 1;
        let _ = write!(
            srt,
            "{}\n{} --> {}\n{}",
            count,
            srt_timestamp(frametime, framerate),
            srt_timestamp(frametime + duration, framerate),
            text
        );
    }

    Ok(groups.into_iter().map(|(id, (_, srt))| (id, srt)).collect())
}

fn srt_timestamp(ticks: u32, rate: u32) -> String {
    let ms = ticks % rate;
    let sec = (ticks / rate) % 60;
    let min = (ticks / (rate * 60)) % 60;
    let hour = (ticks / (rate * 3600)) % 24;
    format!("{hour:02}:{min:02}:{sec:02},{ms:03}")
}

enum AudioStream {
    Adx { header: AdxHeader, raw: Vec<u8> },
    Hca { hca: Hca, raw: Vec<u8> },
}

impl AudioStream {
    fn codec(&self) -> u64 {
        match self {
            Self::Adx { .. } => AUDIO_CODEC_ADX,
            Self::Hca { .. } => AUDIO_CODEC_HCA,
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Adx { raw, .. } => raw.len(),
            Self::Hca { raw, .. } => raw.len(),
        }
    }

    fn channels(&self) -> u32 {
        match self {
            Self::Adx { header, .. } => u32::from(header.channels),
            Self::Hca { hca, .. } => u32::from(hca.channels()),
        }
    }

    fn sample_rate(&self) -> u32 {
        match self {
            Self::Adx { header, .. } => header.sample_rate,
            Self::Hca { hca, .. } => hca.sample_rate(),
        }
    }

    fn total_samples(&self) -> u32 {
        match self {
            Self::Adx { header, .. } => header.sample_count,
            Self::Hca { hca, .. } => hca.frame_count(),
        }
    }

    /// Payload bytes per packet: one ADX block batch or one HCA frame.
    fn chunk_size(&self) -> usize {
        match self {
            Self::Adx { header, .. } => {
                let per_frame = (header.sample_rate as f64 / AUDIO_FPS).floor() / 32.0;
                per_frame.floor() as usize * header.frame_bytes()
            }
            Self::Hca { hca, .. } => hca.frame_size() as usize,
        }
    }

    fn base_interval(&self) -> f64 {
        match self {
            Self::Adx { .. } => 99.9,
            Self::Hca { .. } => 64.0,
        }
    }
}

/// Assembles a USM from one VP9/IVF video stream plus optional ADX or
/// HCA audio streams.
pub struct UsmBuilder {
    video: Vec<u8>,
    video_filename: String,
    audio: Vec<(String, Vec<u8>)>,
    key: Option<UsmKey>,
    encrypt_video: bool,
    encrypt_audio: bool,
}

impl UsmBuilder {
    pub fn new(ivf: Vec<u8>, filename: impl Into<String>) -> Self {
        Self {
            video: ivf,
            video_filename: filename.into(),
            audio: Vec::new(),
            key: None,
            encrypt_video: false,
            encrypt_audio: false,
        }
    }

    /// Adds an audio stream (ADX or HCA bytes) on the next channel.
    pub fn add_audio(&mut self, data: Vec<u8>) -> &mut Self {
        let name = format!("{:02}.sfa", self.audio.len());
        self.audio.push((name, data));
        self
    }

    pub fn add_audio_named(&mut self, name: impl Into<String>, data: Vec<u8>) -> &mut Self {
        self.audio.push((name.into(), data));
        self
    }

    /// Sets the scramble key; video payloads are masked from then on.
    pub fn key(mut self, key: u64) -> Self {
        self.key = Some(UsmKey::new(key));
        self.encrypt_video = true;
        self
    }

    /// Also masks ADX audio payloads (requires a key).
    pub fn encrypt_audio(mut self, encrypt: bool) -> Self {
        self.encrypt_audio = encrypt;
        self
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        if self.encrypt_audio && self.key.is_none() {
            return Err(CriError::invalid("audio encryption without a key", 0));
        }
        let ivf = Ivf::parse(&self.video)?;
        let streams = self.parse_audio()?;

        let sfv_interval = (2997.0 / ivf.fps() * 10.0).round() / 10.0;
        let (sfv_packets, video_stats) = self.video_packets(&ivf)?;
        let sfa_packets: Vec<Vec<Vec<u8>>> = streams
            .iter()
            .enumerate()
            .map(|(chno, stream)| self.audio_packets(stream, chno as u8))
            .collect::<Result<_>>()?;

        let header = self.layout_header(&ivf, &streams, &video_stats, &sfv_packets, &sfa_packets)?;
        Ok(interleave(
            header,
            &sfv_packets,
            &sfa_packets,
            sfv_interval,
            streams.first().map(|s| s.base_interval()).unwrap_or(99.9),
        ))
    }

    fn parse_audio(&self) -> Result<Vec<AudioStream>> {
        self.audio
            .iter()
            .map(|(_, raw)| {
                if raw.len() >= 2 && raw[0] == 0x80 && raw[1] == 0x00 {
                    Ok(AudioStream::Adx {
                        header: AdxHeader::parse(raw)?,
                        raw: raw.clone(),
                    })
                } else if raw.len() >= 4 && raw[0] & 0x7F == b'H' {
                    Ok(AudioStream::Hca {
                        hca: Hca::parse(raw)?,
                        raw: raw.clone(),
                    })
                } else {
                    Err(CriError::unsupported(
                        "USM audio must be ADX or HCA",
                    ))
                }
            })
            .collect()
    }

    /// Content packets for the video stream plus the stats the header
    /// tables need.
    fn video_packets(&self, ivf: &Ivf) -> Result<(Vec<Vec<u8>>, VideoStats)> {
        let sfv_interval = (2997.0 / ivf.fps() * 10.0).round() / 10.0;
        let frame_rate_field = (ivf.fps() * 100.0) as u32;

        let mut packets = Vec::with_capacity(ivf.frame_count as usize + 1);
        let mut stats = VideoStats::default();
        let mut count = 0u64;
        let mut interval = 0u32;
        let mut bitrate = 0f64;
        for frame in ivf.frames() {
            let frame = frame?;
            let mut payload = Vec::with_capacity(frame.data.len() + 0x40);
            if count == 0 {
                payload.extend_from_slice(ivf.header());
            }
            payload.extend_from_slice(frame.data);
            if self.encrypt_video
                && let Some(key) = &self.key
            {
                key.video_mask(&mut payload);
            }
            packets.push(payload_packet(
                SFV_MAGIC,
                0,
                interval,
                frame_rate_field,
                &payload,
            ));

            count += 1;
            interval = (count as f64 * sfv_interval) as u32;
            if frame.keyframe {
                stats.keyframes += 1;
            }
            stats.max_payload = stats.max_payload.max(payload.len() as u32);
            bitrate += payload.len() as f64 * 8.0 * (f64::from(frame_rate_field) / 100.0);
        }
        if count == 0 {
            return Err(CriError::invalid("IVF stream with no frames", 0));
        }
        stats.avbps = (bitrate / count as f64) as u32;
        packets.push(section_end(SFV_MAGIC, 0, CONTENTS_END));
        Ok((packets, stats))
    }

    /// Content packets for one audio stream. The final element carries
    /// the stream's `#CONTENTS END` sentinel fused to its last payload.
    fn audio_packets(&self, stream: &AudioStream, chno: u8) -> Result<Vec<Vec<u8>>> {
        let mut packets = Vec::new();
        let base = stream.base_interval();
        let mut interval = 0u32;
        let mut count = 0u64;

        match stream {
            AudioStream::Adx { header, raw } => {
                let first = header.body_offset();
                let footer = header.footer_len();
                if raw.len() < first + footer {
                    return Err(CriError::invalid("ADX stream shorter than its framing", 0));
                }
                let content_end = raw.len() - footer;
                let chunk = stream.chunk_size().max(1);

                let mut cursor = 0usize;
                while cursor < content_end {
                    let take = if cursor == 0 {
                        first
                    } else if cursor + chunk > content_end {
                        content_end - cursor
                    } else {
                        chunk
                    };
                    let mut payload = raw[cursor..cursor + take].to_vec();
                    if self.encrypt_audio
                        && let Some(key) = &self.key
                    {
                        key.audio_mask(&mut payload);
                    }
                    packets.push(payload_packet(SFA_MAGIC, chno, interval, 2997, &payload));
                    cursor += take;
                    interval = (count as f64 * base) as u32;
                    count += 1;
                }
                // Footer block rides its own packet, with the section
                // sentinel fused on.
                let mut last = payload_packet(SFA_MAGIC, chno, interval, 2997, &raw[content_end..]);
                last.extend_from_slice(&section_end(SFA_MAGIC, chno, CONTENTS_END));
                packets.push(last);
            }
            AudioStream::Hca { hca, .. } => {
                packets.push(payload_packet(SFA_MAGIC, chno, interval, 2997, hca.header()));
                let frames: Vec<&[u8]> = hca.frames().collect();
                for (i, frame) in frames.iter().enumerate() {
                    let mut packet = payload_packet(SFA_MAGIC, chno, interval, 2997, frame);
                    interval += base as u32;
                    if i + 1 == frames.len() {
                        packet.extend_from_slice(&section_end(SFA_MAGIC, chno, CONTENTS_END));
                    }
                    packets.push(packet);
                }
            }
        }
        Ok(packets)
    }

    /// CRID, header-info, section sentinels and seek info, in stream
    /// order, exactly sized so the first content packet offset is known.
    fn layout_header(
        &self,
        ivf: &Ivf,
        streams: &[AudioStream],
        video: &VideoStats,
        sfv_packets: &[Vec<u8>],
        sfa_packets: &[Vec<Vec<u8>>],
    ) -> Result<Vec<u8>> {
        let video_hdrinfo = self.video_hdrinfo(ivf, video)?;
        let audio_headers: Vec<Vec<u8>> = streams
            .iter()
            .enumerate()
            .map(|(chno, stream)| self.audio_hdrinfo(stream, chno as u8))
            .collect::<Result<_>>()?;
        let audio_metadata: Vec<(u8, Vec<u8>)> = streams
            .iter()
            .enumerate()
            .filter_map(|(chno, stream)| match stream {
                AudioStream::Hca { hca, .. } => Some(
                    self.hca_header_packet(hca, chno as u8)
                        .map(|packet| (chno as u8, packet)),
                ),
                AudioStream::Adx { .. } => None,
            })
            .collect::<Result<_>>()?;

        // Everything that precedes the first content packet, except the
        // seek-info packet whose own size is value-independent.
        let fixed = 0x800
            + video_hdrinfo.len()
            + audio_headers.iter().map(Vec::len).sum::<usize>()
            + 0x40 * (1 + streams.len())
            + audio_metadata.iter().map(|(_, p)| p.len()).sum::<usize>()
            + 0x40 * (1 + audio_metadata.len());
        let probe = self.seek_info(1)?;
        let first_content_offset = (fixed + probe.len()) as u64;
        let seek_info = self.seek_info(first_content_offset)?;
        debug_assert_eq!(seek_info.len(), probe.len());

        let content_len: usize = sfv_packets.iter().map(Vec::len).sum::<usize>()
            + sfa_packets
                .iter()
                .flat_map(|s| s.iter().map(Vec::len))
                .sum::<usize>();
        let total_len = first_content_offset + content_len as u64;

        let crid = self.crid_packet(ivf, streams, video, total_len)?;

        let mut out = Vec::with_capacity(first_content_offset as usize);
        out.extend_from_slice(&crid);
        out.extend_from_slice(&video_hdrinfo);
        for packet in &audio_headers {
            out.extend_from_slice(packet);
        }
        out.extend_from_slice(&section_end(SFV_MAGIC, 0, HEADER_END));
        for chno in 0..streams.len() {
            out.extend_from_slice(&section_end(SFA_MAGIC, chno as u8, HEADER_END));
        }
        out.extend_from_slice(&seek_info);
        for (_, packet) in &audio_metadata {
            out.extend_from_slice(packet);
        }
        out.extend_from_slice(&section_end(SFV_MAGIC, 0, METADATA_END));
        for (chno, _) in &audio_metadata {
            out.extend_from_slice(&section_end(SFA_MAGIC, *chno, METADATA_END));
        }
        debug_assert_eq!(out.len() as u64, first_content_offset);
        Ok(out)
    }

    fn crid_packet(
        &self,
        ivf: &Ivf,
        streams: &[AudioStream],
        video: &VideoStats,
        total_len: u64,
    ) -> Result<Vec<u8>> {
        let usm_name = format!(
            "{}.usm",
            self.video_filename
                .rsplit_once('.')
                .map(|(stem, _)| stem)
                .unwrap_or(&self.video_filename)
        );

        let mut total_avbps = u64::from(video.avbps);
        let mut total_minbuf = 4 + u64::from(video.max_payload);
        let mut audio_rows = Vec::new();
        for (chno, stream) in streams.iter().enumerate() {
            let size = stream.len() as u64;
            let avbps = match stream {
                AudioStream::Adx { .. } => size * 8 * u64::from(stream.channels()) - size,
                AudioStream::Hca { .. } => size / u64::from(stream.channels()),
            };
            total_avbps += avbps;
            total_minbuf += u64::from(AUDIO_MINBUF);
            audio_rows.push(vec![
                ("avbps".into(), CellValue::U32(avbps as u32)),
                ("chno".into(), CellValue::U16(chno as u16)),
                ("datasize".into(), CellValue::U32(0)),
                (
                    "filename".into(),
                    CellValue::Str(self.audio[chno].0.clone()),
                ),
                ("filesize".into(), CellValue::U32(size as u32)),
                ("fmtver".into(), CellValue::U32(FMTVER)),
                ("minbuf".into(), CellValue::U32(AUDIO_MINBUF)),
                ("minchk".into(), CellValue::U16(1)),
                (
                    "stmid".into(),
                    CellValue::U32(u32::from_be_bytes(*SFA_MAGIC)),
                ),
            ]);
        }

        let mut builder = UtfBuilder::new("CRIUSF_DIR_STREAM");
        builder.push_row(vec![
            ("avbps".into(), CellValue::U32(total_avbps as u32)),
            ("chno".into(), CellValue::U16(0xFFFF)),
            ("datasize".into(), CellValue::U32(0)),
            ("filename".into(), CellValue::Str(usm_name)),
            ("filesize".into(), CellValue::U32(total_len as u32)),
            ("fmtver".into(), CellValue::U32(FMTVER)),
            ("minbuf".into(), CellValue::U32(total_minbuf as u32)),
            ("minchk".into(), CellValue::U16(1)),
            ("stmid".into(), CellValue::U32(0)),
        ]);
        builder.push_row(vec![
            ("avbps".into(), CellValue::U32(video.avbps)),
            ("chno".into(), CellValue::U16(0)),
            ("datasize".into(), CellValue::U32(0)),
            ("filename".into(), CellValue::Str(self.video_filename.clone())),
            ("filesize".into(), CellValue::U32(ivf.total_len() as u32)),
            ("fmtver".into(), CellValue::U32(FMTVER)),
            ("minbuf".into(), CellValue::U32(video.max_payload)),
            ("minchk".into(), CellValue::U16(video.keyframes)),
            (
                "stmid".into(),
                CellValue::U32(u32::from_be_bytes(*SFV_MAGIC)),
            ),
        ]);
        for row in audio_rows {
            builder.push_row(row);
        }
        let table = builder.build()?;
        if table.len() > 0x7E0 {
            return Err(CriError::invalid("CRID table overflows its packet", 0));
        }

        let header = UsmPacketHeader {
            magic: *CRID_MAGIC,
            chunk_size: 0x800 - 0x8,
            data_offset: 0x18,
            padding_size: (0x800 - table.len() - 0x20) as u16,
            channel_number: 0,
            kind: PacketKind::HeaderInfo,
            frame_time: 0,
            frame_rate: 30,
        };
        let mut out = Vec::with_capacity(0x800);
        header.emit(&mut out);
        out.extend_from_slice(&table);
        out.resize(0x800, 0);
        Ok(out)
    }

    fn video_hdrinfo(&self, ivf: &Ivf, video: &VideoStats) -> Result<Vec<u8>> {
        let framerate_n =
            ((ivf.fps() * 1000.0).round() / 1000.0 * 1000.0).round() as u32;
        let mut builder = UtfBuilder::new("VIDEO_HDRINFO");
        builder.push_row(vec![
            ("alpha_type".into(), CellValue::U32(0)),
            ("color_space".into(), CellValue::U32(0)),
            ("disp_height".into(), CellValue::U32(u32::from(ivf.height))),
            ("disp_width".into(), CellValue::U32(u32::from(ivf.width))),
            ("framerate_d".into(), CellValue::U32(1000)),
            ("framerate_n".into(), CellValue::U32(framerate_n)),
            ("height".into(), CellValue::U32(u32::from(ivf.height))),
            ("ixsize".into(), CellValue::U32(video.max_payload)),
            ("mat_height".into(), CellValue::U32(u32::from(ivf.height))),
            ("mat_width".into(), CellValue::U32(u32::from(ivf.width))),
            ("max_picture_size".into(), CellValue::U32(0)),
            ("metadata_count".into(), CellValue::U32(1)),
            ("metadata_size".into(), CellValue::U32(224)),
            ("mpeg_codec".into(), CellValue::U8(9)),
            ("mpeg_dcprec".into(), CellValue::U8(0)),
            ("picture_type".into(), CellValue::U32(0)),
            ("pre_padding".into(), CellValue::U32(0)),
            ("scrn_width".into(), CellValue::U32(0)),
            ("total_frames".into(), CellValue::U32(ivf.frame_count)),
            ("width".into(), CellValue::U32(u32::from(ivf.width))),
        ]);
        Ok(info_packet(SFV_MAGIC, 0, PacketKind::HeaderInfo, &builder.build()?))
    }

    fn audio_hdrinfo(&self, stream: &AudioStream, chno: u8) -> Result<Vec<u8>> {
        let is_hca = stream.codec() == AUDIO_CODEC_HCA;
        let metadata_size = if let AudioStream::Hca { hca, .. } = stream {
            self.hca_header_packet(hca, chno)?.len() as u32
        } else {
            0
        };

        let mut row = vec![
            ("audio_codec".into(), CellValue::U8(stream.codec() as u8)),
            ("ixsize".into(), CellValue::U32(AUDIO_MINBUF)),
            (
                "metadata_count".into(),
                CellValue::U32(u32::from(is_hca)),
            ),
            ("metadata_size".into(), CellValue::U32(metadata_size)),
            ("num_channels".into(), CellValue::U8(stream.channels() as u8)),
            ("sampling_rate".into(), CellValue::U32(stream.sample_rate())),
            ("total_samples".into(), CellValue::U32(stream.total_samples())),
        ];
        if is_hca {
            row.push(("ambisonics".into(), CellValue::U32(0)));
        }

        let mut builder = UtfBuilder::new("AUDIO_HDRINFO");
        builder.push_row(row);
        Ok(info_packet(SFA_MAGIC, chno, PacketKind::HeaderInfo, &builder.build()?))
    }

    /// Raw HCA header bytes shipped as an AUDIO_HEADER metadata packet.
    fn hca_header_packet(&self, hca: &Hca, chno: u8) -> Result<Vec<u8>> {
        let mut builder = UtfBuilder::new("AUDIO_HEADER");
        builder.push_row(vec![(
            "hca_header".into(),
            CellValue::Bytes(hca.header().to_vec()),
        )]);
        Ok(info_packet(SFA_MAGIC, chno, PacketKind::Metadata, &builder.build()?))
    }

    fn seek_info(&self, first_content_offset: u64) -> Result<Vec<u8>> {
        let mut builder = UtfBuilder::new("VIDEO_SEEKINFO");
        builder.push_row(vec![
            ("num_skip".into(), CellValue::I16(0)),
            ("ofs_byte".into(), CellValue::U64(first_content_offset)),
            ("ofs_frmid".into(), CellValue::I32(0)),
            ("resv".into(), CellValue::I16(0)),
        ]);
        Ok(info_packet(SFV_MAGIC, 0, PacketKind::Metadata, &builder.build()?))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct VideoStats {
    keyframes: u16,
    max_payload: u32,
    avbps: u32,
}

fn payload_packet(
    magic: &[u8; 4],
    chno: u8,
    frame_time: u32,
    frame_rate: u32,
    payload: &[u8],
) -> Vec<u8> {
    packet(magic, chno, PacketKind::Payload, frame_time, frame_rate, payload)
}

fn info_packet(magic: &[u8; 4], chno: u8, kind: PacketKind, table: &[u8]) -> Vec<u8> {
    packet(magic, chno, kind, 0, 30, table)
}

fn section_end(magic: &[u8; 4], chno: u8, sentinel: &[u8; 32]) -> Vec<u8> {
    packet(magic, chno, PacketKind::SectionEnd, 0, 30, sentinel)
}

fn packet(
    magic: &[u8; 4],
    chno: u8,
    kind: PacketKind,
    frame_time: u32,
    frame_rate: u32,
    payload: &[u8],
) -> Vec<u8> {
    let padding = (0x20 - payload.len() % 0x20) % 0x20;
    let header = UsmPacketHeader {
        magic: *magic,
        chunk_size: (payload.len() + padding) as u32 + UsmPacketHeader::INNER,
        data_offset: UsmPacketHeader::INNER as u8,
        padding_size: padding as u16,
        channel_number: chno,
        kind,
        frame_time,
        frame_rate,
    };
    let mut out = Vec::with_capacity(UsmPacketHeader::SIZE + payload.len() + padding);
    header.emit(&mut out);
    out.extend_from_slice(payload);
    out.resize(out.len() + padding, 0);
    out
}

/// Video packets keep order priority; after each one the audio streams
/// catch up to the growing interval target, one packet column at a time.
fn interleave(
    mut out: Vec<u8>,
    sfv: &[Vec<u8>],
    sfa: &[Vec<Vec<u8>>],
    sfv_interval: f64,
    base_interval: f64,
) -> Vec<u8> {
    let max_sfa = sfa.iter().map(Vec::len).max().unwrap_or(0);
    let rounds = sfv.len().max(max_sfa);

    let mut current = 0f64;
    let mut target = 0f64;
    let mut column = 0usize;
    for i in 0..rounds {
        if i < sfv.len() {
            out.extend_from_slice(&sfv[i]);
        }
        target += sfv_interval;

        if !sfa.is_empty() {
            while current < target {
                for stream in sfa {
                    if column == 0
                        && let Some(first) = stream.first()
                    {
                        out.extend_from_slice(first);
                    }
                    if column + 1 < stream.len() {
                        out.extend_from_slice(&stream[column + 1]);
                    }
                }
                current += base_interval;
                column += 1;
            }
        }
    }
    // Audio longer than the video timeline still has to land somewhere.
    while column < max_sfa {
        for stream in sfa {
            if column == 0
                && let Some(first) = stream.first()
            {
                out.extend_from_slice(first);
            }
            if column + 1 < stream.len() {
                out.extend_from_slice(&stream[column + 1]);
            }
        }
        column += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::adx::compute_loop;
    use crate::structs::ivf::tests::{VP9_INTER, VP9_KEY, build_ivf};

    fn sample_adx() -> Vec<u8> {
        let header = AdxHeader {
            version: 4,
            encoding: 3,
            block_size: 0x12,
            bit_depth: 4,
            channels: 2,
            sample_rate: 48000,
            sample_count: 320,
            highpass: 0x1F4,
            flags: 0,
            data_offset: 0x24,
            adx_loop: None,
        };
        let mut raw = header.emit().unwrap();
        for block in 0u8..10 {
            raw.extend(std::iter::repeat_n(block, header.frame_bytes()));
        }
        raw.extend_from_slice(&header.emit_footer());
        raw
    }

    fn sample_video() -> Vec<u8> {
        let inter: Vec<u8> = VP9_INTER
            .iter()
            .copied()
            .chain(std::iter::repeat_n(0x5A, 0x300))
            .collect();
        build_ivf(&[(VP9_KEY, 0), (&inter, 1), (VP9_INTER, 2)])
    }

    #[test]
    fn key_schedule_shapes() {
        let key = UsmKey::new(0x0123_4567_89AB_CDEF);
        for i in 0..0x20 {
            assert_eq!(key.video_mask2[i], !key.video_mask1[i]);
        }
        for i in (1..0x20).step_by(2) {
            assert_eq!(key.audio_mask[i], b"URUC"[(i >> 1) & 3]);
        }
        for i in (0..0x20).step_by(2) {
            assert_eq!(key.audio_mask[i], key.video_mask2[i]);
        }
    }

    #[test]
    fn video_mask_roundtrip_on_aligned_payload() {
        let key = UsmKey::new(0xDEAD_BEEF_0BAD_F00D);
        let original: Vec<u8> = (0..0x340u32).map(|i| (i * 31 + 7) as u8).collect();

        let mut packet = original.clone();
        key.video_mask(&mut packet);
        assert_ne!(packet, original);
        key.video_unmask(&mut packet);
        assert_eq!(packet, original);
    }

    #[test]
    fn audio_mask_roundtrip_on_aligned_payload() {
        let key = UsmKey::new(0x1122_3344_5566_7788);
        let original: Vec<u8> = (0..0x2C0u32).map(|i| (i ^ 0xA5) as u8).collect();

        let mut packet = original.clone();
        key.audio_mask(&mut packet);
        assert_ne!(packet, original);
        key.audio_unmask(&mut packet);
        assert_eq!(packet, original);
    }

    #[test]
    fn mux_demux_roundtrip_plain() {
        let ivf_bytes = sample_video();
        let adx_bytes = sample_adx();

        let mut builder = UsmBuilder::new(ivf_bytes.clone(), "movie.ivf");
        builder.add_audio(adx_bytes.clone());
        let usm = builder.build().unwrap();
        assert_eq!(&usm[..4], b"CRID");
        assert_eq!(usm.len() % 0x20, 0);

        let demuxed = Usm::parse(&usm).unwrap().demux().unwrap();
        assert_eq!(demuxed.crid.name, "CRIUSF_DIR_STREAM");
        assert_eq!(demuxed.crid.row_count(), 3);
        assert_eq!(demuxed.crid.string(0, "filename").unwrap(), "movie.usm");
        assert_eq!(
            demuxed.crid.number(0, "filesize").unwrap() as usize,
            usm.len()
        );

        let video = demuxed.stream(SFV_MAGIC, 0).unwrap();
        assert_eq!(video.data, ivf_bytes);
        let audio = demuxed.stream(SFA_MAGIC, 0).unwrap();
        assert_eq!(audio.data, adx_bytes);

        // minchk counts the keyframes the IVF carries.
        assert_eq!(demuxed.crid.number(1, "minchk").unwrap(), 1);
        // Header tables arrive as metadata.
        assert!(demuxed.metadata.iter().any(|t| t.name == "VIDEO_HDRINFO"));
        assert!(demuxed.metadata.iter().any(|t| t.name == "AUDIO_HDRINFO"));
        assert!(demuxed.metadata.iter().any(|t| t.name == "VIDEO_SEEKINFO"));
    }

    #[test]
    fn mux_demux_roundtrip_encrypted() {
        let ivf_bytes = sample_video();
        let adx_bytes = sample_adx();
        let key = 0x0013_579B_DF24_680A;

        let mut builder = UsmBuilder::new(ivf_bytes.clone(), "movie.ivf");
        builder.add_audio(adx_bytes.clone());
        let builder = builder.key(key).encrypt_audio(true);
        let usm = builder.build().unwrap();

        let demuxed = Usm::parse(&usm).unwrap().with_key(key).demux().unwrap();
        assert_eq!(demuxed.stream(SFV_MAGIC, 0).unwrap().data, ivf_bytes);
        assert_eq!(demuxed.stream(SFA_MAGIC, 0).unwrap().data, adx_bytes);
    }

    #[test]
    fn seek_info_points_at_first_content_packet() {
        let mut builder = UsmBuilder::new(sample_video(), "movie.ivf");
        builder.add_audio(sample_adx());
        let usm = builder.build().unwrap();

        let demuxed = Usm::parse(&usm).unwrap().demux().unwrap();
        let seek = demuxed
            .metadata
            .iter()
            .find(|t| t.name == "VIDEO_SEEKINFO")
            .unwrap();
        let offset = seek.number(0, "ofs_byte").unwrap() as usize;
        // The packet at that offset is the first video payload.
        assert_eq!(&usm[offset..offset + 4], b"@SFV");
        assert_eq!(usm[offset + 0x0F], 0);
    }

    #[test]
    fn unknown_packet_magic_is_fatal() {
        let mut builder = UsmBuilder::new(sample_video(), "movie.ivf");
        builder.add_audio(sample_adx());
        let mut usm = builder.build().unwrap();
        usm[0x800..0x804].copy_from_slice(b"@XYZ");
        assert!(Usm::parse(&usm).unwrap().demux().is_err());
    }

    #[test]
    fn sbt_converts_to_srt() {
        let mut sbt = Vec::new();
        for (time, text) in [(0u32, "hello\0\0"), (1500, "world\0\0")] {
            sbt.extend_from_slice(&2u32.to_be_bytes());
            sbt.extend_from_slice(&1000u32.to_be_bytes());
            sbt.extend_from_slice(&time.to_be_bytes());
            sbt.extend_from_slice(&1000u32.to_be_bytes());
            sbt.extend_from_slice(&(text.len() as u32).to_be_bytes());
            sbt.extend_from_slice(text.as_bytes());
        }
        let groups = sbt_to_srt(&sbt).unwrap();
        assert_eq!(groups.len(), 1);
        let (langid, srt) = &groups[0];
        assert_eq!(*langid, 2);
        assert!(srt.starts_with("1\n00:00:00,000 --> 00:00:01,000\nhello\n\n"));
        assert!(srt.contains("2\n00:00:01,500 --> 00:00:02,500\nworld"));
    }

    #[test]
    fn sanitizes_declared_filenames() {
        assert_eq!(sanitize_filename("D:\\work\\movie.ivf"), "work/movie.ivf");
        assert_eq!(sanitize_filename("../../escape.adx"), "escape.adx");
        assert_eq!(sanitize_filename("name<bad>?.bin"), "namebad.bin");
    }

    #[test]
    fn adx_with_loop_survives_packetizing() {
        // A looping header exercises the non-minimal data offset path.
        let adx_loop = compute_loop(0x12, 2, 0x40, 0x20, 0x100);
        let header = AdxHeader {
            version: 4,
            encoding: 3,
            block_size: 0x12,
            bit_depth: 4,
            channels: 2,
            sample_rate: 32000,
            sample_count: 0x120,
            highpass: 0x1F4,
            flags: 0,
            data_offset: 0x40,
            adx_loop: Some(adx_loop),
        };
        let mut raw = header.emit().unwrap();
        for block in 0u8..9 {
            raw.extend(std::iter::repeat_n(block ^ 0x33, header.frame_bytes()));
        }
        raw.extend_from_slice(&header.emit_footer());

        let mut builder = UsmBuilder::new(sample_video(), "clip.ivf");
        builder.add_audio(raw.clone());
        let usm = builder.build().unwrap();
        let demuxed = Usm::parse(&usm).unwrap().demux().unwrap();
        assert_eq!(demuxed.stream(SFA_MAGIC, 0).unwrap().data, raw);
    }
}

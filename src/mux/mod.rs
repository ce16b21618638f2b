//! Shared segment-boundary policy, filename templating, key rotation and
//! playlist rewrite/recovery (§4.5, C5). Two concrete variants — TS and
//! fMP4 — share this contract; only the underlying writer differs.

pub mod fmp4;
pub mod playlist;
pub mod ts;

use std::path::PathBuf;

use chrono::{Datelike, Timelike, Utc};
use tracing::{info, warn};

use crate::config::HlsConfig;
use crate::crypto::KeyMaterial;
use crate::error::{Result, SegmenterError};
use crate::packet::{CodecId, Packet};
use crate::segment::{Container, Segment, SegmentKey};
use crate::window::FragmentWindow;

/// Renders a filename template, expanding the placeholders named in §4.5.
/// Unknown placeholders pass through literally.
pub struct TemplateContext<'a> {
    pub vhost: &'a str,
    pub app: &'a str,
    pub stream: &'a str,
    pub seq: u64,
    /// Milliseconds; only known at rename time, so this is `None` while the
    /// segment is still open.
    pub duration_ms: Option<u64>,
    pub ctx: Option<&'a str>,
}

/// Creates the parent directory of `path` if missing (original's
/// `mkdir_all` on the segment/key/m3u8/init directories, §4.5).
pub fn ensure_parent_dir(path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| SegmenterError::io(parent, e))?;
        }
    }
    Ok(())
}

fn render_template(template: &str, tc: &TemplateContext) -> String {
    let now = Utc::now();
    let mut out = template
        .replace("[vhost]", tc.vhost)
        .replace("[app]", tc.app)
        .replace("[stream]", tc.stream)
        .replace("[seq]", &tc.seq.to_string())
        .replace("[timestamp]", &now.timestamp().to_string())
        .replace("[year]", &format!("{:04}", now.year()))
        .replace("[month]", &format!("{:02}", now.month()))
        .replace("[day]", &format!("{:02}", now.day()))
        .replace("[hour]", &format!("{:02}", now.hour()))
        .replace("[minute]", &format!("{:02}", now.minute()))
        .replace("[second]", &format!("{:02}", now.second()));
    if let Some(ctx) = tc.ctx {
        out = out.replace("[ctx]", ctx);
    }
    if let Some(dur) = tc.duration_ms {
        out = out.replace("[duration]", &dur.to_string());
    }
    out
}

/// Clock-aligned "piece id" naming (§4.5 "TS-floor timestamping"). The
/// muxer keeps its own monotonic counter seeded from the wall clock and
/// resynchronises when the observed deviation exceeds `RESYNC_PIECES`.
pub struct TsFloor {
    fragment_ms: u64,
    next_piece: u64,
    pub deviation_ts: i64,
}

impl TsFloor {
    const RESYNC_PIECES: i64 = 20;

    pub fn new(fragment_ms: u64) -> Self {
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let piece = now_ms / fragment_ms.max(1);
        TsFloor {
            fragment_ms: fragment_ms.max(1),
            next_piece: piece,
            deviation_ts: 0,
        }
    }

    /// Advance to the next piece id, resynchronising if the wall clock has
    /// drifted more than `RESYNC_PIECES` away from our own counter.
    pub fn advance(&mut self) -> u64 {
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let observed = now_ms / self.fragment_ms;
        let deviation = observed as i64 - self.next_piece as i64;
        self.deviation_ts = deviation;
        if deviation.abs() > Self::RESYNC_PIECES {
            self.next_piece = observed;
        }
        let piece = self.next_piece;
        self.next_piece += 1;
        piece
    }
}

enum Writer {
    Ts(ts::TsSegmentWriter),
    Fmp4 {
        video: Option<fmp4::FragmentWriter>,
        audio: Option<fmp4::FragmentWriter>,
        fragment_seq: u32,
    },
}

/// Shared state + policy for one muxer instance. Owns the live window, the
/// currently-open segment, and key-rotation bookkeeping; delegates actual
/// byte encoding to the container-specific writer.
pub struct Muxer {
    cfg: HlsConfig,
    container: Container,
    vhost: String,
    app: String,
    stream: String,
    next_seq: u64,
    window: FragmentWindow,
    current: Option<OpenSegment>,
    ts_floor: Option<TsFloor>,
    current_key: Option<KeyMaterial>,
    acodec: Option<CodecId>,
    vcodec: Option<CodecId>,
    pure_audio: bool,
    /// TS path only: one pending audio group + one pending video packet,
    /// drained into the writer by `flush_audio`/`flush_video` (§4.4, C4).
    /// fMP4 writes samples directly and never populates this.
    cache: crate::cache::MessageCache,
}

struct OpenSegment {
    meta: Segment,
    start_dts: u64,
    writer: Writer,
}

impl Muxer {
    /// Minimum acceptable segment duration before a reap is allowed to
    /// publish it, 100ms at 90kHz (§3 Inv. 3/4).
    const MIN_SEGMENT_DURATION_TICKS: u64 = 9_000;

    pub fn new(cfg: HlsConfig, container: Container, vhost: String, app: String, stream: String) -> Self {
        let ts_floor = if cfg.ts_floor {
            Some(TsFloor::new((cfg.fragment_secs * 1000.0) as u64))
        } else {
            None
        };
        Muxer {
            cfg,
            container,
            vhost,
            app,
            stream,
            next_seq: 0,
            window: FragmentWindow::new(),
            current: None,
            ts_floor,
            current_key: None,
            acodec: None,
            vcodec: None,
            pure_audio: true,
            cache: crate::cache::MessageCache::new(),
        }
    }

    pub fn update_config(&mut self, cfg: HlsConfig) {
        self.cfg = cfg;
    }

    fn template_ctx(&self, seq: u64, duration_ms: Option<u64>) -> TemplateContext<'_> {
        // `hls_ts_ctx` is the TS-specific sharding context id (§6); it takes
        // priority over the vhost-wide `hls_ctx` for TS output, matching the
        // original's ts_ctx-overrides-ctx directive precedence.
        let ctx = match self.container {
            Container::Ts => self.cfg.ts_ctx.as_deref().or(self.cfg.ctx.as_deref()),
            Container::Fmp4 => self.cfg.ctx.as_deref(),
        };
        TemplateContext {
            vhost: &self.vhost,
            app: &self.app,
            stream: &self.stream,
            seq,
            duration_ms,
            ctx,
        }
    }

    fn segment_filename_template(&self) -> &str {
        match self.container {
            Container::Ts => &self.cfg.ts_file,
            Container::Fmp4 => &self.cfg.fmp4_file,
        }
    }

    /// Allocate a new `current` segment, rendering its filename and rotating
    /// keys if this sequence number starts a new rotation period.
    pub fn segment_open(&mut self, base_dts: u64) -> Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;

        // `seq == 0` always satisfies the modulo branch below, which would
        // otherwise re-rotate (and silently invalidate) the key `init.mp4`
        // was just built against via `ensure_key_material` — only treat a
        // later multiple of `fragments_per_key` as a rotation boundary.
        if self.cfg.keys && (self.current_key.is_none() || (seq != 0 && seq % self.cfg.fragments_per_key as u64 == 0)) {
            self.rotate_key(seq)?;
        }

        let seq_for_name = if let Some(floor) = &mut self.ts_floor {
            floor.advance()
        } else {
            seq
        };

        let tc = self.template_ctx(seq_for_name, None);
        let rel = render_template(self.segment_filename_template(), &tc);
        let path = self.cfg.path.join(&rel);
        let tmp_path = path.with_extension(format!("{}.tmp", self.container.extension()));
        let uri = self.build_uri(&rel);

        let key = self.segment_key();

        ensure_parent_dir(&tmp_path)?;

        let writer = match self.container {
            Container::Ts => Writer::Ts(ts::TsSegmentWriter::open(self.acodec, self.vcodec)?),
            Container::Fmp4 => {
                let cbcs_key = self.current_key.as_ref().map(|k| (k.key, k.iv));
                Writer::Fmp4 {
                    video: self
                        .vcodec
                        .map(|_| fmp4::FragmentWriter::new(seq as u32, fmp4::VIDEO_TRACK_ID, cbcs_key)),
                    audio: self
                        .acodec
                        .map(|_| fmp4::FragmentWriter::new(seq as u32, fmp4::AUDIO_TRACK_ID, cbcs_key)),
                    fragment_seq: seq as u32,
                }
            }
        };

        self.current = Some(OpenSegment {
            meta: Segment {
                sequence_no: seq,
                path,
                tmp_path,
                uri,
                duration: 0,
                discontinuity: false,
                key,
                closed: false,
                container: self.container,
                key_rotation_id: self.current_key.as_ref().map(|k| k.rotation_id).unwrap_or(0),
            },
            start_dts: base_dts,
            writer,
        });
        Ok(())
    }

    fn segment_key(&self) -> SegmentKey {
        match (&self.current_key, self.container) {
            (None, _) => SegmentKey::None,
            (Some(km), Container::Ts) => SegmentKey::Ts { key: km.key, iv: km.iv },
            (Some(km), Container::Fmp4) => SegmentKey::Cbcs {
                kid: km.kid.unwrap_or([0u8; 16]),
                const_iv: km.const_iv.clone().unwrap_or_default(),
                iv: km.iv,
            },
        }
    }

    /// For fMP4, `init.mp4` carries the `kid`/`const_iv` for its `tenc`/`pssh`
    /// boxes and is built before the first segment ever opens, so the first
    /// rotation's key material must exist ahead of that — `segment_open`'s
    /// own rotation check alone would run too late (§4.3, §5).
    pub fn ensure_key_material(&mut self) -> Result<()> {
        if self.cfg.keys && self.current_key.is_none() {
            self.rotate_key(0)?;
        }
        Ok(())
    }

    pub fn current_key(&self) -> Option<&KeyMaterial> {
        self.current_key.as_ref()
    }

    fn rotate_key(&mut self, seq: u64) -> Result<()> {
        let rotation_id = seq / self.cfg.fragments_per_key.max(1) as u64;
        let fmp4 = matches!(self.container, Container::Fmp4);
        let km = KeyMaterial::generate(rotation_id, fmp4, 16)?;
        let tc = self.template_ctx(rotation_id, None);
        let rel = render_template(&self.cfg.key_file, &tc);
        let path = self.cfg.key_file_path.join(&rel);
        ensure_parent_dir(&path)?;
        km.write_key_file(&path)?;
        self.current_key = Some(km);
        Ok(())
    }

    fn build_uri(&self, rel: &str) -> String {
        match &self.cfg.entry_prefix {
            Some(prefix) => format!("{}{}", prefix.trim_end_matches('/'), rel),
            None => rel.to_string(),
        }
    }

    /// Mark the current segment as discontinuous; no-op with a log if
    /// nothing is open (§4.5).
    pub fn on_sequence_header(&mut self) {
        match &mut self.current {
            Some(seg) => seg.meta.discontinuity = true,
            None => warn!("on_sequence_header with no open segment"),
        }
    }

    pub fn set_acodec(&mut self, codec: CodecId) {
        self.acodec = Some(codec);
    }

    pub fn set_vcodec(&mut self, codec: CodecId) {
        self.vcodec = Some(codec);
        self.pure_audio = false;
    }

    /// Forwards to the writer directly for fMP4; for TS, goes through the
    /// message cache so the controller can decide segment boundaries before
    /// the bytes actually land in the TS writer (§4.5, §4.4).
    pub fn write_audio(&mut self, packet: &Packet) -> Result<()> {
        if self.current.is_none() {
            return Err(SegmenterError::ProtocolViolation("write_audio with no open segment".into()));
        }
        match self.container {
            Container::Ts => {
                self.cache.cache_audio(packet.clone());
                Ok(())
            }
            Container::Fmp4 => {
                let seg = self.current.as_mut().unwrap();
                if let Writer::Fmp4 { audio: Some(w), .. } = &mut seg.writer {
                    w.write_sample(packet, 0)?;
                }
                Ok(())
            }
        }
    }

    /// See [`Muxer::write_audio`].
    pub fn write_video(&mut self, packet: &Packet) -> Result<()> {
        if self.current.is_none() {
            return Err(SegmenterError::ProtocolViolation("write_video with no open segment".into()));
        }
        match self.container {
            Container::Ts => {
                self.cache.cache_video(packet.clone());
                Ok(())
            }
            Container::Fmp4 => {
                let flags = if packet.is_keyframe() { 0x0200_0000 } else { 0x0101_0000 };
                let seg = self.current.as_mut().unwrap();
                if let Writer::Fmp4 { video: Some(w), .. } = &mut seg.writer {
                    w.write_sample(packet, flags)?;
                }
                Ok(())
            }
        }
    }

    /// Drain the pending cached audio packet into the TS writer, updating
    /// duration as it goes. No-op for fMP4 (written directly already) or if
    /// nothing is pending (§4.5 `flush_audio`).
    pub fn flush_audio(&mut self) -> Result<()> {
        if self.container != Container::Ts {
            return Ok(());
        }
        let Some(packet) = self.cache.flush_audio() else {
            return Ok(());
        };
        self.update_duration(packet.dts);
        let Some(seg) = &mut self.current else {
            warn!("flush_audio ignored, segment not open");
            return Ok(());
        };
        if let Writer::Ts(w) = &mut seg.writer {
            w.write_audio(&packet)?;
        }
        Ok(())
    }

    /// Drain the pending cached video packet into the TS writer (§4.5
    /// `flush_video`).
    pub fn flush_video(&mut self) -> Result<()> {
        if self.container != Container::Ts {
            return Ok(());
        }
        let Some(packet) = self.cache.flush_video() else {
            return Ok(());
        };
        self.update_duration(packet.dts);
        let Some(seg) = &mut self.current else {
            warn!("flush_video ignored, segment not open");
            return Ok(());
        };
        if let Writer::Ts(w) = &mut seg.writer {
            w.write_video(&packet)?;
        }
        Ok(())
    }

    pub fn pending_audio(&self) -> Option<&Packet> {
        self.cache.audio()
    }

    pub fn pending_video(&self) -> Option<&Packet> {
        self.cache.video()
    }

    pub fn update_duration(&mut self, dts: u64) {
        if let Some(seg) = &mut self.current {
            let dur = dts.saturating_sub(seg.start_dts);
            seg.meta.duration = seg.meta.duration.max(dur);
        }
    }

    fn max_td(&self) -> u64 {
        (self.cfg.fragment_secs * self.cfg.td_ratio * 90_000.0) as u64
    }

    fn deviation(&self) -> u64 {
        match &self.ts_floor {
            Some(floor) => {
                let dev = (HlsConfig::FLOOR_REAP_PERCENT * floor.deviation_ts as f64 * self.cfg.fragment_secs * 90_000.0).abs();
                dev as u64
            }
            None => 0,
        }
    }

    /// "to prevent very small segment": both overflow predicates refuse to
    /// fire before the segment has covered at least `2 * MIN_SEGMENT_DURATION_TICKS`.
    fn below_min_guard(&self) -> bool {
        match &self.current {
            Some(seg) => seg.meta.duration < 2 * Self::MIN_SEGMENT_DURATION_TICKS,
            None => true,
        }
    }

    pub fn is_segment_overflow(&self) -> bool {
        if self.below_min_guard() {
            return false;
        }
        let Some(seg) = &self.current else { return false };
        seg.meta.duration >= self.max_td() + self.deviation()
    }

    pub fn is_segment_absolutely_overflow(&self) -> bool {
        if self.below_min_guard() {
            return false;
        }
        let Some(seg) = &self.current else { return false };
        let aof = (self.cfg.aof_ratio * self.cfg.fragment_secs * 90_000.0) as u64 + self.deviation();
        seg.meta.duration >= aof
    }

    pub fn wait_keyframe(&self) -> bool {
        self.cfg.wait_keyframe
    }

    pub fn is_pure_audio(&self) -> bool {
        self.pure_audio
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_discontinuity(&self) -> bool {
        self.current.as_ref().map(|s| s.meta.discontinuity).unwrap_or(false)
    }

    /// Reap the current segment: finalise bytes, rename tmp→final, append
    /// to the window, refresh the playlist, trim old entries (§4.5 step 2).
    /// Returns the closed segment so the controller can hand it to the
    /// async callback worker.
    pub fn segment_close(&mut self) -> Result<Option<Segment>> {
        let Some(open) = self.current.take() else {
            return Ok(None);
        };

        let bytes = match open.writer {
            Writer::Ts(w) => {
                let key = match &open.meta.key {
                    SegmentKey::Ts { key, iv } => Some((key, iv)),
                    _ => None,
                };
                w.close(key)
            }
            Writer::Fmp4 { video, audio, .. } => {
                let mut out = Vec::new();
                if let Some(w) = video {
                    out.extend(w.flush(open.meta.duration)?);
                }
                if let Some(w) = audio {
                    out.extend(w.flush(open.meta.duration)?);
                }
                out
            }
        };

        if let Err(e) = std::fs::write(&open.meta.tmp_path, &bytes) {
            warn!(path = %open.meta.tmp_path.display(), %e, "segment write failed, dropping");
            self.next_seq -= 1;
            let _ = std::fs::remove_file(&open.meta.tmp_path);
            return Err(SegmenterError::io(&open.meta.tmp_path, e));
        }

        // §3 Inv. 4: a segment outside [min_segment_duration, 3*max_td] is
        // dropped rather than published — sequence number is reused.
        let max_band = 3 * self.max_td();
        if open.meta.duration < Self::MIN_SEGMENT_DURATION_TICKS || open.meta.duration > max_band {
            warn!(
                seq = open.meta.sequence_no,
                dur = open.meta.duration_secs(),
                "segment duration outside acceptable band, dropping"
            );
            self.next_seq -= 1;
            let _ = std::fs::remove_file(&open.meta.tmp_path);
            return Ok(None);
        }

        let mut meta = open.meta;
        let tc = self.template_ctx(meta.sequence_no, Some((meta.duration_secs() * 1000.0) as u64));
        let final_rel = render_template(self.segment_filename_template(), &tc);
        meta.path = self.cfg.path.join(&final_rel);
        meta.uri = self.build_uri(&final_rel);

        if let Err(e) = std::fs::rename(&meta.tmp_path, &meta.path) {
            warn!(path = %meta.path.display(), %e, "segment rename failed, dropping");
            self.next_seq -= 1;
            let _ = std::fs::remove_file(&meta.tmp_path);
            return Err(SegmenterError::io(&meta.path, e));
        }
        meta.closed = true;

        info!(seq = meta.sequence_no, dur = meta.duration_secs(), "reaped segment");
        self.window.append(meta.clone());
        self.window.shrink((self.cfg.window_secs * 90_000.0) as u64);
        self.window.clear_expired(self.cfg.cleanup);

        Ok(Some(meta))
    }

    pub fn window(&self) -> &FragmentWindow {
        &self.window
    }

    pub fn window_mut(&mut self) -> &mut FragmentWindow {
        &mut self.window
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn set_next_seq(&mut self, seq: u64) {
        self.next_seq = seq;
    }

    pub fn m3u8_path(&self) -> PathBuf {
        let tc = self.template_ctx(0, None);
        self.cfg.path.join(render_template(&self.cfg.m3u8_file, &tc))
    }

    /// Renders `hls_init_file` the same way segment/m3u8 filenames are
    /// rendered (§4.5 "Filename templating"); `init.mp4` has no sequence
    /// number or duration of its own, so `seq`/`duration_ms` are unused.
    pub fn init_path(&self) -> PathBuf {
        let tc = self.template_ctx(0, None);
        self.cfg.path.join(render_template(&self.cfg.init_file, &tc))
    }

    /// Playlist-relative `init.mp4` URI (operator prefix + rendered
    /// template), for the `#EXT-X-MAP:URI="…"` line (§3 Inv. 8).
    pub fn init_uri(&self) -> String {
        let tc = self.template_ctx(0, None);
        let rel = render_template(&self.cfg.init_file, &tc);
        self.build_uri(&rel)
    }

    /// Playlist-relative URI for the key file covering `rotation_id`, used
    /// as the `#EXT-X-KEY` `URI=` value when `hls_key_url` is not set
    /// (§4.5 "Key rotation").
    pub fn key_uri(&self, rotation_id: u64) -> String {
        let tc = self.template_ctx(rotation_id, None);
        let rel = render_template(&self.cfg.key_file, &tc);
        self.build_uri(&rel)
    }

    pub fn refresh_playlist(&self) -> Result<()> {
        playlist::write(self)
    }

    pub fn cfg(&self) -> &HlsConfig {
        &self.cfg
    }

    pub fn container(&self) -> Container {
        self.container
    }

    /// Dispose everything: unlink window files, the in-progress tmp file,
    /// and the playlist (§4.7 "Disposal").
    pub fn dispose(&mut self) {
        self.window.dispose();
        self.window.clear_expired(true);
        if let Some(open) = self.current.take() {
            let _ = std::fs::remove_file(&open.meta.tmp_path);
        }
        let _ = std::fs::remove_file(self.m3u8_path());
        self.cache.flush_audio();
        self.cache.flush_video();
    }
}

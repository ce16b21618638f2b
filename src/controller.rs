//! Stream-level adapter between generic packets and the muxer (§4.6, C6).

use tracing::{info, warn};

use crate::config::HlsConfig;
use crate::error::{OnErrorPolicy, Result};
use crate::mux::Muxer;
use crate::packet::{CodecId, Packet, PacketKind};
use crate::segment::{Container, Segment};

const AAC_FRAME_SIZES: [u64; 4] = [960, 1024, 2048, 4096];

/// Estimates AAC frame sample counts from inter-packet DTS deltas so audio
/// DTS stays monotone even when the input source's timestamps are coarse
/// (§4.6 "Audio DTS recovery").
struct AudioDtsEstimator {
    sample_rate: u64,
    cumulative_samples: u64,
    last_input_dts: Option<u64>,
}

impl AudioDtsEstimator {
    fn new(sample_rate: u64) -> Self {
        AudioDtsEstimator {
            sample_rate: sample_rate.max(1),
            cumulative_samples: 0,
            last_input_dts: None,
        }
    }

    fn next_dts(&mut self, input_dts: u64) -> u64 {
        if let Some(last) = self.last_input_dts {
            if input_dts < last {
                // input went backward: resync the estimator
                self.cumulative_samples = 0;
                self.last_input_dts = Some(input_dts);
                return input_dts * 90;
            }
            let delta_ms = input_dts - last;
            let target_samples = delta_ms * self.sample_rate / 1000;
            let bucket = AAC_FRAME_SIZES
                .iter()
                .copied()
                .min_by_key(|&sz| (sz as i64 - target_samples as i64).abs())
                .unwrap_or(1024);
            self.cumulative_samples += bucket;
        }
        self.last_input_dts = Some(input_dts);
        90_000 * self.cumulative_samples / self.sample_rate
    }
}

/// Whether `init.mp4` requires both an audio and a video sequence header
/// before it can be written, tracked per controller instance (§4.5 Open
/// Question 2: write as soon as both available SHs have arrived).
#[derive(Default)]
struct InitReadiness {
    video_sh: Option<Vec<u8>>,
    audio_sh: Option<Vec<u8>>,
    video_codec: Option<CodecId>,
    audio_codec: Option<CodecId>,
    wants_video: bool,
    wants_audio: bool,
}

impl InitReadiness {
    /// True once every media type this stream has actually announced (via a
    /// sequence header observed so far) has its SH in hand. Requires at
    /// least one track to have been requested at all, so a content packet
    /// that races ahead of the first sequence header can't latch in an
    /// empty, trackless `init.mp4` before the real SHs arrive (§4.3 "one
    /// track per enabled media").
    fn ready(&self) -> bool {
        (self.wants_video || self.wants_audio)
            && (!self.wants_video || self.video_sh.is_some())
            && (!self.wants_audio || self.audio_sh.is_some())
    }
}

pub struct Controller {
    muxer: Muxer,
    audio_estimator: Option<AudioDtsEstimator>,
    dts_directly: bool,
    sample_rate: u64,
    fault: bool,
    on_error: OnErrorPolicy,
    init: InitReadiness,
    init_written: bool,
    /// DTS of the first packet in the currently-grouping pure-audio batch;
    /// `None` when nothing is pending aggregation (§4.6).
    audio_group_start: Option<u64>,
}

impl Controller {
    pub fn new(muxer: Muxer, sample_rate: u64) -> Self {
        let dts_directly = muxer.cfg().dts_directly;
        let on_error = muxer.cfg().on_error;
        Controller {
            muxer,
            audio_estimator: if dts_directly { None } else { Some(AudioDtsEstimator::new(sample_rate)) },
            dts_directly,
            sample_rate,
            fault: false,
            on_error,
            init: InitReadiness::default(),
            init_written: false,
            audio_group_start: None,
        }
    }

    pub fn is_fault(&self) -> bool {
        self.fault
    }

    fn audio_dts(&mut self, input_dts: u64) -> u64 {
        if self.dts_directly {
            return input_dts * 90;
        }
        match &mut self.audio_estimator {
            Some(est) => est.next_dts(input_dts),
            None => input_dts * 90,
        }
    }

    /// Processes one packet, returning any segment that was reaped as a
    /// side effect so the caller can dispatch its notifications.
    pub fn on_packet(&mut self, mut packet: Packet) -> Result<Option<Segment>> {
        if self.fault {
            return Ok(None);
        }

        if packet.kind == PacketKind::Audio {
            packet.dts = self.audio_dts(packet.dts / 90);
            packet.pts = packet.dts;
        }

        self.detect_codec_change(&packet);

        if packet.is_sequence_header {
            self.handle_sequence_header(&packet);
            return Ok(None);
        }

        if self.muxer.container() == Container::Fmp4 && !self.init_written && self.init.ready() {
            self.write_init()?;
        }

        if !self.muxer.is_open() {
            self.muxer.segment_open(packet.dts)?;
        }

        let closed = match packet.kind {
            PacketKind::Audio => self.on_audio(packet)?,
            PacketKind::Video => self.on_video(packet)?,
        };
        Ok(closed)
    }

    fn detect_codec_change(&mut self, packet: &Packet) {
        match packet.kind {
            PacketKind::Audio => {
                info!(codec = %packet.codec, "audio codec observed");
                self.muxer.set_acodec(packet.codec);
            }
            PacketKind::Video => {
                info!(codec = %packet.codec, "video codec observed");
                self.muxer.set_vcodec(packet.codec);
            }
        }
    }

    fn handle_sequence_header(&mut self, packet: &Packet) {
        self.muxer.on_sequence_header();
        match packet.kind {
            PacketKind::Audio => {
                self.init.audio_sh = Some(packet.payload.clone());
                self.init.audio_codec = Some(packet.codec);
                self.init.wants_audio = true;
            }
            PacketKind::Video => {
                self.init.video_sh = Some(packet.payload.clone());
                self.init.video_codec = Some(packet.codec);
                self.init.wants_video = true;
            }
        }
    }

    fn write_init(&mut self) -> Result<()> {
        if self.muxer.container() != Container::Fmp4 {
            return Ok(());
        }
        let video = self
            .init
            .video_sh
            .as_ref()
            .zip(self.init.video_codec)
            .map(|(sh, c)| (c, sh.as_slice()));
        let audio = self
            .init
            .audio_sh
            .as_ref()
            .zip(self.init.audio_codec)
            .map(|(sh, c)| (c, sh.as_slice()));
        self.muxer.ensure_key_material()?;
        let bytes = crate::mux::fmp4::InitSegmentBuilder::build(video, audio, self.muxer.current_key())?;
        let path = self.muxer.init_path();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| crate::error::SegmenterError::io(parent, e))?;
            }
        }
        std::fs::write(&path, bytes).map_err(|e| crate::error::SegmenterError::io(&path, e))?;
        self.init_written = true;
        Ok(())
    }

    /// Pure-audio aggregation window: group up to this much audio in the
    /// cache before flushing into the TS writer, to avoid many tiny PES
    /// packets (§4.6, `PURE_AUDIO_AGGREGATE`).
    const PURE_AUDIO_AGGREGATE_TICKS: u64 = HlsConfig::PURE_AUDIO_AGGREGATE_MS * 90;

    /// Write to cache, then decide whether to reap before flushing into the
    /// writer (§4.6 "Segment-overflow branching", mirroring the original's
    /// cache→update_duration→overflow-check→flush ordering).
    fn on_audio(&mut self, packet: Packet) -> Result<Option<Segment>> {
        let was_pending = self.muxer.pending_audio().is_some();
        if !was_pending {
            self.audio_group_start = Some(packet.dts);
        }
        let dts = packet.dts;
        self.muxer.write_audio(&packet)?;
        self.muxer.update_duration(dts);

        if self.muxer.pending_audio().is_some() && self.muxer.is_segment_absolutely_overflow() {
            let closed = self.reap(dts)?;
            self.audio_group_start = None;
            return Ok(closed);
        }

        let aggregate = self.muxer.container() == Container::Ts
            && self.muxer.is_pure_audio()
            && dts.saturating_sub(self.audio_group_start.unwrap_or(dts)) < Self::PURE_AUDIO_AGGREGATE_TICKS;
        if !aggregate {
            self.muxer.flush_audio()?;
            self.audio_group_start = None;
        }
        Ok(None)
    }

    fn on_video(&mut self, packet: Packet) -> Result<Option<Segment>> {
        let dts = packet.dts;
        self.muxer.write_video(&packet)?;
        self.muxer.update_duration(dts);

        if self.muxer.is_segment_overflow() && (!self.muxer.wait_keyframe() || packet.is_keyframe()) {
            return self.reap(dts);
        }
        self.muxer.flush_video()?;
        Ok(None)
    }

    /// close current → open new → flush pending video → flush pending audio
    /// (§4.6 "Reap procedure"). `base_dts` is the DTS of the packet that
    /// triggered the reap: for TS it's also recoverable from the message
    /// cache, but fMP4 never populates that cache (samples go straight to
    /// the `FragmentWriter`), so the caller must pass it in directly — using
    /// `pending_video()`/`pending_audio()` here left every fMP4 segment
    /// after the first opening with `start_dts = 0`. If open fails, surface
    /// the close's error and enter a fault state until unpublish.
    fn reap(&mut self, base_dts: u64) -> Result<Option<Segment>> {
        let closed = match self.muxer.segment_close() {
            Ok(seg) => seg,
            Err(e) => {
                warn!(%e, "segment close failed during reap");
                match self.on_error {
                    OnErrorPolicy::Ignore => return Ok(None),
                    OnErrorPolicy::Continue => None,
                    OnErrorPolicy::Disconnect => {
                        self.fault = true;
                        return Err(e);
                    }
                }
            }
        };
        let _ = self.muxer.refresh_playlist();
        if let Err(e) = self.muxer.segment_open(base_dts) {
            self.fault = true;
            return Err(e);
        }
        self.muxer.flush_video()?;
        self.muxer.flush_audio()?;
        Ok(closed)
    }

    pub fn muxer(&self) -> &Muxer {
        &self.muxer
    }

    pub fn muxer_mut(&mut self) -> &mut Muxer {
        &mut self.muxer
    }

    pub fn update_config(&mut self, cfg: HlsConfig) {
        self.on_error = cfg.on_error;
        self.dts_directly = cfg.dts_directly;
        self.muxer.update_config(cfg);
    }
}

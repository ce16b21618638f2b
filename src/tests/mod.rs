//! End-to-end scenarios exercising the muxer/controller pipeline directly
//! (no ingest/HTTP collaborators), mirroring the concrete scenarios in
//! spec §8. Synthetic packets carry arbitrary payload bytes — correctness
//! here is about segmentation policy, playlist text and window/key
//! bookkeeping, not byte-accurate container decoding.

use std::path::Path;

use tempfile::tempdir;

use crate::config::HlsConfig;
use crate::controller::Controller;
use crate::mux::Muxer;
use crate::packet::{CodecId, FrameType, Packet, PacketKind};
use crate::segment::Container;

fn base_cfg(path: &Path) -> HlsConfig {
    HlsConfig {
        enabled: true,
        fragment_secs: 10.0,
        window_secs: 60.0,
        path: path.to_path_buf(),
        m3u8_file: "live.m3u8".to_string(),
        ts_file: "seg-[seq].ts".to_string(),
        fmp4_file: "seg-[seq].m4s".to_string(),
        init_file: "[app]-[stream]-init.mp4".to_string(),
        td_ratio: 1.0,
        aof_ratio: 2.1,
        on_error: crate::error::OnErrorPolicy::Continue,
        cleanup: true,
        wait_keyframe: true,
        dispose_secs: 0.0,
        nb_notify: 1,
        dts_directly: true,
        ts_floor: false,
        keys: false,
        fragments_per_key: 3,
        key_file: "key-[seq].key".to_string(),
        key_file_path: path.to_path_buf(),
        key_url: None,
        use_fmp4: false,
        entry_prefix: None,
        ctx: None,
        ts_ctx: None,
        recover: false,
    }
}

fn video_pkt(dts_secs: f64, keyframe: bool) -> Packet {
    Packet {
        kind: PacketKind::Video,
        dts: (dts_secs * 90_000.0) as u64,
        pts: (dts_secs * 90_000.0) as u64,
        codec: CodecId::Avc,
        payload: vec![0u8; 32],
        is_sequence_header: false,
        frame_type: Some(if keyframe { FrameType::Key } else { FrameType::Inter }),
    }
}

fn video_sh(codec: CodecId) -> Packet {
    Packet {
        kind: PacketKind::Video,
        dts: 0,
        pts: 0,
        codec,
        payload: vec![0x67, 0x42, 0x00, 0x1f],
        is_sequence_header: true,
        frame_type: Some(FrameType::VideoInfo),
    }
}

fn audio_pkt(dts_secs: f64) -> Packet {
    Packet {
        kind: PacketKind::Audio,
        dts: (dts_secs * 90_000.0) as u64,
        pts: (dts_secs * 90_000.0) as u64,
        codec: CodecId::Aac,
        payload: vec![0u8; 16],
        is_sequence_header: false,
        frame_type: None,
    }
}

fn audio_sh() -> Packet {
    Packet {
        kind: PacketKind::Audio,
        dts: 0,
        pts: 0,
        codec: CodecId::Aac,
        payload: vec![0x11, 0x90],
        is_sequence_header: true,
        frame_type: None,
    }
}

fn read_playlist(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

/// S1 (smoke, TS): keyframe-aligned video + audio feeds 65s at
/// fragment=10s/window=60s/wait_keyframe=on should reap once per ~10s and
/// leave a consistent, atomically-visible playlist.
#[test]
fn ts_smoke_reaps_near_fragment_boundaries() {
    let dir = tempdir().unwrap();
    let cfg = base_cfg(dir.path());
    let muxer = Muxer::new(cfg, Container::Ts, "_".into(), "live".into(), "stream".into());
    let mut controller = Controller::new(muxer, 48_000);

    controller.on_packet(video_sh(CodecId::Avc)).unwrap();
    controller.on_packet(audio_sh()).unwrap();

    let mut t = 0.0;
    let mut reaped = Vec::new();
    while t < 65.0 {
        let keyframe = (t * 1000.0) as u64 % 2000 < 40;
        if let Some(seg) = controller.on_packet(video_pkt(t, keyframe)).unwrap() {
            reaped.push(seg);
        }
        if let Some(seg) = controller.on_packet(audio_pkt(t)).unwrap() {
            reaped.push(seg);
        }
        t += 0.04;
    }
    if let Some(seg) = controller.muxer_mut().segment_close().unwrap() {
        reaped.push(seg);
    }
    controller.muxer().refresh_playlist().unwrap();

    assert!(reaped.len() >= 5, "expected roughly 6 segments, got {}", reaped.len());
    for seg in &reaped[..reaped.len() - 1] {
        let secs = seg.duration_secs();
        assert!((8.0..=12.5).contains(&secs), "segment {} duration {secs} out of band", seg.sequence_no);
    }
    for (i, w) in reaped.windows(2).enumerate() {
        assert_eq!(w[1].sequence_no, w[0].sequence_no + 1, "sequence gap at index {i}");
    }

    let m3u8 = read_playlist(&controller.muxer().m3u8_path());
    assert!(m3u8.contains("#EXTM3U"));
    assert!(m3u8.contains("#EXT-X-TARGETDURATION"));
    assert!(m3u8.contains(&format!("#EXT-X-MEDIA-SEQUENCE:{}", controller.muxer().window().first().unwrap().sequence_no)));
}

/// S3 (pure-audio reap): no video ever observed, so segmenting falls back
/// to `is_segment_absolutely_overflow` (`aof_ratio * fragment`).
#[test]
fn pure_audio_reaps_at_aof_ratio_bound() {
    let dir = tempdir().unwrap();
    let mut cfg = base_cfg(dir.path());
    cfg.fragment_secs = 5.0;
    cfg.aof_ratio = 2.1;
    let muxer = Muxer::new(cfg, Container::Ts, "_".into(), "live".into(), "stream".into());
    let mut controller = Controller::new(muxer, 48_000);
    controller.on_packet(audio_sh()).unwrap();

    let mut t = 0.0;
    let mut reaped_at = None;
    while t < 12.0 {
        if let Some(seg) = controller.on_packet(audio_pkt(t)).unwrap() {
            reaped_at = Some((t, seg));
            break;
        }
        t += 0.02;
    }

    let (t, seg) = reaped_at.expect("pure-audio segment should reap before t=12s");
    assert!(t >= 10.4 && t <= 11.2, "reaped at t={t}, expected near 10.5s (aof bound)");
    assert_eq!(seg.sequence_no, 0);
}

/// S4 (discontinuity): a mid-publish codec switch must mark the next
/// opened segment discontinuous and surface `#EXT-X-DISCONTINUITY`.
#[test]
fn codec_switch_marks_next_segment_discontinuous() {
    let dir = tempdir().unwrap();
    let mut cfg = base_cfg(dir.path());
    cfg.fragment_secs = 2.0;
    let muxer = Muxer::new(cfg, Container::Ts, "_".into(), "live".into(), "stream".into());
    let mut controller = Controller::new(muxer, 48_000);
    controller.on_packet(video_sh(CodecId::Avc)).unwrap();

    let mut reaped = Vec::new();
    let mut t = 0.0;
    while t < 3.0 {
        let keyframe = (t * 1000.0) as u64 % 500 < 40;
        if let Some(seg) = controller.on_packet(video_pkt(t, keyframe)).unwrap() {
            reaped.push(seg);
        }
        t += 0.04;
    }

    // Codec switch AVC -> HEVC arrives as a fresh sequence header mid-publish.
    controller.on_packet(video_sh(CodecId::Hevc)).unwrap();

    let mut saw_discontinuous = false;
    while t < 6.0 {
        let keyframe = (t * 1000.0) as u64 % 500 < 40;
        let mut pkt = video_pkt(t, keyframe);
        pkt.codec = CodecId::Hevc;
        if let Some(seg) = controller.on_packet(pkt).unwrap() {
            if seg.discontinuity {
                saw_discontinuous = true;
            }
            reaped.push(seg);
        }
        t += 0.04;
    }
    if let Some(seg) = controller.muxer_mut().segment_close().unwrap() {
        if seg.discontinuity {
            saw_discontinuous = true;
        }
    }
    controller.muxer().refresh_playlist().unwrap();

    assert!(saw_discontinuous, "no reaped segment carried discontinuity=true after codec switch");
    let m3u8 = read_playlist(&controller.muxer().m3u8_path());
    assert!(m3u8.contains("#EXT-X-DISCONTINUITY"));
}

/// S5 (key rotation): segments 0, 3, 6 ... emit a fresh `#EXT-X-KEY`;
/// intermediate segments inherit without a redundant line.
#[test]
fn key_rotation_emits_ext_x_key_only_at_boundaries() {
    let dir = tempdir().unwrap();
    let mut cfg = base_cfg(dir.path());
    cfg.keys = true;
    cfg.fragments_per_key = 3;
    let mut muxer = Muxer::new(cfg, Container::Ts, "_".into(), "live".into(), "stream".into());
    muxer.set_acodec(CodecId::Aac);

    for seq in 0u64..4 {
        muxer.segment_open(seq * 450_000).unwrap();
        muxer.write_audio(&audio_pkt(seq as f64 * 5.0)).unwrap();
        muxer.flush_audio().unwrap();
        muxer.update_duration(seq * 450_000 + 450_000);
        let closed = muxer.segment_close().unwrap();
        assert!(closed.is_some(), "segment {seq} should have reaped");
    }
    muxer.refresh_playlist().unwrap();

    let rotation_ids: Vec<u64> = muxer.window().iter().map(|s| s.key_rotation_id).collect();
    assert_eq!(rotation_ids, vec![0, 0, 0, 1]);

    let m3u8 = read_playlist(&muxer.m3u8_path());
    let key_lines = m3u8.matches("URI=").count();
    assert_eq!(key_lines, 2, "expected one EXT-X-KEY at seq 0 and one at seq 3, got {key_lines} in:\n{m3u8}");
    assert!(m3u8.contains("key-0.key"), "key URI should point at the key file, not the segment, in:\n{m3u8}");
    assert!(m3u8.contains("key-1.key"), "missing second rotation's key URI in:\n{m3u8}");
    for seg in muxer.window().iter() {
        let key_path = dir.path().join(format!("key-{}.key", seg.key_rotation_id));
        assert_eq!(std::fs::metadata(&key_path).unwrap().len(), 16);
    }
}

/// S6 (fMP4): `init.mp4` must exist and the playlist must carry
/// `#EXT-X-MAP` and `#EXT-X-VERSION:7` before any `.m4s` is referenced.
#[test]
fn fmp4_writes_init_before_first_fragment_and_maps_it() {
    let dir = tempdir().unwrap();
    let mut cfg = base_cfg(dir.path());
    cfg.use_fmp4 = true;
    cfg.fragment_secs = 2.0;
    let muxer = Muxer::new(cfg, Container::Fmp4, "_".into(), "live".into(), "stream".into());
    let mut controller = Controller::new(muxer, 48_000);

    controller.on_packet(video_sh(CodecId::Avc)).unwrap();
    controller.on_packet(audio_sh()).unwrap();

    let init_path = controller.muxer().init_path();
    assert!(!init_path.exists(), "init.mp4 must not exist before any content packet");

    let mut t = 0.0;
    let mut reaped = Vec::new();
    while t < 4.0 {
        if let Some(seg) = controller.on_packet(video_pkt(t, (t * 1000.0) as u64 % 2000 < 40)).unwrap() {
            reaped.push(seg);
        }
        if let Some(seg) = controller.on_packet(audio_pkt(t)).unwrap() {
            reaped.push(seg);
        }
        t += 0.04;
    }
    controller.muxer_mut().segment_close().unwrap();
    controller.muxer().refresh_playlist().unwrap();

    assert!(init_path.exists(), "init.mp4 should be written once both SHs are seen");
    let ftyp = std::fs::read(&init_path).unwrap();
    assert!(ftyp.windows(4).any(|w| w == b"ftyp"), "init.mp4 missing ftyp box");
    assert!(ftyp.windows(4).any(|w| w == b"moov"), "init.mp4 missing moov box");

    let m3u8 = read_playlist(&controller.muxer().m3u8_path());
    assert!(m3u8.contains("#EXT-X-VERSION:7"));
    assert!(m3u8.contains("#EXT-X-MAP:URI="));
    assert!(m3u8.contains(&controller.muxer().init_uri()));
}

/// Round-trip: recovering from an on-disk playlist preserves sequence
/// numbers, durations and discontinuity flags across a restart.
#[test]
fn recovery_round_trip_preserves_window_state() {
    let dir = tempdir().unwrap();
    let cfg = base_cfg(dir.path());
    let mut muxer = Muxer::new(cfg.clone(), Container::Ts, "_".into(), "live".into(), "stream".into());
    muxer.set_acodec(CodecId::Aac);

    for seq in 0u64..3 {
        muxer.segment_open(seq * 450_000).unwrap();
        if seq == 2 {
            muxer.on_sequence_header();
        }
        muxer.write_audio(&audio_pkt(seq as f64 * 5.0)).unwrap();
        muxer.flush_audio().unwrap();
        muxer.update_duration(seq * 450_000 + 450_000);
        muxer.segment_close().unwrap();
    }
    muxer.refresh_playlist().unwrap();
    let before: Vec<_> = muxer
        .window()
        .iter()
        .map(|s| (s.sequence_no, s.duration, s.discontinuity, s.uri.clone()))
        .collect();

    let mut fresh = Muxer::new(cfg, Container::Ts, "_".into(), "live".into(), "stream".into());
    crate::mux::playlist::recover(&mut fresh, &muxer.m3u8_path()).unwrap();
    fresh.refresh_playlist().unwrap();
    let after: Vec<_> = fresh
        .window()
        .iter()
        .map(|s| (s.sequence_no, s.duration, s.discontinuity, s.uri.clone()))
        .collect();

    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(after.iter()) {
        assert_eq!(b.0, a.0, "sequence number mismatch after recovery");
        assert_eq!(b.2, a.2, "discontinuity flag mismatch after recovery");
        assert_eq!(b.3, a.3, "uri mismatch after recovery");
        // duration survives the 90kHz <-> seconds-with-3-decimals round trip
        // to within one tick of rounding error.
        let diff = (b.1 as i64 - a.1 as i64).abs();
        assert!(diff <= 90, "duration drifted by {diff} ticks after recovery round trip");
    }
}

/// §3 Inv. 4: a segment shorter than `min_segment_duration` is dropped,
/// not published, and its sequence number is reused.
#[test]
fn undersized_segment_is_dropped_and_sequence_reused() {
    let dir = tempdir().unwrap();
    let cfg = base_cfg(dir.path());
    let mut muxer = Muxer::new(cfg, Container::Ts, "_".into(), "live".into(), "stream".into());
    muxer.set_acodec(CodecId::Aac);

    muxer.segment_open(0).unwrap();
    muxer.write_audio(&audio_pkt(0.0)).unwrap();
    muxer.flush_audio().unwrap();
    muxer.update_duration(1_000); // well under MIN_SEGMENT_DURATION_TICKS (9000)
    let dropped = muxer.segment_close().unwrap();
    assert!(dropped.is_none(), "undersized segment should be dropped, not published");
    assert_eq!(muxer.next_seq(), 0, "sequence number must be reused after a drop");
    assert!(muxer.window().empty());

    muxer.segment_open(0).unwrap();
    muxer.write_audio(&audio_pkt(0.0)).unwrap();
    muxer.flush_audio().unwrap();
    muxer.update_duration(450_000);
    let published = muxer.segment_close().unwrap();
    assert_eq!(published.unwrap().sequence_no, 0, "reused sequence number should be 0 again");
}

/// §7 / §5: two consecutive unpublishes must be indistinguishable from one.
#[tokio::test]
async fn unpublish_is_idempotent() {
    use crate::callback::{CallbackSink, HlsNotification, HlsViewNotification};
    use crate::stream::Stream;

    struct NoopSink;
    #[async_trait::async_trait]
    impl CallbackSink for NoopSink {
        async fn on_hls(&self, _n: HlsNotification) {}
        async fn on_hls_notify(&self, _n: HlsViewNotification) {}
    }

    let dir = tempdir().unwrap();
    let cfg = base_cfg(dir.path());
    let mut stream = Stream::new("_", "live", "stream");
    stream.initialize(cfg, 48_000);
    stream.on_publish(NoopSink, 8);
    stream.on_packet(video_sh(CodecId::Avc));
    stream.on_packet(video_pkt(0.0, true));

    stream.on_unpublish().await;
    stream.on_unpublish().await;
}

/// §4.7 `cycle`: a publishing stream idle past `dispose_secs` tears itself
/// down on the next tick; one still inside the window must not.
#[tokio::test]
async fn cycle_disposes_stream_idle_past_dispose_secs() {
    use crate::callback::{CallbackSink, HlsNotification, HlsViewNotification};
    use crate::stream::Stream;

    struct NoopSink;
    #[async_trait::async_trait]
    impl CallbackSink for NoopSink {
        async fn on_hls(&self, _n: HlsNotification) {}
        async fn on_hls_notify(&self, _n: HlsViewNotification) {}
    }

    let dir = tempdir().unwrap();
    let mut cfg = base_cfg(dir.path());
    cfg.dispose_secs = 0.05;
    let mut stream = Stream::new("_", "live", "stream");
    stream.initialize(cfg, 48_000);
    stream.on_publish(NoopSink, 8);
    stream.on_packet(video_sh(CodecId::Avc));
    stream.on_packet(video_pkt(0.0, true));

    stream.cycle().await;
    assert!(stream.controller().is_some(), "must not dispose before dispose_secs elapses");

    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    stream.cycle().await;
    assert!(stream.controller().is_none(), "should dispose once idle past dispose_secs");
}

/// §4.3 CBCS: fMP4 samples are encrypted in place with the per-segment key,
/// and the playlist advertises `METHOD=SAMPLE-AES` for the rotation.
#[test]
fn fmp4_cbcs_encrypts_sample_payload_end_to_end() {
    let dir = tempdir().unwrap();
    let mut cfg = base_cfg(dir.path());
    cfg.use_fmp4 = true;
    cfg.keys = true;
    cfg.fragments_per_key = 8;
    let mut muxer = Muxer::new(cfg, Container::Fmp4, "_".into(), "live".into(), "stream".into());
    muxer.set_acodec(CodecId::Aac);

    let plaintext_block = vec![0xABu8; 32];
    muxer.segment_open(0).unwrap();
    let mut pkt = audio_pkt(0.0);
    pkt.payload = plaintext_block.clone();
    muxer.write_audio(&pkt).unwrap();
    muxer.flush_audio().unwrap();
    muxer.update_duration(450_000);
    let closed = muxer.segment_close().unwrap().expect("segment should reap");
    muxer.refresh_playlist().unwrap();

    let on_disk = std::fs::read(&closed.path).unwrap();
    assert!(
        !on_disk.windows(plaintext_block.len()).any(|w| w == plaintext_block.as_slice()),
        "sample payload should not survive unencrypted in the segment file"
    );

    let m3u8 = read_playlist(&muxer.m3u8_path());
    assert!(m3u8.contains("METHOD=SAMPLE-AES"), "fmp4 key lines must use SAMPLE-AES in:\n{m3u8}");
}

/// §4.3/§5: `init.mp4` for a CBCS-encrypted stream must carry a `tenc` box
/// (per-track protection scheme) and a `pssh` (Common SystemID) box, not
/// just the unencrypted `avc1`/`mp4a` sample entries.
#[test]
fn fmp4_cbcs_init_segment_carries_tenc_and_pssh() {
    let dir = tempdir().unwrap();
    let mut cfg = base_cfg(dir.path());
    cfg.use_fmp4 = true;
    cfg.keys = true;
    cfg.fragments_per_key = 8;
    let muxer = Muxer::new(cfg, Container::Fmp4, "_".into(), "live".into(), "stream".into());
    let mut controller = Controller::new(muxer, 48_000);

    controller.on_packet(video_sh(CodecId::Avc)).unwrap();
    controller.on_packet(audio_sh()).unwrap();
    // first content packet triggers write_init()
    controller.on_packet(video_pkt(0.0, true)).unwrap();

    let init_bytes = std::fs::read(controller.muxer().init_path()).unwrap();
    assert!(init_bytes.windows(4).any(|w| w == b"tenc"), "init.mp4 missing tenc box for a keyed stream");
    assert!(init_bytes.windows(4).any(|w| w == b"pssh"), "init.mp4 missing pssh box for a keyed stream");
    assert!(init_bytes.windows(4).any(|w| w == b"sinf"), "init.mp4 missing sinf box wrapping tenc");
    assert!(init_bytes.windows(4).any(|w| w == b"encv"), "video sample entry should be renamed to encv when keyed");
}

/// §4.3/§5: each encrypted fragment's `moof` must carry `senc` (per-sample
/// IVs), `saiz` and `saio` (auxiliary info size/offset) alongside the
/// existing ciphertext-only assertion in
/// `fmp4_cbcs_encrypts_sample_payload_end_to_end`.
#[test]
fn fmp4_cbcs_fragment_carries_senc_saio_saiz() {
    let dir = tempdir().unwrap();
    let mut cfg = base_cfg(dir.path());
    cfg.use_fmp4 = true;
    cfg.keys = true;
    cfg.fragments_per_key = 8;
    let mut muxer = Muxer::new(cfg, Container::Fmp4, "_".into(), "live".into(), "stream".into());
    muxer.set_acodec(CodecId::Aac);

    muxer.segment_open(0).unwrap();
    muxer.write_audio(&audio_pkt(0.0)).unwrap();
    muxer.flush_audio().unwrap();
    muxer.update_duration(450_000);
    let closed = muxer.segment_close().unwrap().expect("segment should reap");

    let on_disk = std::fs::read(&closed.path).unwrap();
    assert!(on_disk.windows(4).any(|w| w == b"senc"), "fragment missing senc box");
    assert!(on_disk.windows(4).any(|w| w == b"saiz"), "fragment missing saiz box");
    assert!(on_disk.windows(4).any(|w| w == b"saio"), "fragment missing saio box");
}

/// `[duration]` is only known at segment-close, so the URI written into the
/// playlist must match the renamed on-disk filename, not the tmp-path guess.
#[test]
fn duration_placeholder_is_resolved_consistently_in_uri_and_path() {
    let dir = tempdir().unwrap();
    let mut cfg = base_cfg(dir.path());
    cfg.ts_file = "seg-[seq]-[duration].ts".to_string();
    let mut muxer = Muxer::new(cfg, Container::Ts, "_".into(), "live".into(), "stream".into());
    muxer.set_acodec(CodecId::Aac);

    muxer.segment_open(0).unwrap();
    muxer.write_audio(&audio_pkt(0.0)).unwrap();
    muxer.flush_audio().unwrap();
    muxer.update_duration(450_000); // 5.000s at 90kHz
    let seg = muxer.segment_close().unwrap().expect("segment should reap");
    muxer.refresh_playlist().unwrap();

    assert!(seg.path.exists(), "renamed segment must exist at meta.path");
    let expected_name = seg.path.file_name().unwrap().to_string_lossy().into_owned();
    assert_eq!(seg.uri, expected_name, "uri must reflect the same [duration] substitution as the on-disk filename");

    let m3u8 = read_playlist(&muxer.m3u8_path());
    assert!(m3u8.contains(&seg.uri), "playlist must reference the resolved uri:\n{m3u8}");
}

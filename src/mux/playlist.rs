//! Playlist rewrite and recovery (§4.5 "Playlist refresh" / "Recovery").

use std::fs::File;
use std::io::BufReader;

use m3u8_rs::{ExtTag, Key, KeyMethod, MediaPlaylist, MediaSegment};
use tracing::warn;

use crate::error::{Result, SegmenterError};
use crate::mux::Muxer;
use crate::segment::{Container, Segment, SegmentKey};

fn playlist_version(container: Container) -> usize {
    match container {
        Container::Ts => 3,
        Container::Fmp4 => 7,
    }
}

/// Render the live playlist to `<m3u8>.temp` and atomically rename it into
/// place. Never leaves a partial file visible (§5 "Ordering guarantees").
pub fn write(muxer: &Muxer) -> Result<()> {
    let window = muxer.window();
    if window.empty() {
        return Ok(());
    }

    let cfg = muxer.cfg();
    let container = muxer.container();

    let mut pl = MediaPlaylist {
        version: Some(playlist_version(container)),
        ..Default::default()
    };

    let max_td_secs = (cfg.fragment_secs * cfg.td_ratio).max(window.max_duration() as f64 / 90_000.0);
    pl.target_duration = max_td_secs.ceil() as f32;
    pl.media_sequence = window.first().map(|s| s.sequence_no).unwrap_or(0);
    pl.end_list = false;

    if container == Container::Fmp4 {
        pl.unknown_tags.push(ExtTag {
            tag: "X-MAP".to_string(),
            rest: Some(format!("URI=\"{}\"", muxer.init_uri())),
        });
    }

    let mut last_rotation = None;
    for seg in window.iter() {
        let mut key = None;
        if seg.key.is_encrypted() && last_rotation != Some(seg.key_rotation_id) {
            last_rotation = Some(seg.key_rotation_id);
            key = Some(to_playlist_key(seg, container, muxer));
        }

        pl.segments.push(MediaSegment {
            uri: seg.uri.clone(),
            duration: seg.duration_secs() as f32,
            discontinuity: seg.discontinuity,
            keys: key.into_iter().collect(),
            ..Default::default()
        });
    }

    let path = muxer.m3u8_path();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| SegmenterError::playlist(parent, e))?;
        }
    }
    let tmp = path.with_extension("m3u8.temp");
    let mut f = File::create(&tmp).map_err(|e| SegmenterError::playlist(&tmp, e))?;
    pl.write_to(&mut f)
        .map_err(|e| SegmenterError::playlist(&tmp, std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
    drop(f);

    if let Err(e) = std::fs::rename(&tmp, &path) {
        warn!(path = %path.display(), %e, "m3u8 rename failed, leaving previous playlist in place");
        let _ = std::fs::remove_file(&tmp);
        return Err(SegmenterError::playlist(&path, e));
    }
    Ok(())
}

fn to_playlist_key(seg: &Segment, container: Container, muxer: &Muxer) -> Key {
    let method = match container {
        Container::Ts => KeyMethod::AES128,
        Container::Fmp4 => KeyMethod::SampleAES,
    };
    let uri = muxer
        .cfg()
        .key_url
        .clone()
        .unwrap_or_else(|| muxer.key_uri(seg.key_rotation_id));
    Key {
        method,
        uri: Some(uri),
        iv: seg.key.iv_hex().map(|h| format!("0x{h}")),
        keyformat: None,
        keyformatversions: None,
    }
}

/// Best-effort recovery: re-ingest an existing `.m3u8` so
/// `EXT-X-MEDIA-SEQUENCE` and existing segments are preserved across a
/// restart. Any parse anomaly causes that one segment to be skipped rather
/// than aborting recovery (§4.5 "Recovery").
pub fn recover(muxer: &mut Muxer, path: &std::path::Path) -> Result<()> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return Ok(()), // nothing to recover from, not an error
    };
    let mut reader = BufReader::new(file);
    let bytes = {
        use std::io::Read;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).map_err(|e| SegmenterError::io(path, e))?;
        buf
    };

    let parsed = match m3u8_rs::parse_media_playlist_res(&bytes) {
        Ok(pl) => pl,
        Err(_) => return Ok(()),
    };

    let mut seq = parsed.media_sequence;
    let mut carry_discontinuity = false;
    let mut recovered = Vec::new();

    for seg in &parsed.segments {
        if seg.discontinuity {
            carry_discontinuity = true;
        }
        if seg.uri.is_empty() || seg.duration <= 0.0 {
            warn!(uri = %seg.uri, "skipping unparseable segment during recovery");
            continue;
        }
        if muxer.window().iter().any(|s| s.uri == seg.uri) {
            continue;
        }

        recovered.push(Segment {
            sequence_no: seq,
            path: muxer.cfg().path.join(&seg.uri),
            tmp_path: muxer.cfg().path.join(format!("{}.tmp", seg.uri)),
            uri: seg.uri.clone(),
            duration: (seg.duration as f64 * 90_000.0) as u64,
            discontinuity: carry_discontinuity,
            key: SegmentKey::None,
            closed: true,
            container: muxer.container(),
            key_rotation_id: 0,
        });
        carry_discontinuity = false;
        seq += 1;
    }

    for seg in recovered {
        muxer.window_mut().append(seg);
    }
    muxer.set_next_seq(seq);
    Ok(())
}

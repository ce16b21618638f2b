//! fMP4 / ISO BMFF segment writer (§4.3, C3). Builds a one-shot `init.mp4`
//! (`ftyp` + `moov`) and per-segment `.m4s` fragments (`moof` + `mdat`),
//! with optional CBCS sample encryption.

use bytes::{Bytes, BytesMut};
use mp4_atom::{
    Avc1, Avcc, Ftyp, Hdlr, Hev1, Hvcc, Mdhd, Mdia, Mfhd, Minf, Mp4a, Mvex, Mvhd, Stbl, Stco, Stsc,
    Stsd, Stsz, Stts, Tfdt, Tfhd, Tkhd, Traf, Trak, Trex, Trun, TrunEntry, Vmhd,
};
use mp4_atom::Encode;
use tracing::warn;

use crate::crypto::{encrypt_cbcs_sample, KeyMaterial, CBCS_ENCRYPT_BLOCKS, CBCS_SKIP_BLOCKS};
use crate::error::{Result, SegmenterError};
use crate::packet::{CodecId, Packet};

pub const VIDEO_TRACK_ID: u32 = 1;
pub const AUDIO_TRACK_ID: u32 = 2;

fn encode_err<E: std::fmt::Display>(e: E) -> SegmenterError {
    SegmenterError::ProtocolViolation(format!("fmp4 encode: {e}"))
}

/// CENC "Common SystemID" (`1077efec-c0b2-4d02-ace3-3c1e52e2fb4b`) advertised
/// in `pssh`. This repo doesn't speak to any one DRM license server, so it
/// signals the system-agnostic KID mapping rather than a vendor system id.
const PSSH_COMMON_SYSTEM_ID: [u8; 16] = [
    0x10, 0x77, 0xef, 0xec, 0xc0, 0xb2, 0x4d, 0x02, 0xac, 0xe3, 0x3c, 0x1e, 0x52, 0xe2, 0xfb, 0x4b,
];

/// Writes a complete `[size][fourcc][body]` box.
fn write_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&((8 + body.len()) as u32).to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(body);
    out
}

/// Adds `delta` to the big-endian `u32` box-size field at `at`. Used only to
/// grow an already-encoded ancestor box after splicing a new child into it;
/// every anchor this is called with sits before the splice point, so the
/// rewrite never invalidates another offset already computed from `buf`.
fn bump_u32(buf: &mut [u8], at: usize, delta: usize) {
    let cur = u32::from_be_bytes(buf[at..at + 4].try_into().unwrap());
    buf[at..at + 4].copy_from_slice(&(cur + delta as u32).to_be_bytes());
}

/// Finds the first direct child box with the given fourcc inside `body`
/// (the content of a *simple* container box, i.e. one with no fields of its
/// own before its children — `trak`/`mdia`/`minf`/`stbl` all qualify).
fn find_simple_child(body: &[u8], fourcc: &[u8; 4]) -> Option<(usize, usize)> {
    let mut pos = 0;
    while pos + 8 <= body.len() {
        let size = u32::from_be_bytes(body[pos..pos + 4].try_into().unwrap()) as usize;
        if size < 8 || pos + size > body.len() {
            break;
        }
        if &body[pos + 4..pos + 8] == fourcc {
            return Some((pos, size));
        }
        pos += size;
    }
    None
}

fn build_frma(original_format: &[u8; 4]) -> Vec<u8> {
    write_box(b"frma", original_format)
}

fn build_schm() -> Vec<u8> {
    let mut body = Vec::with_capacity(12);
    body.extend_from_slice(&[0, 0, 0, 0]); // version + flags
    body.extend_from_slice(b"cbcs");
    body.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // scheme_version 1.0
    write_box(b"schm", &body)
}

/// `tenc`, version 1 (carries the pattern fields CBCS needs). Per-sample IVs
/// are 16 bytes, so `default_constant_IV` is absent (§5 "1 encrypt / 9 skip").
fn build_tenc(kid: [u8; 16]) -> Vec<u8> {
    let mut body = Vec::with_capacity(24);
    body.push(1); // version
    body.extend_from_slice(&[0, 0, 0]); // flags
    body.push(0); // reserved
    body.push(((CBCS_ENCRYPT_BLOCKS as u8) << 4) | (CBCS_SKIP_BLOCKS as u8 & 0x0f));
    body.push(1); // default_isProtected
    body.push(16); // default_Per_Sample_IV_Size
    body.extend_from_slice(&kid);
    write_box(b"tenc", &body)
}

fn build_sinf(original_format: &[u8; 4], kid: [u8; 16]) -> Vec<u8> {
    let schi = write_box(b"schi", &build_tenc(kid));
    let mut body = Vec::new();
    body.extend_from_slice(&build_frma(original_format));
    body.extend_from_slice(&build_schm());
    body.extend_from_slice(&schi);
    write_box(b"sinf", &body)
}

fn build_pssh(kid: [u8; 16]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + 16 + 4 + 16 + 4);
    body.push(1); // version 1: KID list present
    body.extend_from_slice(&[0, 0, 0]); // flags
    body.extend_from_slice(&PSSH_COMMON_SYSTEM_ID);
    body.extend_from_slice(&1u32.to_be_bytes()); // kid_count
    body.extend_from_slice(&kid);
    body.extend_from_slice(&0u32.to_be_bytes()); // data_size
    write_box(b"pssh", &body)
}

/// Rewrites an already-encoded `trak` box into a CENC "Protected Sample
/// Entry": the sample entry's fourcc becomes `encv`/`enca` and a `sinf`
/// (`frma`+`schm`+`schi>tenc`) box is appended to it, bumping every ancestor
/// box's size field in turn (§4.3, §6 "per-track tenc when encrypted").
fn encrypt_trak(mut bytes: Vec<u8>, is_audio: bool, original_format: &[u8; 4], kid: [u8; 16]) -> Vec<u8> {
    let body_start = 8;
    let (mdia_off, mdia_size) =
        find_simple_child(&bytes[body_start..], b"mdia").expect("trak missing mdia");
    let mdia_abs = body_start + mdia_off;
    let (minf_off, minf_size) = find_simple_child(&bytes[mdia_abs + 8..mdia_abs + mdia_size], b"minf")
        .expect("mdia missing minf");
    let minf_abs = mdia_abs + 8 + minf_off;
    let (stbl_off, stbl_size) = find_simple_child(&bytes[minf_abs + 8..minf_abs + minf_size], b"stbl")
        .expect("minf missing stbl");
    let stbl_abs = minf_abs + 8 + stbl_off;
    let (stsd_off, _stsd_size) = find_simple_child(&bytes[stbl_abs + 8..stbl_abs + stbl_size], b"stsd")
        .expect("stbl missing stsd");
    let stsd_abs = stbl_abs + 8 + stsd_off;
    // stsd is a FullBox (entry_count follows version/flags) with exactly one
    // entry in this repo (single codec per track), so the entry starts right
    // after stsd's 8-byte box header + 4-byte version/flags + 4-byte count.
    let entry_abs = stsd_abs + 16;
    let entry_size = u32::from_be_bytes(bytes[entry_abs..entry_abs + 4].try_into().unwrap()) as usize;

    let new_fourcc: &[u8; 4] = if is_audio { b"enca" } else { b"encv" };
    bytes[entry_abs + 4..entry_abs + 8].copy_from_slice(new_fourcc);

    let sinf = build_sinf(original_format, kid);
    let insert_at = entry_abs + entry_size;
    let delta = sinf.len();
    bytes.splice(insert_at..insert_at, sinf);

    for anchor in [entry_abs, stsd_abs, stbl_abs, minf_abs, mdia_abs, 0usize] {
        bump_u32(&mut bytes, anchor, delta);
    }
    bytes
}

/// Builds `init.mp4` once per publish session (§4.3 "init.mp4").
/// `video_sh`/`audio_sh` are the raw sequence-header payloads (SPS/PPS/VPS,
/// AudioSpecificConfig) as received from the controller.
pub struct InitSegmentBuilder;

impl InitSegmentBuilder {
    pub fn build(
        video: Option<(CodecId, &[u8])>,
        audio: Option<(CodecId, &[u8])>,
        key: Option<&KeyMaterial>,
    ) -> Result<Vec<u8>> {
        let ftyp = Ftyp {
            major_brand: *b"iso6",
            minor_version: 0,
            compatible_brands: vec![*b"iso6", *b"isom", *b"avc1", *b"mp41"],
        };

        let kid = key.and_then(|k| k.kid);

        let mut traks: Vec<(Trak, bool, [u8; 4])> = Vec::new();
        if let Some((codec, sh)) = video {
            let original_format: [u8; 4] = match codec {
                CodecId::Hevc => *b"hev1",
                _ => *b"avc1",
            };
            traks.push((Self::video_trak(codec, sh)?, false, original_format));
        }
        if let Some((codec, sh)) = audio {
            traks.push((Self::audio_trak(codec, sh)?, true, *b"mp4a"));
        }

        let mvex = Mvex {
            trex: traks
                .iter()
                .map(|(t, _, _)| Trex {
                    track_id: t.tkhd.track_id,
                    default_sample_description_index: 1,
                    default_sample_duration: 0,
                    default_sample_size: 0,
                    default_sample_flags: 0,
                })
                .collect(),
            ..Default::default()
        };

        let mvhd = Mvhd {
            timescale: 90_000,
            duration: 0,
            rate: 1.0,
            volume: 1.0,
            next_track_id: traks.len() as u32 + 1,
            ..Default::default()
        };

        let mut mvhd_bytes = BytesMut::new();
        mvhd.encode(&mut mvhd_bytes).map_err(encode_err)?;
        let mut mvex_bytes = BytesMut::new();
        mvex.encode(&mut mvex_bytes).map_err(encode_err)?;

        // `moov` is assembled by hand rather than through a typed `Moov`
        // because an encrypted track's `trak` is patched byte-for-byte after
        // encoding (see `encrypt_trak`) and can no longer round-trip through
        // `Moov`'s own typed `trak: Vec<Trak>` field.
        let mut moov_body = Vec::new();
        moov_body.extend_from_slice(&mvhd_bytes);
        for (trak, is_audio, original_format) in &traks {
            let mut trak_bytes = BytesMut::new();
            trak.encode(&mut trak_bytes).map_err(encode_err)?;
            let trak_bytes = match kid {
                Some(kid) => encrypt_trak(trak_bytes.to_vec(), *is_audio, original_format, kid),
                None => trak_bytes.to_vec(),
            };
            moov_body.extend_from_slice(&trak_bytes);
        }
        moov_body.extend_from_slice(&mvex_bytes);
        if let Some(kid) = kid {
            moov_body.extend_from_slice(&build_pssh(kid));
        }
        let moov_bytes = write_box(b"moov", &moov_body);

        let mut out = BytesMut::new();
        ftyp.encode(&mut out).map_err(encode_err)?;
        out.extend_from_slice(&moov_bytes);
        Ok(out.to_vec())
    }

    fn video_trak(codec: CodecId, sh: &[u8]) -> Result<Trak> {
        let stsd = match codec {
            CodecId::Avc => Stsd {
                codecs: vec![mp4_atom::Codec::Avc1(Avc1 {
                    visual: Default::default(),
                    avcc: Avcc::decode_body(&mut std::io::Cursor::new(sh)).unwrap_or(Avcc {
                        configuration_version: 1,
                        avc_profile_indication: 0,
                        profile_compatibility: 0,
                        avc_level_indication: 0,
                        length_size: 4,
                        sps: vec![],
                        pps: vec![],
                        ext: None,
                    }),
                })],
            },
            CodecId::Hevc => Stsd {
                codecs: vec![mp4_atom::Codec::Hev1(Hev1 {
                    visual: Default::default(),
                    hvcc: Hvcc::decode_body(&mut std::io::Cursor::new(sh)).unwrap_or_default(),
                })],
            },
            _ => {
                return Err(SegmenterError::ProtocolViolation(
                    "video trak requested for non-video codec".to_string(),
                ))
            }
        };

        Ok(Trak {
            tkhd: Tkhd {
                track_id: VIDEO_TRACK_ID,
                ..Default::default()
            },
            mdia: Mdia {
                mdhd: Mdhd {
                    timescale: 90_000,
                    ..Default::default()
                },
                hdlr: Hdlr {
                    handler: *b"vide",
                    ..Default::default()
                },
                minf: Minf {
                    vmhd: Some(Vmhd::default()),
                    stbl: Stbl {
                        stsd,
                        stts: Stts::default(),
                        stsc: Stsc::default(),
                        stsz: Stsz::default(),
                        stco: Stco::default(),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            },
            ..Default::default()
        })
    }

    fn audio_trak(codec: CodecId, sh: &[u8]) -> Result<Trak> {
        if codec != CodecId::Aac {
            return Err(SegmenterError::ProtocolViolation(
                "fmp4 audio only supports AAC".to_string(),
            ));
        }
        let stsd = Stsd {
            codecs: vec![mp4_atom::Codec::Mp4a(Mp4a {
                audio: Default::default(),
                esds: mp4_atom::Esds {
                    es_desc: mp4_atom::EsDescriptor {
                        dec_config: mp4_atom::DecoderConfig {
                            object_type_indication: 0x40,
                            stream_type: 0x05,
                            dec_specific: sh.to_vec(),
                            ..Default::default()
                        },
                        ..Default::default()
                    },
                },
            })],
        };

        Ok(Trak {
            tkhd: Tkhd {
                track_id: AUDIO_TRACK_ID,
                ..Default::default()
            },
            mdia: Mdia {
                mdhd: Mdhd {
                    timescale: 90_000,
                    ..Default::default()
                },
                hdlr: Hdlr {
                    handler: *b"soun",
                    ..Default::default()
                },
                minf: Minf {
                    stbl: Stbl {
                        stsd,
                        stts: Stts::default(),
                        stsc: Stsc::default(),
                        stsz: Stsz::default(),
                        stco: Stco::default(),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            },
            ..Default::default()
        })
    }
}

struct PendingSample {
    dts: u64,
    pts: u64,
    flags: u32,
    payload: Vec<u8>,
    /// IV in force at the start of this sample's encryption, i.e. before
    /// `encrypt_cbcs_sample` advances it for the next one; `None` when the
    /// fragment isn't encrypted. Recorded so `senc` can list each sample's
    /// own IV rather than only the final chained value (§5).
    iv: Option<[u8; 16]>,
}

/// Accumulates samples for one `.m4s` fragment; `flush` back-patches offsets
/// and serialises `moof` + `mdat` (§4.3).
pub struct FragmentWriter {
    sequence_number: u32,
    track_id: u32,
    samples: Vec<PendingSample>,
    last_dts: Option<u64>,
    cbcs: Option<([u8; 16], [u8; 16])>,
}

impl FragmentWriter {
    pub fn new(sequence_number: u32, track_id: u32, cbcs_key: Option<([u8; 16], [u8; 16])>) -> Self {
        FragmentWriter {
            sequence_number,
            track_id,
            samples: Vec::new(),
            last_dts: None,
            cbcs: cbcs_key,
        }
    }

    /// `write_sample` MUST be called in non-decreasing DTS order (§4.3
    /// "Contracts"): a reversal is a programming error on the controller's
    /// part, so it trips a `debug_assert!` in debug builds; in release
    /// builds it is logged and the sample is dropped rather than silently
    /// reordered (§7 `ProtocolViolation`).
    pub fn write_sample(&mut self, packet: &Packet, flags: u32) -> Result<()> {
        if let Some(last) = self.last_dts {
            debug_assert!(packet.dts >= last, "fmp4 write_sample received out-of-order dts");
            if packet.dts < last {
                warn!(last, dts = packet.dts, "fmp4 write_sample received out-of-order dts, dropping sample");
                return Err(SegmenterError::ProtocolViolation(format!(
                    "fmp4 write_sample received out-of-order dts: {} < {}",
                    packet.dts, last
                )));
            }
        }
        self.last_dts = Some(packet.dts);

        let mut payload = packet.payload.clone();
        let sample_iv = self.cbcs.as_ref().map(|(_, iv)| *iv);
        if let Some((key, iv)) = self.cbcs.as_mut() {
            encrypt_cbcs_sample(key, iv, &mut payload);
        }
        self.samples.push(PendingSample {
            dts: packet.dts,
            pts: packet.pts,
            flags,
            payload,
            iv: sample_iv,
        });
        Ok(())
    }

    pub fn flush(self, final_dts: u64) -> Result<Vec<u8>> {
        let encrypted = self.cbcs.is_some();
        let mdat_header_size = 8;

        let mut entries = Vec::with_capacity(self.samples.len());
        let mut ivs = Vec::with_capacity(self.samples.len());
        let mut prev_dts = self.samples.first().map(|s| s.dts).unwrap_or(final_dts);
        let mut mdat = BytesMut::new();
        for s in &self.samples {
            let duration = s.dts.saturating_sub(prev_dts).max(1) as u32;
            prev_dts = s.dts;
            entries.push(TrunEntry {
                duration: Some(duration),
                size: Some(s.payload.len() as u32),
                flags: Some(s.flags),
                cts: Some((s.pts as i64 - s.dts as i64) as i32),
            });
            ivs.push(s.iv.unwrap_or([0u8; 16]));
            mdat.extend_from_slice(&s.payload);
        }
        let sample_count = entries.len() as u32;
        let first_dts = self.samples.first().map(|s| s.dts).unwrap_or(final_dts);

        let mut traf_typed = Traf {
            tfhd: Tfhd {
                track_id: self.track_id,
                base_data_offset: None,
                sample_description_index: Some(1),
                default_sample_duration: None,
                default_sample_size: None,
                default_sample_flags: None,
            },
            tfdt: Some(Tfdt {
                base_media_decode_time: first_dts,
            }),
            trun: vec![Trun {
                data_offset: Some(0),
                entries,
            }],
            ..Default::default()
        };

        let mut mfhd_bytes = BytesMut::new();
        Mfhd {
            sequence_number: self.sequence_number,
        }
        .encode(&mut mfhd_bytes)
        .map_err(encode_err)?;

        let encode_traf = |traf: &Traf| -> Result<Vec<u8>> {
            let mut b = BytesMut::new();
            traf.encode(&mut b).map_err(encode_err)?;
            Ok(b.to_vec())
        };

        // First pass: measure the unencrypted traf's length (fixed
        // regardless of `data_offset`'s actual value) so the crypto boxes'
        // byte offsets can be computed before `trun.data_offset` is known.
        let traf_bytes = encode_traf(&traf_typed)?;
        let mut extra = Vec::new();
        if encrypted {
            let senc = build_senc(&ivs);
            let saiz = build_saiz(sample_count);
            let moof_header_size = 8;
            let traf_box_start = moof_header_size + mfhd_bytes.len();
            let senc_abs = traf_box_start + traf_bytes.len();
            let iv_data_start = senc_abs + 16; // senc hdr(8) + fullbox(4) + sample_count(4)
            let saio = build_saio(iv_data_start as u32);
            extra.extend_from_slice(&senc);
            extra.extend_from_slice(&saiz);
            extra.extend_from_slice(&saio);
        }

        let moof_header_size = 8;
        let moof_total_len = moof_header_size + mfhd_bytes.len() + traf_bytes.len() + extra.len();
        let real_offset = (moof_total_len + mdat_header_size) as i32;
        traf_typed.trun[0].data_offset = Some(real_offset);

        let mut traf_bytes = encode_traf(&traf_typed)?;
        if encrypted {
            bump_u32(&mut traf_bytes, 0, extra.len());
            traf_bytes.extend_from_slice(&extra);
        }

        let mut moof_body = Vec::with_capacity(mfhd_bytes.len() + traf_bytes.len());
        moof_body.extend_from_slice(&mfhd_bytes);
        moof_body.extend_from_slice(&traf_bytes);
        let moof_bytes = write_box(b"moof", &moof_body);

        let mut out = Vec::with_capacity(moof_bytes.len() + mdat_header_size + mdat.len());
        out.extend_from_slice(&moof_bytes);
        let mdat_atom = mp4_atom::Mdat(Bytes::from(mdat.to_vec()));
        let mut mdat_bytes = BytesMut::new();
        mdat_atom.encode(&mut mdat_bytes).map_err(encode_err)?;
        out.extend_from_slice(&mdat_bytes);
        Ok(out)
    }
}

/// `senc`, version 0, no subsample table: one 16-byte IV per sample (§5).
fn build_senc(ivs: &[[u8; 16]]) -> Vec<u8> {
    let mut body = Vec::with_capacity(8 + ivs.len() * 16);
    body.extend_from_slice(&[0, 0, 0, 0]); // version + flags
    body.extend_from_slice(&(ivs.len() as u32).to_be_bytes());
    for iv in ivs {
        body.extend_from_slice(iv);
    }
    write_box(b"senc", &body)
}

/// `saiz`: every sample's auxiliary info (its IV) is a constant 16 bytes.
fn build_saiz(sample_count: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(9);
    body.extend_from_slice(&[0, 0, 0, 0]); // version + flags
    body.push(16); // default_sample_info_size
    body.extend_from_slice(&sample_count.to_be_bytes());
    write_box(b"saiz", &body)
}

/// `saio`, version 0: one offset, counted from the first byte of the
/// containing `moof` (matching `trun.data_offset`'s own anchor in this file).
fn build_saio(offset: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(12);
    body.extend_from_slice(&[0, 0, 0, 0]); // version + flags
    body.extend_from_slice(&1u32.to_be_bytes()); // entry_count
    body.extend_from_slice(&offset.to_be_bytes());
    write_box(b"saio", &body)
}

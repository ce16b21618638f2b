//! MPEG-2 TS segment writer (§4.2, C2). Packetises audio/video PES into a
//! single `.ts` buffer; PAT/PMT are (re)written once per segment open.

use mpeg2ts::es::{StreamId, StreamType};
use mpeg2ts::pes::PesHeader;
use mpeg2ts::time::{ClockReference, Timestamp};
use mpeg2ts::ts::payload::{Bytes, Pat, Pes, Pmt};
use mpeg2ts::ts::{
    AdaptationField, ContinuityCounter, EsInfo, Pid, ProgramAssociation, TsHeader, TsPacket,
    TsPacketWriter, TsPayload, VersionNumber, WriteTsPacket,
};

use crate::crypto::encrypt_ts_segment;
use crate::error::{Result, SegmenterError};
use crate::packet::{CodecId, Packet};

const PAT_PID: u16 = 0;
const PMT_PID: u16 = 256;
const VIDEO_ES_PID: u16 = 257;
const AUDIO_ES_PID: u16 = 258;

const PES_VIDEO_STREAM_ID: u8 = 0xe0;
const PES_AUDIO_STREAM_ID: u8 = 0xc0;

fn ts_header(pid: u16, cc: ContinuityCounter) -> TsHeader {
    use mpeg2ts::ts::TransportScramblingControl;
    TsHeader {
        transport_error_indicator: false,
        transport_priority: false,
        pid: Pid::new(pid).expect("static pid constant in range"),
        transport_scrambling_control: TransportScramblingControl::NotScrambled,
        continuity_counter: cc,
    }
}

fn stream_type(codec: CodecId) -> StreamType {
    match codec {
        CodecId::Aac => StreamType::AdtsAac,
        CodecId::Mp3 => StreamType::Mp3,
        CodecId::Avc => StreamType::H264,
        CodecId::Hevc => StreamType::H265,
    }
}

/// Writes one TS segment's worth of packets into an in-memory buffer so the
/// cipher wrapper (§4.2 "Cipher mode") can encrypt the whole thing on close
/// without a second pass over disk.
pub struct TsSegmentWriter {
    ts: TsPacketWriter<Vec<u8>>,
    audio_cc: ContinuityCounter,
    video_cc: ContinuityCounter,
    acodec: Option<CodecId>,
    vcodec: Option<CodecId>,
}

impl TsSegmentWriter {
    pub fn open(acodec: Option<CodecId>, vcodec: Option<CodecId>) -> Result<Self> {
        let mut ts = TsPacketWriter::new(Vec::new());
        ts.write_ts_packet(&Self::pat()).map_err(ts_err)?;
        ts.write_ts_packet(&Self::pmt(acodec, vcodec)).map_err(ts_err)?;
        Ok(TsSegmentWriter {
            ts,
            audio_cc: ContinuityCounter::default(),
            video_cc: ContinuityCounter::default(),
            acodec,
            vcodec,
        })
    }

    fn pat() -> TsPacket {
        TsPacket {
            header: ts_header(PAT_PID, ContinuityCounter::default()),
            adaptation_field: None,
            payload: Some(TsPayload::Pat(Pat {
                transport_stream_id: 1,
                version_number: VersionNumber::default(),
                table: vec![ProgramAssociation {
                    program_num: 1,
                    program_map_pid: Pid::new(PMT_PID).unwrap(),
                }],
            })),
        }
    }

    fn pmt(acodec: Option<CodecId>, vcodec: Option<CodecId>) -> TsPacket {
        let mut table = Vec::new();
        if let Some(v) = vcodec {
            table.push(EsInfo {
                stream_type: stream_type(v),
                elementary_pid: Pid::new(VIDEO_ES_PID).unwrap(),
                descriptors: vec![],
            });
        }
        if let Some(a) = acodec {
            table.push(EsInfo {
                stream_type: stream_type(a),
                elementary_pid: Pid::new(AUDIO_ES_PID).unwrap(),
                descriptors: vec![],
            });
        }
        // PCR rides on video when present, else audio (pure-audio segments).
        let pcr_pid = if vcodec.is_some() {
            Some(Pid::new(VIDEO_ES_PID).unwrap())
        } else {
            Some(Pid::new(AUDIO_ES_PID).unwrap())
        };
        TsPacket {
            header: ts_header(PMT_PID, ContinuityCounter::default()),
            adaptation_field: None,
            payload: Some(TsPayload::Pmt(Pmt {
                program_num: 1,
                pcr_pid,
                version_number: VersionNumber::default(),
                table,
            })),
        }
    }

    /// Switch codec mid-stream is only valid at a segment boundary; the
    /// controller guarantees this before reuse across `open()` calls.
    pub fn set_acodec(&mut self, codec: CodecId) {
        self.acodec = Some(codec);
    }

    pub fn set_vcodec(&mut self, codec: CodecId) {
        self.vcodec = Some(codec);
    }

    pub fn write_audio(&mut self, packet: &Packet) -> Result<()> {
        let mut data = packet.payload.as_slice();
        let first_len = data.len().min(153);
        let (first, rest) = data.split_at(first_len);
        data = rest;

        let pts = Timestamp::new(packet.pts % (1 << 33)).map_err(pes_err)?;
        self.ts
            .write_ts_packet(&TsPacket {
                header: ts_header(AUDIO_ES_PID, self.audio_cc.clone()),
                adaptation_field: None,
                payload: Some(TsPayload::Pes(Pes {
                    header: PesHeader {
                        stream_id: StreamId::new(PES_AUDIO_STREAM_ID),
                        priority: false,
                        data_alignment_indicator: false,
                        copyright: false,
                        original_or_copy: false,
                        pts: Some(pts),
                        dts: None,
                        escr: None,
                    },
                    pes_packet_len: 0,
                    data: Bytes::new(first).map_err(pes_err)?,
                })),
            })
            .map_err(ts_err)?;
        self.audio_cc.increment();

        while !data.is_empty() {
            let len = data.len().min(Bytes::MAX_SIZE);
            let (chunk, rest) = data.split_at(len);
            data = rest;
            self.ts
                .write_ts_packet(&TsPacket {
                    header: ts_header(AUDIO_ES_PID, self.audio_cc.clone()),
                    adaptation_field: None,
                    payload: Some(TsPayload::Raw(Bytes::new(chunk).map_err(pes_err)?)),
                })
                .map_err(ts_err)?;
            self.audio_cc.increment();
        }
        Ok(())
    }

    pub fn write_video(&mut self, packet: &Packet) -> Result<()> {
        let mut data = packet.payload.as_slice();
        let first_len = data.len().min(153);
        let (first, rest) = data.split_at(first_len);
        data = rest;

        let dts_wrapped = packet.dts % (1 << 33);
        let pts_wrapped = packet.pts % (1 << 33);
        let dts = Timestamp::new(dts_wrapped).map_err(pes_err)?;
        let pts = Timestamp::new(pts_wrapped).map_err(pes_err)?;

        let adaptation_field = if packet.is_keyframe() {
            let pcr = ClockReference::new(dts_wrapped).map_err(pes_err)?;
            Some(AdaptationField {
                discontinuity_indicator: false,
                random_access_indicator: true,
                es_priority_indicator: false,
                pcr: Some(pcr),
                opcr: None,
                splice_countdown: None,
                transport_private_data: Vec::new(),
                extension: None,
            })
        } else {
            None
        };

        self.ts
            .write_ts_packet(&TsPacket {
                header: ts_header(VIDEO_ES_PID, self.video_cc.clone()),
                adaptation_field,
                payload: Some(TsPayload::Pes(Pes {
                    header: PesHeader {
                        stream_id: StreamId::new(PES_VIDEO_STREAM_ID),
                        priority: false,
                        data_alignment_indicator: false,
                        copyright: false,
                        original_or_copy: false,
                        pts: Some(pts),
                        dts: Some(dts),
                        escr: None,
                    },
                    pes_packet_len: 0,
                    data: Bytes::new(first).map_err(pes_err)?,
                })),
            })
            .map_err(ts_err)?;
        self.video_cc.increment();

        while !data.is_empty() {
            let len = data.len().min(Bytes::MAX_SIZE);
            let (chunk, rest) = data.split_at(len);
            data = rest;
            self.ts
                .write_ts_packet(&TsPacket {
                    header: ts_header(VIDEO_ES_PID, self.video_cc.clone()),
                    adaptation_field: None,
                    payload: Some(TsPayload::Raw(Bytes::new(chunk).map_err(pes_err)?)),
                })
                .map_err(ts_err)?;
            self.video_cc.increment();
        }
        Ok(())
    }

    /// Pad the current partial TS packet to 188 bytes and return the final
    /// plaintext buffer, optionally AES-128-CBC-encrypted with PKCS7.
    pub fn close(self, key: Option<(&[u8; 16], &[u8; 16])>) -> Vec<u8> {
        let mut buf = self.ts.into_inner();
        let rem = buf.len() % 188;
        if rem != 0 {
            buf.resize(buf.len() + (188 - rem), 0xff);
        }
        match key {
            Some((k, iv)) => encrypt_ts_segment(k, iv, &buf),
            None => buf,
        }
    }
}

fn ts_err(e: mpeg2ts::Error) -> SegmenterError {
    SegmenterError::ProtocolViolation(format!("ts write: {e}"))
}

fn pes_err<E: std::fmt::Display>(e: E) -> SegmenterError {
    SegmenterError::ProtocolViolation(format!("pes encode: {e}"))
}

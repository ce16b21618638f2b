//! Publisher-driven HLS segmenter.
//!
//! Consumes a single decoded live stream (already-demuxed, timestamped audio
//! and video access units) and continuously produces an HLS presentation —
//! a rolling playlist plus its media segments — on a content tree reachable
//! by HTTP servers. Two container profiles are supported: MPEG-2 TS
//! segments (`.ts`) and fragmented MP4 segments (`.m4s` + a once-written
//! `init.mp4`).
//!
//! Out of scope (collaborator interfaces only): the configuration tree
//! (`config::ConfigStore`), the ingest/demux path that produces `Packet`s,
//! HTTP serving of the produced files, and delivery of the outbound
//! notifications enqueued by `callback::CallbackWorker`.

pub mod cache;
pub mod callback;
pub mod config;
pub mod controller;
pub mod crypto;
pub mod error;
pub mod jitter;
pub mod mux;
pub mod packet;
pub mod segment;
pub mod stream;
pub mod window;

pub use config::{ConfigStore, HlsConfig};
pub use controller::Controller;
pub use error::{Result, SegmenterError};
pub use packet::{CodecId, FrameType, Packet, PacketKind};
pub use segment::{Container, Segment};
pub use stream::Stream;

#[cfg(test)]
mod tests;

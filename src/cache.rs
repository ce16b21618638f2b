use crate::packet::Packet;

/// Per-stream pre-buffer holding at most one in-flight audio and one
/// in-flight video packet, so a segment-boundary decision can inspect the
/// next frame before committing (§4.4 Message cache / C4).
#[derive(Default)]
pub struct MessageCache {
    audio: Option<Packet>,
    video: Option<Packet>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// If empty, retain `packet`; otherwise append its payload to the
    /// existing grouped audio packet (increasing DTS).
    pub fn cache_audio(&mut self, packet: Packet) {
        match &mut self.audio {
            None => self.audio = Some(packet),
            Some(existing) => {
                existing.payload.extend_from_slice(&packet.payload);
                existing.dts = packet.dts;
                existing.pts = packet.pts;
            }
        }
    }

    /// Video packets are never grouped; the caller must flush any pending
    /// video packet before calling this again.
    pub fn cache_video(&mut self, packet: Packet) {
        debug_assert!(
            self.video.is_none(),
            "cache_video called with a packet already pending flush"
        );
        self.video = Some(packet);
    }

    pub fn audio(&self) -> Option<&Packet> {
        self.audio.as_ref()
    }

    pub fn video(&self) -> Option<&Packet> {
        self.video.as_ref()
    }

    /// Clear the pending audio packet after a successful write.
    pub fn flush_audio(&mut self) -> Option<Packet> {
        self.audio.take()
    }

    /// Clear the pending video packet after a successful write.
    pub fn flush_video(&mut self) -> Option<Packet> {
        self.video.take()
    }
}

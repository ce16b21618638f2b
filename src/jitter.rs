//! Jitter-correction pre-stage applied before packets reach the controller
//! (§4.7 "Apply jitter correction").

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JitterMode {
    /// No correction; packets pass through untouched.
    PassThrough,
    /// Enforce monotonic DTS with a small fill-in step when a packet's DTS
    /// does not advance past the previous one.
    Monotonic { fill_step: u64 },
}

pub struct JitterCorrector {
    mode: JitterMode,
    last_dts: Option<u64>,
}

impl JitterCorrector {
    pub fn new(mode: JitterMode) -> Self {
        JitterCorrector { mode, last_dts: None }
    }

    /// Returns the corrected DTS for this packet.
    pub fn correct(&mut self, dts: u64) -> u64 {
        let corrected = match self.mode {
            JitterMode::PassThrough => dts,
            JitterMode::Monotonic { fill_step } => match self.last_dts {
                Some(last) if dts <= last => last + fill_step,
                _ => dts,
            },
        };
        self.last_dts = Some(corrected);
        corrected
    }
}

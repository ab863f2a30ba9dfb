//! Link statistics counters. All counters are monotonic with wrap allowed.

#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct Stats {
    pub rx_bytes: u32,
    pub tx_bytes: u32,
    pub rx_frames: u32,
    pub rx_bad_frames: u32,
    pub rx_retry_frames: u32,
    pub tx_frames: u32,
    pub tx_retry_frames: u32,
}

impl Stats {
    pub fn new() -> Stats {
        Stats::default()
    }

    pub fn reset(&mut self) {
        *self = Stats::default();
    }

    #[inline]
    pub(crate) fn rx_byte(&mut self) {
        self.rx_bytes = self.rx_bytes.wrapping_add(1);
    }

    #[inline]
    pub(crate) fn tx_byte(&mut self) {
        self.tx_bytes = self.tx_bytes.wrapping_add(1);
    }

    #[inline]
    pub(crate) fn rx_frame(&mut self) {
        self.rx_frames = self.rx_frames.wrapping_add(1);
    }

    #[inline]
    pub(crate) fn rx_bad_frame(&mut self) {
        self.rx_bad_frames = self.rx_bad_frames.wrapping_add(1);
    }

    #[inline]
    pub(crate) fn rx_retry_frame(&mut self) {
        self.rx_retry_frames = self.rx_retry_frames.wrapping_add(1);
    }

    #[inline]
    pub(crate) fn tx_frame(&mut self) {
        self.tx_frames = self.tx_frames.wrapping_add(1);
    }

    #[inline]
    pub(crate) fn tx_retries(&mut self, count: u32) {
        self.tx_retry_frames = self.tx_retry_frames.wrapping_add(count);
    }
}

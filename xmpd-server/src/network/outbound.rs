//! Per-client output queue with watermark backpressure.

use std::io::{ErrorKind, Write};

use tracing::debug;

pub(crate) const DEFAULT_HIGH_WATERMARK: usize = 256 * 1024;
pub(crate) const DEFAULT_LOW_WATERMARK: usize = 128 * 1024;

/// Queue sizes that pause (`high`) and resume (`low`) reading from a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Watermarks {
    pub(crate) high: usize,
    pub(crate) low: usize,
}

impl Watermarks {
    /// Raises both marks to at least the defaults and keeps `low` strictly below `high`.
    #[must_use]
    pub(crate) fn new(high: usize, low: usize) -> Self {
        let high = high.max(DEFAULT_HIGH_WATERMARK);
        let low = low.max(DEFAULT_LOW_WATERMARK).min(high - 1);
        Self { high, low }
    }
}

impl Default for Watermarks {
    fn default() -> Self {
        Self::new(DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushOutcome {
    /// Everything queued reached the socket.
    Drained,
    /// The socket would block; the rest waits for writability.
    Blocked,
    /// The peer is gone.
    Failed,
}

/// Serialized stanzas waiting for the socket.
#[derive(Debug)]
pub(crate) struct OutboundQueue {
    bytes: Vec<u8>,
    watermarks: Watermarks,
    throttled: bool,
}

impl OutboundQueue {
    pub(crate) fn new(watermarks: Watermarks) -> Self {
        Self {
            bytes: Vec::new(),
            watermarks,
            throttled: false,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// `true` from the moment the queue reaches the high mark until it drains to the low one.
    pub(crate) fn is_throttled(&self) -> bool {
        self.throttled
    }

    pub(crate) fn push(&mut self, text: &str) {
        self.bytes.extend_from_slice(text.as_bytes());
        self.recheck();
    }

    /// Writes until the queue is empty or `sink` would block.
    pub(crate) fn flush_into(&mut self, sink: &mut impl Write) -> FlushOutcome {
        while !self.bytes.is_empty() {
            match sink.write(&self.bytes) {
                Ok(0) => return FlushOutcome::Failed,
                Ok(written) => {
                    let _ = self.bytes.drain(..written);
                    self.recheck();
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => return FlushOutcome::Blocked,
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(error) => {
                    debug!(%error, "client write failed");
                    return FlushOutcome::Failed;
                }
            }
        }
        FlushOutcome::Drained
    }

    fn recheck(&mut self) {
        let queued = self.bytes.len();
        self.throttled = if self.throttled {
            queued > self.watermarks.low
        } else {
            queued >= self.watermarks.high
        };
    }
}

#[cfg(test)]
mod tests {
    use super::{
        DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK, FlushOutcome, OutboundQueue, Watermarks,
    };
    use googletest::prelude::*;
    use rstest::rstest;
    use std::io::{self, Write};

    /// Accepts `budget` bytes, then reports `WouldBlock`.
    struct SlowSocket {
        received: Vec<u8>,
        budget: usize,
    }

    impl Write for SlowSocket {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let accepted = buf.len().min(self.budget);
            self.budget -= accepted;
            self.received.extend_from_slice(&buf[..accepted]);
            Ok(accepted)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[rstest]
    #[case(0, 0, DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK)]
    #[case(16, 1 << 20, DEFAULT_HIGH_WATERMARK, DEFAULT_HIGH_WATERMARK - 1)]
    #[case(1 << 20, 1 << 19, 1 << 20, 1 << 19)]
    fn watermarks_are_clamped(
        #[case] high: usize,
        #[case] low: usize,
        #[case] expected_high: usize,
        #[case] expected_low: usize,
    ) {
        let marks = Watermarks::new(high, low);
        assert_that!(marks.high, eq(expected_high));
        assert_that!(marks.low, eq(expected_low));
    }

    #[rstest]
    fn partial_write_keeps_the_tail_queued() {
        let mut queue = OutboundQueue::new(Watermarks::default());
        queue.push("<presence/>");
        let mut socket = SlowSocket {
            received: Vec::new(),
            budget: 4,
        };

        assert_that!(queue.flush_into(&mut socket), eq(FlushOutcome::Blocked));
        assert_that!(&socket.received, eq(&b"<pre".to_vec()));

        socket.budget = usize::MAX;
        assert_that!(queue.flush_into(&mut socket), eq(FlushOutcome::Drained));
        assert_that!(&socket.received, eq(&b"<presence/>".to_vec()));
        assert_that!(queue.is_empty(), eq(true));
    }

    #[rstest]
    fn throttle_engages_at_high_and_releases_at_low() {
        let marks = Watermarks::default();
        let mut queue = OutboundQueue::new(marks);
        queue.push(&"x".repeat(marks.high));
        assert_that!(queue.is_throttled(), eq(true));

        let mut socket = SlowSocket {
            received: Vec::new(),
            budget: marks.high - marks.low - 1,
        };
        let _ = queue.flush_into(&mut socket);
        assert_that!(queue.is_throttled(), eq(true));

        socket.budget = 1;
        let _ = queue.flush_into(&mut socket);
        assert_that!(queue.is_throttled(), eq(false));
    }

    #[rstest]
    fn zero_length_write_means_peer_is_gone() {
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut queue = OutboundQueue::new(Watermarks::default());
        queue.push("</stream:stream>");
        assert_that!(queue.flush_into(&mut Closed), eq(FlushOutcome::Failed));
    }
}

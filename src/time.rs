//! Stage 3: reconstructs a 64-bit timeline from 24-bit rolling timestamps.
//!
//! Timestamped frames carry only the low 24 bits of the target's tick
//! counter; wraps are detected by monotonicity. A `SYSTEM_RESET` restarts
//! the target's counter at zero, so the time accumulated before the reset
//! is folded into a base offset, keeping the emitted absolute time
//! non-decreasing across the whole stream.

use std::io::{Read, Seek};

use crate::frame::Framer;
use crate::overflow::OverflowFilter;
use crate::{DecoderError, Event, EventKind};

const TIMESTAMP_SPAN: u64 = 1 << 24;

/// Whether frames with this tag carry a timestamp in the low 24 bits of
/// word 0. Additional-parameter and sync-region frames do not; their
/// events inherit the time of the previous frame.
fn carries_timestamp(tag: u8) -> bool {
    match tag {
        0x00..=0x0F => false,
        0x10..=0x77 => true,
        0x78..=0x7F => false,
        0x80..=0xFF => true,
    }
}

/// An event annotated with the absolute time at which it occurred, in
/// tracer ticks since first observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedEvent {
    pub time: u64,
    pub event: Event,
}

pub struct Timeline<R> {
    inner: OverflowFilter<R>,
    /// Ticks folded away by resets.
    base: u64,
    /// Ticks within the current session; the low 24 bits equal the last
    /// seen timestamp field.
    current: u64,
    /// False until the first event has been timed, so that a reset
    /// opening the stream starts the timeline at zero.
    started: bool,
}

impl<R> Timeline<R>
where
    R: Read + Seek,
{
    pub fn new(inner: OverflowFilter<R>) -> Timeline<R> {
        Timeline {
            inner,
            base: 0,
            current: 0,
            started: false,
        }
    }

    pub fn framer(&self) -> &Framer<R> {
        self.inner.framer()
    }

    pub fn next(&mut self) -> Result<Option<TimedEvent>, DecoderError> {
        match self.inner.next()? {
            None => Ok(None),
            Some(event) => {
                let time = self.apply(&event);
                self.started = true;
                Ok(Some(TimedEvent { time, event }))
            }
        }
    }

    fn apply(&mut self, event: &Event) -> u64 {
        let raw = match event {
            Event::Frame(raw) => raw,
            // Synthesized records inherit the most recent time.
            _ => return self.base + self.current,
        };

        if raw.kind() == Some(EventKind::SystemReset) {
            // Rebase unconditionally, one tick past everything already
            // released, and restart the session clock; the reset itself
            // is the session's tick zero.
            if self.started {
                self.base += self.current + 1;
            }
            self.current = 0;
            return self.base;
        }

        if carries_timestamp(raw.tag()) {
            let now = u64::from(raw.timestamp());
            let old = self.current & (TIMESTAMP_SPAN - 1);
            if now < old {
                self.current += TIMESTAMP_SPAN;
            }
            self.current = (self.current & !(TIMESTAMP_SPAN - 1)) | now;
        }
        self.base + self.current
    }
}

//! Stage 2: infers ring-buffer overflow from the cycle counter.
//!
//! The tracer appends a `CYCLE` event each time the RTT buffer wraps, and
//! both `CYCLE` and `IDLE` may carry a monotonic counter in the parameter
//! (bit 0 set distinguishes the counter form from the buffer-stats form).
//! Overflow is only observable after the fact, as a jump in that counter:
//! events framed since the previous counter observation may already be a
//! mix of old and new ring contents, so they are discarded rather than
//! released. A window of not-yet-released events is kept for exactly this
//! purpose.

use std::collections::VecDeque;
use std::io::{Read, Seek};

use bitmatch::bitmatch;
use log::warn;

use crate::frame::Framer;
use crate::{DecoderError, Event, EventKind, RawEvent};

// Upper bound on the window, in records. The window also never exceeds a
// quarter of the input size, so small captures are buffered whole while
// memory stays O(1) on large ones.
const WINDOW_MAX: u64 = 1 << 20;

// Fabricated frames standing in for events the target must have emitted
// but the stream no longer contains.
const SYNTH_RESET: RawEvent = RawEvent {
    word0: 0x1100_0000,
    word1: 0,
};

fn synth_overflow(dropped: u32) -> RawEvent {
    RawEvent {
        word0: 0x1200_0000,
        word1: dropped,
    }
}

/// Releases events in input order, withholding a sliding window in which
/// cycle-counter jumps can still invalidate them.
pub struct OverflowFilter<R> {
    framer: Framer<R>,
    window: VecDeque<Event>,
    /// Computed from the input size once the framer has located the data
    /// region.
    capacity: Option<usize>,
    drained: bool,
    /// Last observed counter value. `None` while no observation is live
    /// in the window, in which case jumps cannot be told apart from a
    /// missed reset.
    counter: Option<u32>,
    /// Window index of the event carrying the last observation. Slides
    /// toward the head as events are released.
    marker: Option<usize>,
}

impl<R> OverflowFilter<R>
where
    R: Read + Seek,
{
    pub fn new(framer: Framer<R>) -> OverflowFilter<R> {
        OverflowFilter {
            framer,
            window: VecDeque::new(),
            capacity: None,
            drained: false,
            counter: None,
            marker: None,
        }
    }

    pub fn framer(&self) -> &Framer<R> {
        &self.framer
    }

    /// Returns the next event the window will no longer invalidate, or
    /// `None` once the source is drained and the window empty.
    pub fn next(&mut self) -> Result<Option<Event>, DecoderError> {
        self.fill()?;
        match self.window.pop_front() {
            None => Ok(None),
            Some(ev) => {
                self.marker = match self.marker.take() {
                    // The observation itself was released; jumps are
                    // undetectable until the next counter-carrying event.
                    Some(0) => {
                        self.counter = None;
                        None
                    }
                    Some(m) => Some(m - 1),
                    None => None,
                };
                Ok(Some(ev))
            }
        }
    }

    fn fill(&mut self) -> Result<(), DecoderError> {
        while !self.drained {
            if let Some(cap) = self.capacity {
                if self.window.len() >= cap {
                    break;
                }
            }
            match self.framer.next()? {
                None => self.drained = true,
                Some(ev) => self.admit(ev),
            }
            if self.capacity.is_none() {
                let cap = (self.framer.data_len() / 4).min(WINDOW_MAX).max(1);
                self.capacity = Some(cap as usize);
            }
        }
        Ok(())
    }

    #[bitmatch]
    fn admit(&mut self, ev: Event) {
        let raw = match &ev {
            Event::Frame(raw) => *raw,
            _ => {
                self.window.push_back(ev);
                return;
            }
        };

        #[bitmatch]
        let "cccc_cccc_cccc_cccc_cccc_cccc_cccc_cccf" = raw.param();
        match raw.kind() {
            Some(EventKind::SystemReset) => {
                self.window.push_back(ev);
                self.counter = Some(1);
                self.marker = Some(self.window.len() - 1);
            }
            Some(EventKind::Cycle) if f == 1 => self.check_counter(c, 2, ev),
            Some(EventKind::Idle) if f == 1 => self.check_counter(c, 0, ev),
            _ => self.window.push_back(ev),
        }
    }

    /// Compares a fresh counter observation against the expected value
    /// and reacts to any jump before admitting the carrying event.
    fn check_counter(&mut self, new: u32, increment: u32, ev: Event) {
        match self.counter {
            None => {
                if new > 1 {
                    // The stream joined an already-running target, or the
                    // window outlived the last observation: everything
                    // buffered predates a state we cannot reconstruct.
                    let dropped = self.window.len() as u32;
                    warn!(
                        "cycle counter at {} with no reset seen, {} event(s) discarded",
                        new, dropped
                    );
                    self.window.clear();
                    self.window.push_back(Event::Frame(SYNTH_RESET));
                    self.window.push_back(Event::Frame(synth_overflow(dropped)));
                }
            }
            Some(saved) => {
                let expected = saved.wrapping_add(increment);
                let diff = i64::from(new) - i64::from(expected);
                if diff > 0 {
                    let dropped = self.drop_after_marker();
                    warn!(
                        "cycle counter jumped from {} to {} (expected {}), {} event(s) discarded",
                        saved, new, expected, dropped
                    );
                    self.window.push_back(Event::Lost { count: dropped });
                } else if diff < 0 {
                    // The counter went backwards: an overflow swallowed a
                    // system reset along with the events around it.
                    let dropped = self.drop_after_marker();
                    warn!(
                        "cycle counter fell from {} to {}, reset assumed, {} event(s) discarded",
                        saved, new, dropped
                    );
                    self.window.push_back(Event::Frame(SYNTH_RESET));
                    self.window.push_back(Event::Frame(synth_overflow(dropped)));
                }
            }
        }

        self.window.push_back(ev);
        self.counter = Some(new);
        self.marker = Some(self.window.len() - 1);
    }

    /// Discards the window suffix admitted after the last counter
    /// observation and returns its length.
    fn drop_after_marker(&mut self) -> u32 {
        let keep = self.marker.map(|m| m + 1).unwrap_or(0);
        let dropped = self.window.len() - keep;
        self.window.truncate(keep);
        dropped as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// A counter-form `CYCLE` parameter.
    fn cycle_param(counter: u32) -> u32 {
        (counter << 1) | 1
    }

    fn stream(frames: &[(u32, u32)]) -> OverflowFilter<Cursor<Vec<u8>>> {
        let mut bytes = vec![];
        for (w0, w1) in frames {
            bytes.extend_from_slice(&w0.to_le_bytes());
            bytes.extend_from_slice(&w1.to_le_bytes());
        }
        OverflowFilter::new(Framer::new(Cursor::new(bytes), None))
    }

    fn drain(filter: &mut OverflowFilter<Cursor<Vec<u8>>>) -> Vec<Event> {
        let mut events = vec![];
        while let Some(ev) = filter.next().unwrap() {
            events.push(ev);
        }
        events
    }

    fn kinds(events: &[Event]) -> Vec<EventKind> {
        events
            .iter()
            .map(|ev| match ev {
                Event::Frame(raw) => raw.kind().unwrap(),
                Event::Corrupted { skipped } => EventKind::Corrupted { skipped: *skipped },
                Event::Lost { count } => EventKind::Lost { count: *count },
            })
            .collect()
    }

    #[test]
    fn consistent_counters_release_everything() {
        let mut filter = stream(&[
            (0x1100_0000, 0),
            (0x0100_0000, cycle_param(3)),
            (0x1400_0001, 5),
            (0x0100_0000, cycle_param(5)),
            (0x1400_0002, 6),
            (0x0100_0000, cycle_param(7)),
        ]);
        let events = drain(&mut filter);
        assert_eq!(events.len(), 6);
        assert!(events.iter().all(|ev| matches!(ev, Event::Frame(_))));
    }

    #[test]
    fn idle_counter_expects_no_increment() {
        let mut filter = stream(&[
            (0x1100_0000, 0),
            (0x1300_0001, cycle_param(1)),
            (0x1300_0002, cycle_param(1)),
        ]);
        let events = drain(&mut filter);
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|ev| matches!(ev, Event::Frame(_))));
    }

    #[test]
    fn counter_jump_drops_the_unreliable_suffix() {
        let mut filter = stream(&[
            (0x1100_0000, 0),
            (0x0100_0000, cycle_param(3)),
            (0x1400_0001, 5),
            (0x1500_0002, 5),
            (0x0100_0000, cycle_param(9)),
            (0x1400_0003, 6),
        ]);
        let events = drain(&mut filter);
        assert_eq!(
            kinds(&events),
            vec![
                EventKind::SystemReset,
                EventKind::Cycle,
                EventKind::Lost { count: 2 },
                EventKind::Cycle,
                EventKind::ThreadStart,
            ]
        );
    }

    #[test]
    fn counter_falling_back_synthesizes_a_reset() {
        let mut filter = stream(&[
            (0x1100_0000, 0),
            (0x0100_0000, cycle_param(3)),
            (0x1400_0001, 5),
            (0x0100_0000, cycle_param(1)),
        ]);
        let events = drain(&mut filter);
        assert_eq!(
            kinds(&events),
            vec![
                EventKind::SystemReset,
                EventKind::Cycle,
                EventKind::SystemReset,
                EventKind::Overflow,
                EventKind::Cycle,
            ]
        );
        // The thread-start admitted after the counter observation is gone.
        assert!(!kinds(&events).contains(&EventKind::ThreadStart));
    }

    #[test]
    fn counter_without_reset_discards_the_prefix() {
        let mut filter = stream(&[
            (0x1400_0001, 5),
            (0x1500_0002, 5),
            (0x0100_0000, cycle_param(57)),
            (0x1400_0003, 6),
        ]);
        let events = drain(&mut filter);
        assert_eq!(
            kinds(&events),
            vec![
                EventKind::SystemReset,
                EventKind::Overflow,
                EventKind::Cycle,
                EventKind::ThreadStart,
            ]
        );
    }

    #[test]
    fn stats_form_parameters_are_ignored() {
        // Bit 0 clear: the parameter carries buffer statistics, not the
        // cycle counter.
        let mut filter = stream(&[
            (0x1100_0000, 0),
            (0x0100_0000, 0x0000_4000),
            (0x1400_0001, 5),
            (0x0100_0000, 0x0000_3000),
        ]);
        let events = drain(&mut filter);
        assert_eq!(events.len(), 4);
        assert!(events.iter().all(|ev| matches!(ev, Event::Frame(_))));
    }
}

//! # `rtt-lite-trace`
//!
//! A decoder for the RTT lite trace protocol: the stream of fixed-size
//! 8-byte event frames a lightweight RTOS tracer writes into a SEGGER RTT
//! ring buffer on the target. The decoder turns the raw byte stream
//! captured from such a buffer into timestamped, payload-complete event
//! records suitable for a SystemView-style visualizer.
//!
//! Decoding is organized as a pull pipeline of four stages, each a plain
//! state machine advanced by one call:
//!
//! 1. [`frame`](mod@crate::frame) frames 8-byte events out of the byte
//!    stream, strips the textual header/footer blocks, consumes sync
//!    sentinels and realigns after corruption;
//! 2. [`overflow`](mod@crate::overflow) correlates the ring-buffer cycle
//!    counter carried on `CYCLE`/`IDLE` events and synthesizes overflow
//!    records when events were lost on the target;
//! 3. [`time`](mod@crate::time) reconstructs a 64-bit monotonic tick
//!    count from the 24-bit rolling timestamps, across system resets;
//! 4. [`combine`](mod@crate::combine) reassembles the side-band buffers
//!    (thread metadata, format strings, printed payloads) that are
//!    multiplexed into the fixed-size slots, per execution context.
//!
//! Usage is simple:
//! ```
//! use rtt_lite_trace::{Decoder, DecoderOptions};
//! use std::io::Cursor;
//!
//! // or a std::fs::File, or anything else that implements Read + Seek
//! let stream: &[u8] = &[
//!     // ...
//! ];
//! let mut decoder = Decoder::new(Cursor::new(stream), DecoderOptions::default());
//! for record in decoder.records() {
//!     // ...
//! }
//! ```
//!
//! The [`sysview`](mod@crate::sysview) module maps decoded records onto
//! the semantic operations of a SystemView recorder.
#[deny(rustdoc::broken_intra_doc_links)]
pub mod combine;
pub mod format;
pub mod frame;
pub mod overflow;
pub mod sysview;
pub mod time;

use std::io::{Read, Seek};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::combine::Combiner;

/// Eight bytes that the tracer interleaves into the stream as a
/// realignment mark. A permutation of `0x78..=0x7F`, chosen so that no
/// suffix of the pattern is also a prefix.
pub const SYNC_PATTERN: [u8; 8] = [0x79, 0x7E, 0x7C, 0x78, 0x7B, 0x7A, 0x7D, 0x7F];

/// One raw 8-byte frame: two little-endian 32-bit words.
///
/// The high byte of `word0` carries the event tag. Depending on the tag,
/// the low 24 bits of `word0` are either a rolling timestamp or an
/// additional parameter, and `word1` is the event parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawEvent {
    pub word0: u32,
    pub word1: u32,
}

impl RawEvent {
    /// The event tag: the high byte of word 0.
    pub fn tag(&self) -> u8 {
        (self.word0 >> 24) as u8
    }

    /// The 24-bit rolling timestamp, for tags that carry one.
    pub fn timestamp(&self) -> u32 {
        self.word0 & 0x00FF_FFFF
    }

    /// The 24-bit additional parameter, for tags that carry one.
    pub fn additional(&self) -> u32 {
        self.word0 & 0x00FF_FFFF
    }

    /// The event parameter: word 1.
    pub fn param(&self) -> u32 {
        self.word1
    }

    /// Classifies the frame by its tag. `None` if no event maps to the
    /// tag, which the framer treats as corruption.
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_frame(self.tag(), self.additional())
    }
}

/// The set of events the tracer emits, plus the records the pipeline
/// synthesizes when it recovers from a defect in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventKind {
    /// The RTT buffer wrapped around to its beginning. Carries the cycle
    /// counter in the parameter when the counter form is enabled.
    Cycle,

    /// Reports the priority of a new thread, or a priority change.
    ThreadPriority {
        /// Priority carried in the additional-parameter bits.
        prio: u32,
    },

    /// First 3 bytes of the metadata describing the thread named by the
    /// parameter.
    ThreadInfoBegin,

    /// Next 3 bytes of thread metadata.
    ThreadInfoNext,

    /// Last 3 bytes of thread metadata. The decoder releases this event
    /// with the reassembled metadata attached.
    ThreadInfoEnd,

    /// Registers a format descriptor, sent in the side-band buffer that
    /// immediately follows, under the format id in the parameter.
    Format,

    /// Opens a side-band buffer on the current context; carries its first
    /// 4 + 3 bytes.
    BufferBegin,

    /// Continues a side-band buffer with 4 + 3 more bytes.
    BufferNext,

    /// Closes a side-band buffer. Carries up to 6 final bytes and the
    /// count of how many of them are meaningful.
    BufferEnd,

    /// A complete side-band buffer of at most 6 bytes in a single frame.
    BufferBeginEnd,

    /// Names a resource for pretty printing; the name travels in the
    /// side-band buffer that follows.
    ResName,

    /// First event after the system reset. Restarts the timeline and the
    /// cycle counter.
    SystemReset,

    /// The tracer could not fit an event into the RTT buffer; the
    /// parameter counts the events dropped on the target.
    Overflow,

    /// The system went idle. Carries the cycle counter like `Cycle`.
    Idle,

    /// A thread was switched in.
    ThreadStart,

    /// The running thread was switched out, back to the scheduler.
    ThreadStop,

    /// A thread was created.
    ThreadCreate,

    /// A thread was suspended.
    ThreadSuspend,

    /// A thread was resumed.
    ThreadResume,

    /// A thread became ready to run.
    ThreadReady,

    /// A thread started pending on a resource.
    ThreadPend,

    /// A traced system function was entered; the parameter is the
    /// function id.
    SysCall,

    /// A traced system function returned.
    SysEndCall,

    /// The running interrupt handler returned.
    IsrExit,

    /// Formatted text output. The parameter carries the message level and
    /// a format id; arguments travel in the side-band buffer.
    Printf,

    /// Plain text output. The parameter holds the first four characters;
    /// longer strings continue in the side-band buffer.
    Print,

    /// A user marker interval opened.
    MarkStart,

    /// A point user marker.
    Mark,

    /// A user marker interval closed.
    MarkStop,

    /// An event from the range reserved for applications.
    User {
        /// The raw tag value.
        tag: u8,
    },

    /// A frame from the realignment region. Only the full 8-byte
    /// [`SYNC_PATTERN`] is valid there, and the framer consumes it
    /// silently; this kind never reaches the pipeline output.
    Sync,

    /// An interrupt handler was entered.
    IsrEnter {
        /// Interrupt number, the low 7 bits of the tag byte.
        isr: u8,
    },

    /// Synthesized by the framer after realigning on a corrupted region:
    /// `skipped` bytes could not be decoded.
    Corrupted { skipped: u64 },

    /// Synthesized by the overflow detector: `count` already-framed
    /// events were discarded because a cycle-counter jump showed they
    /// are unreliable.
    Lost { count: u32 },
}

impl EventKind {
    /// The canonical tag-to-event mapping, total on `0x01..=0xFF`.
    /// Returns `None` for the tag values no event maps to; the framer
    /// treats those frames as corruption.
    pub fn from_frame(tag: u8, additional: u32) -> Option<EventKind> {
        use EventKind::*;

        Some(match tag {
            0x00 => return None,
            0x01 => Cycle,
            0x02 => ThreadPriority { prio: additional },
            0x03 => ThreadInfoBegin,
            0x04 => ThreadInfoNext,
            0x05 => ThreadInfoEnd,
            0x06 => Format,
            0x07 => BufferBegin,
            0x08 => BufferNext,
            0x09 => BufferEnd,
            0x0A => BufferBeginEnd,
            0x0B => ResName,
            0x0C..=0x10 => return None,
            0x11 => SystemReset,
            0x12 => Overflow,
            0x13 => Idle,
            0x14 => ThreadStart,
            0x15 => ThreadStop,
            0x16 => ThreadCreate,
            0x17 => ThreadSuspend,
            0x18 => ThreadResume,
            0x19 => ThreadReady,
            0x1A => ThreadPend,
            0x1B => SysCall,
            0x1C => SysEndCall,
            0x1D => IsrExit,
            0x1E => Printf,
            0x1F => Print,
            0x20 => MarkStart,
            0x21 => Mark,
            0x22 => MarkStop,
            0x23..=0x77 => User { tag },
            0x78..=0x7F => Sync,
            0x80..=0xFF => IsrEnter { isr: tag & 0x7F },
        })
    }
}

/// A record flowing between the pipeline stages: either a framed event,
/// or one of the records the pipeline synthesizes in place of data it had
/// to give up on.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Event {
    /// A validated 8-byte frame.
    Frame(RawEvent),

    /// A corrupted region was skipped; see [`EventKind::Corrupted`].
    Corrupted { skipped: u64 },

    /// Framed events were discarded; see [`EventKind::Lost`].
    Lost { count: u32 },
}

/// A fully decoded event: absolute time in tracer ticks, kind, raw
/// parameter, and the reassembled side-band payload. `payload` is empty
/// for every kind that does not carry one.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceRecord {
    pub time: u64,
    pub kind: EventKind,
    pub param: u32,
    pub payload: Vec<u8>,
}

/// Set of errors that can occur during decode.
///
/// Corrupted input is not an error: the framer recovers locally and
/// surfaces the defect as an [`EventKind::Corrupted`] record. Only the
/// byte source failing is fatal.
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    #[error("read from byte source failed: {0}")]
    Io(#[from] std::io::Error),
}

/// [`Decoder`] configuration.
#[derive(Clone)]
pub struct DecoderOptions {
    /// Upper bound on a reassembled side-band buffer. An assembly that
    /// would exceed it is dropped and reported as corruption.
    pub buffer_cap: usize,

    /// Upper bound on reassembled thread metadata.
    pub thread_info_cap: usize,

    /// Optional cooperative stop flag, polled between frames. Once
    /// raised, the decoder reports end-of-stream on the next pull.
    pub stop: Option<Arc<AtomicBool>>,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        DecoderOptions {
            buffer_cap: 64 * 1024,
            thread_info_cap: 256,
            stop: None,
        }
    }
}

/// RTT lite trace protocol decoder.
///
/// Wraps a seekable byte source (a capture file, or an in-memory buffer)
/// and yields [`TraceRecord`]s. The source is read lazily: the header and
/// footer blocks are located on the first pull.
pub struct Decoder<R>
where
    R: Read + Seek,
{
    combiner: Combiner<R>,
}

impl<R> Decoder<R>
where
    R: Read + Seek,
{
    pub fn new(reader: R, options: DecoderOptions) -> Decoder<R> {
        Decoder {
            combiner: Combiner::new(reader, options),
        }
    }

    /// Returns the next fully decoded record, or `None` on clean end of
    /// stream.
    pub fn next_record(&mut self) -> Result<Option<TraceRecord>, DecoderError> {
        self.combiner.next_record()
    }

    /// Returns an iterator over [`TraceRecord`]s.
    pub fn records(&mut self) -> Records<R> {
        Records { decoder: self }
    }

    /// The `#`-prefixed text lines found before the frame data. Empty
    /// until the first pull.
    pub fn header_lines(&self) -> &[String] {
        self.combiner.framer().header_lines()
    }

    /// The `#`-prefixed text lines found after the frame data. Empty
    /// until the first pull.
    pub fn footer_lines(&self) -> &[String] {
        self.combiner.framer().footer_lines()
    }
}

/// Iterator that yields [`TraceRecord`]s until the stream is drained.
pub struct Records<'a, R>
where
    R: Read + Seek,
{
    decoder: &'a mut Decoder<R>,
}

impl<'a, R> Iterator for Records<'a, R>
where
    R: Read + Seek,
{
    type Item = Result<TraceRecord, DecoderError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_record().transpose()
    }
}

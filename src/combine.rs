//! Stage 4: reassembles side-band buffers and tracks execution contexts.
//!
//! Variable-length data (thread metadata, format descriptors, printed
//! payloads, resource names) is chopped into the fixed-size event slots:
//! an opening fragment, any number of continuations, and a terminator
//! whose count byte says how much of the final slot is meaningful. Two
//! contexts may be transmitting at once (a thread and the interrupts
//! nested on top of it), so fragments are accumulated per context and a
//! finished buffer is delivered with the first payload-carrying event
//! released on that context.
//!
//! Thread metadata is the exception: its fragments name the described
//! thread in the parameter and are keyed on that thread regardless of
//! which context was running.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Seek};

use bitmatch::bitmatch;
use log::warn;

use crate::frame::Framer;
use crate::overflow::OverflowFilter;
use crate::time::{TimedEvent, Timeline};
use crate::{DecoderError, DecoderOptions, Event, EventKind, RawEvent, TraceRecord};

/// No `THREAD_START` or `ISR_ENTER` seen yet.
const CONTEXT_UNKNOWN: u64 = 0;

fn thread_context(id: u32) -> u64 {
    (1 << 33) | u64::from(id)
}

/// An interrupt context: the ISR number bits of the frame, made unique
/// per nesting level so nested handlers keep separate buffers.
fn isr_context(raw: &RawEvent, depth: usize) -> u64 {
    (1 << 32) | u64::from(raw.word0 & 0x7F00_0000) | depth as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Assembly {
    Empty,
    Running,
    Done,
}

impl Default for Assembly {
    fn default() -> Self {
        Assembly::Empty
    }
}

#[derive(Default)]
struct Accumulator {
    bytes: Vec<u8>,
    state: Assembly,
}

impl Accumulator {
    fn restart(&mut self) {
        self.bytes.clear();
        self.state = Assembly::Running;
    }

    fn reset(&mut self) {
        self.bytes.clear();
        self.state = Assembly::Empty;
    }

    fn take(&mut self) -> Vec<u8> {
        self.state = Assembly::Empty;
        std::mem::take(&mut self.bytes)
    }
}

#[derive(Default)]
struct ContextState {
    buffer: Accumulator,
    thread_info: Accumulator,
}

pub struct Combiner<R> {
    inner: Timeline<R>,
    contexts: HashMap<u64, ContextState>,
    current_thread: u64,
    isr_stack: Vec<u64>,
    /// Records decoded but not yet pulled; one input event can release
    /// more than one record.
    pending: VecDeque<TraceRecord>,
    buffer_cap: usize,
    thread_info_cap: usize,
}

impl<R> Combiner<R>
where
    R: Read + Seek,
{
    pub fn new(reader: R, options: DecoderOptions) -> Combiner<R> {
        let framer = Framer::new(reader, options.stop.clone());
        Combiner {
            inner: Timeline::new(OverflowFilter::new(framer)),
            contexts: HashMap::new(),
            current_thread: CONTEXT_UNKNOWN,
            isr_stack: vec![],
            pending: VecDeque::new(),
            buffer_cap: options.buffer_cap,
            thread_info_cap: options.thread_info_cap,
        }
    }

    pub fn framer(&self) -> &Framer<R> {
        self.inner.framer()
    }

    pub fn next_record(&mut self) -> Result<Option<TraceRecord>, DecoderError> {
        loop {
            if let Some(rec) = self.pending.pop_front() {
                return Ok(Some(rec));
            }
            match self.inner.next()? {
                None => return Ok(None),
                Some(te) => self.process(te),
            }
        }
    }

    fn current_context(&self) -> u64 {
        self.isr_stack.last().copied().unwrap_or(self.current_thread)
    }

    fn context(&mut self, id: u64) -> &mut ContextState {
        self.contexts.entry(id).or_default()
    }

    /// Forget every context: after a reset or a gap in the stream, no
    /// partial assembly can be completed and the running context is
    /// unknown.
    fn clear_contexts(&mut self) {
        self.contexts.clear();
        self.isr_stack.clear();
        self.current_thread = CONTEXT_UNKNOWN;
    }

    fn release(&mut self, time: u64, kind: EventKind, param: u32, payload: Vec<u8>) {
        self.pending.push_back(TraceRecord {
            time,
            kind,
            param,
            payload,
        });
    }

    /// Reports a side-band protocol violation and resets the offending
    /// accumulator; decoding continues with the next frame.
    fn violation(&mut self, time: u64, context: u64, what: &str) {
        warn!("side-band buffer violation on context {:#x}: {}", context, what);
        self.release(time, EventKind::Corrupted { skipped: 0 }, 0, vec![]);
    }

    fn process(&mut self, te: TimedEvent) {
        let time = te.time;
        let raw = match te.event {
            Event::Corrupted { skipped } => {
                self.clear_contexts();
                self.release(time, EventKind::Corrupted { skipped }, 0, vec![]);
                return;
            }
            Event::Lost { count } => {
                self.clear_contexts();
                self.release(time, EventKind::Lost { count }, 0, vec![]);
                return;
            }
            Event::Frame(raw) => raw,
        };
        let kind = match raw.kind() {
            Some(kind) => kind,
            None => return,
        };
        let param = raw.param();

        match kind {
            EventKind::SystemReset | EventKind::Overflow => {
                self.clear_contexts();
                self.release(time, kind, param, vec![]);
            }

            EventKind::ThreadStart => {
                self.current_thread = thread_context(param);
                self.isr_stack.clear();
                self.release(time, kind, param, vec![]);
            }
            EventKind::IsrEnter { .. } => {
                let ctx = isr_context(&raw, self.isr_stack.len());
                self.isr_stack.push(ctx);
                self.release(time, kind, param, vec![]);
            }
            EventKind::IsrExit => {
                // An exit with no matching enter is tolerated; the stream
                // may have started inside a handler.
                self.isr_stack.pop();
                self.release(time, kind, param, vec![]);
            }

            EventKind::BufferBegin => {
                let ctx = self.current_context();
                let acc = &mut self.context(ctx).buffer;
                if acc.state != Assembly::Empty {
                    warn!("buffer restarted on context {:#x} before delivery", ctx);
                }
                acc.restart();
                acc.bytes.extend_from_slice(&param.to_le_bytes());
                acc.bytes.extend_from_slice(&raw.additional().to_le_bytes()[..3]);
                self.enforce_buffer_cap(time, ctx);
            }
            EventKind::BufferNext => {
                let ctx = self.current_context();
                let acc = &mut self.context(ctx).buffer;
                if acc.state != Assembly::Running {
                    acc.reset();
                    self.violation(time, ctx, "continuation without an open buffer");
                    return;
                }
                acc.bytes.extend_from_slice(&param.to_le_bytes());
                acc.bytes.extend_from_slice(&raw.additional().to_le_bytes()[..3]);
                self.enforce_buffer_cap(time, ctx);
            }
            EventKind::BufferEnd => {
                let ctx = self.current_context();
                let acc = &mut self.context(ctx).buffer;
                if acc.state != Assembly::Running {
                    acc.reset();
                    self.violation(time, ctx, "terminator without an open buffer");
                    return;
                }
                Self::finish_buffer(acc, &raw);
                self.enforce_buffer_cap(time, ctx);
            }
            EventKind::BufferBeginEnd => {
                let ctx = self.current_context();
                let acc = &mut self.context(ctx).buffer;
                if acc.state == Assembly::Running {
                    warn!("buffer restarted on context {:#x} before delivery", ctx);
                }
                acc.restart();
                Self::finish_buffer(acc, &raw);
            }

            EventKind::ThreadInfoBegin => {
                let ctx = thread_context(param);
                let acc = &mut self.context(ctx).thread_info;
                if acc.state != Assembly::Empty {
                    warn!("thread info for {:#x} restarted before delivery", param);
                }
                acc.restart();
                acc.bytes.extend_from_slice(&raw.additional().to_le_bytes()[..3]);
            }
            EventKind::ThreadInfoNext => {
                let ctx = thread_context(param);
                let cap = self.thread_info_cap;
                let acc = &mut self.context(ctx).thread_info;
                if acc.state != Assembly::Running {
                    acc.reset();
                    self.violation(time, ctx, "thread info continuation without a begin");
                    return;
                }
                acc.bytes.extend_from_slice(&raw.additional().to_le_bytes()[..3]);
                if acc.bytes.len() > cap {
                    self.context(ctx).thread_info.reset();
                    self.violation(time, ctx, "thread info exceeds the configured cap");
                }
            }
            EventKind::ThreadInfoEnd => {
                let ctx = thread_context(param);
                let acc = &mut self.context(ctx).thread_info;
                if acc.state != Assembly::Running {
                    acc.reset();
                    self.violation(time, ctx, "thread info end without a begin");
                    return;
                }
                acc.bytes.extend_from_slice(&raw.additional().to_le_bytes()[..3]);
                let payload = acc.take();
                self.release(time, kind, param, payload);
            }

            EventKind::Format
            | EventKind::Printf
            | EventKind::Print
            | EventKind::ResName
            | EventKind::MarkStart
            | EventKind::Mark
            | EventKind::MarkStop
            | EventKind::User { .. } => {
                let ctx = self.current_context();
                let state = self.context(ctx);
                let payload = match state.buffer.state {
                    Assembly::Done => state.buffer.take(),
                    Assembly::Empty => vec![],
                    Assembly::Running => {
                        state.buffer.reset();
                        self.violation(time, ctx, "payload event inside an open buffer");
                        vec![]
                    }
                };
                self.release(time, kind, param, payload);
            }

            // Consumed by the framer; nothing to release.
            EventKind::Sync => {}

            EventKind::Cycle
            | EventKind::ThreadPriority { .. }
            | EventKind::Idle
            | EventKind::ThreadStop
            | EventKind::ThreadCreate
            | EventKind::ThreadSuspend
            | EventKind::ThreadResume
            | EventKind::ThreadReady
            | EventKind::ThreadPend
            | EventKind::SysCall
            | EventKind::SysEndCall => {
                let ctx = self.current_context();
                if let Some(state) = self.contexts.get(&ctx) {
                    if state.buffer.state != Assembly::Empty {
                        warn!(
                            "side-band buffer pending across a non-payload event on context {:#x}",
                            ctx
                        );
                    }
                }
                self.release(time, kind, param, vec![]);
            }

            // Synthesized upstream; never decoded from a frame.
            EventKind::Corrupted { .. } | EventKind::Lost { .. } => {}
        }
    }

    /// Appends the up-to-six final bytes of a terminator frame and trims
    /// the assembly to the meaningful length.
    #[bitmatch]
    fn finish_buffer(acc: &mut Accumulator, raw: &RawEvent) {
        #[bitmatch]
        let "????_????_nnnn_nnnn_bbbb_bbbb_bbbb_bbbb" = raw.word0;
        acc.bytes.extend_from_slice(&raw.param().to_le_bytes());
        acc.bytes.extend_from_slice(&(b as u16).to_le_bytes());
        let meaningful = (n as usize).min(6);
        acc.bytes.truncate(acc.bytes.len() - 6 + meaningful);
        acc.state = Assembly::Done;
    }

    fn enforce_buffer_cap(&mut self, time: u64, ctx: u64) {
        if self.context(ctx).buffer.bytes.len() > self.buffer_cap {
            self.context(ctx).buffer.reset();
            self.violation(time, ctx, "assembly exceeds the configured cap");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn combiner(frames: &[(u32, u32)]) -> Combiner<Cursor<Vec<u8>>> {
        let mut bytes = vec![];
        for (w0, w1) in frames {
            bytes.extend_from_slice(&w0.to_le_bytes());
            bytes.extend_from_slice(&w1.to_le_bytes());
        }
        Combiner::new(Cursor::new(bytes), DecoderOptions::default())
    }

    fn drain(combiner: &mut Combiner<Cursor<Vec<u8>>>) -> Vec<TraceRecord> {
        let mut records = vec![];
        while let Some(rec) = combiner.next_record().unwrap() {
            records.push(rec);
        }
        records
    }

    #[test]
    fn buffer_reassembly_with_terminator_trim() {
        let records = drain(&mut combiner(&[
            (0x1100_0000, 0),
            (0x1400_0001, 0xAAAA),
            (0x0741_4243, 0x4445_4647),
            (0x0902_4849, 0x4A4B_4C4D),
            (0x1F00_0002, 0x0000_0050),
        ]));
        let print = records.last().unwrap();
        assert_eq!(print.kind, EventKind::Print);
        assert_eq!(
            print.payload,
            // 4 + 3 opening bytes, then 2 of the final 6.
            vec![0x47, 0x46, 0x45, 0x44, 0x43, 0x42, 0x41, 0x4D, 0x4C]
        );
    }

    #[test]
    fn small_buffer_in_a_single_frame() {
        let records = drain(&mut combiner(&[
            (0x1100_0000, 0),
            (0x1400_0001, 0xAAAA),
            (0x0A05_006F, 0x6C6C_6548),
            (0x1F00_0002, 0x0000_0070),
        ]));
        let print = records.last().unwrap();
        assert_eq!(print.payload, b"Hello".to_vec());
    }

    #[test]
    fn long_buffer_with_continuations() {
        let records = drain(&mut combiner(&[
            (0x1100_0000, 0),
            (0x1400_0001, 0xAAAA),
            (0x0747_4645, 0x4443_4241), // ABCDEFG
            (0x084E_4D4C, 0x4B4A_4948), // HIJKLMN
            (0x0906_5453, 0x5251_504F), // OPQRST, all six meaningful
            (0x1E00_0000, 0x00FF_FFFF),
        ]));
        let printf = records.last().unwrap();
        assert_eq!(printf.payload, b"ABCDEFGHIJKLMNOPQRST".to_vec());
    }

    #[test]
    fn continuation_without_begin_is_a_violation() {
        let records = drain(&mut combiner(&[
            (0x1100_0000, 0),
            (0x1400_0001, 0xAAAA),
            (0x0841_4243, 0x4445_4647),
        ]));
        assert!(records
            .iter()
            .any(|r| matches!(r.kind, EventKind::Corrupted { skipped: 0 })));
    }

    #[test]
    fn interrupt_buffers_do_not_collide_with_the_thread() {
        let records = drain(&mut combiner(&[
            (0x1100_0000, 0),
            (0x1400_0001, 0xAAAA),
            (0x0743_4241, 0x0000_0000), // thread opens a buffer
            (0x8500_0005, 0),           // ISR 5 preempts
            (0x0A03_0063, 0x0000_6261), // ISR sends "abc" in one frame
            (0x1F00_0006, 0x0000_0070), // ISR prints: gets "abc"
            (0x1D00_0007, 0),           // ISR exits
            (0x0903_0000, 0x0000_4443), // thread terminates its buffer
            (0x1F00_0008, 0x0000_0070), // thread prints
        ]));
        let prints: Vec<&TraceRecord> = records
            .iter()
            .filter(|r| r.kind == EventKind::Print)
            .collect();
        assert_eq!(prints.len(), 2);
        assert_eq!(prints[0].payload, b"abc".to_vec());
        assert_eq!(
            prints[1].payload,
            vec![0x00, 0x00, 0x00, 0x00, 0x41, 0x42, 0x43, 0x43, 0x44, 0x00]
        );
    }

    #[test]
    fn thread_info_is_keyed_on_the_described_thread() {
        let records = drain(&mut combiner(&[
            (0x1100_0000, 0),
            (0x1400_0001, 0xAAAA), // thread 0xAAAA runs...
            (0x0300_1000, 0xBBBB), // ...while info about 0xBBBB arrives
            (0x0400_0000, 0xBBBB),
            (0x0500_6261, 0xBBBB),
            (0x1500_0002, 0xAAAA),
        ]));
        let info = records
            .iter()
            .find(|r| r.kind == EventKind::ThreadInfoEnd)
            .unwrap();
        assert_eq!(info.param, 0xBBBB);
        assert_eq!(
            info.payload,
            vec![0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x61, 0x62, 0x00]
        );
    }

    #[test]
    fn reset_discards_partial_assemblies() {
        let records = drain(&mut combiner(&[
            (0x1100_0000, 0),
            (0x1400_0001, 0xAAAA),
            (0x0741_4243, 0x4445_4647), // buffer opened, never terminated
            (0x1100_0001, 0),
            (0x1400_0002, 0xAAAA),
            (0x1F00_0003, 0x0000_0070),
        ]));
        let print = records.last().unwrap();
        assert_eq!(print.kind, EventKind::Print);
        assert!(print.payload.is_empty());
    }

    #[test]
    fn payload_event_with_no_buffer_releases_empty() {
        let records = drain(&mut combiner(&[
            (0x1100_0000, 0),
            (0x1400_0001, 0xAAAA),
            (0x1F00_0001, 0x0000_0069),
        ]));
        let print = records.last().unwrap();
        assert_eq!(print.kind, EventKind::Print);
        assert!(print.payload.is_empty());
    }
}

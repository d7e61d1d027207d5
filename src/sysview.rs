//! Mapping of decoded records onto the semantic operations of a
//! SystemView-style recorder.
//!
//! The writer of the actual wire-compatible output file lives outside
//! this crate; [`SystemView`] names the operations such a writer exposes
//! and [`Dispatcher`] drives them from [`TraceRecord`]s. The dispatcher
//! also owns the little state the mapping needs: thread priorities
//! reported ahead of the metadata they belong to, registered format
//! descriptors, and resource names.

use std::collections::HashMap;
use std::convert::TryInto;
use std::io::{self, Write};

use bitmatch::bitmatch;
use log::warn;

use crate::format::{parse_format, print_text, render, FormatSpec};
use crate::{EventKind, TraceRecord};

/// Identity the tracer assigns to traced system functions; user-visible
/// ids start past this offset.
pub const SYS_TRACE_ID_OFFSET: u32 = 32;

pub const SYS_TRACE_ID_MUTEX_INIT: u32 = 1 + SYS_TRACE_ID_OFFSET;
pub const SYS_TRACE_ID_MUTEX_UNLOCK: u32 = 2 + SYS_TRACE_ID_OFFSET;
pub const SYS_TRACE_ID_MUTEX_LOCK: u32 = 3 + SYS_TRACE_ID_OFFSET;
pub const SYS_TRACE_ID_SEMA_INIT: u32 = 4 + SYS_TRACE_ID_OFFSET;
pub const SYS_TRACE_ID_SEMA_GIVE: u32 = 5 + SYS_TRACE_ID_OFFSET;
pub const SYS_TRACE_ID_SEMA_TAKE: u32 = 6 + SYS_TRACE_ID_OFFSET;
pub const SYS_TRACE_ID_SYSTEM_RESET: u32 = 7 + SYS_TRACE_ID_OFFSET;
pub const SYS_TRACE_ID_THREAD_SUSPEND: u32 = 8 + SYS_TRACE_ID_OFFSET;
pub const SYS_TRACE_ID_THREAD_RESUME: u32 = 9 + SYS_TRACE_ID_OFFSET;

/// Message level carried in the high byte of a formatted-output
/// parameter; level 1 marks an error.
const PRINTF_LEVEL_ERROR: u8 = 1;

/// Format id meaning "descriptor is inline in the payload".
const FORMAT_INLINE: u32 = 0x00FF_FFFF;

/// Metadata describing one thread, assembled from the thread-info
/// side-band and the last reported priority.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TaskInfo {
    pub id: u32,
    pub prio: u32,
    pub stack_base: u32,
    pub stack_size: u32,
    pub name: String,
}

/// The operations a SystemView recorder exposes.
///
/// Every operation may fail with the I/O error of the underlying writer;
/// the absolute time of the record being dispatched is supplied up front
/// via [`set_timestamp`](SystemView::set_timestamp), mirroring how the
/// recorder obtains timestamps through a callback rather than per call.
pub trait SystemView {
    fn set_timestamp(&mut self, _ticks: u64) -> io::Result<()> {
        Ok(())
    }

    fn on_task_create(&mut self, id: u32) -> io::Result<()>;
    fn on_task_start_exec(&mut self, id: u32) -> io::Result<()>;
    fn on_task_stop_exec(&mut self) -> io::Result<()>;
    fn on_task_start_ready(&mut self, id: u32) -> io::Result<()>;
    fn on_task_stop_ready(&mut self, id: u32, cause: u32) -> io::Result<()>;
    fn on_idle(&mut self) -> io::Result<()>;
    fn record_enter_isr(&mut self, isr: u8) -> io::Result<()>;
    fn record_exit_isr(&mut self) -> io::Result<()>;
    fn record_void(&mut self, id: u32) -> io::Result<()>;
    fn record_end_call(&mut self, id: u32) -> io::Result<()>;
    fn record_u32(&mut self, id: u32, value: u32) -> io::Result<()>;
    fn send_task_info(&mut self, info: &TaskInfo) -> io::Result<()>;
    fn print(&mut self, text: &str) -> io::Result<()>;
    fn error(&mut self, text: &str) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Drives a [`SystemView`] sink from decoded records.
pub struct Dispatcher<S> {
    sink: S,
    priorities: HashMap<u32, u32>,
    formats: HashMap<u32, FormatSpec>,
    resources: HashMap<u32, String>,
}

impl<S> Dispatcher<S>
where
    S: SystemView,
{
    pub fn new(sink: S) -> Dispatcher<S> {
        Dispatcher {
            sink,
            priorities: HashMap::new(),
            formats: HashMap::new(),
            resources: HashMap::new(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_inner(self) -> S {
        self.sink
    }

    /// The name registered for a resource id, if any.
    pub fn resource_name(&self, id: u32) -> Option<&str> {
        self.resources.get(&id).map(String::as_str)
    }

    /// Maps one record onto the sink and flushes it.
    #[bitmatch]
    pub fn dispatch(&mut self, record: &TraceRecord) -> io::Result<()> {
        self.sink.set_timestamp(record.time)?;
        let param = record.param;

        match &record.kind {
            // Consumed by the overflow detector; the cycle itself is not
            // an observable scheduling event.
            EventKind::Cycle => return Ok(()),

            EventKind::ThreadPriority { prio } => {
                self.priorities.insert(param, *prio);
                return Ok(());
            }
            EventKind::Format => {
                match parse_format(&record.payload) {
                    Some((spec, _)) => {
                        self.formats.insert(param & FORMAT_INLINE, spec);
                    }
                    None => warn!("unparsable format descriptor for id {:#x}", param),
                }
                return Ok(());
            }
            EventKind::ResName => {
                let name = String::from_utf8_lossy(&record.payload).into_owned();
                self.resources.insert(param, name);
                return Ok(());
            }

            EventKind::SystemReset => self.sink.record_void(SYS_TRACE_ID_SYSTEM_RESET)?,
            EventKind::Overflow => self
                .sink
                .error(&format!("overflow: {} event(s) lost on target", param))?,
            EventKind::Idle => self.sink.on_idle()?,
            EventKind::ThreadStart => self.sink.on_task_start_exec(param)?,
            EventKind::ThreadStop => self.sink.on_task_stop_exec()?,
            EventKind::ThreadCreate => self.sink.on_task_create(param)?,
            EventKind::ThreadSuspend => {
                self.sink.record_u32(SYS_TRACE_ID_THREAD_SUSPEND, param)?
            }
            EventKind::ThreadResume => self.sink.record_u32(SYS_TRACE_ID_THREAD_RESUME, param)?,
            EventKind::ThreadReady => self.sink.on_task_start_ready(param)?,
            EventKind::ThreadPend => self.sink.on_task_stop_ready(param, 2)?,
            EventKind::SysCall => self.sink.record_void(param)?,
            EventKind::SysEndCall => self.sink.record_end_call(param)?,
            EventKind::IsrEnter { isr } => self.sink.record_enter_isr(*isr)?,
            EventKind::IsrExit => self.sink.record_exit_isr()?,

            EventKind::ThreadInfoEnd => match parse_task_info(record, &self.priorities) {
                Some(info) => self.sink.send_task_info(&info)?,
                None => warn!(
                    "thread info for {:#x} is too short: {} byte(s)",
                    param,
                    record.payload.len()
                ),
            },

            EventKind::Printf => {
                #[bitmatch]
                let "llll_llll_ffff_ffff_ffff_ffff_ffff_ffff" = param;
                let text = self.format_message(f, &record.payload);
                if l as u8 == PRINTF_LEVEL_ERROR {
                    self.sink.error(&text)?;
                } else {
                    self.sink.print(&text)?;
                }
            }
            EventKind::Print => self.sink.print(&print_text(param, &record.payload))?,

            EventKind::MarkStart => self.sink.record_u32(0x20, param)?,
            EventKind::Mark => self.sink.record_u32(0x21, param)?,
            EventKind::MarkStop => self.sink.record_u32(0x22, param)?,
            EventKind::User { tag } => self.sink.record_u32(u32::from(*tag), param)?,

            EventKind::Corrupted { skipped } => self
                .sink
                .error(&format!("corrupted input: {} byte(s) skipped", skipped))?,
            EventKind::Lost { count } => self
                .sink
                .error(&format!("overflow: {} framed event(s) dropped", count))?,

            // Assembled upstream; never released on their own.
            EventKind::ThreadInfoBegin
            | EventKind::ThreadInfoNext
            | EventKind::BufferBegin
            | EventKind::BufferNext
            | EventKind::BufferEnd
            | EventKind::BufferBeginEnd
            | EventKind::Sync => return Ok(()),
        }

        self.sink.flush()
    }

    /// Resolves a message against the registered or inline descriptor.
    fn format_message(&mut self, format_id: u32, payload: &[u8]) -> String {
        if format_id == FORMAT_INLINE {
            match parse_format(payload) {
                Some((spec, consumed)) => return render(&spec, &payload[consumed..]),
                None => {
                    warn!("formatted message with unparsable inline descriptor");
                    return String::from_utf8_lossy(payload).into_owned();
                }
            }
        }
        match self.formats.get(&format_id) {
            Some(spec) => render(spec, payload),
            None => {
                warn!("formatted message references unknown format {:#x}", format_id);
                format!("<format {:#x}>", format_id)
            }
        }
    }
}

/// Decodes an assembled thread-info payload: a 3-byte stack size, a
/// 4-byte stack base, then the name, zero-padded to a 3-byte boundary.
fn parse_task_info(record: &TraceRecord, priorities: &HashMap<u32, u32>) -> Option<TaskInfo> {
    let payload = &record.payload;
    if payload.len() < 7 {
        return None;
    }
    let stack_size = u32::from_le_bytes([payload[0], payload[1], payload[2], 0]);
    let stack_base = u32::from_le_bytes(payload[3..7].try_into().unwrap());
    let name_end = payload.len() - payload.iter().rev().take_while(|&&b| b == 0).count();
    let name = String::from_utf8_lossy(&payload[7..name_end.max(7)]).into_owned();

    Some(TaskInfo {
        id: record.param,
        prio: priorities.get(&record.param).copied().unwrap_or(0),
        stack_base,
        stack_size,
        name,
    })
}

/// A sink that renders each operation as one text line, used by the
/// conversion tool when inspecting a capture.
pub struct TextSink<W> {
    out: W,
    time: u64,
}

impl<W> TextSink<W>
where
    W: Write,
{
    pub fn new(out: W) -> TextSink<W> {
        TextSink { out, time: 0 }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.out, "{:>12} {}", self.time, text)
    }
}

impl<W> SystemView for TextSink<W>
where
    W: Write,
{
    fn set_timestamp(&mut self, ticks: u64) -> io::Result<()> {
        self.time = ticks;
        Ok(())
    }

    fn on_task_create(&mut self, id: u32) -> io::Result<()> {
        self.line(&format!("task-create id={:#x}", id))
    }

    fn on_task_start_exec(&mut self, id: u32) -> io::Result<()> {
        self.line(&format!("task-start-exec id={:#x}", id))
    }

    fn on_task_stop_exec(&mut self) -> io::Result<()> {
        self.line("task-stop-exec")
    }

    fn on_task_start_ready(&mut self, id: u32) -> io::Result<()> {
        self.line(&format!("task-start-ready id={:#x}", id))
    }

    fn on_task_stop_ready(&mut self, id: u32, cause: u32) -> io::Result<()> {
        self.line(&format!("task-stop-ready id={:#x} cause={}", id, cause))
    }

    fn on_idle(&mut self) -> io::Result<()> {
        self.line("idle")
    }

    fn record_enter_isr(&mut self, isr: u8) -> io::Result<()> {
        self.line(&format!("isr-enter {}", isr))
    }

    fn record_exit_isr(&mut self) -> io::Result<()> {
        self.line("isr-exit")
    }

    fn record_void(&mut self, id: u32) -> io::Result<()> {
        self.line(&format!("call {}", id))
    }

    fn record_end_call(&mut self, id: u32) -> io::Result<()> {
        self.line(&format!("end-call {}", id))
    }

    fn record_u32(&mut self, id: u32, value: u32) -> io::Result<()> {
        self.line(&format!("call {} value={:#x}", id, value))
    }

    fn send_task_info(&mut self, info: &TaskInfo) -> io::Result<()> {
        self.line(&format!(
            "task-info id={:#x} prio={} stack={:#x}+{:#x} name={:?}",
            info.id, info.prio, info.stack_base, info.stack_size, info.name
        ))
    }

    fn print(&mut self, text: &str) -> io::Result<()> {
        self.line(&format!("print {:?}", text))
    }

    fn error(&mut self, text: &str) -> io::Result<()> {
        self.line(&format!("error {:?}", text))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

//! Stage 1: frames 8-byte events out of the raw byte stream.
//!
//! A capture starts with zero or more `#`-prefixed ASCII header lines and
//! may end with a matching footer block; everything between is a sequence
//! of 8-byte frames with the occasional [sync sentinel](crate::SYNC_PATTERN)
//! interleaved. On an invalid frame the framer rewinds far enough to
//! cover a sentinel straddling the bad read, scans byte-by-byte for the
//! sentinel, and reports the whole region as a single
//! [`Event::Corrupted`](crate::Event::Corrupted) record before resuming
//! with the first post-sentinel frame.

use std::convert::TryInto;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::{DecoderError, Event, EventKind, RawEvent, SYNC_PATTERN};

// Text blocks are only searched for within this many bytes of either end
// of the stream.
const TEXT_SCAN_LIMIT: u64 = 1024;

fn is_printable(b: u8) -> bool {
    (0x20..=0x7E).contains(&b)
}

/// Length of the `#`-prefixed, CRLF-terminated text line at the start of
/// `buf`, if there is one.
fn text_line(buf: &[u8]) -> Option<usize> {
    if buf.first() != Some(&b'#') {
        return None;
    }
    let mut i = 1;
    while i < buf.len() && is_printable(buf[i]) {
        i += 1;
    }
    if buf.get(i) == Some(&b'\r') && buf.get(i + 1) == Some(&b'\n') {
        Some(i + 2)
    } else {
        None
    }
}

/// Start offset of the `#`-prefixed text line terminating `buf`, if the
/// buffer ends with one.
fn trailing_text_line(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 || &buf[buf.len() - 2..] != b"\r\n" {
        return None;
    }
    let mut start = buf.len() - 2;
    while start > 0 && is_printable(buf[start - 1]) {
        start -= 1;
    }
    if buf[start] == b'#' {
        Some(start)
    } else {
        None
    }
}

/// Reads 8-byte frames from a seekable byte source.
pub struct Framer<R> {
    reader: R,
    stop: Option<Arc<AtomicBool>>,
    started: bool,
    /// Offset of the next unread byte. Kept in lockstep with the
    /// reader's position.
    pos: u64,
    data_start: u64,
    data_end: u64,
    header: Vec<String>,
    footer: Vec<String>,
}

impl<R> Framer<R>
where
    R: Read + Seek,
{
    pub fn new(reader: R, stop: Option<Arc<AtomicBool>>) -> Framer<R> {
        Framer {
            reader,
            stop,
            started: false,
            pos: 0,
            data_start: 0,
            data_end: 0,
            header: vec![],
            footer: vec![],
        }
    }

    pub fn header_lines(&self) -> &[String] {
        &self.header
    }

    pub fn footer_lines(&self) -> &[String] {
        &self.footer
    }

    /// Length of the frame data region, excluding the text blocks. Only
    /// meaningful once the first frame has been pulled.
    pub fn data_len(&self) -> u64 {
        self.data_end - self.data_start
    }

    /// Locates the text blocks and positions the reader on the first
    /// frame.
    fn start(&mut self) -> Result<(), DecoderError> {
        let len = self.reader.seek(SeekFrom::End(0))?;

        self.reader.seek(SeekFrom::Start(0))?;
        let mut head = vec![0u8; len.min(TEXT_SCAN_LIMIT) as usize];
        self.reader.read_exact(&mut head)?;
        let mut start = 0;
        while let Some(line_len) = text_line(&head[start..]) {
            let line = &head[start..start + line_len - 2];
            self.header.push(String::from_utf8_lossy(line).into_owned());
            start += line_len;
        }
        self.data_start = start as u64;

        let tail_len = (len - self.data_start).min(TEXT_SCAN_LIMIT);
        self.reader.seek(SeekFrom::Start(len - tail_len))?;
        let mut tail = vec![0u8; tail_len as usize];
        self.reader.read_exact(&mut tail)?;
        let mut end = tail.len();
        while let Some(line_start) = trailing_text_line(&tail[..end]) {
            let line = &tail[line_start..end - 2];
            self.footer.push(String::from_utf8_lossy(line).into_owned());
            end = line_start;
            // A lone carriage return marks the start of the footer block.
            if end > 0 && tail[end - 1] == b'\r' {
                end -= 1;
                break;
            }
        }
        self.footer.reverse();
        self.data_end = (len - (tail.len() - end) as u64).max(self.data_start);

        if !self.header.is_empty() || !self.footer.is_empty() {
            debug!(
                "stripped {} header and {} footer line(s), {} data bytes remain",
                self.header.len(),
                self.footer.len(),
                self.data_len()
            );
        }

        self.pos = self.data_start;
        self.reader.seek(SeekFrom::Start(self.pos))?;
        Ok(())
    }

    /// Returns the next framed event, or `None` on clean end of stream.
    /// Sync sentinels are consumed silently; corrupted regions come back
    /// as a single [`Event::Corrupted`] record each.
    pub fn next(&mut self) -> Result<Option<Event>, DecoderError> {
        if !self.started {
            self.start()?;
            self.started = true;
        }
        if let Some(stop) = &self.stop {
            if stop.load(Ordering::Relaxed) {
                return Ok(None);
            }
        }

        loop {
            let remaining = self.data_end - self.pos;
            if remaining == 0 {
                return Ok(None);
            }
            if remaining < 8 {
                // Truncated trailing frame; account for it so the
                // consumed stream stays 8-byte aligned.
                warn!("{} trailing byte(s) do not form a frame", remaining);
                self.pos = self.data_end;
                return Ok(Some(Event::Corrupted { skipped: remaining }));
            }

            let frame_start = self.pos;
            let mut buf = [0u8; 8];
            self.reader.read_exact(&mut buf)?;
            self.pos += 8;

            let raw = RawEvent {
                word0: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
                word1: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            };
            match raw.kind() {
                Some(EventKind::Sync) => {
                    if buf == SYNC_PATTERN {
                        continue;
                    }
                    return self.resync(frame_start).map(Some);
                }
                Some(_) => return Ok(Some(Event::Frame(raw))),
                None => return self.resync(frame_start).map(Some),
            }
        }
    }

    /// Scans forward for the sync sentinel, starting one byte after the
    /// bad frame so that a sentinel straddling it is still found. The
    /// reported skip count covers every byte read while realigning.
    fn resync(&mut self, bad_start: u64) -> Result<Event, DecoderError> {
        self.pos = bad_start + 1;
        self.reader.seek(SeekFrom::Start(self.pos))?;

        let mut window = [0u8; 8];
        if self.data_end - self.pos >= 8 {
            self.reader.read_exact(&mut window)?;
            self.pos += 8;

            loop {
                if window == SYNC_PATTERN {
                    let skipped = (self.pos - 8) - bad_start + 7;
                    warn!("realigned on sync pattern, {} byte(s) skipped", skipped);
                    return Ok(Event::Corrupted { skipped });
                }
                if self.pos >= self.data_end {
                    break;
                }
                let mut byte = [0u8; 1];
                self.reader.read_exact(&mut byte)?;
                self.pos += 1;
                window.rotate_left(1);
                window[7] = byte[0];
            }
        }

        // No sentinel before end of stream; the tail is unusable.
        let skipped = self.data_end - bad_start + 7;
        warn!("no sync pattern before end of stream, {} byte(s) skipped", skipped);
        self.pos = self.data_end;
        Ok(Event::Corrupted { skipped })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;
    use std::io::Cursor;

    fn frame(word0: u32, word1: u32) -> Vec<u8> {
        let mut bytes = word0.to_le_bytes().to_vec();
        bytes.extend_from_slice(&word1.to_le_bytes());
        bytes
    }

    fn framer(stream: Vec<u8>) -> Framer<Cursor<Vec<u8>>> {
        Framer::new(Cursor::new(stream), None)
    }

    fn drain(framer: &mut Framer<Cursor<Vec<u8>>>) -> Vec<Event> {
        let mut events = vec![];
        while let Some(ev) = framer.next().unwrap() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn empty_stream() {
        let mut framer = framer(vec![]);
        assert!(framer.next().unwrap().is_none());
    }

    #[test]
    fn frames_and_kinds() {
        let mut stream = frame(0x1100_0000, 0);
        stream.extend(frame(0x1300_0001, 3));
        let mut framer = framer(stream);

        let events = drain(&mut framer);
        assert_eq!(events.len(), 2);
        match &events[0] {
            Event::Frame(raw) => assert_eq!(raw.kind(), Some(EventKind::SystemReset)),
            other => panic!("unexpected {:?}", other),
        }
        match &events[1] {
            Event::Frame(raw) => {
                assert_eq!(raw.kind(), Some(EventKind::Idle));
                assert_eq!(raw.timestamp(), 1);
                assert_eq!(raw.param(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn header_and_footer_are_stripped() {
        let mut stream = b"#SampleTrace v1\r\n#core=app\r\n".to_vec();
        stream.extend(frame(0x1100_0000, 0));
        stream.extend_from_slice(b"\r#end of capture\r\n");
        let mut framer = framer(stream);

        let events = drain(&mut framer);
        assert_eq!(events.len(), 1);
        assert_eq!(framer.header_lines(), ["#SampleTrace v1", "#core=app"]);
        assert_eq!(framer.footer_lines(), ["#end of capture"]);
        assert_eq!(framer.data_len(), 8);
    }

    #[test]
    fn sync_sentinel_is_consumed() {
        let mut stream = frame(0x1100_0000, 0);
        stream.extend_from_slice(&SYNC_PATTERN);
        stream.extend(frame(0x1300_0001, 3));
        let mut framer = framer(stream);

        let events = drain(&mut framer);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::Frame(_)));
        assert!(matches!(events[1], Event::Frame(_)));
    }

    #[test]
    fn corrupted_region_reports_junk_plus_rewind_margin() {
        let mut stream = frame(0x1100_0000, 0);
        stream.extend(frame(0x1400_0001, 5));
        // 13 junk bytes free of the sync pattern, then the sentinel.
        stream.extend_from_slice(&[0u8; 13]);
        stream.extend_from_slice(&SYNC_PATTERN);
        stream.extend(frame(0x1500_0002, 5));
        stream.extend(frame(0x1300_0003, 0));
        let mut framer = framer(stream);

        let events = drain(&mut framer);
        assert_eq!(events.len(), 5);
        assert_eq!(events[2], Event::Corrupted { skipped: 20 });
        match &events[3] {
            Event::Frame(raw) => assert_eq!(raw.kind(), Some(EventKind::ThreadStop)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn junk_without_sentinel_consumes_the_tail() {
        let mut stream = frame(0x1100_0000, 0);
        stream.extend_from_slice(&[0u8; 16]);
        let mut framer = framer(stream);

        let events = drain(&mut framer);
        assert_eq!(events.len(), 2);
        // 16 junk bytes plus the rewind margin.
        assert_eq!(events[1], Event::Corrupted { skipped: 23 });
        assert!(framer.next().unwrap().is_none());
    }

    #[test]
    fn truncated_trailing_frame_is_flagged() {
        let mut stream = frame(0x1100_0000, 0);
        stream.extend_from_slice(&[0x11, 0x22, 0x33]);
        let mut framer = framer(stream);

        let events = drain(&mut framer);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], Event::Corrupted { skipped: 3 });
    }

    #[test]
    fn stop_flag_ends_the_stream() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut stream = frame(0x1100_0000, 0);
        stream.extend(frame(0x1300_0001, 3));
        let mut framer = Framer::new(Cursor::new(stream), Some(stop.clone()));

        assert!(framer.next().unwrap().is_some());
        stop.store(true, Ordering::Relaxed);
        assert!(framer.next().unwrap().is_none());
    }
}

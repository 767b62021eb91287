use std::fmt::{self, Write as _};

use crate::record::PacketRecord;

/// Upper bound on a rendered line, newline included.
pub const MAX_LINE_LEN: usize = 255;

/// A rendered line did not fit in [`MAX_LINE_LEN`] bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatOverflow;

impl fmt::Display for FormatOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "formatted line exceeds {} bytes", MAX_LINE_LEN)
    }
}

impl std::error::Error for FormatOverflow {}

/// One formatted log line held inline, so producing and copying it never
/// touches the allocator.
#[derive(Clone, Copy)]
pub struct LogLine {
    buf: [u8; MAX_LINE_LEN],
    len: u8,
}

impl LogLine {
    pub const EMPTY: LogLine = LogLine {
        buf: [0; MAX_LINE_LEN],
        len: 0,
    };

    /// Wrap pre-rendered text, rejecting anything longer than the bound.
    pub fn from_text(text: &str) -> Result<Self, FormatOverflow> {
        let mut line = LogLine::EMPTY;
        line.write_str(text).map_err(|_| FormatOverflow)?;
        Ok(line)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Write for LogLine {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let start = self.len as usize;
        let end = start + s.len();
        if end > MAX_LINE_LEN {
            return Err(fmt::Error);
        }
        self.buf[start..end].copy_from_slice(s.as_bytes());
        self.len = end as u8;
        Ok(())
    }
}

impl fmt::Debug for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LogLine")
            .field(&String::from_utf8_lossy(self.as_bytes()))
            .finish()
    }
}

impl PartialEq for LogLine {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for LogLine {}

/// Render `record` as `<STAGE> [<PROTO>]: SRC=<ip>:<port> DST=<ip>:<port>\n`.
///
/// A line that would exceed [`MAX_LINE_LEN`] is rejected whole; no partial
/// line is ever returned.
pub fn format_record(record: &PacketRecord) -> Result<LogLine, FormatOverflow> {
    let mut line = LogLine::EMPTY;
    writeln!(
        line,
        "{} [{}]: SRC={}:{} DST={}:{}",
        record.stage.label(),
        record.protocol.label(),
        record.src_addr,
        record.src_port,
        record.dst_addr,
        record.dst_port,
    )
    .map_err(|_| FormatOverflow)?;
    Ok(line)
}

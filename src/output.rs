/// Bounded output buffer over a host-provided byte region.
///
/// All word output (`.`, `emit`, `cr`, `decompile`) lands here; the host
/// drains it between calls with [`OutputBuf::as_str`] and
/// [`OutputBuf::clear`].
pub struct OutputBuf {
    buf: *mut u8,
    len: usize,
    capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputError {
    OutputFull,
    FormattingErr,
}

impl OutputBuf {
    pub fn new(buf: *mut u8, capacity: usize) -> Self {
        Self {
            buf,
            len: 0,
            capacity,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes still free before the buffer fills.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.len
    }

    /// The one write path; everything else funnels through here. A write
    /// that does not fit is refused whole, never truncated.
    pub fn push_bstr(&mut self, bytes: &[u8]) -> Result<(), OutputError> {
        if bytes.len() > self.remaining() {
            return Err(OutputError::OutputFull);
        }
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.buf.add(self.len), bytes.len());
        }
        self.len += bytes.len();
        Ok(())
    }

    pub fn push_str(&mut self, s: &str) -> Result<(), OutputError> {
        self.push_bstr(s.as_bytes())
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn as_str(&self) -> &str {
        let bytes = unsafe { core::slice::from_raw_parts(self.buf, self.len) };
        // `emit` can deposit arbitrary bytes, so the content is not
        // guaranteed to be UTF-8.
        core::str::from_utf8(bytes).unwrap_or("<non-utf8 output>")
    }
}

impl core::fmt::Write for OutputBuf {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.push_str(s).map_err(|_| core::fmt::Error)
    }
}

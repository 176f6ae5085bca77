use crate::error::{WireError, WireFault, WireResult};
use slice_deque::SliceDeque;
use std::io;

type ByteDeque = SliceDeque<u8>;

// Growth happens in socket-sized steps so a burst of large values does not
// balloon the allocation one frame at a time.
const GROWTH_STEP: usize = 65536;

/// A byte FIFO sitting between a non-blocking socket and the framer. Data is
/// appended at the tail and consumed from the head; both sides see contiguous
/// slices. The deque starts small and grows on demand up to `max_size`, at
/// which point `fill_from` stops draining the socket and the kernel window
/// provides the backpressure.
pub struct Buffer {
    data: ByteDeque,
    max_size: usize,
}

impl Buffer {
    pub fn new(initial: usize, max_size: usize) -> Buffer {
        let mut data = ByteDeque::new();
        data.reserve(initial.min(max_size));
        Buffer { data, max_size }
    }

    /// The number of buffered bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Contiguous view of the buffered data.
    #[inline]
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Drop `count` bytes from the head after they have been parsed.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.data.len());
        unsafe { self.data.move_head(count as isize) }
    }

    #[inline]
    pub fn clear(&mut self) {
        let len = self.len();
        unsafe { self.data.move_head(len as isize) };
    }

    /// Append `bytes` at the tail. `Wait` if the buffer is at capacity; the
    /// caller holds on to the data and tries again after a drain.
    pub fn put(&mut self, bytes: &[u8]) -> WireResult<()> {
        if self.data.len() + bytes.len() > self.max_size {
            return Err(WireError::Wait);
        }

        self.data.extend(bytes.iter().cloned());
        Ok(())
    }

    /// Read from `reader` until it would block or the buffer reaches its
    /// cap. Returns the number of bytes taken in; a clean zero-byte read is
    /// the peer hanging up and surfaces as `Closed`.
    pub fn fill_from<R: io::Read>(&mut self, mut reader: R) -> WireResult<usize> {
        let mut total = 0;

        while self.data.len() < self.max_size {
            if self.spare_capacity() == 0 {
                self.grow();
            }

            let allowance = self.max_size - self.data.len();

            unsafe {
                let slice = self.data.tail_head_slice();
                let limit = allowance.min(slice.len());
                let read_count = match reader.read(&mut slice[..limit]) {
                    Ok(count) => count,
                    Err(err) => {
                        if err.kind() == io::ErrorKind::WouldBlock {
                            return Ok(total);
                        }
                        if err.kind() == io::ErrorKind::Interrupted {
                            continue;
                        }
                        return Err(err.into());
                    }
                };

                if read_count == 0 {
                    return Err(WireError::Closed);
                }

                self.data.move_tail(read_count as isize);
                total += read_count;
            }
        }

        Ok(total)
    }

    /// Write buffered data to `writer` until it would block or the buffer is
    /// empty. Returns the number of bytes moved out.
    pub fn drain_to<W: io::Write>(&mut self, mut writer: W) -> WireResult<usize> {
        let mut total = 0;

        while !self.data.is_empty() {
            let written = match writer.write(self.data.as_slice()) {
                Ok(count) => count,
                Err(err) => {
                    if err.kind() == io::ErrorKind::WouldBlock {
                        return Ok(total);
                    }
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err.into());
                }
            };

            if written == 0 {
                return Err(WireError::Fatal(WireFault::Io(io::ErrorKind::WriteZero)));
            }

            self.consume(written);
            total += written;
        }

        Ok(total)
    }

    #[inline]
    fn spare_capacity(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    fn grow(&mut self) {
        let step = GROWTH_STEP.min(self.max_size - self.data.len());
        self.data.reserve(step.max(1));
    }
}

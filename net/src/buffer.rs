//! Growable byte buffer with read/write cursors, one per traffic direction.

use std::io;
use std::os::unix::io::RawFd;

/// Initial capacity of a fresh buffer.
const INITIAL_CAPACITY: usize = 1024;

/// Stack scratch used by the scatter read so one syscall can admit far more
/// than the current tail without pre-allocating per connection.
const SCRATCH_SIZE: usize = 64 * 1024;

/// A contiguous byte region with a read cursor `r` and a write cursor `w`,
/// `0 <= r <= w <= cap`.
///
/// `[r, w)` holds readable payload; `[w, cap)` is the writable tail.
/// When the readable region empties both cursors reset to zero; capacity
/// grows monotonically and never shrinks.
#[derive(Debug)]
pub struct Buffer {
    buf: Vec<u8>,
    r: usize,
    w: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            buf: vec![0; INITIAL_CAPACITY],
            r: 0,
            w: 0,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.w - self.r
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.w
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.r == self.w
    }

    /// The readable region.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.r..self.w]
    }

    /// Consume `n` readable bytes. Cursors reset to zero when the region
    /// empties; no bytes are moved.
    pub fn consume(&mut self, n: usize) {
        self.r += n.min(self.readable_bytes());
        if self.r == self.w {
            self.r = 0;
            self.w = 0;
        }
    }

    /// Remove and return the whole readable region.
    pub fn take(&mut self) -> Vec<u8> {
        let out = self.peek().to_vec();
        self.clear();
        out
    }

    pub fn clear(&mut self) {
        self.r = 0;
        self.w = 0;
    }

    /// Append `data`, growing capacity when the tail is insufficient.
    pub fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.writable_bytes() < data.len() {
            self.buf.resize(self.w + data.len(), 0);
        }
        self.buf[self.w..self.w + data.len()].copy_from_slice(data);
        self.w += data.len();
    }

    /// Scatter-read from `fd` into the tail plus a 64 KiB stack scratch.
    ///
    /// Scratch overflow is appended afterwards, so a single syscall can
    /// admit much more than the current tail. `Ok(0)` signals peer close;
    /// transient failures come back as `WouldBlock`/`Interrupted`.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut scratch = [0u8; SCRATCH_SIZE];
        let tail = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: unsafe { self.buf.as_mut_ptr().add(self.w) } as *mut libc::c_void,
                iov_len: tail,
            },
            libc::iovec {
                iov_base: scratch.as_mut_ptr() as *mut libc::c_void,
                iov_len: scratch.len(),
            },
        ];
        // Skip the scratch segment once the tail alone is at least as large.
        let iovcnt: libc::c_int = if tail < scratch.len() { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= tail {
            self.w += n;
        } else {
            self.w = self.buf.len();
            self.append(&scratch[..n - tail]);
        }
        Ok(n)
    }

    /// Write the readable region to `fd` once, consuming what was sent.
    pub fn write_to_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable_bytes();
        if readable == 0 {
            return Ok(0);
        }
        let n = unsafe {
            libc::write(
                fd,
                self.buf.as_ptr().add(self.r) as *const libc::c_void,
                readable,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        self.consume(n as usize);
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

    fn nonblocking_pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn write_all(fd: RawFd, mut data: &[u8]) {
        while !data.is_empty() {
            let n =
                unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    continue;
                }
                panic!("pipe write failed: {err}");
            }
            data = &data[n as usize..];
        }
    }

    #[test]
    fn append_extends_readable_region() {
        let mut buf = Buffer::new();
        assert_eq!(buf.capacity(), 1024);
        assert_eq!(buf.readable_bytes(), 0);

        buf.append(b"hello");
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.peek(), b"hello");

        buf.append(b" world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(&buf.peek()[6..], b"world");
    }

    #[test]
    fn consume_advances_and_resets() {
        let mut buf = Buffer::new();
        buf.append(b"abcdef");

        buf.consume(2);
        assert_eq!(buf.peek(), b"cdef");
        assert_eq!(buf.readable_bytes(), 4);

        // Draining the region resets both cursors without moving bytes.
        buf.consume(4);
        assert_eq!(buf.readable_bytes(), 0);
        buf.append(b"x");
        assert_eq!(buf.peek(), b"x");
        assert_eq!(buf.writable_bytes(), buf.capacity() - 1);
    }

    #[test]
    fn consume_is_clamped() {
        let mut buf = Buffer::new();
        buf.append(b"ab");
        buf.consume(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn append_grows_capacity_monotonically() {
        let mut buf = Buffer::new();
        let big = vec![7u8; 4096];
        buf.append(&big);
        assert!(buf.capacity() >= 4096);
        assert_eq!(buf.readable_bytes(), 4096);

        let cap = buf.capacity();
        buf.consume(4096);
        buf.append(b"tiny");
        assert_eq!(buf.capacity(), cap);
    }

    #[test]
    fn read_from_fd_fills_tail() {
        let (rx, tx) = nonblocking_pipe();
        write_all(tx.as_raw_fd(), b"ping");

        let mut buf = Buffer::new();
        let n = buf.read_from_fd(rx.as_raw_fd()).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf.peek(), b"ping");
    }

    #[test]
    fn read_from_fd_spills_into_scratch() {
        let (rx, tx) = nonblocking_pipe();

        // Shrink the tail to a few bytes so the kernel must fill the
        // scratch segment as well.
        let mut buf = Buffer::new();
        let filler = vec![0u8; 1020];
        buf.append(&filler);
        assert_eq!(buf.writable_bytes(), 4);

        let payload: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        let writer = {
            let fd = tx.as_raw_fd();
            let payload = payload.clone();
            std::thread::spawn(move || write_all(fd, &payload))
        };

        let mut total = 0;
        while total < payload.len() {
            match buf.read_from_fd(rx.as_raw_fd()) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => panic!("readv failed: {e}"),
            }
        }
        writer.join().unwrap();

        assert_eq!(total, payload.len());
        assert_eq!(&buf.peek()[1020..], &payload[..]);
    }

    #[test]
    fn read_from_fd_reports_peer_close() {
        let (rx, tx) = nonblocking_pipe();
        drop(tx);

        let mut buf = Buffer::new();
        assert_eq!(buf.read_from_fd(rx.as_raw_fd()).unwrap(), 0);
    }

    #[test]
    fn write_to_fd_consumes_what_was_sent() {
        let (rx, tx) = nonblocking_pipe();

        let mut buf = Buffer::new();
        buf.append(b"response");
        let n = buf.write_to_fd(tx.as_raw_fd()).unwrap();
        assert_eq!(n, 8);
        assert!(buf.is_empty());

        let mut out = [0u8; 16];
        let got = unsafe {
            libc::read(
                rx.as_raw_fd(),
                out.as_mut_ptr() as *mut libc::c_void,
                out.len(),
            )
        };
        assert_eq!(&out[..got as usize], b"response");
    }
}

//! Freelist of receive buffers backing pooled descriptors.

use log::trace;

/// Fixed-size buffer freelist. `obtain` never fails: the pool grows when
/// the freelist runs dry, and fragments larger than the pool's buffer size
/// get a one-off allocation that is dropped on release instead of recycled.
pub(crate) struct DescPool {
    free: Vec<Box<[u8]>>,
    buf_size: usize,
    /// Pooled buffers currently held by descriptors or the user.
    outstanding: usize,
}

impl DescPool {
    pub(crate) fn new(buf_size: usize, bootstrap: usize) -> Self {
        assert!(buf_size > 0);
        let free = (0..bootstrap)
            .map(|_| vec![0u8; buf_size].into_boxed_slice())
            .collect();
        DescPool {
            free,
            buf_size,
            outstanding: 0,
        }
    }

    /// Obtain a buffer of at least `len` bytes.
    pub(crate) fn obtain(&mut self, len: usize) -> Box<[u8]> {
        self.outstanding += 1;
        if len > self.buf_size {
            trace!("oversize receive buffer requested: {} bytes", len);
            return vec![0u8; len].into_boxed_slice();
        }
        self.free.pop().unwrap_or_else(|| {
            trace!("receive buffer pool grows beyond bootstrap");
            vec![0u8; self.buf_size].into_boxed_slice()
        })
    }

    /// Return a buffer obtained from this pool. Oversize one-offs are
    /// dropped here.
    pub(crate) fn release(&mut self, buf: Box<[u8]>) {
        debug_assert!(self.outstanding > 0);
        self.outstanding -= 1;
        if buf.len() == self.buf_size {
            self.free.push(buf);
        }
    }

    #[inline]
    pub(crate) fn available(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obtain_release_recycles() {
        let mut pool = DescPool::new(64, 2);
        assert_eq!(pool.available(), 2);

        let buf = pool.obtain(10);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.outstanding(), 1);

        pool.release(buf);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn grows_past_bootstrap() {
        let mut pool = DescPool::new(16, 1);
        let a = pool.obtain(16);
        let b = pool.obtain(16);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn oversize_not_recycled() {
        let mut pool = DescPool::new(16, 1);
        let big = pool.obtain(100);
        assert_eq!(big.len(), 100);
        pool.release(big);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.outstanding(), 0);
    }
}

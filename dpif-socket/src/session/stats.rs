use std::sync::atomic::{AtomicUsize, Ordering};

/// Statistics for a session. These are shared between the driver task and
/// every session handle.
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Requests sent, dumps included
    requests: AtomicUsize,
    /// Total bytes sent
    bytes_tx: AtomicUsize,
    /// Total bytes received
    bytes_rx: AtomicUsize,
    /// Data messages delivered to dumps
    dump_messages: AtomicUsize,
    /// Requests the kernel answered with an error
    kernel_errors: AtomicUsize,
    /// Messages for requests that were no longer pending
    dropped: AtomicUsize,
}

impl SessionStats {
    #[inline]
    pub(crate) fn increment_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_tx(&self, bytes: usize) {
        self.bytes_tx.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_rx(&self, bytes: usize) {
        self.bytes_rx.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_dump_messages(&self) {
        self.dump_messages.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_kernel_errors(&self) {
        self.kernel_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_tx(&self) -> usize {
        self.bytes_tx.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_rx(&self) -> usize {
        self.bytes_rx.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn dump_messages(&self) -> usize {
        self.dump_messages.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn kernel_errors(&self) -> usize {
        self.kernel_errors.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

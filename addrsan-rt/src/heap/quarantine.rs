//! FIFO of freed chunks held back from reuse. A chunk sits here fully
//! poisoned until enough younger frees have accumulated behind it, which is
//! what turns a use-after-free from a lucky read of recycled memory into a
//! reported bug.

use core::ptr::NonNull;

use spin::mutex::SpinMutex;

use super::ChunkHeader;

#[derive(Debug)]
pub(crate) struct Quarantine {
    inner: SpinMutex<Fifo>,
}

#[derive(Debug)]
struct Fifo {
    head: Option<NonNull<ChunkHeader>>,
    tail: Option<NonNull<ChunkHeader>>,
    bytes: usize,
}

unsafe impl Send for Fifo {}

impl Quarantine {
    pub(crate) const fn new() -> Quarantine {
        Quarantine { inner: SpinMutex::new(Fifo { head: None, tail: None, bytes: 0 }) }
    }

    pub(crate) fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    /// Appends a freed chunk, then hands every chunk that overflows `limit`
    /// to `release`, oldest first. The chunk's intrusive `next` link is
    /// claimed by the queue while it sits here.
    pub(crate) fn push(
        &self,
        chunk: NonNull<ChunkHeader>,
        limit: usize,
        mut release: impl FnMut(NonNull<ChunkHeader>),
    ) {
        let mut evicted: Option<NonNull<ChunkHeader>> = None;
        {
            let mut fifo = self.inner.lock();
            unsafe {
                (*chunk.as_ptr()).next = None;
            }
            match fifo.tail {
                Some(tail) => unsafe { (*tail.as_ptr()).next = Some(chunk) },
                None => fifo.head = Some(chunk),
            }
            fifo.tail = Some(chunk);
            fifo.bytes += unsafe { chunk.as_ref().total_size };

            // Unlink overflow inside the lock, release it outside: release
            // may munmap or take a size-class lock.
            let mut evicted_tail: Option<NonNull<ChunkHeader>> = None;
            while fifo.bytes > limit {
                let Some(oldest) = fifo.head else { break };
                fifo.head = unsafe { oldest.as_ref().next };
                if fifo.head.is_none() {
                    fifo.tail = None;
                }
                fifo.bytes -= unsafe { oldest.as_ref().total_size };
                unsafe { (*oldest.as_ptr()).next = None };
                match evicted_tail {
                    Some(tail) => unsafe { (*tail.as_ptr()).next = Some(oldest) },
                    None => evicted = Some(oldest),
                }
                evicted_tail = Some(oldest);
            }
        }
        while let Some(chunk) = evicted {
            evicted = unsafe { chunk.as_ref().next };
            release(chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{CHUNK_QUARANTINED, ChunkHeader};
    use core::sync::atomic::AtomicU32;

    fn synthetic_chunk(total_size: usize) -> NonNull<ChunkHeader> {
        let header = ChunkHeader {
            state: AtomicU32::new(CHUNK_QUARANTINED),
            size_class: 0,
            user_size: 0,
            alignment: 8,
            chunk_beg: 0,
            total_size,
            alloc_tid: 0,
            free_tid: 0,
            alloc_stack: 0,
            free_stack: 0,
            next: None,
        };
        NonNull::from(alloc::boxed::Box::leak(alloc::boxed::Box::new(header)))
    }

    #[test]
    fn holds_until_limit_then_releases_fifo() {
        let quarantine = Quarantine::new();
        let chunks: Vec<_> = (0..4).map(|_| synthetic_chunk(100)).collect();
        let mut released = Vec::new();

        for chunk in &chunks {
            quarantine.push(*chunk, 250, |c| released.push(c));
        }
        // 4 x 100 bytes against a limit of 250: the two oldest fall out, in
        // order.
        assert_eq!(released, chunks[..2].to_vec());
        assert_eq!(quarantine.bytes(), 200);
    }

    #[test]
    fn oversized_chunk_passes_straight_through() {
        let quarantine = Quarantine::new();
        let big = synthetic_chunk(1000);
        let mut released = Vec::new();
        quarantine.push(big, 250, |c| released.push(c));
        assert_eq!(released, [big]);
        assert_eq!(quarantine.bytes(), 0);
    }

    #[test]
    fn zero_limit_keeps_nothing() {
        let quarantine = Quarantine::new();
        let mut released = Vec::new();
        for _ in 0..3 {
            quarantine.push(synthetic_chunk(64), 0, |c| released.push(c));
        }
        assert_eq!(released.len(), 3);
        assert_eq!(quarantine.bytes(), 0);
    }
}

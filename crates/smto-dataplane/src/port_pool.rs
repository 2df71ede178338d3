//! NAT Port Pool
//!
//! Bounded lock-free pool of NAT ports handed to new flows for their
//! address/port rewrite. Exhaustion is backpressure: the flow is tracked
//! without a rewrite until ports come back.

use crossbeam::queue::ArrayQueue;

pub struct PortPool {
    free: ArrayQueue<u16>,
    base: u16,
    size: usize,
}

impl PortPool {
    /// Pool seeded with `base .. base + size`.
    ///
    /// The range is clipped at `u16::MAX`; config validation rejects
    /// ranges that would need clipping.
    pub fn new(base: u16, size: usize) -> Self {
        let end = (base as usize + size).min(u16::MAX as usize + 1);
        let size = end - base as usize;
        let free = ArrayQueue::new(size.max(1));
        for port in base as usize..end {
            // capacity equals the seeded range
            let _ = free.push(port as u16);
        }
        Self { free, base, size }
    }

    /// Take a free port, `None` when exhausted
    #[inline]
    pub fn acquire(&self) -> Option<u16> {
        self.free.pop()
    }

    /// Return a port to the pool.
    ///
    /// Ports outside the seeded range are ignored, as is a return into a
    /// full pool (double release).
    pub fn release(&self, port: u16) -> bool {
        if !self.contains(port) {
            return false;
        }
        self.free.push(port).is_ok()
    }

    fn contains(&self, port: u16) -> bool {
        let port = port as usize;
        port >= self.base as usize && port < self.base as usize + self.size
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_exhaustion_and_release() {
        let pool = PortPool::new(2000, 4);
        let ports: Vec<u16> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(ports, vec![2000, 2001, 2002, 2003]);
        assert!(pool.acquire().is_none());

        assert!(pool.release(2002));
        assert_eq!(pool.acquire(), Some(2002));
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_release_out_of_range() {
        let pool = PortPool::new(2000, 4);
        assert!(!pool.release(80));
        assert!(!pool.release(2000)); // pool already full
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_range_clipped_at_u16_max() {
        let pool = PortPool::new(65534, 10);
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.acquire(), Some(65534));
        assert_eq!(pool.acquire(), Some(65535));
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_concurrent_acquire_unique() {
        use std::sync::Arc;
        use std::thread;

        let pool = Arc::new(PortPool::new(1024, 4000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || (0..1000).filter_map(|_| pool.acquire()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for port in h.join().unwrap() {
                assert!(seen.insert(port));
            }
        }
        assert_eq!(seen.len(), 4000);
        assert_eq!(pool.available(), 0);
    }
}

use crate::encap::{wifi_encap, EncapError};
use crate::{Frame, MacAddr};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Bounded FIFO of wired frames for one station within one traffic class.
///
/// Frames are encapsulated into 802.11 data frames from `ta` to `ra` as they are pulled.
pub struct StationQueue {
    ra: MacAddr,
    ta: MacAddr,
    capacity: usize,
    ring: RwLock<Ring>,
    encap_failures: AtomicU64,
}

struct Ring {
    slots: Box<[Option<Frame>]>,
    head: usize,
    tail: usize,
    size: usize,
    drops: u64,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            tail: 0,
            size: 0,
            drops: 0,
        }
    }
}

impl StationQueue {
    pub fn new(capacity: usize, ra: MacAddr, ta: MacAddr) -> Self {
        Self {
            ra,
            ta,
            capacity,
            ring: RwLock::new(Ring::new(capacity)),
            encap_failures: AtomicU64::new(0),
        }
    }

    pub fn ra(&self) -> MacAddr {
        self.ra
    }

    pub fn ta(&self) -> MacAddr {
        self.ta
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a frame. Returns false and counts a drop if the queue is full.
    pub fn push(&self, f: Frame) -> bool {
        let mut ring = self.ring.write();
        if ring.size == self.capacity {
            ring.drops += 1;
            trace!(ra = %self.ra, drops = ring.drops, "station queue full");
            return false;
        }

        let tail = ring.tail;
        ring.slots[tail] = Some(f);
        ring.tail = (tail + 1) % self.capacity;
        ring.size += 1;
        true
    }

    /// Remove the oldest frame and encapsulate it.
    ///
    /// `None` means the queue was empty. `Some(Err(_))` means a frame was removed but could not
    /// be encapsulated; it has been destroyed.
    pub fn pull(&self) -> Option<Result<Frame, EncapError>> {
        let f = {
            let mut ring = self.ring.write();
            if ring.size == 0 {
                return None;
            }

            let head = ring.head;
            let f = ring.slots[head].take();
            ring.head = (head + 1) % self.capacity;
            ring.size -= 1;
            f?
        };

        let res = wifi_encap(f, self.ra, self.ta);
        if res.is_err() {
            self.encap_failures.fetch_add(1, Ordering::Relaxed);
        }

        Some(res)
    }

    /// Look at the frame that the next [`StationQueue::pull`] will return, before encapsulation.
    pub fn peek<R>(&self, f: impl FnOnce(&Frame) -> R) -> Option<R> {
        let ring = self.ring.read();
        if ring.size == 0 {
            return None;
        }

        ring.slots[ring.head].as_ref().map(f)
    }

    pub fn size(&self) -> usize {
        self.ring.read().size
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn drops(&self) -> u64 {
        self.ring.read().drops
    }

    pub fn encap_failures(&self) -> u64 {
        self.encap_failures.load(Ordering::Relaxed)
    }

    pub fn report(&self) -> StationReport {
        let ring = self.ring.read();
        StationReport {
            ra: self.ra,
            ta: self.ta,
            size: ring.size,
            capacity: self.capacity,
            drops: ring.drops,
            encap_failures: self.encap_failures(),
            head_len: if ring.size > 0 {
                ring.slots[ring.head].as_ref().map(Frame::len)
            } else {
                None
            },
        }
    }
}

impl std::fmt::Debug for StationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("StationQueue")
            .field("ra", &self.ra)
            .field("ta", &self.ta)
            .field("size", &self.size())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// Snapshot of one station queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StationReport {
    pub ra: MacAddr,
    pub ta: MacAddr,
    pub size: usize,
    pub capacity: usize,
    pub drops: u64,
    pub encap_failures: u64,
    /// Wired length of the frame at the head of the queue.
    pub head_len: Option<usize>,
}

impl std::fmt::Display for StationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RA: {}, TA: {} status: {}/{} drops: {}",
            self.ra, self.ta, self.size, self.capacity, self.drops
        )?;
        if self.encap_failures > 0 {
            write!(f, " encap_failures: {}", self.encap_failures)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod t {
    use super::StationQueue;
    use crate::encap::{split_llc_snap, EncapError, WifiDataHeader, ETHER_HDR_LEN};
    use crate::t::{init, mac, wired_frame};
    use crate::Frame;

    #[test]
    fn fifo_order_and_encap() {
        init();
        let (sta, ap, src) = (mac(1), mac(0xa0), mac(0x77));
        let q = StationQueue::new(8, sta, ap);

        let frames: Vec<_> = (0..5u8)
            .map(|i| wired_frame(src, sta, 0x0800, 60 + i as usize, i))
            .collect();
        for f in &frames {
            assert!(q.push(f.clone()));
        }

        assert_eq!(q.size(), 5);
        for orig in &frames {
            let f = q.pull().unwrap().unwrap();
            let (hdr, body) = WifiDataHeader::from_slice(f.data()).unwrap();
            assert_eq!((hdr.addr1, hdr.addr2, hdr.addr3), (sta, ap, src));
            let (ether_type, payload) = split_llc_snap(body).unwrap();
            assert_eq!(ether_type, 0x0800);
            assert_eq!(payload, &orig.data()[ETHER_HDR_LEN..]);
        }

        assert!(q.pull().is_none());
        assert_eq!(q.size(), 0);
        assert_eq!(q.drops(), 0);
    }

    #[test]
    fn drops_when_full() {
        init();
        let q = StationQueue::new(3, mac(1), mac(2));
        for i in 0..3 {
            assert!(q.push(wired_frame(mac(9), mac(1), 0x0800, 10, i)));
        }

        for i in 0..4 {
            assert!(!q.push(wired_frame(mac(9), mac(1), 0x0800, 10, 10 + i)));
            assert_eq!(q.drops(), i as u64 + 1);
            assert_eq!(q.size(), 3);
        }

        // the survivors are the first three.
        for i in 0..3 {
            let f = q.pull().unwrap().unwrap();
            assert_eq!(f.data()[32], i);
        }
    }

    #[test]
    fn wraps_around() {
        init();
        let q = StationQueue::new(3, mac(1), mac(2));
        let mut next_in = 0u8;
        let mut next_out = 0u8;
        for round in 0..20 {
            let n = 1 + round % 3;
            for _ in 0..n {
                assert!(q.push(wired_frame(mac(9), mac(1), 0x0800, 4, next_in)));
                next_in += 1;
            }

            for _ in 0..n {
                let f = q.pull().unwrap().unwrap();
                assert_eq!(f.data()[32], next_out);
                next_out += 1;
            }
        }

        assert!(q.is_empty());
    }

    #[test]
    fn peek_sees_true_head() {
        init();
        let q = StationQueue::new(4, mac(1), mac(2));
        assert_eq!(q.peek(Frame::len), None);

        q.push(wired_frame(mac(9), mac(1), 0x0800, 10, 1));
        q.push(wired_frame(mac(9), mac(1), 0x0800, 20, 2));
        assert_eq!(q.peek(|f| f.data()[14]), Some(1));
        assert_eq!(q.peek(Frame::len), Some(24));
        // peeking does not consume.
        assert_eq!(q.size(), 2);

        q.pull().unwrap().unwrap();
        assert_eq!(q.peek(|f| f.data()[14]), Some(2));
        assert_eq!(q.report().head_len, Some(34));
    }

    #[test]
    fn encap_failure_consumes_frame() {
        init();
        let q = StationQueue::new(4, mac(1), mac(2));
        q.push(Frame::new(vec![0u8; 6]));
        q.push(wired_frame(mac(9), mac(1), 0x0800, 10, 7));

        let e = q.pull().unwrap().unwrap_err();
        assert!(matches!(e, EncapError::Truncated { len: 6 }));
        assert_eq!(q.encap_failures(), 1);
        assert_eq!(q.size(), 1);

        let f = q.pull().unwrap().unwrap();
        assert_eq!(f.data()[32], 7);
        assert_eq!(q.report().encap_failures, 1);
    }
}

use super::{StationId, StationQueue, StationReport, TrafficClassKey};
use crate::encap::EncapError;
use crate::{Frame, MacAddr};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// The queues of one traffic class: one [`StationQueue`] per destination station, served in
/// round robin. Also carries the class's DRR deficit and quantum, which the scheduler drives.
pub struct ClassQueue {
    key: TrafficClassKey,
    capacity: usize,
    quantum: usize,
    amsdu_aggregation: bool,
    debug: bool,
    stations: RwLock<StationArena>,
    state: Mutex<ClassState>,
}

#[derive(Default)]
struct StationArena {
    index: HashMap<MacAddr, StationId>,
    queues: Vec<Arc<StationQueue>>,
}

#[derive(Default)]
struct ClassState {
    // stations believed to have frames queued, each at most once.
    rotation: VecDeque<StationId>,
    deficit: usize,
    size: usize,
    drops: u64,
    encap_failures: u64,
}

impl ClassQueue {
    pub fn new(key: TrafficClassKey, capacity: usize, quantum: usize, debug: bool) -> Self {
        Self {
            key,
            capacity,
            quantum,
            amsdu_aggregation: false,
            debug,
            stations: Default::default(),
            state: Default::default(),
        }
    }

    pub fn key(&self) -> &TrafficClassKey {
        &self.key
    }

    pub fn quantum(&self) -> usize {
        self.quantum
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // Locate or create the queue for station `ra`. A station keeps the `ta` it was first seen
    // with.
    fn station(&self, ra: MacAddr, ta: MacAddr) -> (StationId, Arc<StationQueue>) {
        {
            let arena = self.stations.read();
            if let Some(&sid) = arena.index.get(&ra) {
                return (sid, Arc::clone(&arena.queues[sid.0]));
            }
        }

        let mut arena = self.stations.write();
        if let Some(&sid) = arena.index.get(&ra) {
            return (sid, Arc::clone(&arena.queues[sid.0]));
        }

        if self.debug {
            info!(class = %self.key, %ra, %ta, "creating new station queue");
        } else {
            debug!(class = %self.key, %ra, %ta, "creating new station queue");
        }

        let sid = StationId(arena.queues.len());
        let queue = Arc::new(StationQueue::new(self.capacity, ra, ta));
        arena.queues.push(Arc::clone(&queue));
        arena.index.insert(ra, sid);
        (sid, queue)
    }

    /// Enqueue a wired frame for station `ra`, to be sent from access point address `ta`.
    ///
    /// Returns false if the station's queue is full; the drop is counted.
    pub fn enqueue(&self, f: Frame, ra: MacAddr, ta: MacAddr) -> bool {
        let mut st = self.state.lock();
        let (sid, queue) = self.station(ra, ta);
        if !queue.push(f) {
            st.drops += 1;
            return false;
        }

        st.size += 1;
        if !st.rotation.contains(&sid) {
            st.rotation.push_back(sid);
        }

        true
    }

    /// Dequeue one encapsulated frame from the next station in the rotation.
    ///
    /// Stations found empty leave the rotation. `None` means no station had anything queued.
    /// `Some(Err(_))` means the selected station's head frame failed encapsulation and was
    /// destroyed.
    pub fn dequeue(&self) -> Option<Result<Frame, EncapError>> {
        let mut st = self.state.lock();
        let mut candidates = st.rotation.len();
        while candidates > 0 {
            candidates -= 1;
            let sid = st.rotation.pop_front()?;
            let queue = Arc::clone(&self.stations.read().queues[sid.0]);
            match queue.pull() {
                None => {
                    trace!(class = %self.key, ra = %queue.ra(), "station drained");
                }
                Some(Ok(f)) => {
                    st.rotation.push_back(sid);
                    st.size = st.size.saturating_sub(1);
                    return Some(Ok(f));
                }
                Some(Err(e)) => {
                    st.size = st.size.saturating_sub(1);
                    st.encap_failures += 1;
                    if !queue.is_empty() {
                        st.rotation.push_back(sid);
                    }

                    return Some(Err(e));
                }
            }
        }

        None
    }

    /// Charge `len` bytes against the deficit if it covers them. Otherwise grant the class one
    /// quantum and refuse.
    pub fn charge(&self, len: usize) -> bool {
        let mut st = self.state.lock();
        if st.deficit >= len {
            st.deficit -= len;
            true
        } else {
            st.deficit += self.quantum;
            false
        }
    }

    pub fn reset_deficit(&self) {
        self.state.lock().deficit = 0;
    }

    pub fn deficit(&self) -> usize {
        self.state.lock().deficit
    }

    /// Frames queued across all stations of this class.
    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn drops(&self) -> u64 {
        self.state.lock().drops
    }

    pub fn report(&self) -> ClassReport {
        let st = self.state.lock();
        let stations = self
            .stations
            .read()
            .queues
            .iter()
            .map(|q| q.report())
            .collect();
        ClassReport {
            key: self.key.clone(),
            capacity: self.capacity,
            quantum: self.quantum,
            deficit: st.deficit,
            size: st.size,
            drops: st.drops,
            encap_failures: st.encap_failures,
            amsdu_aggregation: self.amsdu_aggregation,
            active_stations: st.rotation.len(),
            stations,
        }
    }
}

impl std::fmt::Debug for ClassQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("ClassQueue")
            .field("key", &self.key)
            .field("quantum", &self.quantum)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

/// Snapshot of one traffic class and its stations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassReport {
    pub key: TrafficClassKey,
    pub capacity: usize,
    pub quantum: usize,
    pub deficit: usize,
    pub size: usize,
    pub drops: u64,
    pub encap_failures: u64,
    pub amsdu_aggregation: bool,
    pub active_stations: usize,
    pub stations: Vec<StationReport>,
}

impl std::fmt::Display for ClassReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} -> capacity: {} quantum: {} deficit: {} size: {} drops: {}",
            self.key, self.capacity, self.quantum, self.deficit, self.size, self.drops
        )?;
        for s in &self.stations {
            writeln!(f, "  {}", s)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod t {
    use super::ClassQueue;
    use crate::encap::WifiDataHeader;
    use crate::scheduler::TrafficClassKey;
    use crate::t::{init, mac, wired_frame};
    use crate::{Frame, MacAddr};

    fn class(capacity: usize) -> ClassQueue {
        ClassQueue::new(TrafficClassKey::new("tenant", 0), capacity, 1500, false)
    }

    fn enq(c: &ClassQueue, sta: MacAddr, tag: u8) -> bool {
        c.enqueue(wired_frame(mac(0x77), sta, 0x0800, 50, tag), sta, mac(0xa0))
    }

    fn deq_ra(c: &ClassQueue) -> MacAddr {
        let f = c.dequeue().unwrap().unwrap();
        WifiDataHeader::from_slice(f.data()).unwrap().0.addr1
    }

    #[test]
    fn round_robin_across_stations() {
        init();
        let c = class(10);
        let (a, b, s) = (mac(0xa), mac(0xb), mac(0xc));
        enq(&c, a, 0);
        enq(&c, b, 0);
        enq(&c, s, 0);
        assert_eq!(c.size(), 3);

        assert_eq!(deq_ra(&c), a);
        // a new frame for a arrives mid-sweep; b and c still go first.
        enq(&c, a, 1);
        assert_eq!(deq_ra(&c), b);
        assert_eq!(deq_ra(&c), s);
        assert_eq!(deq_ra(&c), a);
        assert!(c.dequeue().is_none());
        assert_eq!(c.size(), 0);
        assert_eq!(c.report().active_stations, 0);
    }

    #[test]
    fn one_frame_per_station_per_sweep() {
        init();
        let c = class(10);
        let (a, b) = (mac(0xa), mac(0xb));
        for i in 0..3 {
            enq(&c, a, i);
        }
        enq(&c, b, 0);

        let order: Vec<_> = (0..4).map(|_| deq_ra(&c)).collect();
        assert_eq!(order, vec![a, b, a, a]);
    }

    #[test]
    fn station_listed_once() {
        init();
        let c = class(10);
        for i in 0..5 {
            enq(&c, mac(1), i);
        }

        let r = c.report();
        assert_eq!(r.active_stations, 1);
        assert_eq!(r.stations.len(), 1);
        assert_eq!(r.stations[0].size, 5);
    }

    #[test]
    fn drops_counted_per_class() {
        init();
        let c = class(2);
        assert!(enq(&c, mac(1), 0));
        assert!(enq(&c, mac(1), 1));
        assert!(!enq(&c, mac(1), 2));
        // other stations have their own capacity.
        assert!(enq(&c, mac(2), 0));
        assert!(!enq(&c, mac(1), 3));

        assert_eq!(c.drops(), 2);
        assert_eq!(c.size(), 3);
        let r = c.report();
        assert_eq!(r.stations[0].drops, 2);
        assert_eq!(r.stations[1].drops, 0);
    }

    #[test]
    fn encap_failure_keeps_station_eligible() {
        init();
        let c = class(10);
        let sta = mac(1);
        c.enqueue(Frame::new(vec![0u8; 3]), sta, mac(0xa0));
        enq(&c, sta, 9);

        c.dequeue().unwrap().unwrap_err();
        assert_eq!(c.size(), 1);
        assert_eq!(c.report().encap_failures, 1);

        let f = c.dequeue().unwrap().unwrap();
        assert_eq!(f.data()[32], 9);
        assert!(c.dequeue().is_none());
    }

    #[test]
    fn deficit_accounting() {
        init();
        let c = ClassQueue::new(TrafficClassKey::new("tenant", 0), 10, 100, false);
        assert_eq!(c.deficit(), 0);
        assert!(!c.charge(150));
        assert_eq!(c.deficit(), 100);
        assert!(!c.charge(150));
        assert_eq!(c.deficit(), 200);
        assert!(c.charge(150));
        assert_eq!(c.deficit(), 50);
        c.reset_deficit();
        assert_eq!(c.deficit(), 0);
    }
}

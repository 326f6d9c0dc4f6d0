use super::{ClassId, ClassQueue, ClassReport, Scheduler, TrafficClassKey};
use crate::classify::{Classification, Classifier};
use crate::config::{check_class_params, check_dscp, SchedulerConfig};
use crate::Frame;
use color_eyre::eyre::{ensure, Report};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Consecutive pulls that dispatch nothing before the scheduler declares itself idle.
const SLEEPINESS_TRIGGER: u32 = 9;

/// Full passes over the class rotation a single pull may make. One pass hands every waiting class
/// a quantum, so a class whose quantum covers its head frame sends on the second.
const SWEEPS_PER_PULL: usize = 2;

/// Deficit Round Robin across traffic classes, round robin across the stations of each class.
///
/// Producers call [`QosScheduler::push`] concurrently; one consumer calls
/// [`QosScheduler::pull`]. Frames leave as 802.11 data frames.
///
/// # Implementation Details
/// Lock order is `drr` → `classes` → a class's own lock → a station's lock. `push` releases the
/// class lock before it takes `drr`.
pub struct QosScheduler<C> {
    classifier: C,
    cfg: SchedulerConfig,
    classes: RwLock<ClassArena>,
    drr: Mutex<DrrState>,
    idle: AtomicBool,
    wake_tx: flume::Sender<()>,
    wake_rx: flume::Receiver<()>,
    unclassified: AtomicU64,
    encap_failures: AtomicU64,
}

#[derive(Default)]
struct ClassArena {
    index: HashMap<TrafficClassKey, ClassId>,
    queues: Vec<Arc<ClassQueue>>,
}

impl ClassArena {
    fn get(&self, key: &TrafficClassKey) -> Option<(ClassId, Arc<ClassQueue>)> {
        self.index
            .get(key)
            .map(|&cid| (cid, Arc::clone(&self.queues[cid.0])))
    }

    fn insert(&mut self, q: ClassQueue) -> (ClassId, Arc<ClassQueue>) {
        let cid = ClassId(self.queues.len());
        let q = Arc::new(q);
        self.index.insert(q.key().clone(), cid);
        self.queues.push(Arc::clone(&q));
        (cid, q)
    }
}

#[derive(Default)]
struct DrrState {
    // classes with frames queued, each at most once.
    rotation: VecDeque<ClassId>,
    // read-ahead: a class's next frame, dequeued but still waiting for enough deficit.
    heads: Vec<Option<Frame>>,
    sleepiness: u32,
}

impl DrrState {
    fn head(&mut self, cid: ClassId) -> &mut Option<Frame> {
        if self.heads.len() <= cid.0 {
            self.heads.resize_with(cid.0 + 1, || None);
        }

        &mut self.heads[cid.0]
    }
}

impl<C: Classifier> QosScheduler<C> {
    pub fn new(cfg: SchedulerConfig, classifier: C) -> Result<Self, Report> {
        cfg.validate()?;
        let (wake_tx, wake_rx) = flume::bounded(1);
        Ok(Self {
            classifier,
            cfg,
            classes: Default::default(),
            drr: Default::default(),
            idle: AtomicBool::new(true),
            wake_tx,
            wake_rx,
            unclassified: AtomicU64::new(0),
            encap_failures: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    fn log_new_class(&self, key: &TrafficClassKey, quantum: usize, capacity: usize) {
        if self.cfg.debug {
            info!(class = %key, ?quantum, ?capacity, "creating new traffic class");
        } else {
            debug!(class = %key, ?quantum, ?capacity, "creating new traffic class");
        }
    }

    // Locate or create, with default parameters, the queue for `key`.
    fn class_queue(&self, key: &TrafficClassKey) -> (ClassId, Arc<ClassQueue>) {
        if let Some(found) = self.classes.read().get(key) {
            return found;
        }

        let mut arena = self.classes.write();
        if let Some(found) = arena.get(key) {
            return found;
        }

        self.log_new_class(key, self.cfg.default_quantum, self.cfg.capacity);
        arena.insert(ClassQueue::new(
            key.clone(),
            self.cfg.capacity,
            self.cfg.default_quantum,
            self.cfg.debug,
        ))
    }

    fn class(&self, cid: ClassId) -> Arc<ClassQueue> {
        Arc::clone(&self.classes.read().queues[cid.0])
    }

    /// Create the traffic class `key` with `quantum` and the default capacity ahead of its
    /// traffic.
    ///
    /// If the class already exists this does nothing and returns `Ok(false)`; its quantum and
    /// queued frames are left as they are.
    pub fn provision(&self, key: TrafficClassKey, quantum: usize) -> Result<bool, Report> {
        self.provision_with(key, quantum, self.cfg.capacity)
    }

    /// Like [`QosScheduler::provision`], with a per-station `capacity` for this class.
    pub fn provision_with(
        &self,
        key: TrafficClassKey,
        quantum: usize,
        capacity: usize,
    ) -> Result<bool, Report> {
        check_class_params(capacity, quantum)?;
        check_dscp(key.dscp)?;

        let mut arena = self.classes.write();
        if let Some((cid, q)) = arena.get(&key) {
            debug!(class = %key, ?cid, quantum = q.quantum(), "class already exists, leaving it untouched");
            return Ok(false);
        }

        self.log_new_class(&key, quantum, capacity);
        arena.insert(ClassQueue::new(key, capacity, quantum, self.cfg.debug));
        Ok(true)
    }

    /// Classify and enqueue a wired frame.
    ///
    /// Returns false if the frame was discarded: it could not be classified, or its station
    /// queue is full. Both are counted.
    pub fn push(&self, f: Frame) -> bool {
        let Classification { class, station, ap } = match self.classifier.classify(&f) {
            Ok(c) => c,
            Err(e) => {
                self.unclassified.fetch_add(1, Ordering::Relaxed);
                debug!(err = %format!("{:#}", e), "could not classify frame");
                return false;
            }
        };

        let (cid, queue) = self.class_queue(&class);
        let len = f.len();
        if !queue.enqueue(f, station, ap) {
            trace!(%class, %station, ?len, "dropping frame");
            return false;
        }

        let mut st = self.drr.lock();
        if !st.rotation.contains(&cid) {
            st.rotation.push_back(cid);
        }

        st.sleepiness = 0;
        if self.idle.swap(false, Ordering::SeqCst) {
            trace!("scheduler awake");
            // a full channel means a wakeup is already pending.
            let _ = self.wake_tx.try_send(());
        }

        true
    }

    fn raise_idle(&self, st: &mut DrrState) {
        st.sleepiness = 0;
        if !self.idle.swap(true, Ordering::SeqCst) {
            trace!("scheduler idle");
        }
    }

    /// Dequeue the next 802.11 frame.
    ///
    /// `None` means nothing was dispatchable on this call: every queue is empty, each class
    /// examined was still waiting for credit, or the selected frame failed encapsulation and was
    /// destroyed.
    pub fn pull(&self) -> Option<Frame> {
        let mut guard = self.drr.lock();
        let st = &mut *guard;

        let mut candidates = SWEEPS_PER_PULL * st.rotation.len();
        while candidates > 0 {
            candidates -= 1;
            let cid = match st.rotation.front() {
                Some(&cid) => cid,
                None => break,
            };

            let class = self.class(cid);
            let head = match st.head(cid).take() {
                Some(f) => f,
                None => match class.dequeue() {
                    Some(Ok(f)) => f,
                    None => {
                        trace!(class = %class.key(), "class drained");
                        st.rotation.pop_front();
                        class.reset_deficit();
                        continue;
                    }
                    Some(Err(e)) => {
                        self.encap_failures.fetch_add(1, Ordering::Relaxed);
                        debug!(class = %class.key(), err = %e, "dropping frame");
                        if class.is_empty() {
                            st.rotation.pop_front();
                            class.reset_deficit();
                            if st.rotation.is_empty() {
                                self.raise_idle(st);
                            }
                        }

                        return None;
                    }
                },
            };

            // check for credit *before* granting a quantum, and let a credited class keep the
            // front of the rotation, otherwise bandwidth shares stop following quanta.
            if class.charge(head.len()) {
                if class.is_empty() {
                    st.rotation.pop_front();
                    class.reset_deficit();
                    if st.rotation.is_empty() {
                        self.raise_idle(st);
                    }
                }

                st.sleepiness = 0;
                if self.cfg.debug {
                    debug!(class = %class.key(), len = head.len(), deficit = class.deficit(), "dispatching frame");
                }

                return Some(head);
            }

            *st.head(cid) = Some(head);
            st.rotation.rotate_left(1);
        }

        if st.rotation.is_empty() {
            self.raise_idle(st);
        } else {
            st.sleepiness += 1;
            if st.sleepiness >= SLEEPINESS_TRIGGER {
                debug!(classes = st.rotation.len(), "no class has credit, going idle");
                self.raise_idle(st);
            }
        }

        None
    }

    /// Frames buffered, including those held in read-ahead.
    pub fn pending_frames(&self) -> usize {
        let read_ahead = self.drr.lock().heads.iter().filter(|h| h.is_some()).count();
        let queued: usize = self.classes.read().queues.iter().map(|c| c.size()).sum();
        read_ahead + queued
    }

    pub fn unclassified(&self) -> u64 {
        self.unclassified.load(Ordering::Relaxed)
    }

    pub fn encap_failures(&self) -> u64 {
        self.encap_failures.load(Ordering::Relaxed)
    }

    /// Snapshot every class and station queue. Not meant for the data path.
    pub fn report(&self) -> SchedulerReport {
        let (rotation, read_ahead) = {
            let st = self.drr.lock();
            (
                st.rotation.iter().copied().collect::<Vec<_>>(),
                st.heads.iter().filter(|h| h.is_some()).count(),
            )
        };

        let arena = self.classes.read();
        SchedulerReport {
            idle: self.idle.load(Ordering::SeqCst),
            unclassified: self.unclassified(),
            encap_failures: self.encap_failures(),
            read_ahead,
            rotation: rotation
                .into_iter()
                .map(|cid| arena.queues[cid.0].key().clone())
                .collect(),
            classes: arena.queues.iter().map(|c| c.report()).collect(),
        }
    }
}

impl<C: Classifier> Scheduler for QosScheduler<C> {
    fn enq(&self, f: Frame) -> Result<(), Report> {
        ensure!(self.push(f), "Dropping frame");
        Ok(())
    }

    fn deq(&self) -> Result<Option<Frame>, Report> {
        Ok(self.pull())
    }

    fn len_frames(&self) -> usize {
        self.pending_frames()
    }

    fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    fn wake_signal(&self) -> flume::Receiver<()> {
        self.wake_rx.clone()
    }

    fn dbg(&self) {
        for line in self.report().to_string().lines() {
            info!("{}", line);
        }
    }
}

impl<C> std::fmt::Debug for QosScheduler<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("QosScheduler")
            .field("cfg", &self.cfg)
            .field("classes", &self.classes.read().queues)
            .field("idle", &self.idle.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Snapshot of the scheduler, see [`QosScheduler::report`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerReport {
    pub idle: bool,
    pub unclassified: u64,
    pub encap_failures: u64,
    /// Frames dequeued from their class and waiting for credit.
    pub read_ahead: usize,
    /// Classes with frames queued, in service order.
    pub rotation: Vec<TrafficClassKey>,
    pub classes: Vec<ClassReport>,
}

impl std::fmt::Display for SchedulerReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "idle: {} unclassified: {} encap_failures: {} read_ahead: {}",
            self.idle, self.unclassified, self.encap_failures, self.read_ahead
        )?;
        for c in &self.classes {
            write!(f, "{}", c)?;
        }

        Ok(())
    }
}

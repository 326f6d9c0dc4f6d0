use super::Scheduler;
use crate::classify::{Classification, Classifier};
use crate::encap::wifi_encap;
use crate::{Error, Frame};
use color_eyre::eyre::Report;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, trace};

/// A single drop-tail queue shared by every class and station.
///
/// Classification only picks the radio addresses; there is no isolation between tenants. Useful
/// as a baseline against [`super::QosScheduler`].
pub struct Fifo<C> {
    classifier: C,
    limit_frames: usize,
    inner: Mutex<VecDeque<(Frame, Classification)>>,
    idle: AtomicBool,
    wake_tx: flume::Sender<()>,
    wake_rx: flume::Receiver<()>,
    drops: AtomicU64,
    encap_failures: AtomicU64,
}

impl<C: Classifier> Fifo<C> {
    pub fn new(limit_frames: usize, classifier: C) -> Self {
        let (wake_tx, wake_rx) = flume::bounded(1);
        Self {
            classifier,
            limit_frames,
            inner: Default::default(),
            idle: AtomicBool::new(true),
            wake_tx,
            wake_rx,
            drops: AtomicU64::new(0),
            encap_failures: AtomicU64::new(0),
        }
    }

    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

impl<C: Classifier> Scheduler for Fifo<C> {
    fn enq(&self, f: Frame) -> Result<(), Report> {
        let c = self.classifier.classify(&f)?;
        {
            let mut q = self.inner.lock();
            if q.len() >= self.limit_frames {
                self.drops.fetch_add(1, Ordering::Relaxed);
                return Err(Error::FrameDropped {
                    class: c.class,
                    station: c.station,
                }
                .into());
            }

            q.push_back((f, c));
            trace!(frames = ?q.len(), "queue size");
        }

        if self.idle.swap(false, Ordering::SeqCst) {
            let _ = self.wake_tx.try_send(());
        }

        Ok(())
    }

    fn deq(&self) -> Result<Option<Frame>, Report> {
        let mut q = self.inner.lock();
        let (f, c) = match q.pop_front() {
            Some(x) => x,
            None => {
                self.idle.store(true, Ordering::SeqCst);
                return Ok(None);
            }
        };

        if q.is_empty() {
            self.idle.store(true, Ordering::SeqCst);
        }
        drop(q);

        match wifi_encap(f, c.station, c.ap) {
            Ok(f) => Ok(Some(f)),
            Err(e) => {
                self.encap_failures.fetch_add(1, Ordering::Relaxed);
                debug!(station = %c.station, err = %e, "dropping frame");
                Ok(None)
            }
        }
    }

    fn len_frames(&self) -> usize {
        self.inner.lock().len()
    }

    fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    fn wake_signal(&self) -> flume::Receiver<()> {
        self.wake_rx.clone()
    }

    fn dbg(&self) {
        info!(
            frames = self.len_frames(),
            limit = self.limit_frames,
            drops = self.drops(),
            encap_failures = self.encap_failures.load(Ordering::Relaxed),
            "fifo"
        );
    }
}

impl<C> std::fmt::Debug for Fifo<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("Fifo")
            .field("limit_frames", &self.limit_frames)
            .field("frames", &self.inner.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod t {
    use super::Fifo;
    use crate::classify::{Lvap, LvapTable};
    use crate::encap::WifiDataHeader;
    use crate::scheduler::{Scheduler, TrafficClassKey};
    use crate::t::{init, mac, wired_frame};
    use crate::{Error, Frame, MacAddr};

    fn ra_of(f: &Frame) -> MacAddr {
        WifiDataHeader::from_slice(f.data()).unwrap().0.addr1
    }

    fn fifo(limit: usize) -> Fifo<LvapTable> {
        Fifo::new(
            limit,
            LvapTable::new((1..=2).map(|i| Lvap {
                sta: mac(i),
                bssid: mac(0xa0),
                ssid: "tenant".to_owned(),
            })),
        )
    }

    #[test]
    fn arrival_order() {
        init();
        let s = fifo(10);
        let wake = s.wake_signal();
        assert!(s.is_idle());
        for (i, sta) in [1, 2, 1, 1, 2].into_iter().enumerate() {
            s.enq(wired_frame(mac(0x77), mac(sta), 0x0800, 40, i as u8))
                .unwrap();
        }
        assert!(!s.is_idle());
        assert!(wake.try_recv().is_ok());
        assert_eq!(s.len_frames(), 5);

        let order: Vec<_> = std::iter::from_fn(|| s.deq().unwrap())
            .map(|f| (ra_of(&f), f.data()[32]))
            .collect();
        assert_eq!(
            order,
            vec![
                (mac(1), 0),
                (mac(2), 1),
                (mac(1), 2),
                (mac(1), 3),
                (mac(2), 4)
            ]
        );
        assert!(s.is_idle());
        assert!(s.is_empty());
    }

    #[test]
    fn drop_tail() {
        init();
        let s = fifo(2);
        s.enq(wired_frame(mac(0x77), mac(1), 0x0800, 40, 0)).unwrap();
        s.enq(wired_frame(mac(0x77), mac(2), 0x0800, 40, 1)).unwrap();
        let err = s
            .enq(wired_frame(mac(0x77), mac(2), 0x0800, 40, 2))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::FrameDropped { class, station })
                if *class == TrafficClassKey::new("tenant", 0) && *station == mac(2)
        ));
        assert_eq!(s.drops(), 1);

        // unknown stations are refused without counting as a drop.
        s.enq(wired_frame(mac(0x77), mac(9), 0x0800, 40, 3))
            .unwrap_err();
        assert_eq!(s.drops(), 1);
        assert_eq!(s.len_frames(), 2);
    }
}

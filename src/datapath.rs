//! Paced user-space TAP-based access point transmit path.
//!
//! Wired frames flow into the TAP device that [`Datapath`] manages, through a [`Scheduler`], and
//! out as 802.11 data frames to a Unix datagram socket standing in for the radio. That socket must
//! exist; if it does not, [`Datapath::new`] will error, but if it black-holes frames [`Datapath`]
//! will not complain.
//!
//! The transmit side emulates a zero-latency link at the given pacing rate with a token-bucket-style
//! pacer, and sleeps on the scheduler's wake signal while the scheduler is idle.

use color_eyre::eyre::{ensure, Report, WrapErr};
use std::os::unix::net::UnixDatagram;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};
use tun_tap::Iface;

use crate::encap::WifiDataHeader;
use crate::scheduler::Scheduler;
use crate::Frame;

/// How long the transmit thread waits for a wakeup while the scheduler is idle but still holds
/// frames.
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Manage pacing, scheduling (via the parameter), and forwarding frames to a Unix socket.
pub struct Datapath<S: Scheduler> {
    iface: Iface,
    out_port: OutputPort<S>,
}

impl<S: Scheduler + Send + Sync + 'static> Datapath<S> {
    /// Initialize the TAP device using the interface name `listen_iface`.
    /// We will forward frames to the Unix socket at `fwd_addr`, and pace them at the rate
    /// `tx_rate_bytes_per_sec`. If `tx_rate_bytes_per_sec` is `None`, frames are sent as fast as
    /// the scheduler releases them, so queues only build when the socket pushes back.
    pub fn new(
        listen_iface: &str,
        fwd_addr: impl AsRef<std::path::Path>,
        tx_rate_bytes_per_sec: Option<usize>,
        sch: S,
    ) -> Result<Self, Report> {
        let iface = Iface::new(listen_iface, tun_tap::Mode::Tap)
            .wrap_err("could not create TAP interface")?;
        let this = Self {
            iface,
            out_port: OutputPort::new(fwd_addr.as_ref(), tx_rate_bytes_per_sec, sch)?,
        };
        ip_link_up(this.iface.name())?;
        Ok(this)
    }

    /// Start the datapath. Only returns on error.
    #[tracing::instrument(level = "info", skip(self), err)]
    pub fn run(self) -> Result<(), Report> {
        info!(iface=?self.iface.name(), "starting");

        let sch = self.out_port.start()?;
        let mut buf = [0u8; 4096];
        loop {
            let len = self.iface.recv(&mut buf)?;
            // TAP frames carry a 4-byte flags/protocol prefix.
            if len < 4 {
                debug!(?len, "frame too small");
                continue;
            }

            if let Err(e) = sch.enq(Frame::new(buf[4..len].to_vec())) {
                trace!(err = %format!("{:#}", e), "enq error");
            }
        }
    }
}

struct Rate {
    epoch_start: u64,
    bytes: usize,
}

impl Rate {
    fn new(clk: &quanta::Clock, bytes: usize) -> Self {
        Self {
            epoch_start: clk.raw(),
            bytes,
        }
    }
}

/// Log the achieved rate every `period`, and dump scheduler state with it.
fn record_tx(
    achieved: &mut Option<Rate>,
    clk: &quanta::Clock,
    len: usize,
    period: Duration,
    q: &impl Scheduler,
) {
    match achieved {
        None => *achieved = Some(Rate::new(clk, len)),
        Some(Rate { bytes, epoch_start }) => {
            *bytes += len;
            let el = clk.delta(*epoch_start, clk.raw());
            if el > period {
                let epoch_rate_bytes_per_sec = *bytes as f64 / el.as_secs_f64();
                let achieved_rate_mbps = epoch_rate_bytes_per_sec * 8. / 1e6;
                info!(?achieved_rate_mbps, ?el, "achieved_tx_rate");
                *achieved = None;
                q.dbg();
            }
        }
    }
}

struct OutputPort<S> {
    fwd: UnixDatagram,
    tx_rate_bytes_per_sec: Option<usize>,
    queue: Arc<S>,
}

impl<S: Scheduler + Send + Sync + 'static> OutputPort<S> {
    fn new(
        out_addr: &std::path::Path,
        tx_rate_bytes_per_sec: Option<usize>,
        sch: S,
    ) -> Result<Self, Report> {
        let fwd = UnixDatagram::unbound().wrap_err("could not create unix socket")?;
        fwd.connect(out_addr)
            .wrap_err_with(|| format!("could not connect to {:?}", out_addr))?;
        Ok(Self {
            fwd,
            tx_rate_bytes_per_sec,
            queue: Arc::new(sch),
        })
    }

    /// Spawn the transmit thread and hand back the scheduler for the ingress side.
    fn start(self) -> Result<Arc<S>, Report> {
        let q = Arc::clone(&self.queue);
        let name = "apfq-tx".to_owned();
        if let Some(tx_rate_bytes_per_sec) = self.tx_rate_bytes_per_sec {
            std::thread::Builder::new()
                .name(name)
                .spawn(move || self.run(tx_rate_bytes_per_sec))?;
        } else {
            std::thread::Builder::new()
                .name(name)
                .spawn(move || self.run_no_pacing())?;
        }
        Ok(q)
    }

    fn send(&self, f: &Frame) {
        if let Ok((hdr, _)) = WifiDataHeader::from_slice(f.data()) {
            trace!(ra = %hdr.addr1, ta = %hdr.addr2, len = f.len(), "forwarding frame");
        }

        if let Err(e) = self.fwd.send(f.data()) {
            debug!(?e, "fwd error");
        }
    }

    /// Block until the scheduler has something to dispatch. Returns immediately if it is not idle.
    fn wait_for_work(&self, wake: &flume::Receiver<()>) -> Result<(), Report> {
        if !self.queue.is_idle() {
            return Ok(());
        }

        if self.queue.is_empty() {
            wake.recv().wrap_err("wake signal disconnected")?;
        } else {
            // idle with frames left: classes are starved of credit, keep pulling slowly.
            match wake.recv_timeout(IDLE_POLL) {
                Ok(()) | Err(flume::RecvTimeoutError::Timeout) => (),
                Err(e) => return Err(e).wrap_err("wake signal disconnected"),
            }
        }

        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self), err)]
    fn run_no_pacing(self) -> Result<(), Report> {
        info!("running with no pacing");
        let wake = self.queue.wake_signal();
        let clk = quanta::Clock::new();
        let mut achieved_tx_rate: Option<Rate> = None;
        loop {
            match self.queue.deq()? {
                Some(f) => {
                    record_tx(
                        &mut achieved_tx_rate,
                        &clk,
                        f.len(),
                        Duration::from_millis(100),
                        &*self.queue,
                    );
                    self.send(&f);
                }
                None => self.wait_for_work(&wake)?,
            }
        }
    }

    #[tracing::instrument(level = "info", skip(self), err)]
    fn run(self, tx_rate_bytes_per_sec: usize) -> Result<(), Report> {
        // ticker
        // the bound here does not particularly matter. if we reach it, we will accumulate tokens
        // in token_bytes and tick over bigger token "blocks" in the next send.
        let (ticker_s, ticker_r) = flume::bounded(32);
        let tx_rate_bytes_per_usec = tx_rate_bytes_per_sec as f64 / 1e6;
        info!(?tx_rate_bytes_per_sec, "pacing");
        std::thread::spawn(move || {
            // try to send tokens for ~ 1500 bytes at a time.
            let clk = quanta::Clock::new();
            let mut token_bytes = 0;
            let mut then = clk.raw();
            loop {
                while token_bytes < 1500 {
                    std::thread::sleep(Duration::from_micros(10));
                    let now = clk.raw();
                    let dur_us = clk.delta(then, now).as_micros() as f64;
                    then = now;
                    token_bytes += (dur_us * tx_rate_bytes_per_usec) as usize;
                }

                match ticker_s.try_send(token_bytes) {
                    Ok(()) => token_bytes = 0,
                    Err(flume::TrySendError::Full(_)) => (),
                    Err(flume::TrySendError::Disconnected(_)) => return,
                }
            }
        });

        let wake = self.queue.wake_signal();
        let clk = quanta::Clock::new();
        let mut achieved_tx_rate: Option<Rate> = None;
        let mut accum_tokens: isize = 0;
        loop {
            accum_tokens += ticker_r.recv().wrap_err("ticker stopped")? as isize;
            while accum_tokens > 0 {
                match self.queue.deq() {
                    Ok(Some(f)) => {
                        record_tx(
                            &mut achieved_tx_rate,
                            &clk,
                            f.len(),
                            Duration::from_millis(100),
                            &*self.queue,
                        );
                        accum_tokens -= f.len() as isize;
                        self.send(&f);
                    }
                    Ok(None) if self.queue.is_idle() => {
                        // we're not active right now, so we get rid of any token backlog to avoid
                        // bursting. Once frames come back, we will resume building up a backlog.
                        achieved_tx_rate = None;
                        accum_tokens = 0;
                        self.wait_for_work(&wake)?;
                        while ticker_r.try_recv().is_ok() {}
                    }
                    // classes still earning credit.
                    Ok(None) => (),
                    Err(e) => {
                        debug!(?e, "deq error");
                    }
                }
            }
        }
    }
}

fn ip_link_up(dev: &str) -> Result<(), Report> {
    let status = Command::new("ip")
        .args(["link", "set", "up", "dev", dev])
        .status()?;
    ensure!(status.success(), "ip link set up failed");
    Ok(())
}

//! Two-level fair-queueing frame scheduler for a wireless access point.
//!
//! Wired (Ethernet II) frames destined for associated stations are classified into traffic
//! classes (tenant SSID + DSCP), buffered per (class, station), and released to the radio transmit
//! path by a Deficit Round Robin scheduler across classes and plain round robin across the
//! stations of a class. Every frame is rewritten into an 802.11 data frame with an LLC/SNAP header
//! as it leaves its queue.
//!
//! The entry point is [`scheduler::QosScheduler`]. It needs a [`classify::Classifier`] to map a
//! frame to its traffic class and radio addresses; [`classify::LvapTable`] is one built from
//! [`config::QosConfig`].

pub mod classify;
pub mod config;
pub mod encap;
pub mod scheduler;
pub use scheduler::Scheduler;

#[cfg(all(target_os = "linux", feature = "datapath"))]
mod datapath;
#[cfg(all(target_os = "linux", feature = "datapath"))]
pub use datapath::Datapath;

use color_eyre::eyre::{ensure, Report};
use scheduler::TrafficClassKey;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("frame dropped: queue for {station} in class {class} is full")]
    FrameDropped {
        class: TrafficClassKey,
        station: MacAddr,
    },
    #[error("could not encapsulate frame")]
    Encap(#[from] encap::EncapError),
    #[error("no station matches destination {0}")]
    Unclassified(MacAddr),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// A frame buffer.
///
/// Frames enter the scheduler in wired (Ethernet II) format and leave it as 802.11 data frames.
/// The buffer is not exposed mutably outside the crate; read it with [`Frame::data`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    buf: Vec<u8>,
}

impl Frame {
    pub fn new(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

impl From<Vec<u8>> for Frame {
    fn from(buf: Vec<u8>) -> Self {
        Self::new(buf)
    }
}

/// A 48-bit link-layer address.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Group addresses have the I/G bit of the first octet set.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(a: [u8; 6]) -> Self {
        MacAddr(a)
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a, b, c, d, e, g
        )
    }
}

impl std::fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::str::FromStr for MacAddr {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = s.split([':', '-']).collect();
        ensure!(parts.len() == 6, "mac address must be aa:bb:cc:dd:ee:ff");
        let mut addr = [0u8; 6];
        for (o, p) in addr.iter_mut().zip(parts) {
            ensure!(p.len() == 2, "mac address octet {:?} must be two hex digits", p);
            *o = u8::from_str_radix(p, 16)?;
        }

        Ok(MacAddr(addr))
    }
}

#[cfg(test)]
pub(crate) mod t {
    use crate::{Frame, MacAddr};

    pub(crate) fn init() {
        use std::sync::Once;
        static INIT: Once = Once::new();

        INIT.call_once(|| {
            tracing_subscriber::fmt::init();
            color_eyre::install().unwrap();
        })
    }

    /// A wired frame of `payload_len` bytes after the Ethernet header. The first payload byte
    /// carries `tag` so tests can tell frames apart after encapsulation.
    pub(crate) fn wired_frame(
        src: MacAddr,
        dst: MacAddr,
        ether_type: u16,
        payload_len: usize,
        tag: u8,
    ) -> Frame {
        let mut buf = Vec::with_capacity(14 + payload_len);
        etherparse::Ethernet2Header {
            destination: dst.0,
            source: src.0,
            ether_type,
        }
        .write(&mut buf)
        .unwrap();
        buf.resize(14 + payload_len, 0);
        if payload_len > 0 {
            buf[14] = tag;
        }

        Frame::new(buf)
    }

    pub(crate) fn mac(last: u8) -> MacAddr {
        MacAddr([0x02, 0, 0, 0, 0, last])
    }

    #[test]
    fn parse_mac() {
        init();

        let m: MacAddr = "00:11:22:aa:BB:cc".parse().unwrap();
        assert_eq!(m, MacAddr([0x00, 0x11, 0x22, 0xaa, 0xbb, 0xcc]));
        assert_eq!(m.to_string(), "00:11:22:aa:bb:cc");

        let m: MacAddr = "ff-ff-ff-ff-ff-ff".parse().unwrap();
        assert_eq!(m, MacAddr::BROADCAST);
        assert!(m.is_multicast());

        "00:11:22:33:44".parse::<MacAddr>().unwrap_err();
        "00:11:22:33:44:5".parse::<MacAddr>().unwrap_err();
        "00:11:22:33:44:zz".parse::<MacAddr>().unwrap_err();
    }
}

//! Mapping wired frames to a traffic class and the radio addresses of their destination.

use crate::scheduler::TrafficClassKey;
use crate::{Error, Frame, MacAddr};
use color_eyre::eyre::{eyre, Report};
use etherparse::{Ethernet2Header, IpHeader, PacketHeaders};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Where a frame goes: its traffic class, the station that receives it (RA), and the access point
/// address it is sent from (TA).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    pub class: TrafficClassKey,
    pub station: MacAddr,
    pub ap: MacAddr,
}

pub trait Classifier: Send + Sync {
    /// Errors if the frame's destination cannot be resolved; the caller discards the frame.
    fn classify(&self, f: &Frame) -> Result<Classification, Report>;
}

impl<F> Classifier for F
where
    F: Fn(&Frame) -> Result<Classification, Report> + Send + Sync,
{
    fn classify(&self, f: &Frame) -> Result<Classification, Report> {
        self(f)
    }
}

/// A light virtual access point: the BSSID an access point presents to one station, under a
/// tenant's SSID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lvap {
    pub sta: MacAddr,
    pub bssid: MacAddr,
    pub ssid: String,
}

/// Classify frames by destination station and IP DSCP.
///
/// The station's LVAP gives the SSID half of the traffic class and the transmitter address.
/// Frames that do not carry IP are classified with DSCP 0.
#[derive(Debug, Default)]
pub struct LvapTable {
    lvaps: RwLock<HashMap<MacAddr, Lvap>>,
}

impl LvapTable {
    pub fn new(lvaps: impl IntoIterator<Item = Lvap>) -> Self {
        Self {
            lvaps: RwLock::new(lvaps.into_iter().map(|l| (l.sta, l)).collect()),
        }
    }

    /// Add or replace the LVAP for `lvap.sta`, returning the previous one.
    pub fn insert(&self, lvap: Lvap) -> Option<Lvap> {
        self.lvaps.write().insert(lvap.sta, lvap)
    }

    pub fn remove(&self, sta: &MacAddr) -> Option<Lvap> {
        self.lvaps.write().remove(sta)
    }

    pub fn len(&self) -> usize {
        self.lvaps.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lvaps.read().is_empty()
    }
}

fn dscp(buf: &[u8]) -> u8 {
    match PacketHeaders::from_ethernet_slice(buf) {
        Ok(PacketHeaders {
            ip: Some(IpHeader::Version4(h, _)),
            ..
        }) => h.differentiated_services_code_point,
        Ok(PacketHeaders {
            ip: Some(IpHeader::Version6(h, _)),
            ..
        }) => h.traffic_class >> 2,
        _ => 0,
    }
}

impl Classifier for LvapTable {
    fn classify(&self, f: &Frame) -> Result<Classification, Report> {
        let (eth, _) = Ethernet2Header::from_slice(f.data())
            .map_err(|e| eyre!("could not parse ethernet header: {:?}", e))?;
        let dst = MacAddr(eth.destination);
        let lvaps = self.lvaps.read();
        let lvap = lvaps.get(&dst).ok_or(Error::Unclassified(dst))?;
        Ok(Classification {
            class: TrafficClassKey::new(lvap.ssid.clone(), dscp(f.data())),
            station: lvap.sta,
            ap: lvap.bssid,
        })
    }
}

//! Ethernet II to 802.11 data frame encapsulation.
//!
//! The wired header (destination, source, ethertype) is replaced by an 802.11 data header sent
//! from the distribution system, followed by an LLC/SNAP header that carries the original
//! ethertype:
//!
//! ```text
//! | fc (2) | dur (2) | addr1 = RA | addr2 = TA | addr3 = SA | seq (2) | AA AA 03 00 00 00 | type (2) | payload
//! ```

use crate::{Frame, MacAddr};
use etherparse::Ethernet2Header;

pub const ETHER_HDR_LEN: usize = 14;
pub const WIFI_HDR_LEN: usize = 24;
pub const LLC_SNAP_LEN: usize = 8;
/// Largest MSDU (LLC/SNAP + payload) a non-aggregated 802.11 data frame may carry.
pub const MAX_MSDU_LEN: usize = 2304;

/// Bytes an encapsulated frame gains over its wired form.
pub const ENCAP_OVERHEAD: usize = WIFI_HDR_LEN + LLC_SNAP_LEN - ETHER_HDR_LEN;

pub const LLC_SNAP_PREFIX: [u8; 6] = [0xaa, 0xaa, 0x03, 0x00, 0x00, 0x00];

const FC0_VERSION_0: u8 = 0x00;
const FC0_TYPE_MASK: u8 = 0x0c;
const FC0_TYPE_DATA: u8 = 0x08;
const FC1_DIR_MASK: u8 = 0x03;
const FC1_DIR_FROMDS: u8 = 0x02;

#[derive(Debug, thiserror::Error)]
pub enum EncapError {
    #[error("frame of {len} bytes is too short for its header")]
    Truncated { len: usize },
    #[error("msdu of {len} bytes exceeds the 802.11 maximum of 2304 bytes")]
    Oversize { len: usize },
    #[error("could not grow frame buffer")]
    Alloc(#[from] std::collections::TryReserveError),
}

/// The 24-byte header of an 802.11 data frame without QoS control.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WifiDataHeader {
    pub frame_control: [u8; 2],
    pub duration: u16,
    pub addr1: MacAddr,
    pub addr2: MacAddr,
    pub addr3: MacAddr,
    pub seq_ctrl: u16,
}

impl WifiDataHeader {
    /// Header for a data frame leaving the access point towards station `ra`.
    pub fn from_ds(ra: MacAddr, ta: MacAddr, sa: MacAddr) -> Self {
        Self {
            frame_control: [FC0_VERSION_0 | FC0_TYPE_DATA, FC1_DIR_FROMDS & FC1_DIR_MASK],
            duration: 0,
            addr1: ra,
            addr2: ta,
            addr3: sa,
            seq_ctrl: 0,
        }
    }

    pub fn is_data(&self) -> bool {
        self.frame_control[0] & FC0_TYPE_MASK == FC0_TYPE_DATA
    }

    pub fn is_from_ds(&self) -> bool {
        self.frame_control[1] & FC1_DIR_MASK == FC1_DIR_FROMDS
    }

    pub fn from_slice(buf: &[u8]) -> Result<(Self, &[u8]), EncapError> {
        if buf.len() < WIFI_HDR_LEN {
            return Err(EncapError::Truncated { len: buf.len() });
        }

        let addr = |off: usize| {
            let mut a = [0u8; 6];
            a.copy_from_slice(&buf[off..off + 6]);
            MacAddr(a)
        };

        let hdr = Self {
            frame_control: [buf[0], buf[1]],
            duration: u16::from_le_bytes([buf[2], buf[3]]),
            addr1: addr(4),
            addr2: addr(10),
            addr3: addr(16),
            seq_ctrl: u16::from_le_bytes([buf[22], buf[23]]),
        };

        Ok((hdr, &buf[WIFI_HDR_LEN..]))
    }

    /// Serialize into the first [`WIFI_HDR_LEN`] bytes of `out`.
    pub fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.frame_control);
        out[2..4].copy_from_slice(&self.duration.to_le_bytes());
        out[4..10].copy_from_slice(&self.addr1.0);
        out[10..16].copy_from_slice(&self.addr2.0);
        out[16..22].copy_from_slice(&self.addr3.0);
        out[22..24].copy_from_slice(&self.seq_ctrl.to_le_bytes());
    }
}

/// Split an 802.11 frame body into the ethertype carried by its LLC/SNAP header and the payload.
pub fn split_llc_snap(body: &[u8]) -> Option<(u16, &[u8])> {
    if body.len() < LLC_SNAP_LEN || body[..6] != LLC_SNAP_PREFIX {
        return None;
    }

    Some((u16::from_be_bytes([body[6], body[7]]), &body[LLC_SNAP_LEN..]))
}

/// Rewrite a wired frame into an 802.11 data frame from access point `ta` to station `ra`.
///
/// The original source address becomes addr3. The buffer is grown in place with a fallible
/// reservation; on any error the frame is consumed and nothing is returned.
pub fn wifi_encap(frame: Frame, ra: MacAddr, ta: MacAddr) -> Result<Frame, EncapError> {
    let mut buf = frame.into_vec();
    let len = buf.len();
    let (eth, _) =
        Ethernet2Header::from_slice(&buf).map_err(|_| EncapError::Truncated { len })?;

    let msdu_len = len - ETHER_HDR_LEN + LLC_SNAP_LEN;
    if msdu_len > MAX_MSDU_LEN {
        return Err(EncapError::Oversize { len: msdu_len });
    }

    buf.try_reserve_exact(ENCAP_OVERHEAD)?;

    let mut hdr = [0u8; WIFI_HDR_LEN + LLC_SNAP_LEN];
    WifiDataHeader::from_ds(ra, ta, MacAddr(eth.source)).write(&mut hdr[..WIFI_HDR_LEN]);
    hdr[WIFI_HDR_LEN..WIFI_HDR_LEN + 6].copy_from_slice(&LLC_SNAP_PREFIX);
    hdr[WIFI_HDR_LEN + 6..].copy_from_slice(&eth.ether_type.to_be_bytes());

    // capacity was reserved above, so this cannot reallocate.
    buf.splice(0..ETHER_HDR_LEN, hdr);
    Ok(Frame::new(buf))
}

#[cfg(test)]
mod t {
    use super::*;
    use crate::t::{init, mac, wired_frame};

    #[test]
    fn encap_rewrites_headers() {
        init();
        let sta = mac(1);
        let ap = mac(0xa0);
        let src = MacAddr([0x00, 0x16, 0x3e, 0x01, 0x02, 0x03]);
        let wired = wired_frame(src, sta, 0x0800, 100, 0x5a);
        let payload = wired.data()[ETHER_HDR_LEN..].to_vec();

        let f = wifi_encap(wired, sta, ap).unwrap();
        assert_eq!(f.len(), WIFI_HDR_LEN + LLC_SNAP_LEN + 100);

        let (hdr, body) = WifiDataHeader::from_slice(f.data()).unwrap();
        assert!(hdr.is_data());
        assert!(hdr.is_from_ds());
        assert_eq!(hdr.frame_control, [0x08, 0x02]);
        assert_eq!(hdr.addr1, sta);
        assert_eq!(hdr.addr2, ap);
        assert_eq!(hdr.addr3, src);

        let (ether_type, rest) = split_llc_snap(body).unwrap();
        assert_eq!(ether_type, 0x0800);
        assert_eq!(rest, &payload[..]);
        assert_eq!(&body[..6], &LLC_SNAP_PREFIX);
    }

    #[test]
    fn encap_keeps_ethertype() {
        init();
        let f = wifi_encap(wired_frame(mac(9), mac(1), 0x86dd, 40, 0), mac(1), mac(2)).unwrap();
        let (_, body) = WifiDataHeader::from_slice(f.data()).unwrap();
        assert_eq!(&body[6..8], &[0x86, 0xdd]);

        // header-only frame: nothing but the bridging header after encapsulation.
        let f = wifi_encap(wired_frame(mac(9), mac(1), 0x0806, 0, 0), mac(1), mac(2)).unwrap();
        assert_eq!(f.len(), WIFI_HDR_LEN + LLC_SNAP_LEN);
    }

    #[test]
    fn encap_rejects_truncated() {
        init();
        let e = wifi_encap(Frame::new(vec![0u8; 13]), mac(1), mac(2)).unwrap_err();
        assert!(matches!(e, EncapError::Truncated { len: 13 }), "{:?}", e);
    }

    #[test]
    fn encap_rejects_oversize() {
        init();
        let max_payload = MAX_MSDU_LEN - LLC_SNAP_LEN;
        wifi_encap(wired_frame(mac(9), mac(1), 0x0800, max_payload, 0), mac(1), mac(2)).unwrap();
        let e = wifi_encap(
            wired_frame(mac(9), mac(1), 0x0800, max_payload + 1, 0),
            mac(1),
            mac(2),
        )
        .unwrap_err();
        assert!(matches!(e, EncapError::Oversize { len } if len == MAX_MSDU_LEN + 1));
    }
}

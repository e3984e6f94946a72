//! DHCP Unique Identifier handling (RFC 3315 section 9).
//!
//! The client DUID is generated once, persisted as a hex string in a
//! well-known file and reused across restarts so servers keep recognizing
//! the client.

use common::{Error, Result};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// DUID type code for link-layer address plus time (RFC 3315 section 9.2)
const DUID_TYPE_LLT: u16 = 1;

/// DUID type code for link-layer address (RFC 3315 section 9.4)
const DUID_TYPE_LL: u16 = 3;

/// Hardware type for Ethernet (RFC 826)
pub const HWTYPE_ETHERNET: u16 = 1;

/// Seconds between the Unix epoch and the DUID-LLT epoch (2000-01-01 UTC)
const DUID_TIME_EPOCH: u64 = 946_684_800;

/// Longest DUID the protocol allows (RFC 3315 section 9.1)
const DUID_MAX_LEN: usize = 128;

/// Which DUID flavour to generate when none is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuidKind {
    LinkLayerTime,
    LinkLayer,
}

/// An opaque DHCP Unique Identifier.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Duid(Vec<u8>);

impl Duid {
    /// Wrap raw DUID bytes. Rejects empty and oversized identifiers.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() || bytes.len() > DUID_MAX_LEN {
            return Err(Error::duid(format!("invalid DUID length {}", bytes.len())));
        }
        Ok(Duid(bytes.to_vec()))
    }

    /// Build a DUID-LLT from a link-layer address and the current time.
    pub fn new_llt(hwtype: u16, hwaddr: &[u8]) -> Result<Self> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::duid(e))?;
        let duid_time = (now.as_secs().saturating_sub(DUID_TIME_EPOCH) & 0xffff_ffff) as u32;
        Self::new_llt_at(hwtype, hwaddr, duid_time)
    }

    /// Build a DUID-LLT with an explicit timestamp (seconds since 2000-01-01).
    pub fn new_llt_at(hwtype: u16, hwaddr: &[u8], duid_time: u32) -> Result<Self> {
        if hwaddr.is_empty() {
            return Err(Error::duid("empty link-layer address"));
        }
        let mut bytes = Vec::with_capacity(8 + hwaddr.len());
        bytes.extend_from_slice(&DUID_TYPE_LLT.to_be_bytes());
        bytes.extend_from_slice(&hwtype.to_be_bytes());
        bytes.extend_from_slice(&duid_time.to_be_bytes());
        bytes.extend_from_slice(hwaddr);
        Ok(Duid(bytes))
    }

    /// Build a DUID-LL from a link-layer address.
    pub fn new_ll(hwtype: u16, hwaddr: &[u8]) -> Result<Self> {
        if hwaddr.is_empty() {
            return Err(Error::duid("empty link-layer address"));
        }
        let mut bytes = Vec::with_capacity(4 + hwaddr.len());
        bytes.extend_from_slice(&DUID_TYPE_LL.to_be_bytes());
        bytes.extend_from_slice(&hwtype.to_be_bytes());
        bytes.extend_from_slice(hwaddr);
        Ok(Duid(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render as lowercase colon-free hex, the on-disk format.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(self.0.len() * 2);
        for byte in &self.0 {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }

    /// Parse the on-disk hex format.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.trim();
        if hex.is_empty() || hex.len() % 2 != 0 {
            return Err(Error::duid("malformed DUID hex string"));
        }
        let mut bytes = Vec::with_capacity(hex.len() / 2);
        for chunk in hex.as_bytes().chunks(2) {
            let hi = (chunk[0] as char)
                .to_digit(16)
                .ok_or_else(|| Error::duid("malformed DUID hex string"))?;
            let lo = (chunk[1] as char)
                .to_digit(16)
                .ok_or_else(|| Error::duid("malformed DUID hex string"))?;
            bytes.push(((hi << 4) | lo) as u8);
        }
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for Duid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Duid({})", self.to_hex())
    }
}

impl fmt::Display for Duid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Load the client DUID from `path`, generating and persisting one when the
/// file does not exist.
///
/// Generation failure or an unwritable DUID file is fatal for device
/// creation; a corrupt file is replaced with a fresh identifier.
pub fn load_or_generate(path: &Path, kind: DuidKind, hwaddr: &[u8]) -> Result<Duid> {
    match fs::read_to_string(path) {
        Ok(contents) => match Duid::from_hex(&contents) {
            Ok(duid) => return Ok(duid),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Replacing corrupt DUID file");
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let duid = match kind {
        DuidKind::LinkLayerTime => Duid::new_llt(HWTYPE_ETHERNET, hwaddr)?,
        DuidKind::LinkLayer => Duid::new_ll(HWTYPE_ETHERNET, hwaddr)?,
    };
    store(path, &duid)?;
    tracing::info!(path = %path.display(), duid = %duid, "Generated new client DUID");
    Ok(duid)
}

/// Atomically persist the DUID: write a sibling temp file, then rename.
fn store(path: &Path, duid: &Duid) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, duid.to_hex())?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llt_layout() {
        let mac = [0x02, 0x00, 0x5e, 0x10, 0x20, 0x30];
        let duid = Duid::new_llt_at(HWTYPE_ETHERNET, &mac, 0x01020304).unwrap();
        let bytes = duid.as_bytes();
        assert_eq!(&bytes[0..2], &[0x00, 0x01]); // type LLT
        assert_eq!(&bytes[2..4], &[0x00, 0x01]); // ethernet
        assert_eq!(&bytes[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[8..], &mac);
    }

    #[test]
    fn test_ll_layout() {
        let mac = [0x02, 0x00, 0x5e, 0x10, 0x20, 0x30];
        let duid = Duid::new_ll(HWTYPE_ETHERNET, &mac).unwrap();
        let bytes = duid.as_bytes();
        assert_eq!(&bytes[0..2], &[0x00, 0x03]); // type LL
        assert_eq!(&bytes[2..4], &[0x00, 0x01]);
        assert_eq!(&bytes[4..], &mac);
    }

    #[test]
    fn test_hex_round_trip() {
        let duid = Duid::from_bytes(&[0x00, 0x03, 0x00, 0x01, 0xaa, 0xbb]).unwrap();
        assert_eq!(duid.to_hex(), "00030001aabb");
        assert_eq!(Duid::from_hex("00030001aabb").unwrap(), duid);
        assert_eq!(Duid::from_hex(" 00030001aabb\n").unwrap(), duid);
    }

    #[test]
    fn test_hex_rejects_garbage() {
        assert!(Duid::from_hex("").is_err());
        assert!(Duid::from_hex("abc").is_err());
        assert!(Duid::from_hex("zz00").is_err());
    }

    #[test]
    fn test_empty_hwaddr_rejected() {
        assert!(Duid::new_ll(HWTYPE_ETHERNET, &[]).is_err());
        assert!(Duid::new_llt_at(HWTYPE_ETHERNET, &[], 0).is_err());
    }

    #[test]
    fn test_load_or_generate_persists() {
        let dir = std::env::temp_dir().join(format!("duid-test-{}", std::process::id()));
        let path = dir.join("duid");
        let mac = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];

        let first = load_or_generate(&path, DuidKind::LinkLayer, &mac).unwrap();
        let second = load_or_generate(&path, DuidKind::LinkLayer, &mac).unwrap();
        assert_eq!(first, second);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}

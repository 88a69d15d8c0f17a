use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Bluetooth device address, stored little-endian as received from the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

#[derive(Debug, Error)]
#[error("Invalid Bluetooth address: {0}")]
pub struct BdAddrParseError(String);

impl FromStr for BdAddr {
    type Err = BdAddrParseError;

    /// Parses the colon-separated, most significant byte first form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(BdAddrParseError(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            let mut octet = [0u8; 1];
            hex::decode_to_slice(part, &mut octet).map_err(|_| BdAddrParseError(s.to_string()))?;
            bytes[5 - i] = octet[0];
        }
        Ok(Self { bytes })
    }
}

/// Physical transport a device is reached over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transport {
    Classic,
    Le,
}

impl Transport {
    /// Tag used in per-device file names
    pub fn tag(&self) -> &'static str {
        match self {
            Transport::Classic => "CLASSIC",
            Transport::Le => "LE",
        }
    }
}

/// Identity of a remote device. Classic and LE links to the same address are
/// distinct devices as far as the GATT client is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIdentity {
    pub address: BdAddr,
    pub transport: Transport,
}

impl DeviceIdentity {
    pub fn new(address: BdAddr, transport: Transport) -> Self {
        Self { address, transport }
    }

    pub fn le(address: BdAddr) -> Self {
        Self::new(address, Transport::Le)
    }

    pub fn classic(address: BdAddr) -> Self {
        Self::new(address, Transport::Classic)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.address, self.transport.tag())
    }
}

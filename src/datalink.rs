//! BACnet/IP Virtual Link Layer
//!
//! Frame-level decoding for BACnet/IP (ASHRAE 135 Annex J). Every monitored
//! datagram starts with the 4-byte BVLL header: the `0x81` B/IP type octet,
//! a function octet and a 16-bit total length that must match the datagram.
//!
//! The monitor only observes traffic, so this module decodes and never
//! assembles frames. Functions that wrap an NPDU expose their payload for
//! the next pipeline stage; foreign-device bookkeeping functions carry the
//! registration TTL or table address instead.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// BACnet/IP well-known port number (0xBAC0)
pub const BACNET_IP_PORT: u16 = 47808;

/// B/IP type octet carried by every BVLL frame
pub const BVLL_TYPE_BACNET_IP: u8 = 0x81;

/// Result type for link-layer operations
pub type Result<T> = std::result::Result<T, DataLinkError>;

/// Errors that can occur while decoding BVLL frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataLinkError {
    /// First octet is not the B/IP type
    NotBvll,
    /// Function octet outside the monitored table
    UnknownFunction(u8),
    /// Structurally invalid frame
    InvalidFrame(String),
}

impl fmt::Display for DataLinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataLinkError::NotBvll => write!(f, "not a BVLL frame"),
            DataLinkError::UnknownFunction(function) => {
                write!(f, "unknown BVLL function: {:#04x}", function)
            }
            DataLinkError::InvalidFrame(msg) => write!(f, "invalid BVLL frame: {}", msg),
        }
    }
}

impl std::error::Error for DataLinkError {}

/// BVLL function table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BvllFunction {
    OriginalUnicastNpdu = 0x00,
    OriginalBroadcastNpdu = 0x01,
    ForwardedNpdu = 0x02,
    RegisterForeignDevice = 0x03,
    DeleteForeignDeviceTableEntry = 0x04,
    DistributeBroadcastToNetwork = 0x05,
}

impl BvllFunction {
    /// PDU class name used in family keys
    pub fn class_name(&self) -> &'static str {
        match self {
            BvllFunction::OriginalUnicastNpdu => "OriginalUnicastNPDU",
            BvllFunction::OriginalBroadcastNpdu => "OriginalBroadcastNPDU",
            BvllFunction::ForwardedNpdu => "ForwardedNPDU",
            BvllFunction::RegisterForeignDevice => "RegisterForeignDevice",
            BvllFunction::DeleteForeignDeviceTableEntry => "DeleteForeignDeviceTableEntry",
            BvllFunction::DistributeBroadcastToNetwork => "DistributeBroadcastToNetwork",
        }
    }

    /// Whether frames with this function wrap an NPDU payload
    pub fn carries_npdu(&self) -> bool {
        !matches!(
            self,
            BvllFunction::RegisterForeignDevice | BvllFunction::DeleteForeignDeviceTableEntry
        )
    }
}

impl TryFrom<u8> for BvllFunction {
    type Error = DataLinkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::OriginalUnicastNpdu),
            0x01 => Ok(Self::OriginalBroadcastNpdu),
            0x02 => Ok(Self::ForwardedNpdu),
            0x03 => Ok(Self::RegisterForeignDevice),
            0x04 => Ok(Self::DeleteForeignDeviceTableEntry),
            0x05 => Ok(Self::DistributeBroadcastToNetwork),
            _ => Err(DataLinkError::UnknownFunction(value)),
        }
    }
}

/// BVLL header structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BvllHeader {
    /// BVLL function
    pub function: BvllFunction,
    /// Total frame length including the header
    pub length: u16,
}

impl BvllHeader {
    /// Decode the 4-byte BVLL header
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() || data[0] != BVLL_TYPE_BACNET_IP {
            return Err(DataLinkError::NotBvll);
        }
        if data.len() < 4 {
            return Err(DataLinkError::InvalidFrame("header truncated".to_string()));
        }

        let function = BvllFunction::try_from(data[1])?;
        let length = u16::from_be_bytes([data[2], data[3]]);

        Ok(BvllHeader { function, length })
    }
}

/// A fully decoded BVLL frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BvllFrame<'a> {
    /// BVLL function
    pub function: BvllFunction,
    /// Embedded originator for Forwarded-NPDU frames
    pub originator: Option<SocketAddr>,
    /// Registration time-to-live for Register-Foreign-Device
    pub ttl: Option<u16>,
    /// Table entry address for Delete-Foreign-Device-Table-Entry
    pub address: Option<SocketAddr>,
    /// NPDU payload when the function carries one, empty otherwise
    pub payload: &'a [u8],
}

impl<'a> BvllFrame<'a> {
    /// Decode a BVLL frame from a raw datagram
    pub fn decode(data: &'a [u8]) -> Result<Self> {
        let header = BvllHeader::decode(data)?;

        if header.length as usize != data.len() {
            return Err(DataLinkError::InvalidFrame(format!(
                "length field {} does not match frame size {}",
                header.length,
                data.len()
            )));
        }

        let body = &data[4..];
        let mut frame = BvllFrame {
            function: header.function,
            originator: None,
            ttl: None,
            address: None,
            payload: &[],
        };

        match header.function {
            BvllFunction::OriginalUnicastNpdu
            | BvllFunction::OriginalBroadcastNpdu
            | BvllFunction::DistributeBroadcastToNetwork => {
                frame.payload = body;
            }
            BvllFunction::ForwardedNpdu => {
                if body.len() < 6 {
                    return Err(DataLinkError::InvalidFrame(
                        "forwarded NPDU missing originator".to_string(),
                    ));
                }
                frame.originator = Some(decode_bip_address(&body[..6]));
                frame.payload = &body[6..];
            }
            BvllFunction::RegisterForeignDevice => {
                if body.len() != 2 {
                    return Err(DataLinkError::InvalidFrame(
                        "registration missing TTL".to_string(),
                    ));
                }
                frame.ttl = Some(u16::from_be_bytes([body[0], body[1]]));
            }
            BvllFunction::DeleteForeignDeviceTableEntry => {
                if body.len() != 6 {
                    return Err(DataLinkError::InvalidFrame(
                        "delete entry missing address".to_string(),
                    ));
                }
                frame.address = Some(decode_bip_address(&body[..6]));
            }
        }

        Ok(frame)
    }
}

/// Decode a 6-byte B/IP address (4 IP octets + 2 port octets)
pub fn decode_bip_address(raw: &[u8]) -> SocketAddr {
    let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
    let port = u16::from_be_bytes([raw[4], raw[5]]);
    SocketAddr::V4(SocketAddrV4::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(function: u8, body: &[u8]) -> Vec<u8> {
        let length = (4 + body.len()) as u16;
        let mut data = vec![0x81, function, (length >> 8) as u8, (length & 0xFF) as u8];
        data.extend_from_slice(body);
        data
    }

    #[test]
    fn test_unicast_payload() {
        let data = frame(0x00, &[0x01, 0x00, 0x10, 0x08]);
        let decoded = BvllFrame::decode(&data).unwrap();
        assert_eq!(decoded.function, BvllFunction::OriginalUnicastNpdu);
        assert_eq!(decoded.payload, &[0x01, 0x00, 0x10, 0x08]);
    }

    #[test]
    fn test_forwarded_originator() {
        let mut body = vec![192, 0, 2, 99, 0xBA, 0xC0];
        body.extend_from_slice(&[0x01, 0x00]);
        let data = frame(0x02, &body);
        let decoded = BvllFrame::decode(&data).unwrap();
        assert_eq!(
            decoded.originator,
            Some("192.0.2.99:47808".parse().unwrap())
        );
        assert_eq!(decoded.payload, &[0x01, 0x00]);
    }

    #[test]
    fn test_register_ttl() {
        let data = frame(0x03, &[0x00, 0x3C]);
        let decoded = BvllFrame::decode(&data).unwrap();
        assert_eq!(decoded.ttl, Some(60));
        assert!(decoded.payload.is_empty());
        assert!(!decoded.function.carries_npdu());
    }

    #[test]
    fn test_non_bvll_rejected() {
        assert_eq!(BvllHeader::decode(&[0x55, 0x00]), Err(DataLinkError::NotBvll));
    }

    #[test]
    fn test_unknown_function() {
        let data = frame(0x0A, &[]);
        assert_eq!(
            BvllFrame::decode(&data),
            Err(DataLinkError::UnknownFunction(0x0A))
        );
    }

    #[test]
    fn test_length_mismatch() {
        let mut data = frame(0x00, &[0x01]);
        data[3] = 0xFF;
        assert!(matches!(
            BvllFrame::decode(&data),
            Err(DataLinkError::InvalidFrame(_))
        ));
    }
}

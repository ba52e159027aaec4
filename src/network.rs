//! BACnet Network Layer
//!
//! NPDU decoding per ASHRAE 135 clause 6. The NPCI header carries the
//! protocol version, a control octet and optional destination/source
//! network addresses; the remainder is either a network-layer message or
//! application data for the APDU stage.
//!
//! The monitor cares about two things here: lifting the source address when
//! an SADR is present (so family keys name the originating station rather
//! than the router), and classifying network-layer messages into the fixed
//! table below.

use std::fmt;

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Errors that can occur in NPDU decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid NPDU format
    InvalidNpdu(String),
    /// Protocol version other than 1
    BadVersion(u8),
    /// Network message type outside the monitored table
    UnknownMessageType(u8),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::InvalidNpdu(msg) => write!(f, "Invalid NPDU: {}", msg),
            NetworkError::BadVersion(version) => {
                write!(f, "not version 1 - {}", version)
            }
            NetworkError::UnknownMessageType(message_type) => {
                write!(f, "unknown network message type: {}", message_type)
            }
        }
    }
}

impl std::error::Error for NetworkError {}

/// NPDU control flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NpduControl {
    /// Network layer message
    pub network_message: bool,
    /// Destination specifier present
    pub destination_present: bool,
    /// Source specifier present
    pub source_present: bool,
    /// Data expecting reply
    pub expecting_reply: bool,
    /// Network priority (0-3)
    pub priority: u8,
}

impl NpduControl {
    /// Parse control byte into flags
    pub fn from_byte(byte: u8) -> Self {
        Self {
            network_message: (byte & 0x80) != 0,
            destination_present: (byte & 0x20) != 0,
            source_present: (byte & 0x08) != 0,
            expecting_reply: (byte & 0x04) != 0,
            priority: byte & 0x03,
        }
    }
}

/// Network address (network number + MAC address)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    /// Network number (0 = local network, 65535 = broadcast)
    pub network: u16,
    /// MAC address on that network
    pub address: Vec<u8>,
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.is_empty() {
            write!(f, "{}:*", self.network)
        } else {
            write!(f, "{}:{}", self.network, hex::encode(&self.address))
        }
    }
}

/// Network Protocol Data Unit header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Npdu {
    /// Protocol version (always 1)
    pub version: u8,
    /// Control information
    pub control: NpduControl,
    /// Destination network address
    pub destination: Option<NetworkAddress>,
    /// Source network address
    pub source: Option<NetworkAddress>,
    /// Hop count (only present if destination is present)
    pub hop_count: Option<u8>,
}

impl Npdu {
    /// Decode the NPCI header, returning the header and its size
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 2 {
            return Err(NetworkError::InvalidNpdu("NPDU too short".to_string()));
        }

        let mut pos = 0;

        let version = data[pos];
        pos += 1;
        if version != 1 {
            return Err(NetworkError::BadVersion(version));
        }

        let control = NpduControl::from_byte(data[pos]);
        pos += 1;

        let destination = if control.destination_present {
            let (address, consumed) = decode_network_address(&data[pos..], "destination")?;
            pos += consumed;
            Some(address)
        } else {
            None
        };

        let source = if control.source_present {
            let (address, consumed) = decode_network_address(&data[pos..], "source")?;
            pos += consumed;
            Some(address)
        } else {
            None
        };

        let hop_count = if destination.is_some() {
            if pos >= data.len() {
                return Err(NetworkError::InvalidNpdu("missing hop count".to_string()));
            }
            let hc = data[pos];
            pos += 1;
            Some(hc)
        } else {
            None
        };

        Ok((
            Npdu {
                version,
                control,
                destination,
                source,
                hop_count,
            },
            pos,
        ))
    }

    /// Check if this NPDU carries a network layer message
    pub fn is_network_message(&self) -> bool {
        self.control.network_message
    }
}

fn decode_network_address(data: &[u8], which: &str) -> Result<(NetworkAddress, usize)> {
    if data.len() < 3 {
        return Err(NetworkError::InvalidNpdu(format!(
            "invalid {} address",
            which
        )));
    }

    let network = u16::from_be_bytes([data[0], data[1]]);
    let addr_len = data[2] as usize;

    if data.len() < 3 + addr_len {
        return Err(NetworkError::InvalidNpdu(format!(
            "invalid {} address length",
            which
        )));
    }

    let address = data[3..3 + addr_len].to_vec();
    Ok((NetworkAddress { network, address }, 3 + addr_len))
}

/// Network layer message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetworkMessageType {
    WhoIsRouterToNetwork = 0x00,
    IAmRouterToNetwork = 0x01,
    ICouldBeRouterToNetwork = 0x02,
    RejectMessageToNetwork = 0x03,
    RouterBusyToNetwork = 0x04,
    RouterAvailableToNetwork = 0x05,
    EstablishConnectionToNetwork = 0x06,
    DisconnectConnectionToNetwork = 0x07,
}

impl TryFrom<u8> for NetworkMessageType {
    type Error = NetworkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::WhoIsRouterToNetwork),
            0x01 => Ok(Self::IAmRouterToNetwork),
            0x02 => Ok(Self::ICouldBeRouterToNetwork),
            0x03 => Ok(Self::RejectMessageToNetwork),
            0x04 => Ok(Self::RouterBusyToNetwork),
            0x05 => Ok(Self::RouterAvailableToNetwork),
            0x06 => Ok(Self::EstablishConnectionToNetwork),
            0x07 => Ok(Self::DisconnectConnectionToNetwork),
            _ => Err(NetworkError::UnknownMessageType(value)),
        }
    }
}

/// A decoded network layer message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    WhoIsRouterToNetwork { network: Option<u16> },
    IAmRouterToNetwork { networks: Vec<u16> },
    ICouldBeRouterToNetwork { network: u16, performance_index: u8 },
    RejectMessageToNetwork { reason: u8, network: u16 },
    RouterBusyToNetwork { networks: Vec<u16> },
    RouterAvailableToNetwork { networks: Vec<u16> },
    EstablishConnectionToNetwork { network: u16, termination_time: u8 },
    DisconnectConnectionToNetwork { network: u16 },
}

impl NetworkMessage {
    /// Decode a network layer message (message type octet + payload)
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(NetworkError::InvalidNpdu(
                "empty network message".to_string(),
            ));
        }

        let message_type = NetworkMessageType::try_from(data[0])?;
        let body = &data[1..];

        let message = match message_type {
            NetworkMessageType::WhoIsRouterToNetwork => NetworkMessage::WhoIsRouterToNetwork {
                network: if body.is_empty() {
                    None
                } else {
                    Some(read_u16(body, 0)?)
                },
            },
            NetworkMessageType::IAmRouterToNetwork => NetworkMessage::IAmRouterToNetwork {
                networks: read_network_list(body)?,
            },
            NetworkMessageType::ICouldBeRouterToNetwork => {
                if body.len() < 3 {
                    return Err(NetworkError::InvalidNpdu("message truncated".to_string()));
                }
                NetworkMessage::ICouldBeRouterToNetwork {
                    network: read_u16(body, 0)?,
                    performance_index: body[2],
                }
            }
            NetworkMessageType::RejectMessageToNetwork => {
                if body.len() < 3 {
                    return Err(NetworkError::InvalidNpdu("message truncated".to_string()));
                }
                NetworkMessage::RejectMessageToNetwork {
                    reason: body[0],
                    network: read_u16(body, 1)?,
                }
            }
            NetworkMessageType::RouterBusyToNetwork => NetworkMessage::RouterBusyToNetwork {
                networks: read_network_list(body)?,
            },
            NetworkMessageType::RouterAvailableToNetwork => {
                NetworkMessage::RouterAvailableToNetwork {
                    networks: read_network_list(body)?,
                }
            }
            NetworkMessageType::EstablishConnectionToNetwork => {
                if body.len() < 3 {
                    return Err(NetworkError::InvalidNpdu("message truncated".to_string()));
                }
                NetworkMessage::EstablishConnectionToNetwork {
                    network: read_u16(body, 0)?,
                    termination_time: body[2],
                }
            }
            NetworkMessageType::DisconnectConnectionToNetwork => {
                NetworkMessage::DisconnectConnectionToNetwork {
                    network: read_u16(body, 0)?,
                }
            }
        };

        Ok(message)
    }

    /// PDU class name used in family keys
    pub fn class_name(&self) -> &'static str {
        match self {
            NetworkMessage::WhoIsRouterToNetwork { .. } => "WhoIsRouterToNetwork",
            NetworkMessage::IAmRouterToNetwork { .. } => "IAmRouterToNetwork",
            NetworkMessage::ICouldBeRouterToNetwork { .. } => "ICouldBeRouterToNetwork",
            NetworkMessage::RejectMessageToNetwork { .. } => "RejectMessageToNetwork",
            NetworkMessage::RouterBusyToNetwork { .. } => "RouterBusyToNetwork",
            NetworkMessage::RouterAvailableToNetwork { .. } => "RouterAvailableToNetwork",
            NetworkMessage::EstablishConnectionToNetwork { .. } => "EstablishConnectionToNetwork",
            NetworkMessage::DisconnectConnectionToNetwork { .. } => {
                "DisconnectConnectionToNetwork"
            }
        }
    }

    /// Message-specific discriminators for the family key, in fixed order
    pub fn discriminators(&self) -> Vec<String> {
        match self {
            NetworkMessage::WhoIsRouterToNetwork { network } => {
                vec![render_optional(*network)]
            }
            NetworkMessage::IAmRouterToNetwork { networks }
            | NetworkMessage::RouterBusyToNetwork { networks }
            | NetworkMessage::RouterAvailableToNetwork { networks } => {
                if networks.is_empty() {
                    vec!["*".to_string()]
                } else {
                    networks.iter().map(|net| net.to_string()).collect()
                }
            }
            NetworkMessage::ICouldBeRouterToNetwork {
                network,
                performance_index,
            } => vec![network.to_string(), performance_index.to_string()],
            NetworkMessage::RejectMessageToNetwork { reason, network } => {
                vec![reason.to_string(), network.to_string()]
            }
            NetworkMessage::EstablishConnectionToNetwork {
                network,
                termination_time,
            } => vec![network.to_string(), termination_time.to_string()],
            NetworkMessage::DisconnectConnectionToNetwork { network } => {
                vec![network.to_string()]
            }
        }
    }
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    if data.len() < offset + 2 {
        return Err(NetworkError::InvalidNpdu("message truncated".to_string()));
    }
    Ok(u16::from_be_bytes([data[offset], data[offset + 1]]))
}

fn read_network_list(data: &[u8]) -> Result<Vec<u16>> {
    if data.len() % 2 != 0 {
        return Err(NetworkError::InvalidNpdu(
            "odd network list length".to_string(),
        ));
    }
    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

fn render_optional(value: Option<u16>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => "*".to_string(),
    }
}

//! BACnet Application Layer
//!
//! APDU framing for the classification pipeline. The first nibble of an
//! APDU selects one of eight PDU types; request types additionally carry a
//! service choice octet that selects the service-specific parser.
//!
//! Only the header fields the monitor classifies on are decoded; service
//! payloads are handed to [`crate::service`] untouched.

use std::fmt;

/// Result type for application layer operations
pub type Result<T> = std::result::Result<T, ApplicationError>;

/// Errors that can occur in APDU decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplicationError {
    /// Invalid APDU format
    InvalidApdu(String),
    /// APDU type nibble outside the table
    UnknownApduType(u8),
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplicationError::InvalidApdu(msg) => write!(f, "Invalid APDU: {}", msg),
            ApplicationError::UnknownApduType(apdu_type) => {
                write!(f, "unknown APDU type: {}", apdu_type)
            }
        }
    }
}

impl std::error::Error for ApplicationError {}

/// APDU types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApduType {
    ConfirmedRequest = 0,
    UnconfirmedRequest = 1,
    SimpleAck = 2,
    ComplexAck = 3,
    SegmentAck = 4,
    Error = 5,
    Reject = 6,
    Abort = 7,
}

/// Application Protocol Data Unit, decoded to the classification depth
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apdu<'a> {
    /// Confirmed service request
    ConfirmedRequest {
        invoke_id: u8,
        segmented: bool,
        service_choice: u8,
        service_data: &'a [u8],
    },

    /// Unconfirmed service request
    UnconfirmedRequest {
        service_choice: u8,
        service_data: &'a [u8],
    },

    /// Simple acknowledgment
    SimpleAck { invoke_id: u8, service_choice: u8 },

    /// Complex acknowledgment
    ComplexAck {
        invoke_id: u8,
        segmented: bool,
        service_choice: u8,
        service_data: &'a [u8],
    },

    /// Segment acknowledgment
    SegmentAck { invoke_id: u8 },

    /// Error PDU
    Error { invoke_id: u8, service_choice: u8 },

    /// Reject PDU
    Reject { invoke_id: u8, reject_reason: u8 },

    /// Abort PDU
    Abort { invoke_id: u8, abort_reason: u8 },
}

impl<'a> Apdu<'a> {
    /// Decode an APDU from bytes
    pub fn decode(data: &'a [u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(ApplicationError::InvalidApdu("empty APDU".to_string()));
        }

        let pdu_type_byte = data[0];
        let pdu_type = match (pdu_type_byte >> 4) & 0x0F {
            0 => ApduType::ConfirmedRequest,
            1 => ApduType::UnconfirmedRequest,
            2 => ApduType::SimpleAck,
            3 => ApduType::ComplexAck,
            4 => ApduType::SegmentAck,
            5 => ApduType::Error,
            6 => ApduType::Reject,
            7 => ApduType::Abort,
            other => return Err(ApplicationError::UnknownApduType(other)),
        };

        match pdu_type {
            ApduType::ConfirmedRequest => {
                if data.len() < 4 {
                    return Err(ApplicationError::InvalidApdu(
                        "confirmed request too short".to_string(),
                    ));
                }

                let segmented = (pdu_type_byte & 0x08) != 0;
                let invoke_id = data[2];

                // Sequence number and window size are present when segmented
                let choice_pos = if segmented { 5 } else { 3 };
                if data.len() <= choice_pos {
                    return Err(ApplicationError::InvalidApdu(
                        "confirmed request header truncated".to_string(),
                    ));
                }

                Ok(Apdu::ConfirmedRequest {
                    invoke_id,
                    segmented,
                    service_choice: data[choice_pos],
                    service_data: &data[choice_pos + 1..],
                })
            }

            ApduType::UnconfirmedRequest => {
                if data.len() < 2 {
                    return Err(ApplicationError::InvalidApdu(
                        "unconfirmed request too short".to_string(),
                    ));
                }
                Ok(Apdu::UnconfirmedRequest {
                    service_choice: data[1],
                    service_data: &data[2..],
                })
            }

            ApduType::SimpleAck => {
                if data.len() < 3 {
                    return Err(ApplicationError::InvalidApdu(
                        "simple ack too short".to_string(),
                    ));
                }
                Ok(Apdu::SimpleAck {
                    invoke_id: data[1],
                    service_choice: data[2],
                })
            }

            ApduType::ComplexAck => {
                if data.len() < 3 {
                    return Err(ApplicationError::InvalidApdu(
                        "complex ack too short".to_string(),
                    ));
                }

                let segmented = (pdu_type_byte & 0x08) != 0;
                let invoke_id = data[1];
                let choice_pos = if segmented { 4 } else { 2 };
                if data.len() <= choice_pos {
                    return Err(ApplicationError::InvalidApdu(
                        "complex ack header truncated".to_string(),
                    ));
                }

                Ok(Apdu::ComplexAck {
                    invoke_id,
                    segmented,
                    service_choice: data[choice_pos],
                    service_data: &data[choice_pos + 1..],
                })
            }

            ApduType::SegmentAck => {
                if data.len() < 4 {
                    return Err(ApplicationError::InvalidApdu(
                        "segment ack too short".to_string(),
                    ));
                }
                Ok(Apdu::SegmentAck { invoke_id: data[1] })
            }

            ApduType::Error => {
                if data.len() < 3 {
                    return Err(ApplicationError::InvalidApdu("error too short".to_string()));
                }
                Ok(Apdu::Error {
                    invoke_id: data[1],
                    service_choice: data[2],
                })
            }

            ApduType::Reject => {
                if data.len() < 3 {
                    return Err(ApplicationError::InvalidApdu(
                        "reject too short".to_string(),
                    ));
                }
                Ok(Apdu::Reject {
                    invoke_id: data[1],
                    reject_reason: data[2],
                })
            }

            ApduType::Abort => {
                if data.len() < 3 {
                    return Err(ApplicationError::InvalidApdu("abort too short".to_string()));
                }
                Ok(Apdu::Abort {
                    invoke_id: data[1],
                    abort_reason: data[2],
                })
            }
        }
    }
}

/// Confirmed service choices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConfirmedServiceChoice {
    // Alarm and Event Services
    AcknowledgeAlarm = 0,
    ConfirmedEventNotification = 2,
    GetAlarmSummary = 3,
    GetEnrollmentSummary = 4,
    GetEventInformation = 29,

    // File Access Services
    AtomicReadFile = 6,
    AtomicWriteFile = 7,

    // Object Access Services
    AddListElement = 8,
    RemoveListElement = 9,
    CreateObject = 10,
    DeleteObject = 11,
    ReadProperty = 12,
    ReadPropertyMultiple = 14,
    WriteProperty = 15,
    WritePropertyMultiple = 16,

    // Remote Device Management Services
    DeviceCommunicationControl = 17,
    ReinitializeDevice = 20,

    // Virtual Terminal Services
    VtOpen = 21,
    VtClose = 22,
    VtData = 23,

    // Security Services
    Authenticate = 24,
    RequestKey = 25,

    // Other Services
    ReadRange = 26,
    SubscribeCov = 5,
    SubscribeCovProperty = 28,
}

impl ConfirmedServiceChoice {
    /// Request class name used in family keys
    pub fn request_name(&self) -> &'static str {
        match self {
            Self::AcknowledgeAlarm => "AcknowledgeAlarmRequest",
            Self::ConfirmedEventNotification => "ConfirmedEventNotificationRequest",
            Self::GetAlarmSummary => "GetAlarmSummaryRequest",
            Self::GetEnrollmentSummary => "GetEnrollmentSummaryRequest",
            Self::GetEventInformation => "GetEventInformationRequest",
            Self::AtomicReadFile => "AtomicReadFileRequest",
            Self::AtomicWriteFile => "AtomicWriteFileRequest",
            Self::AddListElement => "AddListElementRequest",
            Self::RemoveListElement => "RemoveListElementRequest",
            Self::CreateObject => "CreateObjectRequest",
            Self::DeleteObject => "DeleteObjectRequest",
            Self::ReadProperty => "ReadPropertyRequest",
            Self::ReadPropertyMultiple => "ReadPropertyMultipleRequest",
            Self::WriteProperty => "WritePropertyRequest",
            Self::WritePropertyMultiple => "WritePropertyMultipleRequest",
            Self::DeviceCommunicationControl => "DeviceCommunicationControlRequest",
            Self::ReinitializeDevice => "ReinitializeDeviceRequest",
            Self::VtOpen => "VtOpenRequest",
            Self::VtClose => "VtCloseRequest",
            Self::VtData => "VtDataRequest",
            Self::Authenticate => "AuthenticateRequest",
            Self::RequestKey => "RequestKeyRequest",
            Self::ReadRange => "ReadRangeRequest",
            Self::SubscribeCov => "SubscribeCOVRequest",
            Self::SubscribeCovProperty => "SubscribeCOVPropertyRequest",
        }
    }

    /// Complex-ack class name used in family keys
    pub fn ack_name(&self) -> String {
        let request = self.request_name();
        format!("{}ACK", request.trim_end_matches("Request"))
    }
}

impl TryFrom<u8> for ConfirmedServiceChoice {
    type Error = ApplicationError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::AcknowledgeAlarm),
            2 => Ok(Self::ConfirmedEventNotification),
            3 => Ok(Self::GetAlarmSummary),
            4 => Ok(Self::GetEnrollmentSummary),
            29 => Ok(Self::GetEventInformation),
            6 => Ok(Self::AtomicReadFile),
            7 => Ok(Self::AtomicWriteFile),
            8 => Ok(Self::AddListElement),
            9 => Ok(Self::RemoveListElement),
            10 => Ok(Self::CreateObject),
            11 => Ok(Self::DeleteObject),
            12 => Ok(Self::ReadProperty),
            14 => Ok(Self::ReadPropertyMultiple),
            15 => Ok(Self::WriteProperty),
            16 => Ok(Self::WritePropertyMultiple),
            17 => Ok(Self::DeviceCommunicationControl),
            20 => Ok(Self::ReinitializeDevice),
            21 => Ok(Self::VtOpen),
            22 => Ok(Self::VtClose),
            23 => Ok(Self::VtData),
            24 => Ok(Self::Authenticate),
            25 => Ok(Self::RequestKey),
            26 => Ok(Self::ReadRange),
            5 => Ok(Self::SubscribeCov),
            28 => Ok(Self::SubscribeCovProperty),
            _ => Err(ApplicationError::InvalidApdu(format!(
                "unsupported confirmed service choice: {}",
                value
            ))),
        }
    }
}

/// Unconfirmed service choices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnconfirmedServiceChoice {
    IAm = 0,
    IHave = 1,
    UnconfirmedCovNotification = 2,
    UnconfirmedEventNotification = 3,
    UnconfirmedPrivateTransfer = 4,
    UnconfirmedTextMessage = 5,
    TimeSynchronization = 6,
    WhoHas = 7,
    WhoIs = 8,
    UtcTimeSynchronization = 9,
    WriteGroup = 10,
}

impl UnconfirmedServiceChoice {
    /// Request class name used in family keys
    pub fn request_name(&self) -> &'static str {
        match self {
            Self::IAm => "IAmRequest",
            Self::IHave => "IHaveRequest",
            Self::UnconfirmedCovNotification => "UnconfirmedCOVNotificationRequest",
            Self::UnconfirmedEventNotification => "UnconfirmedEventNotificationRequest",
            Self::UnconfirmedPrivateTransfer => "UnconfirmedPrivateTransferRequest",
            Self::UnconfirmedTextMessage => "UnconfirmedTextMessageRequest",
            Self::TimeSynchronization => "TimeSynchronizationRequest",
            Self::WhoHas => "WhoHasRequest",
            Self::WhoIs => "WhoIsRequest",
            Self::UtcTimeSynchronization => "UTCTimeSynchronizationRequest",
            Self::WriteGroup => "WriteGroupRequest",
        }
    }
}

impl TryFrom<u8> for UnconfirmedServiceChoice {
    type Error = ApplicationError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::IAm),
            1 => Ok(Self::IHave),
            2 => Ok(Self::UnconfirmedCovNotification),
            3 => Ok(Self::UnconfirmedEventNotification),
            4 => Ok(Self::UnconfirmedPrivateTransfer),
            5 => Ok(Self::UnconfirmedTextMessage),
            6 => Ok(Self::TimeSynchronization),
            7 => Ok(Self::WhoHas),
            8 => Ok(Self::WhoIs),
            9 => Ok(Self::UtcTimeSynchronization),
            10 => Ok(Self::WriteGroup),
            _ => Err(ApplicationError::InvalidApdu(format!(
                "unsupported unconfirmed service choice: {}",
                value
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_unconfirmed_request() {
        let data = [0x10, 0x08, 0x09, 0x01, 0x19, 0x0A];
        let apdu = Apdu::decode(&data).unwrap();
        match apdu {
            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => {
                assert_eq!(service_choice, 8);
                assert_eq!(service_data.len(), 4);
            }
            other => panic!("unexpected APDU: {:?}", other),
        }
    }

    #[test]
    fn test_decode_confirmed_request() {
        // unsegmented ReadProperty, invoke id 42
        let data = [0x00, 0x05, 0x2A, 0x0C, 0xFF];
        let apdu = Apdu::decode(&data).unwrap();
        match apdu {
            Apdu::ConfirmedRequest {
                invoke_id,
                segmented,
                service_choice,
                service_data,
            } => {
                assert_eq!(invoke_id, 42);
                assert!(!segmented);
                assert_eq!(service_choice, 12);
                assert_eq!(service_data, &[0xFF]);
            }
            other => panic!("unexpected APDU: {:?}", other),
        }
    }

    #[test]
    fn test_decode_simple_ack() {
        let data = [0x20, 0x2A, 0x0F];
        assert_eq!(
            Apdu::decode(&data).unwrap(),
            Apdu::SimpleAck {
                invoke_id: 42,
                service_choice: 15
            }
        );
    }

    #[test]
    fn test_service_names() {
        assert_eq!(UnconfirmedServiceChoice::IAm.request_name(), "IAmRequest");
        assert_eq!(
            ConfirmedServiceChoice::ReadProperty.ack_name(),
            "ReadPropertyACK"
        );
    }

    #[test]
    fn test_empty_apdu() {
        assert!(matches!(
            Apdu::decode(&[]),
            Err(ApplicationError::InvalidApdu(_))
        ));
    }
}

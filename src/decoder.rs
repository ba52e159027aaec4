//! Packet Classification Pipeline
//!
//! Three-stage decode of a raw UDP datagram: BVLL framing, NPCI header,
//! then the APDU and its service payload. Each stage can fail
//! independently; failures never propagate as errors, they classify the
//! packet into a [`DecodeErrorKind`] instead so the error families are
//! counted like any other traffic.
//!
//! Successful classification yields a *family key*: the PDU class name,
//! the originating source address after lifting, and the service-specific
//! discriminators, joined with `,` in a fixed order. Family keys are the
//! identity the whole counting and alarm machinery operates on, so their
//! rendering must stay stable.

use std::net::SocketAddr;

use crate::app::{Apdu, ConfirmedServiceChoice, UnconfirmedServiceChoice};
use crate::datalink::{BvllFrame, BvllFunction, DataLinkError, BACNET_IP_PORT, BVLL_TYPE_BACNET_IP};
use crate::network::{NetworkError, NetworkMessage, Npdu};
use crate::service::{
    CovNotificationRequest, EventNotificationRequest, IAmRequest, IHaveRequest, WhoHasRequest,
    WhoIsRequest,
};

/// Traffic categories, each backed by a family-key set in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    IpTraffic,
    BvllTraffic,
    NetworkTraffic,
    ApplicationTraffic,
    ErrorTraffic,
}

impl Category {
    /// Store key of the category's family set
    pub fn set_name(&self) -> &'static str {
        match self {
            Category::IpTraffic => "ip-traffic",
            Category::BvllTraffic => "bvll-traffic",
            Category::NetworkTraffic => "network-traffic",
            Category::ApplicationTraffic => "application-traffic",
            Category::ErrorTraffic => "error-traffic",
        }
    }

    /// All categories, in the order they are reported
    pub fn all() -> [Category; 5] {
        [
            Category::IpTraffic,
            Category::BvllTraffic,
            Category::NetworkTraffic,
            Category::ApplicationTraffic,
            Category::ErrorTraffic,
        ]
    }

    /// Look a category up by its set name or short API alias
    pub fn from_name(name: &str) -> Option<Category> {
        match name {
            "ip" | "ip-traffic" => Some(Category::IpTraffic),
            "bvll" | "bvll-traffic" => Some(Category::BvllTraffic),
            "network" | "network-traffic" => Some(Category::NetworkTraffic),
            "application" | "application-traffic" => Some(Category::ApplicationTraffic),
            "error" | "error-traffic" => Some(Category::ErrorTraffic),
            _ => None,
        }
    }
}

/// Minimum per-packet metadata the counting engine needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMeta {
    /// Datagram size in bytes
    pub size: usize,
    /// Carried protocol
    pub protocol: &'static str,
}

impl PacketMeta {
    fn bacnet(size: usize) -> Self {
        PacketMeta {
            size,
            protocol: "bacnet",
        }
    }
}

/// Decode rejection kinds, counted under `error-traffic`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeErrorKind {
    Empty,
    NonBvll,
    UnknownBvllFunction,
    BvllDecode,
    BadVersion,
    NpduDecode,
    ApduDecode,
    UnknownApduType,
}

impl DecodeErrorKind {
    /// Stable label used in the error-traffic set entries
    pub fn label(&self) -> &'static str {
        match self {
            DecodeErrorKind::Empty => "empty",
            DecodeErrorKind::NonBvll => "non_bvll",
            DecodeErrorKind::UnknownBvllFunction => "unknown_bvll_function",
            DecodeErrorKind::BvllDecode => "bvll_decode",
            DecodeErrorKind::BadVersion => "bad_version",
            DecodeErrorKind::NpduDecode => "npdu_decode",
            DecodeErrorKind::ApduDecode => "apdu_decode",
            DecodeErrorKind::UnknownApduType => "unknown_apdu_type",
        }
    }
}

/// A successfully classified packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    /// Final family key
    pub family: String,
    /// Category of the final family key
    pub category: Category,
    /// Packet metadata
    pub meta: PacketMeta,
    /// BVLL-level family key when classification continued into the NPDU
    pub bvll_family: Option<String>,
    /// Forwarding source when a Forwarded-NPDU arrived from a non-BBMD peer
    pub non_bbmd_forwarder: Option<String>,
}

/// A rejected packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure {
    /// Rejection kind
    pub kind: DecodeErrorKind,
    /// Human-readable detail, may be empty
    pub detail: String,
    /// Packet metadata
    pub meta: PacketMeta,
    /// BVLL-level family key when the link layer decoded cleanly
    pub bvll_family: Option<String>,
    /// Forwarding source when a Forwarded-NPDU arrived from a non-BBMD peer
    pub non_bbmd_forwarder: Option<String>,
}

/// Outcome of decoding one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    Classified(Classified),
    Error(DecodeFailure),
}

/// Render a B/IP source the way family keys expect: bare IP on the
/// well-known port, `ip:port` otherwise.
pub fn render_address(addr: &SocketAddr) -> String {
    if addr.port() == BACNET_IP_PORT {
        addr.ip().to_string()
    } else {
        addr.to_string()
    }
}

/// Stateless packet decoder
#[derive(Debug, Clone, Default)]
pub struct Decoder {
    /// Addresses of known BBMDs; Forwarded-NPDUs from anyone else are
    /// flagged for alerting.
    bbmd: Vec<SocketAddr>,
}

impl Decoder {
    /// Create a decoder with the configured BBMD addresses
    pub fn new(bbmd: Vec<SocketAddr>) -> Self {
        Decoder { bbmd }
    }

    fn is_bbmd(&self, source: &SocketAddr) -> bool {
        self.bbmd.iter().any(|addr| addr.ip() == source.ip())
    }

    /// Decode and classify one datagram
    pub fn decode(&self, data: &[u8], source: SocketAddr) -> DecodeOutcome {
        let meta = PacketMeta::bacnet(data.len());
        let source_str = render_address(&source);

        let fail = |kind, detail: String| {
            DecodeOutcome::Error(DecodeFailure {
                kind,
                detail,
                meta,
                bvll_family: None,
                non_bbmd_forwarder: None,
            })
        };

        if data.is_empty() {
            return fail(
                DecodeErrorKind::Empty,
                "empty packet - expected BVLL header".to_string(),
            );
        }

        if data[0] != BVLL_TYPE_BACNET_IP {
            return fail(
                DecodeErrorKind::NonBvll,
                format!("expected BVLL type 0x81, got {:#04x}", data[0]),
            );
        }

        let frame = match BvllFrame::decode(data) {
            Ok(frame) => frame,
            Err(DataLinkError::UnknownFunction(function)) => {
                return fail(DecodeErrorKind::UnknownBvllFunction, function.to_string())
            }
            Err(err) => return fail(DecodeErrorKind::BvllDecode, err.to_string()),
        };

        // Build the link-layer family key.
        let mut bvll_parts = vec![frame.function.class_name().to_string(), source_str];
        let mut non_bbmd_forwarder = None;

        match frame.function {
            BvllFunction::ForwardedNpdu => {
                if !self.is_bbmd(&source) {
                    non_bbmd_forwarder = Some(render_address(&source));
                }
                if let Some(originator) = &frame.originator {
                    bvll_parts.push(render_address(originator));
                }
            }
            BvllFunction::RegisterForeignDevice => {
                if let Some(ttl) = frame.ttl {
                    bvll_parts.push(ttl.to_string());
                }
            }
            BvllFunction::DeleteForeignDeviceTableEntry => {
                if let Some(address) = &frame.address {
                    bvll_parts.push(render_address(address));
                }
            }
            _ => {}
        }

        let bvll_family = bvll_parts.join(",");

        if !frame.function.carries_npdu() {
            return DecodeOutcome::Classified(Classified {
                family: bvll_family,
                category: Category::BvllTraffic,
                meta,
                bvll_family: None,
                non_bbmd_forwarder,
            });
        }

        // The source everything beneath the link layer is attributed to:
        // the embedded originator for forwarded frames, the sender otherwise.
        let lower_source = match (frame.function, &frame.originator) {
            (BvllFunction::ForwardedNpdu, Some(originator)) => render_address(originator),
            _ => render_address(&source),
        };

        if frame.payload.is_empty() {
            return link_failure(
                DecodeErrorKind::Empty,
                "empty packet - expected NPCI header".to_string(),
                meta,
                &bvll_family,
                &non_bbmd_forwarder,
            );
        }

        let (npdu, npci_len) = match Npdu::decode(frame.payload) {
            Ok(decoded) => decoded,
            Err(NetworkError::BadVersion(version)) => {
                return link_failure(
                    DecodeErrorKind::BadVersion,
                    format!("not version 1 - {}", version),
                    meta,
                    &bvll_family,
                    &non_bbmd_forwarder,
                )
            }
            Err(err) => {
                return link_failure(
                    DecodeErrorKind::NpduDecode,
                    err.to_string(),
                    meta,
                    &bvll_family,
                    &non_bbmd_forwarder,
                )
            }
        };

        // Lift the source: an SADR names the actual originating station.
        let lifted_source = match &npdu.source {
            Some(sadr) => sadr.to_string(),
            None => lower_source,
        };

        let body = &frame.payload[npci_len..];

        if npdu.is_network_message() {
            let message = match NetworkMessage::decode(body) {
                Ok(message) => message,
                Err(err) => {
                    return link_failure(
                        DecodeErrorKind::NpduDecode,
                        err.to_string(),
                        meta,
                        &bvll_family,
                        &non_bbmd_forwarder,
                    )
                }
            };

            let mut parts = vec![message.class_name().to_string(), lifted_source];
            parts.extend(message.discriminators());

            return DecodeOutcome::Classified(Classified {
                family: parts.join(","),
                category: Category::NetworkTraffic,
                meta,
                bvll_family: Some(bvll_family),
                non_bbmd_forwarder,
            });
        }

        let apdu = match Apdu::decode(body) {
            Ok(apdu) => apdu,
            Err(crate::app::ApplicationError::UnknownApduType(apdu_type)) => {
                return link_failure(
                    DecodeErrorKind::UnknownApduType,
                    apdu_type.to_string(),
                    meta,
                    &bvll_family,
                    &non_bbmd_forwarder,
                )
            }
            Err(err) => {
                return link_failure(
                    DecodeErrorKind::ApduDecode,
                    err.to_string(),
                    meta,
                    &bvll_family,
                    &non_bbmd_forwarder,
                )
            }
        };

        let (class_name, discriminators) = match self.classify_apdu(&apdu) {
            Ok(classified) => classified,
            Err(detail) => {
                return link_failure(
                    DecodeErrorKind::ApduDecode,
                    detail,
                    meta,
                    &bvll_family,
                    &non_bbmd_forwarder,
                )
            }
        };

        let mut parts = vec![class_name, lifted_source];
        parts.extend(discriminators);

        DecodeOutcome::Classified(Classified {
            family: parts.join(","),
            category: Category::ApplicationTraffic,
            meta,
            bvll_family: Some(bvll_family),
            non_bbmd_forwarder,
        })
    }

    /// Map an APDU to its class name and service discriminators.
    /// `Err` carries the decode-error detail for malformed service payloads.
    fn classify_apdu(&self, apdu: &Apdu<'_>) -> std::result::Result<(String, Vec<String>), String> {
        match apdu {
            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => {
                let choice = match UnconfirmedServiceChoice::try_from(*service_choice) {
                    Ok(choice) => choice,
                    // Services outside the table still classify, just
                    // without a service-specific name.
                    Err(_) => return Ok(("UnconfirmedRequestPDU".to_string(), Vec::new())),
                };

                let discriminators = match choice {
                    UnconfirmedServiceChoice::WhoIs => WhoIsRequest::decode(service_data)
                        .map_err(|err| err.to_string())?
                        .discriminators(),
                    UnconfirmedServiceChoice::IAm => IAmRequest::decode(service_data)
                        .map_err(|err| err.to_string())?
                        .discriminators(),
                    UnconfirmedServiceChoice::WhoHas => WhoHasRequest::decode(service_data)
                        .map_err(|err| err.to_string())?
                        .discriminators(),
                    UnconfirmedServiceChoice::IHave => IHaveRequest::decode(service_data)
                        .map_err(|err| err.to_string())?
                        .discriminators(),
                    UnconfirmedServiceChoice::UnconfirmedEventNotification => {
                        EventNotificationRequest::decode(service_data)
                            .map_err(|err| err.to_string())?
                            .discriminators()
                    }
                    UnconfirmedServiceChoice::UnconfirmedCovNotification => {
                        CovNotificationRequest::decode(service_data)
                            .map_err(|err| err.to_string())?
                            .discriminators()
                    }
                    _ => Vec::new(),
                };

                Ok((choice.request_name().to_string(), discriminators))
            }

            Apdu::ConfirmedRequest { service_choice, .. } => {
                match ConfirmedServiceChoice::try_from(*service_choice) {
                    Ok(choice) => Ok((choice.request_name().to_string(), Vec::new())),
                    Err(_) => Ok(("ConfirmedRequestPDU".to_string(), Vec::new())),
                }
            }

            Apdu::SimpleAck { .. } => Ok(("SimpleAckPDU".to_string(), Vec::new())),

            Apdu::ComplexAck { service_choice, .. } => {
                match ConfirmedServiceChoice::try_from(*service_choice) {
                    Ok(choice) => Ok((choice.ack_name(), Vec::new())),
                    Err(_) => Ok(("ComplexAckPDU".to_string(), Vec::new())),
                }
            }

            Apdu::SegmentAck { .. } => Ok(("SegmentAckPDU".to_string(), Vec::new())),

            Apdu::Error { service_choice, .. } => {
                match ConfirmedServiceChoice::try_from(*service_choice) {
                    Ok(choice) => Ok((
                        format!("{}Error", choice.request_name().trim_end_matches("Request")),
                        Vec::new(),
                    )),
                    Err(_) => Ok(("ErrorPDU".to_string(), Vec::new())),
                }
            }

            Apdu::Reject { .. } => Ok(("RejectPDU".to_string(), Vec::new())),

            Apdu::Abort { .. } => Ok(("AbortPDU".to_string(), Vec::new())),
        }
    }
}

/// Build an error outcome for a packet whose link layer decoded cleanly
fn link_failure(
    kind: DecodeErrorKind,
    detail: String,
    meta: PacketMeta,
    bvll_family: &str,
    non_bbmd_forwarder: &Option<String>,
) -> DecodeOutcome {
    DecodeOutcome::Error(DecodeFailure {
        kind,
        detail,
        meta,
        bvll_family: Some(bvll_family.to_string()),
        non_bbmd_forwarder: non_bbmd_forwarder.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SocketAddr {
        "192.0.2.10:47808".parse().unwrap()
    }

    fn bvll(function: u8, body: &[u8]) -> Vec<u8> {
        let length = (4 + body.len()) as u16;
        let mut data = vec![0x81, function, (length >> 8) as u8, (length & 0xFF) as u8];
        data.extend_from_slice(body);
        data
    }

    fn i_am_apdu(instance: u32) -> Vec<u8> {
        let object_id = ((8u32 << 22) | instance).to_be_bytes();
        let mut apdu = vec![0x10, 0x00, 0xC4];
        apdu.extend_from_slice(&object_id);
        apdu.extend_from_slice(&[0x22, 0x05, 0xC4, 0x91, 0x00, 0x21, 0x0F]);
        apdu
    }

    fn i_am_packet(instance: u32) -> Vec<u8> {
        let mut body = vec![0x01, 0x00];
        body.extend_from_slice(&i_am_apdu(instance));
        bvll(0x01, &body)
    }

    #[test]
    fn test_i_am_classification() {
        let decoder = Decoder::default();
        let outcome = decoder.decode(&i_am_packet(12345), source());
        match outcome {
            DecodeOutcome::Classified(classified) => {
                assert_eq!(classified.family, "IAmRequest,192.0.2.10,12345");
                assert_eq!(classified.category, Category::ApplicationTraffic);
                assert_eq!(
                    classified.bvll_family.as_deref(),
                    Some("OriginalBroadcastNPDU,192.0.2.10")
                );
                assert_eq!(classified.meta.protocol, "bacnet");
                assert!(classified.non_bbmd_forwarder.is_none());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_decode_is_deterministic() {
        let decoder = Decoder::default();
        let packet = i_am_packet(77);
        assert_eq!(
            decoder.decode(&packet, source()),
            decoder.decode(&packet, source())
        );
    }

    #[test]
    fn test_who_is_classification() {
        // Who-Is 100..200 broadcast
        let body = [0x01, 0x00, 0x10, 0x08, 0x09, 0x64, 0x19, 0xC8];
        let packet = bvll(0x01, &body);
        let decoder = Decoder::default();
        match decoder.decode(&packet, source()) {
            DecodeOutcome::Classified(classified) => {
                assert_eq!(classified.family, "WhoIsRequest,192.0.2.10,100,200");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_forwarded_npdu_lifts_originator() {
        let mut body = vec![203, 0, 113, 7, 0xBA, 0xC0];
        body.extend_from_slice(&[0x01, 0x00]);
        body.extend_from_slice(&i_am_apdu(42));
        let packet = bvll(0x02, &body);

        // Sender is a configured BBMD, so no alert flag.
        let decoder = Decoder::new(vec![source()]);
        match decoder.decode(&packet, source()) {
            DecodeOutcome::Classified(classified) => {
                assert_eq!(classified.family, "IAmRequest,203.0.113.7,42");
                assert_eq!(
                    classified.bvll_family.as_deref(),
                    Some("ForwardedNPDU,192.0.2.10,203.0.113.7")
                );
                assert!(classified.non_bbmd_forwarder.is_none());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_forwarded_npdu_from_non_bbmd_flagged() {
        let mut body = vec![203, 0, 113, 7, 0xBA, 0xC0];
        body.extend_from_slice(&[0x01, 0x00]);
        body.extend_from_slice(&i_am_apdu(42));
        let packet = bvll(0x02, &body);

        let decoder = Decoder::new(vec!["198.51.100.1:47808".parse().unwrap()]);
        match decoder.decode(&packet, source()) {
            DecodeOutcome::Classified(classified) => {
                assert_eq!(
                    classified.non_bbmd_forwarder.as_deref(),
                    Some("192.0.2.10")
                );
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_sadr_lifting() {
        // NPDU with SADR net 100, MAC 0x07 carrying Who-Is
        let body = vec![
            0x01, 0x08, 0x00, 0x64, 0x01, 0x07, 0x10, 0x08,
        ];
        let packet = bvll(0x00, &body);
        let decoder = Decoder::default();
        match decoder.decode(&packet, source()) {
            DecodeOutcome::Classified(classified) => {
                assert_eq!(classified.family, "WhoIsRequest,100:07,*,*");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_register_foreign_device_stops_at_bvll() {
        let packet = bvll(0x03, &[0x00, 0x3C]);
        let decoder = Decoder::default();
        match decoder.decode(&packet, source()) {
            DecodeOutcome::Classified(classified) => {
                assert_eq!(classified.family, "RegisterForeignDevice,192.0.2.10,60");
                assert_eq!(classified.category, Category::BvllTraffic);
                assert!(classified.bvll_family.is_none());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_network_message_classification() {
        // Who-Is-Router-To-Network 12
        let body = vec![0x01, 0x80, 0x00, 0x00, 0x0C];
        let packet = bvll(0x01, &body);
        let decoder = Decoder::default();
        match decoder.decode(&packet, source()) {
            DecodeOutcome::Classified(classified) => {
                assert_eq!(classified.family, "WhoIsRouterToNetwork,192.0.2.10,12");
                assert_eq!(classified.category, Category::NetworkTraffic);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_error_kinds() {
        let decoder = Decoder::default();

        let empty = decoder.decode(&[], source());
        assert!(matches!(
            empty,
            DecodeOutcome::Error(DecodeFailure {
                kind: DecodeErrorKind::Empty,
                ..
            })
        ));

        let non_bvll = decoder.decode(&[0x55, 0x01, 0x02], source());
        assert!(matches!(
            non_bvll,
            DecodeOutcome::Error(DecodeFailure {
                kind: DecodeErrorKind::NonBvll,
                ..
            })
        ));

        let unknown_function = decoder.decode(&bvll(0x0B, &[]), source());
        assert!(matches!(
            unknown_function,
            DecodeOutcome::Error(DecodeFailure {
                kind: DecodeErrorKind::UnknownBvllFunction,
                ..
            })
        ));

        let bad_version = decoder.decode(&bvll(0x00, &[0x02, 0x00, 0x10, 0x08]), source());
        match bad_version {
            DecodeOutcome::Error(failure) => {
                assert_eq!(failure.kind, DecodeErrorKind::BadVersion);
                assert_eq!(failure.detail, "not version 1 - 2");
                // the link layer decoded fine, so the BVLL family survives
                assert_eq!(
                    failure.bvll_family.as_deref(),
                    Some("OriginalUnicastNPDU,192.0.2.10")
                );
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let unknown_apdu = decoder.decode(&bvll(0x00, &[0x01, 0x00, 0x80, 0x00]), source());
        assert!(matches!(
            unknown_apdu,
            DecodeOutcome::Error(DecodeFailure {
                kind: DecodeErrorKind::UnknownApduType,
                ..
            })
        ));
    }

    #[test]
    fn test_unknown_service_still_classifies() {
        // unconfirmed request with service choice 99
        let body = vec![0x01, 0x00, 0x10, 0x63];
        let packet = bvll(0x01, &body);
        let decoder = Decoder::default();
        match decoder.decode(&packet, source()) {
            DecodeOutcome::Classified(classified) => {
                assert_eq!(classified.family, "UnconfirmedRequestPDU,192.0.2.10");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}

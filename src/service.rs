//! BACnet Service Parsers
//!
//! Service-specific decoding for the application services the monitor keys
//! on. Each parser extracts only the fields that become family-key
//! discriminators; everything else in the service payload is skipped
//! tag-by-tag.
//!
//! # Family-key discriminators
//!
//! | Service | Discriminators |
//! |---------|----------------|
//! | Who-Is | low limit, high limit |
//! | I-Am | device instance |
//! | Who-Has | object type + instance or object name |
//! | I-Have | device id, object id, object name |
//! | UnconfirmedEventNotification | event type, alarm transition |
//! | UnconfirmedCOVNotification | monitored object type + instance |
//!
//! Absent optional discriminators render as a literal `*` so keys stay
//! order-stable.

use crate::encoding::{
    decode_character_string, decode_object_identifier, decode_tag, skip_value, Result, Tag,
    TagClass,
};

/// Render a BACnet object type as its standard identifier
pub fn object_type_name(object_type: u16) -> String {
    let name = match object_type {
        0 => "analog-input",
        1 => "analog-output",
        2 => "analog-value",
        3 => "binary-input",
        4 => "binary-output",
        5 => "binary-value",
        6 => "calendar",
        7 => "command",
        8 => "device",
        9 => "event-enrollment",
        10 => "file",
        11 => "group",
        12 => "loop",
        13 => "multi-state-input",
        14 => "multi-state-output",
        15 => "notification-class",
        16 => "program",
        17 => "schedule",
        18 => "averaging",
        19 => "multi-state-value",
        20 => "trend-log",
        21 => "life-safety-point",
        22 => "life-safety-zone",
        23 => "accumulator",
        24 => "pulse-converter",
        _ => return object_type.to_string(),
    };
    name.to_string()
}

/// Render a BACnet event type as its standard identifier
pub fn event_type_name(event_type: u32) -> String {
    let name = match event_type {
        0 => "change-of-bitstring",
        1 => "change-of-state",
        2 => "change-of-value",
        3 => "command-failure",
        4 => "floating-limit",
        5 => "out-of-range",
        6 => "complex-event-type",
        8 => "change-of-life-safety",
        9 => "extended",
        10 => "buffer-ready",
        11 => "unsigned-range",
        _ => return event_type.to_string(),
    };
    name.to_string()
}

/// Render a BACnet notify type as its standard identifier
pub fn notify_type_name(notify_type: u32) -> String {
    let name = match notify_type {
        0 => "alarm",
        1 => "event",
        2 => "ack-notification",
        _ => return notify_type.to_string(),
    };
    name.to_string()
}

/// Render a BACnet event state as its standard identifier
pub fn event_state_name(event_state: u32) -> String {
    let name = match event_state {
        0 => "normal",
        1 => "fault",
        2 => "offnormal",
        3 => "high-limit",
        4 => "low-limit",
        5 => "life-safety-alarm",
        _ => return event_state.to_string(),
    };
    name.to_string()
}

fn render_object(object: &(u16, u32)) -> [String; 2] {
    [object_type_name(object.0), object.1.to_string()]
}

/// Who-Is request (unconfirmed service)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WhoIsRequest {
    /// Low limit of device instance range (optional)
    pub low_limit: Option<u32>,
    /// High limit of device instance range (optional)
    pub high_limit: Option<u32>,
}

impl WhoIsRequest {
    /// Decode a Who-Is request
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut request = WhoIsRequest::default();
        let mut pos = 0;

        // Context tag 0 - low limit; a lone low limit without the high limit
        // still classifies, the missing field renders as `*`.
        if pos < data.len() {
            if let Ok((low, consumed)) = crate::encoding::decode_context_unsigned(&data[pos..], 0)
            {
                request.low_limit = Some(low);
                pos += consumed;

                if pos < data.len() {
                    let (high, _) = crate::encoding::decode_context_unsigned(&data[pos..], 1)?;
                    request.high_limit = Some(high);
                }
            }
        }

        Ok(request)
    }

    /// Family-key discriminators: low limit, high limit
    pub fn discriminators(&self) -> Vec<String> {
        let render = |limit: Option<u32>| match limit {
            Some(limit) => limit.to_string(),
            None => "*".to_string(),
        };
        vec![render(self.low_limit), render(self.high_limit)]
    }
}

/// I-Am request (unconfirmed service)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IAmRequest {
    /// Announced device object identifier
    pub device: (u16, u32),
}

impl IAmRequest {
    /// Decode an I-Am request
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (device, _) = decode_object_identifier(data)?;
        Ok(IAmRequest { device })
    }

    /// Family-key discriminators: device instance
    pub fn discriminators(&self) -> Vec<String> {
        vec![self.device.1.to_string()]
    }
}

/// Who-Has request (unconfirmed service)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WhoHasRequest {
    /// Requested object identifier (context tag 2)
    pub object: Option<(u16, u32)>,
    /// Requested object name (context tag 3)
    pub object_name: Option<String>,
}

impl WhoHasRequest {
    /// Decode a Who-Has request
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut request = WhoHasRequest::default();
        let mut pos = 0;

        while pos < data.len() {
            let tag = decode_tag(&data[pos..])?;
            match tag.class {
                TagClass::Context(2) => {
                    let (object, consumed) =
                        crate::encoding::decode_context_object_id(&data[pos..], 2)?;
                    request.object = Some(object);
                    pos += consumed;
                }
                TagClass::Context(3) => {
                    let (name, consumed) =
                        crate::encoding::decode_context_character_string(&data[pos..], 3)?;
                    request.object_name = Some(name);
                    pos += consumed;
                }
                // device instance range limits (tags 0/1) and anything else
                _ => pos += skip_value(&data[pos..])?,
            }
        }

        Ok(request)
    }

    /// Family-key discriminators: object type + instance, object name
    pub fn discriminators(&self) -> Vec<String> {
        let mut parts = match &self.object {
            Some(object) => render_object(object).to_vec(),
            None => vec!["*".to_string()],
        };
        match &self.object_name {
            Some(name) => parts.push(name.clone()),
            None => parts.push("*".to_string()),
        }
        parts
    }
}

/// I-Have request (unconfirmed service)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IHaveRequest {
    /// Responding device object identifier
    pub device: (u16, u32),
    /// Owned object identifier
    pub object: (u16, u32),
    /// Owned object name
    pub object_name: String,
}

impl IHaveRequest {
    /// Decode an I-Have request
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut pos = 0;

        let (device, consumed) = decode_object_identifier(&data[pos..])?;
        pos += consumed;

        let (object, consumed) = decode_object_identifier(&data[pos..])?;
        pos += consumed;

        let (object_name, _) = decode_character_string(&data[pos..])?;

        Ok(IHaveRequest {
            device,
            object,
            object_name,
        })
    }

    /// Family-key discriminators: device id, object id, object name
    pub fn discriminators(&self) -> Vec<String> {
        let mut parts = render_object(&self.device).to_vec();
        parts.extend(render_object(&self.object));
        parts.push(self.object_name.clone());
        parts
    }
}

/// Unconfirmed COV notification request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CovNotificationRequest {
    /// Subscriber process identifier (context tag 0)
    pub process_id: u32,
    /// Monitored object identifier (context tag 2)
    pub monitored_object: (u16, u32),
}

impl CovNotificationRequest {
    /// Decode an unconfirmed COV notification
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut pos = 0;

        let (process_id, consumed) = crate::encoding::decode_context_unsigned(&data[pos..], 0)?;
        pos += consumed;

        // initiating device (tag 1)
        pos += skip_value(&data[pos..])?;

        let (monitored_object, _) = crate::encoding::decode_context_object_id(&data[pos..], 2)?;

        Ok(CovNotificationRequest {
            process_id,
            monitored_object,
        })
    }

    /// Family-key discriminators: monitored object type + instance
    pub fn discriminators(&self) -> Vec<String> {
        render_object(&self.monitored_object).to_vec()
    }
}

/// Unconfirmed event notification request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventNotificationRequest {
    /// Event type (context tag 6)
    pub event_type: u32,
    /// Notify type (context tag 8)
    pub notify_type: u32,
    /// Transition origin state (context tag 10, optional)
    pub from_state: Option<u32>,
    /// Transition target state (context tag 11, optional)
    pub to_state: Option<u32>,
}

impl EventNotificationRequest {
    /// Decode an unconfirmed event notification
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut request = EventNotificationRequest::default();
        let mut pos = 0;
        let mut seen_event_type = false;

        while pos < data.len() {
            let tag: Tag = decode_tag(&data[pos..])?;
            match tag.class {
                TagClass::Context(6) => {
                    let (value, consumed) =
                        crate::encoding::decode_context_enumerated(&data[pos..], 6)?;
                    request.event_type = value;
                    seen_event_type = true;
                    pos += consumed;
                }
                TagClass::Context(8) => {
                    let (value, consumed) =
                        crate::encoding::decode_context_enumerated(&data[pos..], 8)?;
                    request.notify_type = value;
                    pos += consumed;
                }
                TagClass::Context(10) => {
                    let (value, consumed) =
                        crate::encoding::decode_context_enumerated(&data[pos..], 10)?;
                    request.from_state = Some(value);
                    pos += consumed;
                }
                TagClass::Context(11) => {
                    let (value, consumed) =
                        crate::encoding::decode_context_enumerated(&data[pos..], 11)?;
                    request.to_state = Some(value);
                    pos += consumed;
                }
                _ => pos += skip_value(&data[pos..])?,
            }
        }

        if !seen_event_type {
            return Err(crate::encoding::EncodingError::InvalidFormat(
                "event notification without event type".to_string(),
            ));
        }

        Ok(request)
    }

    /// Family-key discriminators: event type, plus the full alarm transition
    /// for alarm notifications and change-of-state events
    pub fn discriminators(&self) -> Vec<String> {
        let event = event_type_name(self.event_type);
        let notify = notify_type_name(self.notify_type);
        let mut parts = vec![event.clone()];

        if notify == "alarm" || event == "change-of-state" {
            let state = |value: Option<u32>| match value {
                Some(value) => event_state_name(value),
                None => "*".to_string(),
            };
            parts.push(notify);
            parts.push(event);
            parts.push(state(self.from_state));
            parts.push(state(self.to_state));
        }

        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_id_bytes(object_type: u16, instance: u32) -> [u8; 4] {
        (((object_type as u32) << 22) | instance).to_be_bytes()
    }

    #[test]
    fn test_who_is_range() {
        // context 0 = 100, context 1 = 200
        let data = [0x09, 0x64, 0x19, 0xC8];
        let request = WhoIsRequest::decode(&data).unwrap();
        assert_eq!(request.low_limit, Some(100));
        assert_eq!(request.high_limit, Some(200));
        assert_eq!(request.discriminators(), vec!["100", "200"]);
    }

    #[test]
    fn test_who_is_unbounded() {
        let request = WhoIsRequest::decode(&[]).unwrap();
        assert_eq!(request.discriminators(), vec!["*", "*"]);
    }

    #[test]
    fn test_i_am() {
        let id = object_id_bytes(8, 12345);
        let mut data = vec![0xC4];
        data.extend_from_slice(&id);
        // max APDU, segmentation, vendor id
        data.extend_from_slice(&[0x22, 0x05, 0xC4, 0x91, 0x00, 0x21, 0x0F]);
        let request = IAmRequest::decode(&data).unwrap();
        assert_eq!(request.device, (8, 12345));
        assert_eq!(request.discriminators(), vec!["12345"]);
    }

    #[test]
    fn test_who_has_by_name() {
        // context 3 character string "PUMP-1"
        let mut data = vec![0x3D, 0x07, 0x00];
        data.extend_from_slice(b"PUMP-1");
        let request = WhoHasRequest::decode(&data).unwrap();
        assert_eq!(request.object_name.as_deref(), Some("PUMP-1"));
        assert_eq!(request.discriminators(), vec!["*", "PUMP-1"]);
    }

    #[test]
    fn test_who_has_by_object() {
        let id = object_id_bytes(0, 7);
        let data = [0x2C, id[0], id[1], id[2], id[3]];
        let request = WhoHasRequest::decode(&data).unwrap();
        assert_eq!(
            request.discriminators(),
            vec!["analog-input", "7", "*"]
        );
    }

    #[test]
    fn test_i_have() {
        let device = object_id_bytes(8, 1);
        let object = object_id_bytes(2, 9);
        let mut data = vec![0xC4];
        data.extend_from_slice(&device);
        data.push(0xC4);
        data.extend_from_slice(&object);
        data.extend_from_slice(&[0x75, 0x05, 0x00]);
        data.extend_from_slice(b"ZONE");
        let request = IHaveRequest::decode(&data).unwrap();
        assert_eq!(
            request.discriminators(),
            vec!["device", "1", "analog-value", "9", "ZONE"]
        );
    }

    #[test]
    fn test_cov_notification() {
        let id = object_id_bytes(8, 5);
        let monitored = object_id_bytes(0, 33);
        let mut data = vec![0x09, 0x01];
        data.push(0x1C);
        data.extend_from_slice(&id);
        data.push(0x2C);
        data.extend_from_slice(&monitored);
        // time remaining (tag 3) and list of values would follow; not needed
        let request = CovNotificationRequest::decode(&data).unwrap();
        assert_eq!(request.discriminators(), vec!["analog-input", "33"]);
    }

    #[test]
    fn test_event_notification_alarm_transition() {
        let device = object_id_bytes(8, 5);
        let object = object_id_bytes(3, 2);
        let mut data = vec![0x09, 0x01];
        data.push(0x1C);
        data.extend_from_slice(&device);
        data.push(0x2C);
        data.extend_from_slice(&object);
        // timestamp (constructed, tag 3)
        data.extend_from_slice(&[0x3E, 0x21, 0x00, 0x3F]);
        // notification class 4, priority 5
        data.extend_from_slice(&[0x49, 0x01, 0x59, 0x08]);
        // event type change-of-state, notify type alarm
        data.extend_from_slice(&[0x69, 0x01, 0x89, 0x00]);
        // from normal to offnormal
        data.extend_from_slice(&[0xA9, 0x00, 0xB9, 0x02]);

        let request = EventNotificationRequest::decode(&data).unwrap();
        assert_eq!(
            request.discriminators(),
            vec![
                "change-of-state",
                "alarm",
                "change-of-state",
                "normal",
                "offnormal"
            ]
        );
    }

    #[test]
    fn test_event_notification_plain_event() {
        // event type out-of-range, notify type event: only the event type
        let data = [0x69, 0x05, 0x89, 0x01];
        let request = EventNotificationRequest::decode(&data).unwrap();
        assert_eq!(request.discriminators(), vec!["out-of-range"]);
    }

    #[test]
    fn test_object_type_names() {
        assert_eq!(object_type_name(0), "analog-input");
        assert_eq!(object_type_name(8), "device");
        assert_eq!(object_type_name(999), "999");
    }
}

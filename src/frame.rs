//! Frames exchanged with the radio transport.
//!
//! The transport hands us JSON objects shaped like the radio's API frames.
//! They are validated once here and turned into [`InboundFrame`], so the rest
//! of the gateway never sees a frame with missing per-kind fields.

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::{AddressError, HardwareAddress};

pub const NODE_IDENTIFICATION: u8 = 0x95;
pub const REMOTE_COMMAND_RESPONSE: u8 = 0x97;
pub const AT_COMMAND_RESPONSE: u8 = 0x88;
pub const IO_DATA_SAMPLE_RX: u8 = 0x92;
pub const TRANSMIT_STATUS: u8 = 0x8B;
pub const REMOTE_AT_COMMAND_REQUEST: u8 = 0x17;

/// Pin mode / level parameters for `Dn` commands.
pub const PIN_ANALOG_INPUT: u8 = 0x02;
pub const PIN_DIGITAL_INPUT: u8 = 0x03;
pub const PIN_OUTPUT_LOW: u8 = 0x04;
pub const PIN_OUTPUT_HIGH: u8 = 0x05;

/// Node identifier query, also used as the availability probe.
pub const NODE_IDENTIFIER: &str = "NI";
pub const APPLY_CHANGES: &str = "AC";
pub const PULL_UP: &str = "PR";
pub const CHANGE_DETECTION: &str = "IC";
pub const SAMPLE_RATE: &str = "IR";

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame type 0x{frame_type:02X} is missing field `{field}`")]
    MissingField {
        frame_type: u8,
        field: &'static str,
    },
    #[error("invalid source address: {0}")]
    Address(#[from] AddressError),
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Frame as delivered by the transport, before validation.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFrame {
    #[serde(rename = "type")]
    pub frame_type: u8,
    pub id: Option<u8>,
    pub remote64: Option<String>,
    pub command: Option<String>,
    pub command_status: Option<u8>,
    pub command_data: Option<Vec<u8>>,
    pub node_identifier: Option<String>,
    pub digital_samples: Option<BTreeMap<String, u8>>,
    pub analog_samples: Option<BTreeMap<String, u16>>,
    pub delivery_status: Option<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IoSample {
    pub source: HardwareAddress,
    pub digital: BTreeMap<String, u8>,
    pub analog: BTreeMap<String, u16>,
}

impl IoSample {
    /// First digital level found under any of `names`.
    pub fn digital_any(&self, names: &[String]) -> Option<u8> {
        names.iter().find_map(|n| self.digital.get(n).copied())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommandResponse {
    /// `None` for responses from the locally attached radio.
    pub source: Option<HardwareAddress>,
    pub frame_id: Option<u8>,
    pub command: String,
    pub status: u8,
    pub data: Vec<u8>,
}

impl CommandResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 0
    }

    /// Command data decoded as text, as returned by `NI`.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data)
            .trim_end_matches('\0')
            .trim()
            .to_string()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    Join {
        source: HardwareAddress,
        node_identifier: Option<String>,
    },
    CommandResponse(CommandResponse),
    IoSample(IoSample),
    TransmitStatus {
        frame_id: Option<u8>,
        delivery_status: u8,
    },
    Other {
        frame_type: u8,
    },
}

impl InboundFrame {
    pub fn from_json(line: &str) -> Result<Self, FrameError> {
        let raw: RawFrame = serde_json::from_str(line)?;
        InboundFrame::try_from(raw)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundFrame::Join { .. } => "join",
            InboundFrame::CommandResponse(_) => "command-response",
            InboundFrame::IoSample(_) => "io-sample",
            InboundFrame::TransmitStatus { .. } => "transmit-status",
            InboundFrame::Other { .. } => "other",
        }
    }
}

fn source(raw: &RawFrame) -> Result<HardwareAddress, FrameError> {
    let text = raw.remote64.as_deref().ok_or(FrameError::MissingField {
        frame_type: raw.frame_type,
        field: "remote64",
    })?;
    Ok(text.parse()?)
}

impl TryFrom<RawFrame> for InboundFrame {
    type Error = FrameError;

    fn try_from(raw: RawFrame) -> Result<Self, Self::Error> {
        let frame = match raw.frame_type {
            NODE_IDENTIFICATION => InboundFrame::Join {
                source: source(&raw)?,
                node_identifier: raw.node_identifier.filter(|n| !n.trim().is_empty()),
            },
            REMOTE_COMMAND_RESPONSE | AT_COMMAND_RESPONSE => {
                let source = if raw.frame_type == REMOTE_COMMAND_RESPONSE {
                    Some(source(&raw)?)
                } else {
                    None
                };
                let command = raw.command.ok_or(FrameError::MissingField {
                    frame_type: raw.frame_type,
                    field: "command",
                })?;
                InboundFrame::CommandResponse(CommandResponse {
                    source,
                    frame_id: raw.id,
                    command: command.to_uppercase(),
                    status: raw.command_status.unwrap_or(0),
                    data: raw.command_data.unwrap_or_default(),
                })
            }
            IO_DATA_SAMPLE_RX => {
                let source = source(&raw)?;
                if raw.digital_samples.is_none() && raw.analog_samples.is_none() {
                    return Err(FrameError::MissingField {
                        frame_type: raw.frame_type,
                        field: "digitalSamples/analogSamples",
                    });
                }
                InboundFrame::IoSample(IoSample {
                    source,
                    digital: raw.digital_samples.unwrap_or_default(),
                    analog: raw.analog_samples.unwrap_or_default(),
                })
            }
            TRANSMIT_STATUS => InboundFrame::TransmitStatus {
                frame_id: raw.id,
                delivery_status: raw.delivery_status.ok_or(FrameError::MissingField {
                    frame_type: raw.frame_type,
                    field: "deliveryStatus",
                })?,
            },
            other => InboundFrame::Other { frame_type: other },
        };
        Ok(frame)
    }
}

/// Remote AT command addressed to one module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundFrame {
    pub destination: HardwareAddress,
    pub command: String,
    pub parameter: Vec<u8>,
}

impl OutboundFrame {
    pub fn at(destination: HardwareAddress, command: &str, parameter: Vec<u8>) -> Self {
        OutboundFrame {
            destination,
            command: command.to_uppercase(),
            parameter,
        }
    }

    pub fn query(destination: HardwareAddress, command: &str) -> Self {
        Self::at(destination, command, Vec::new())
    }

    /// Drive a digital output pin high or low.
    pub fn pin_level(destination: HardwareAddress, pin: &str, high: bool) -> Self {
        let level = if high { PIN_OUTPUT_HIGH } else { PIN_OUTPUT_LOW };
        Self::at(destination, pin, vec![level])
    }

    pub fn to_wire(&self, frame_id: u8) -> WireFrame<'_> {
        WireFrame {
            frame_type: REMOTE_AT_COMMAND_REQUEST,
            id: frame_id,
            destination64: self.destination.to_string(),
            command: &self.command,
            command_parameter: &self.parameter,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireFrame<'a> {
    #[serde(rename = "type")]
    pub frame_type: u8,
    pub id: u8,
    pub destination64: String,
    pub command: &'a str,
    pub command_parameter: &'a [u8],
}

/// Digital input names a sample may report for an AT pin, `D0` -> `DIO0`, `D0`.
pub fn sample_names(pin: &str) -> Vec<String> {
    let pin = pin.to_uppercase();
    match pin.strip_prefix('D') {
        Some(n) if !n.starts_with("IO") => vec![format!("DIO{n}"), pin.clone()],
        _ => match pin.strip_prefix("DIO") {
            Some(n) => vec![pin.clone(), format!("D{n}")],
            None => vec![pin],
        },
    }
}

/// AT pin that configures an analog channel, `AD2` -> `D2`.
pub fn analog_pin(channel: &str) -> Option<String> {
    channel
        .to_uppercase()
        .strip_prefix("AD")
        .filter(|n| !n.is_empty())
        .map(|n| format!("D{n}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_sample_frame() {
        let frame = InboundFrame::from_json(
            r#"{"type":146,"remote64":"0013a20041fb6063","digitalSamples":{"DIO0":1},"analogSamples":{"AD0":512}}"#,
        )
        .unwrap();
        match frame {
            InboundFrame::IoSample(sample) => {
                assert_eq!(sample.source.to_string(), "0013A20041FB6063");
                assert_eq!(sample.digital_any(&sample_names("D0")), Some(1));
                assert_eq!(sample.analog.get("AD0"), Some(&512));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_io_sample_without_samples_is_rejected() {
        let err = InboundFrame::from_json(r#"{"type":146,"remote64":"0013a20041fb6063"}"#)
            .unwrap_err();
        assert!(matches!(err, FrameError::MissingField { .. }));
    }

    #[test]
    fn test_remote_response_requires_source() {
        let err = InboundFrame::from_json(r#"{"type":151,"command":"NI"}"#).unwrap_err();
        assert!(matches!(
            err,
            FrameError::MissingField {
                field: "remote64",
                ..
            }
        ));
    }

    #[test]
    fn test_node_identifier_text() {
        let frame = InboundFrame::from_json(
            r#"{"type":151,"remote64":"0013A20041FB6063","command":"ni","commandStatus":0,"commandData":[84,65,66,76,69,32,50,0]}"#,
        )
        .unwrap();
        let InboundFrame::CommandResponse(resp) = frame else {
            panic!("expected a command response");
        };
        assert!(resp.is_ok());
        assert_eq!(resp.command, "NI");
        assert_eq!(resp.text(), "TABLE 2");
    }

    #[test]
    fn test_unknown_type_is_other() {
        let frame = InboundFrame::from_json(r#"{"type":144}"#).unwrap();
        assert_eq!(frame, InboundFrame::Other { frame_type: 0x90 });
    }

    #[test]
    fn test_wire_frame_shape() {
        let frame = OutboundFrame::pin_level(HardwareAddress::new(0x0013_A200_41FB_6063), "d2", true);
        let json = serde_json::to_value(frame.to_wire(7)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": 23,
                "id": 7,
                "destination64": "0013A20041FB6063",
                "command": "D2",
                "commandParameter": [5],
            })
        );
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(sample_names("D0"), vec!["DIO0".to_string(), "D0".to_string()]);
        assert_eq!(sample_names("DIO3"), vec!["DIO3".to_string(), "D3".to_string()]);
        assert_eq!(analog_pin("ad2"), Some("D2".to_string()));
        assert_eq!(analog_pin("DIO1"), None);
    }
}

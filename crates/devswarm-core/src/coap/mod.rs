//! A minimal RFC 7252-flavored message layer: just enough of CoAP's wire
//! format to carry the handful of verbs the device protocol actually uses
//! (hello, describe, function call, variable read, events, ping) over the
//! already-framed, already-decrypted byte stream. Not a general CoAP
//! implementation — no blockwise transfer, no observe, no non-Uri-Path
//! options.

use crate::error::{DeviceError, Result};

/// CoAP message type, from the low two bits of the second header nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoapType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl CoapType {
    fn to_bits(self) -> u8 {
        match self {
            CoapType::Confirmable => 0,
            CoapType::NonConfirmable => 1,
            CoapType::Acknowledgement => 2,
            CoapType::Reset => 3,
        }
    }

    fn from_bits(bits: u8) -> Result<Self> {
        Ok(match bits {
            0 => CoapType::Confirmable,
            1 => CoapType::NonConfirmable,
            2 => CoapType::Acknowledgement,
            3 => CoapType::Reset,
            other => return Err(DeviceError::MalformedPacket(format!("bad coap type bits {other}"))),
        })
    }
}

pub mod code {
    pub const EMPTY: u8 = 0x00;
    pub const GET: u8 = 0x01;
    pub const POST: u8 = 0x02;
    pub const CONTENT: u8 = 0x45; // 2.05
    pub const CHANGED: u8 = 0x44; // 2.04
}

const OPTION_URI_PATH: u16 = 11;
const VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapMessage {
    pub msg_type: CoapType,
    pub code: u8,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub uri_path: Vec<String>,
    pub payload: Vec<u8>,
}

impl CoapMessage {
    pub fn new(msg_type: CoapType, code: u8, message_id: u16) -> Self {
        Self {
            msg_type,
            code,
            message_id,
            token: Vec::new(),
            uri_path: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn with_token(mut self, token: Vec<u8>) -> Self {
        self.token = token;
        self
    }

    pub fn with_uri_path(mut self, path: &str) -> Self {
        self.uri_path = path.split('/').filter(|s| !s.is_empty()).map(str::to_owned).collect();
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn uri_path_str(&self) -> String {
        self.uri_path.join("/")
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.token.len() > 8 {
            return Err(DeviceError::MalformedPacket("token longer than 8 bytes".into()));
        }
        let mut out = Vec::new();
        out.push((VERSION << 6) | (self.msg_type.to_bits() << 4) | self.token.len() as u8);
        out.push(self.code);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.token);

        let mut prev_option = 0u16;
        for segment in &self.uri_path {
            let delta = OPTION_URI_PATH - prev_option;
            prev_option = OPTION_URI_PATH;
            encode_option(&mut out, delta, segment.as_bytes())?;
        }

        if !self.payload.is_empty() {
            out.push(0xFF);
            out.extend_from_slice(&self.payload);
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(DeviceError::MalformedPacket("coap message shorter than header".into()));
        }
        let version = bytes[0] >> 6;
        if version != VERSION {
            return Err(DeviceError::MalformedPacket(format!("unsupported coap version {version}")));
        }
        let msg_type = CoapType::from_bits((bytes[0] >> 4) & 0x03)?;
        let token_len = (bytes[0] & 0x0F) as usize;
        let code = bytes[1];
        let message_id = u16::from_be_bytes([bytes[2], bytes[3]]);

        let mut cursor = 4usize;
        if bytes.len() < cursor + token_len {
            return Err(DeviceError::MalformedPacket("coap token truncated".into()));
        }
        let token = bytes[cursor..cursor + token_len].to_vec();
        cursor += token_len;

        let mut uri_path = Vec::new();
        let mut running_option = 0u16;
        while cursor < bytes.len() {
            if bytes[cursor] == 0xFF {
                cursor += 1;
                break;
            }
            let (delta, len, consumed) = decode_option_header(&bytes[cursor..])?;
            cursor += consumed;
            if bytes.len() < cursor + len {
                return Err(DeviceError::MalformedPacket("coap option value truncated".into()));
            }
            running_option += delta;
            if running_option == OPTION_URI_PATH {
                let segment = String::from_utf8(bytes[cursor..cursor + len].to_vec())
                    .map_err(|e| DeviceError::MalformedPacket(format!("non-utf8 uri-path segment: {e}")))?;
                uri_path.push(segment);
            }
            cursor += len;
        }
        let payload = bytes[cursor..].to_vec();

        Ok(CoapMessage { msg_type, code, message_id, token, uri_path, payload })
    }
}

fn encode_option(out: &mut Vec<u8>, delta: u16, value: &[u8]) -> Result<()> {
    if delta > 12 || value.len() > 12 {
        return Err(DeviceError::MalformedPacket(
            "option delta/length outside the single-nibble range this codec supports".into(),
        ));
    }
    out.push(((delta as u8) << 4) | value.len() as u8);
    out.extend_from_slice(value);
    Ok(())
}

fn decode_option_header(bytes: &[u8]) -> Result<(u16, usize, usize)> {
    if bytes.is_empty() {
        return Err(DeviceError::MalformedPacket("truncated coap option header".into()));
    }
    let delta_nibble = bytes[0] >> 4;
    let len_nibble = bytes[0] & 0x0F;
    if delta_nibble >= 13 || len_nibble >= 13 {
        return Err(DeviceError::MalformedPacket(
            "extended option delta/length not supported".into(),
        ));
    }
    Ok((delta_nibble as u16, len_nibble as usize, 1))
}

/// Flag value meaning "describe everything" when the Describe request's
/// flag byte (payload[8]) is absent or out of the valid 0..=3 range.
pub const DESCRIBE_ALL: u8 = 0b11;

/// Parses the optional single flag byte out of a Describe request
/// payload, falling back to [`DESCRIBE_ALL`] when it is missing or
/// invalid.
pub fn describe_flag(payload: &[u8]) -> u8 {
    match payload.get(8) {
        Some(&flag) if flag <= 3 => flag,
        _ => DESCRIBE_ALL,
    }
}

/// Builds the 22-byte Hello payload: a 10-byte fixed header (product id,
/// firmware version, two reserved bytes, platform id, device-id length)
/// followed by the 12-byte device id.
pub fn hello_payload(product_id: u16, firmware_version: u16, platform_id: u16, device_id: &[u8; 12]) -> Vec<u8> {
    let mut out = Vec::with_capacity(22);
    out.extend_from_slice(&product_id.to_be_bytes());
    out.extend_from_slice(&firmware_version.to_be_bytes());
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&platform_id.to_be_bytes());
    out.extend_from_slice(&(device_id.len() as u16).to_be_bytes());
    out.extend_from_slice(device_id);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip_with_uri_path_and_payload() {
        let msg = CoapMessage::new(CoapType::Confirmable, code::POST, 7)
            .with_token(vec![1, 2, 3])
            .with_uri_path("h")
            .with_payload(vec![9, 9, 9]);
        let bytes = msg.encode().unwrap();
        let decoded = CoapMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn encode_decode_empty_message_no_options_no_payload() {
        let msg = CoapMessage::new(CoapType::Acknowledgement, code::EMPTY, 42);
        let bytes = msg.encode().unwrap();
        let decoded = CoapMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn multi_segment_uri_path_round_trips() {
        let msg = CoapMessage::new(CoapType::NonConfirmable, code::POST, 1).with_uri_path("e/motion/triggered");
        let bytes = msg.encode().unwrap();
        let decoded = CoapMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.uri_path, vec!["e", "motion", "triggered"]);
    }

    #[test]
    fn hello_payload_is_22_bytes_with_device_id_tail() {
        let device_id = [0xABu8; 12];
        let payload = hello_payload(1, 2, 3, &device_id);
        assert_eq!(payload.len(), 22);
        assert_eq!(&payload[10..], &device_id);
    }

    #[test]
    fn describe_flag_defaults_when_out_of_range_or_missing() {
        assert_eq!(describe_flag(&[0; 5]), DESCRIBE_ALL);
        let mut payload = vec![0u8; 9];
        payload[8] = 7;
        assert_eq!(describe_flag(&payload), DESCRIBE_ALL);
        payload[8] = 2;
        assert_eq!(describe_flag(&payload), 2);
    }
}

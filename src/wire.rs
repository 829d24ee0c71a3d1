//! Tunnel wire protocol.
//!
//! Every frame on the WebSocket is a binary message: four bytes of
//! big-endian request id followed by an HTTP/1.1 message in standard wire
//! form. The WebSocket message boundary delimits the payload, so bodies run
//! to the end of the frame. Registration is the one exception: the first
//! message after connect is a JSON text message.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const FRAME_ID_LEN: usize = 4;
const MAX_HEADERS: usize = 64;

/// First message sent after the WebSocket connects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub token: String,
    pub subdomain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ttl: String,
}

/// Server reply to a registration. A non-OK reply is terminal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub ok: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub subdomain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

pub fn encode_frame(request_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_ID_LEN + payload.len());
    frame.extend_from_slice(&request_id.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub fn decode_frame(frame: &[u8]) -> Result<(u32, &[u8])> {
    if frame.len() < FRAME_ID_LEN {
        return Err(Error::TunnelTransport(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }
    let request_id = u32::from_be_bytes(
        frame[..FRAME_ID_LEN]
            .try_into()
            .expect("slice is four bytes"),
    );
    Ok((request_id, &frame[FRAME_ID_LEN..]))
}

/// An HTTP request in transit through the tunnel, preserved byte-for-byte
/// between serialization and parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRequest {
    pub method: String,
    /// Request target as it appeared on the request line (path + query).
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl WireRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", self.method, self.uri).as_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<WireRequest> {
        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut header_storage);

        let body_start = match parsed
            .parse(data)
            .map_err(|e| Error::TunnelTransport(format!("parsing request: {e}")))?
        {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => {
                return Err(Error::TunnelTransport("truncated request".to_owned()))
            }
        };

        Ok(WireRequest {
            method: parsed
                .method
                .ok_or_else(|| Error::TunnelTransport("request without method".to_owned()))?
                .to_owned(),
            uri: parsed
                .path
                .ok_or_else(|| Error::TunnelTransport("request without target".to_owned()))?
                .to_owned(),
            headers: convert_headers(parsed.headers)?,
            body: data[body_start..].to_vec(),
        })
    }

    /// Path component of the request target, without the query string.
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or(&self.uri)
    }
}

impl WireResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<WireResponse> {
        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut header_storage);

        let body_start = match parsed
            .parse(data)
            .map_err(|e| Error::TunnelTransport(format!("parsing response: {e}")))?
        {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => {
                return Err(Error::TunnelTransport("truncated response".to_owned()))
            }
        };

        Ok(WireResponse {
            status: parsed
                .code
                .ok_or_else(|| Error::TunnelTransport("response without status".to_owned()))?,
            reason: parsed.reason.unwrap_or("").to_owned(),
            headers: convert_headers(parsed.headers)?,
            body: data[body_start..].to_vec(),
        })
    }
}

fn convert_headers(headers: &[httparse::Header<'_>]) -> Result<Vec<(String, String)>> {
    headers
        .iter()
        .map(|h| {
            let value = std::str::from_utf8(h.value)
                .map_err(|_| Error::TunnelTransport(format!("header {} is not UTF-8", h.name)))?;
            Ok((h.name.to_owned(), value.to_owned()))
        })
        .collect()
}

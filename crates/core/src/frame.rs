use crate::error::DecodeError;
use log::debug;
use serde_json::{Map, Value};

/// Opaque inbound payload as delivered by an ingress adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
}

impl Frame {
    /// Binary frames are transcoded lossily; invalid UTF-8 becomes U+FFFD.
    pub fn into_text(self) -> String {
        match self {
            Frame::Text(text) => text,
            Frame::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
            },
        }
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Frame::Text(text)
    }
}

impl From<Vec<u8>> for Frame {
    fn from(bytes: Vec<u8>) -> Self {
        Frame::Binary(bytes)
    }
}

/// A decoded structured message: category name to raw category payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope(Map<String, Value>);

impl Envelope {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Text that was not classified as an envelope. `error` is set when the
/// structured pre-filter matched but the parse itself failed.
#[derive(Debug)]
pub struct RawText {
    pub text: String,
    pub error: Option<DecodeError>,
}

#[derive(Debug)]
pub enum Decoded {
    Envelope(Envelope),
    RawText(RawText),
}

impl Decoded {
    pub fn is_envelope(&self) -> bool {
        matches!(self, Decoded::Envelope(_))
    }
}

const STRUCTURED_CLOSING_MARKER: char = '}';

/// Classifies a frame. Structured parsing is only attempted when the text
/// ends with `}`; this is a cheap pre-filter, not protocol framing, so an
/// otherwise valid object with trailing whitespace comes back as raw text.
pub fn decode_frame(frame: Frame) -> Decoded {
    let text = frame.into_text();
    if !text.ends_with(STRUCTURED_CLOSING_MARKER) {
        return Decoded::RawText(RawText { text, error: None });
    }

    match serde_json::from_str::<Map<String, Value>>(&text) {
        Ok(fields) => Decoded::Envelope(Envelope::new(fields)),
        Err(err) => {
            debug!("frame ends like structured data but did not parse: {}", err);
            Decoded::RawText(RawText {
                text,
                error: Some(DecodeError::Parse(err)),
            })
        }
    }
}

//! Frame model for the out-of-process wire protocol.
//!
//! Every frame is exactly one line of text: a single self-contained
//! pseudo-XML element. `Data` carries a `Stream` tag and a base64 body;
//! the other seven kinds are bare elements with only a `PSGuid` attribute.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The correlation id reserved for the session itself. Never a real command.
pub const SESSION_GUID: Uuid = Uuid::nil();

/// Lines on the inbound channel starting with this marker carry out-of-band
/// diagnostic text from the peer, not protocol frames.
pub const ERROR_PREFIX: &str = "__RemoteError:";

/// Priority/stream tag carried by Data frames.
///
/// `PromptResponse` outranks `Default` in the send queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamTag {
    Default,
    PromptResponse,
}

impl StreamTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "Default",
            Self::PromptResponse => "PromptResponse",
        }
    }

    fn parse(s: &str) -> Result<Self, FrameError> {
        match s {
            "Default" => Ok(Self::Default),
            "PromptResponse" => Ok(Self::PromptResponse),
            other => Err(FrameError::BadStream(other.to_string())),
        }
    }
}

impl std::fmt::Display for StreamTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame kind, mostly for diagnostics and error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    DataAck,
    Command,
    CommandAck,
    Close,
    CloseAck,
    Signal,
    SignalAck,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Data => "Data",
            Self::DataAck => "DataAck",
            Self::Command => "Command",
            Self::CommandAck => "CommandAck",
            Self::Close => "Close",
            Self::CloseAck => "CloseAck",
            Self::Signal => "Signal",
            Self::SignalAck => "SignalAck",
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of wire protocol.
///
/// The GUID correlates a frame with either the session ([`SESSION_GUID`])
/// or one specific command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream: StreamTag,
        guid: Uuid,
        payload: Vec<u8>,
    },
    DataAck { guid: Uuid },
    Command { guid: Uuid },
    CommandAck { guid: Uuid },
    Close { guid: Uuid },
    CloseAck { guid: Uuid },
    Signal { guid: Uuid },
    SignalAck { guid: Uuid },
}

/// A framing rule violation. Fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unknown element '{0}'")]
    UnknownElement(String),

    #[error("element '{element}' has {found} attributes, expected {expected}")]
    AttributeCount {
        element: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("element '{element}' is missing the '{attribute}' attribute")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },

    #[error("Data element has no payload text")]
    MissingPayload,

    #[error("unexpected content outside a protocol element: {0}")]
    UnexpectedContent(String),

    #[error("malformed element: {0}")]
    Malformed(String),

    #[error("invalid PSGuid value: {0}")]
    BadGuid(#[from] uuid::Error),

    #[error("invalid base64 payload: {0}")]
    BadPayload(#[from] base64::DecodeError),

    #[error("unknown stream tag '{0}'")]
    BadStream(String),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Data { .. } => FrameKind::Data,
            Self::DataAck { .. } => FrameKind::DataAck,
            Self::Command { .. } => FrameKind::Command,
            Self::CommandAck { .. } => FrameKind::CommandAck,
            Self::Close { .. } => FrameKind::Close,
            Self::CloseAck { .. } => FrameKind::CloseAck,
            Self::Signal { .. } => FrameKind::Signal,
            Self::SignalAck { .. } => FrameKind::SignalAck,
        }
    }

    pub fn guid(&self) -> Uuid {
        match self {
            Self::Data { guid, .. }
            | Self::DataAck { guid }
            | Self::Command { guid }
            | Self::CommandAck { guid }
            | Self::Close { guid }
            | Self::CloseAck { guid }
            | Self::Signal { guid }
            | Self::SignalAck { guid } => *guid,
        }
    }

    /// True if the frame addresses the session rather than a command.
    pub fn is_session_scoped(&self) -> bool {
        self.guid() == SESSION_GUID
    }

    /// Encode as a single line, without the trailing newline.
    pub fn encode(&self) -> String {
        match self {
            Self::Data {
                stream,
                guid,
                payload,
            } => format!(
                "<Data Stream=\"{}\" PSGuid=\"{}\">{}</Data>",
                stream,
                guid,
                BASE64.encode(payload)
            ),
            other => format!("<{} PSGuid=\"{}\" />", other.kind(), other.guid()),
        }
    }

    /// Decode one line into a frame.
    ///
    /// Returns `Ok(None)` for ignorable content (blank lines, XML comments,
    /// processing instructions). Anything else that is not a well-formed
    /// protocol element is a [`FrameError`].
    pub fn parse(line: &str) -> Result<Option<Frame>, FrameError> {
        let s = line.trim();
        if s.is_empty() {
            return Ok(None);
        }
        if s.starts_with("<?") && s.ends_with("?>") {
            return Ok(None);
        }
        if s.starts_with("<!--") && s.ends_with("-->") {
            return Ok(None);
        }
        if !s.starts_with('<') || s.starts_with("</") {
            return Err(FrameError::UnexpectedContent(truncate_for_error(s)));
        }

        let element = parse_element(s)?;
        Self::from_element(element)
    }

    fn from_element(el: Element) -> Result<Option<Frame>, FrameError> {
        match el.name.as_str() {
            "Data" => {
                if el.attributes.len() != 2 {
                    return Err(FrameError::AttributeCount {
                        element: "Data",
                        expected: 2,
                        found: el.attributes.len(),
                    });
                }
                let stream = StreamTag::parse(el.attribute("Stream").ok_or(
                    FrameError::MissingAttribute {
                        element: "Data",
                        attribute: "Stream",
                    },
                )?)?;
                let guid = parse_guid(&el, "Data")?;
                // The node immediately following the start tag must be the
                // base64 body text; a self-closing Data element is a
                // protocol error. A zero-length payload encodes as an
                // empty body between tags.
                let body = el.body.ok_or(FrameError::MissingPayload)?;
                let payload = BASE64.decode(body.as_bytes())?;
                Ok(Some(Frame::Data {
                    stream,
                    guid,
                    payload,
                }))
            }
            name @ ("DataAck" | "Command" | "CommandAck" | "Close" | "CloseAck" | "Signal"
            | "SignalAck") => {
                let element = match name {
                    "DataAck" => "DataAck",
                    "Command" => "Command",
                    "CommandAck" => "CommandAck",
                    "Close" => "Close",
                    "CloseAck" => "CloseAck",
                    "Signal" => "Signal",
                    _ => "SignalAck",
                };
                if el.attributes.len() != 1 {
                    return Err(FrameError::AttributeCount {
                        element,
                        expected: 1,
                        found: el.attributes.len(),
                    });
                }
                if el.body.as_deref().is_some_and(|b| !b.is_empty()) {
                    return Err(FrameError::UnexpectedContent(truncate_for_error(
                        el.body.as_deref().unwrap_or_default(),
                    )));
                }
                let guid = parse_guid(&el, element)?;
                Ok(Some(match element {
                    "DataAck" => Frame::DataAck { guid },
                    "Command" => Frame::Command { guid },
                    "CommandAck" => Frame::CommandAck { guid },
                    "Close" => Frame::Close { guid },
                    "CloseAck" => Frame::CloseAck { guid },
                    "Signal" => Frame::Signal { guid },
                    _ => Frame::SignalAck { guid },
                }))
            }
            other => Err(FrameError::UnknownElement(other.to_string())),
        }
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind(), self.guid())
    }
}

fn parse_guid(el: &Element, element: &'static str) -> Result<Uuid, FrameError> {
    let raw = el
        .attribute("PSGuid")
        .ok_or(FrameError::MissingAttribute {
            element,
            attribute: "PSGuid",
        })?;
    Ok(Uuid::parse_str(raw)?)
}

fn truncate_for_error(s: &str) -> String {
    const MAX: usize = 64;
    if s.len() <= MAX {
        s.to_string()
    } else {
        let mut end = MAX;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    /// Text between start and end tag; `None` for self-closing elements.
    body: Option<String>,
}

impl Element {
    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Minimal single-element parser for the constrained wire grammar.
///
/// Attribute values are GUIDs and stream tags, bodies are base64 — none of
/// which ever need XML escaping, so no entity handling is required.
fn parse_element(s: &str) -> Result<Element, FrameError> {
    let bytes = s.as_bytes();
    let mut pos = 1; // past '<'

    let name_start = pos;
    while pos < bytes.len() && bytes[pos].is_ascii_alphanumeric() {
        pos += 1;
    }
    if pos == name_start {
        return Err(FrameError::Malformed("missing element name".to_string()));
    }
    let name = s[name_start..pos].to_string();

    let mut attributes = Vec::new();
    loop {
        while pos < bytes.len() && bytes[pos] == b' ' {
            pos += 1;
        }
        if pos >= bytes.len() {
            return Err(FrameError::Malformed("unterminated start tag".to_string()));
        }
        if bytes[pos] == b'/' {
            if s[pos..].starts_with("/>") && pos + 2 == bytes.len() {
                return Ok(Element {
                    name,
                    attributes,
                    body: None,
                });
            }
            return Err(FrameError::Malformed(
                "unexpected '/' inside start tag".to_string(),
            ));
        }
        if bytes[pos] == b'>' {
            pos += 1;
            break;
        }

        let attr_start = pos;
        while pos < bytes.len() && bytes[pos] != b'=' && bytes[pos] != b' ' && bytes[pos] != b'>' {
            pos += 1;
        }
        if pos >= bytes.len() || bytes[pos] != b'=' {
            return Err(FrameError::Malformed("attribute without value".to_string()));
        }
        let attr_name = s[attr_start..pos].to_string();
        pos += 1; // '='
        if pos >= bytes.len() || bytes[pos] != b'"' {
            return Err(FrameError::Malformed(
                "attribute value is not quoted".to_string(),
            ));
        }
        pos += 1;
        let value_start = pos;
        while pos < bytes.len() && bytes[pos] != b'"' {
            pos += 1;
        }
        if pos >= bytes.len() {
            return Err(FrameError::Malformed(
                "unterminated attribute value".to_string(),
            ));
        }
        attributes.push((attr_name, s[value_start..pos].to_string()));
        pos += 1; // closing '"'
    }

    // Body text runs to the matching end tag, which must close the line.
    let end_tag = format!("</{}>", name);
    let rest = &s[pos..];
    let Some(body_end) = rest.find(&end_tag) else {
        return Err(FrameError::Malformed(format!(
            "missing end tag '{}'",
            end_tag
        )));
    };
    if body_end + end_tag.len() != rest.len() {
        return Err(FrameError::UnexpectedContent(truncate_for_error(
            &rest[body_end + end_tag.len()..],
        )));
    }
    Ok(Element {
        name,
        attributes,
        body: Some(rest[..body_end].to_string()),
    })
}

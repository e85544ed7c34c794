use rand::RngCore;
use std::fmt;

/// Short opaque token identifying one pool entry and its paired launch
/// signal. Reference encoding is hex of 4 random bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(String);

impl FlowId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for FlowId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which transport a flow's target arrival was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// The control-channel fragment code for a launch signal (§4.5).
    pub fn fragment(self) -> &'static str {
        match self {
            Protocol::Tcp => "1",
            Protocol::Udp => "2",
        }
    }

    pub fn from_fragment(code: &str) -> Option<Self> {
        match code {
            "1" => Some(Protocol::Tcp),
            "2" => Some(Protocol::Udp),
            _ => None,
        }
    }
}

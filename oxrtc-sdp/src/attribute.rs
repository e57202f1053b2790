use std::fmt;
use std::str::FromStr;

use shared::error::{Error, Result};

/// ICE candidate type carried in an `a=candidate` attribute.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CandidateKind::Host => "host",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::Relay => "relay",
        };
        write!(f, "{s}")
    }
}

impl FromStr for CandidateKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(CandidateKind::Host),
            "srflx" => Ok(CandidateKind::ServerReflexive),
            "prflx" => Ok(CandidateKind::PeerReflexive),
            "relay" => Ok(CandidateKind::Relay),
            _ => Err(Error::ErrMalformedCandidate(s.to_string())),
        }
    }
}

/// Parsed `a=candidate` attribute value:
/// `<foundation> <component> <transport> <priority> <address> <port> typ <type>`
/// with optional `raddr`/`rport` and trailing extension pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateAttribute {
    pub foundation: String,
    pub component: u16,
    pub transport: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub kind: CandidateKind,
    pub related_address: Option<String>,
    pub related_port: Option<u16>,
    /// Unrecognized trailing key/value pairs (e.g. `generation 0`),
    /// preserved for round-trip fidelity.
    pub extensions: Vec<(String, String)>,
}

impl CandidateAttribute {
    pub fn parse(value: &str) -> Result<Self> {
        let malformed = || Error::ErrMalformedCandidate(value.to_string());

        let mut it = value.split_whitespace();
        let foundation = it.next().ok_or_else(malformed)?.to_string();
        let component = it.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
        let transport = it.next().ok_or_else(malformed)?.to_string();
        let priority = it.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
        let address = it.next().ok_or_else(malformed)?.to_string();
        let port = it.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
        if it.next() != Some("typ") {
            return Err(malformed());
        }
        let kind: CandidateKind = it.next().ok_or_else(malformed)?.parse()?;

        let mut related_address = None;
        let mut related_port = None;
        let mut extensions = vec![];
        while let Some(key) = it.next() {
            let val = it.next().ok_or_else(malformed)?;
            match key {
                "raddr" => related_address = Some(val.to_string()),
                "rport" => related_port = Some(val.parse().map_err(|_| malformed())?),
                _ => extensions.push((key.to_string(), val.to_string())),
            }
        }

        Ok(Self {
            foundation,
            component,
            transport,
            priority,
            address,
            port,
            kind,
            related_address,
            related_port,
            extensions,
        })
    }
}

impl fmt::Display for CandidateAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport,
            self.priority,
            self.address,
            self.port,
            self.kind,
        )?;
        if let Some(raddr) = &self.related_address {
            write!(f, " raddr {raddr}")?;
        }
        if let Some(rport) = self.related_port {
            write!(f, " rport {rport}")?;
        }
        for (key, val) in &self.extensions {
            write!(f, " {key} {val}")?;
        }
        Ok(())
    }
}

/// DTLS role negotiation, `a=setup`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SetupRole {
    Actpass,
    Active,
    Passive,
}

impl fmt::Display for SetupRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            SetupRole::Actpass => "actpass",
            SetupRole::Active => "active",
            SetupRole::Passive => "passive",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SetupRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "actpass" => Ok(SetupRole::Actpass),
            "active" => Ok(SetupRole::Active),
            "passive" => Ok(SetupRole::Passive),
            _ => Err(Error::ErrUnknownSetupRole(s.to_string())),
        }
    }
}

/// Media direction attribute.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Sendrecv,
    Sendonly,
    Recvonly,
    Inactive,
}

impl Direction {
    pub(crate) fn from_attribute_name(name: &str) -> Option<Self> {
        match name {
            "sendrecv" => Some(Direction::Sendrecv),
            "sendonly" => Some(Direction::Sendonly),
            "recvonly" => Some(Direction::Recvonly),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Direction::Sendrecv => "sendrecv",
            Direction::Sendonly => "sendonly",
            Direction::Recvonly => "recvonly",
            Direction::Inactive => "inactive",
        };
        write!(f, "{s}")
    }
}

/// One `a=` line, modeled as a tagged variant per attribute category with
/// an opaque fallback for forward compatibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    Candidate(CandidateAttribute),
    EndOfCandidates,
    Fingerprint { algorithm: String, value: String },
    IceUfrag(String),
    IcePwd(String),
    Setup(SetupRole),
    Direction(Direction),
    Rtcp(String),
    RtcpMux,
    Rtpmap { payload_type: u8, encoding: String },
    Sctpmap { port: u16, app: String },
    Ssrc { ssrc: u32, attribute: String },
    Mid(String),
    /// Unknown attribute, preserved verbatim.
    Other(String, Option<String>),
}

impl Attribute {
    /// Parses the part of an `a=` line after the prefix.
    pub fn parse(line: &str) -> Result<Self> {
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, Some(value)),
            None => (line, None),
        };

        let Some(value) = value else {
            if let Some(direction) = Direction::from_attribute_name(name) {
                return Ok(Attribute::Direction(direction));
            }
            return Ok(match name {
                "rtcp-mux" => Attribute::RtcpMux,
                "end-of-candidates" => Attribute::EndOfCandidates,
                _ => Attribute::Other(name.to_string(), None),
            });
        };

        match name {
            "candidate" => Ok(Attribute::Candidate(CandidateAttribute::parse(value)?)),
            "fingerprint" => {
                let (algorithm, fp) = value
                    .split_once(' ')
                    .ok_or_else(|| Error::ErrMalformedFingerprint(value.to_string()))?;
                Ok(Attribute::Fingerprint {
                    algorithm: algorithm.to_string(),
                    value: fp.to_string(),
                })
            }
            "ice-ufrag" => Ok(Attribute::IceUfrag(value.to_string())),
            "ice-pwd" => Ok(Attribute::IcePwd(value.to_string())),
            "setup" => Ok(Attribute::Setup(value.parse()?)),
            "rtcp" => Ok(Attribute::Rtcp(value.to_string())),
            "rtpmap" => {
                let (pt, encoding) = value
                    .split_once(' ')
                    .ok_or_else(|| Error::ErrMalformedSdpLine(format!("a={line}")))?;
                let payload_type = pt
                    .parse()
                    .map_err(|_| Error::ErrMalformedSdpLine(format!("a={line}")))?;
                Ok(Attribute::Rtpmap {
                    payload_type,
                    encoding: encoding.to_string(),
                })
            }
            "sctpmap" => {
                let (port, app) = value
                    .split_once(' ')
                    .ok_or_else(|| Error::ErrMalformedSdpLine(format!("a={line}")))?;
                let port = port
                    .parse()
                    .map_err(|_| Error::ErrMalformedSdpLine(format!("a={line}")))?;
                Ok(Attribute::Sctpmap {
                    port,
                    app: app.to_string(),
                })
            }
            "ssrc" => {
                let (ssrc, attribute) = value
                    .split_once(' ')
                    .ok_or_else(|| Error::ErrMalformedSdpLine(format!("a={line}")))?;
                let ssrc = ssrc
                    .parse()
                    .map_err(|_| Error::ErrMalformedSdpLine(format!("a={line}")))?;
                Ok(Attribute::Ssrc {
                    ssrc,
                    attribute: attribute.to_string(),
                })
            }
            "mid" => Ok(Attribute::Mid(value.to_string())),
            _ => Ok(Attribute::Other(name.to_string(), Some(value.to_string()))),
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::Candidate(c) => write!(f, "candidate:{c}"),
            Attribute::EndOfCandidates => write!(f, "end-of-candidates"),
            Attribute::Fingerprint { algorithm, value } => {
                write!(f, "fingerprint:{algorithm} {value}")
            }
            Attribute::IceUfrag(v) => write!(f, "ice-ufrag:{v}"),
            Attribute::IcePwd(v) => write!(f, "ice-pwd:{v}"),
            Attribute::Setup(role) => write!(f, "setup:{role}"),
            Attribute::Direction(d) => write!(f, "{d}"),
            Attribute::Rtcp(v) => write!(f, "rtcp:{v}"),
            Attribute::RtcpMux => write!(f, "rtcp-mux"),
            Attribute::Rtpmap {
                payload_type,
                encoding,
            } => write!(f, "rtpmap:{payload_type} {encoding}"),
            Attribute::Sctpmap { port, app } => write!(f, "sctpmap:{port} {app}"),
            Attribute::Ssrc { ssrc, attribute } => write!(f, "ssrc:{ssrc} {attribute}"),
            Attribute::Mid(v) => write!(f, "mid:{v}"),
            Attribute::Other(name, Some(value)) => write!(f, "{name}:{value}"),
            Attribute::Other(name, None) => write!(f, "{name}"),
        }
    }
}

use std::fmt;
use std::str::FromStr;

use shared::error::{Error, Result};

use crate::attribute::{Attribute, CandidateAttribute, Direction, SetupRole};

/// RTP payload types that collide with RTCP packet types, RFC 5761 section 4.
const FORBIDDEN_PAYLOAD_TYPES: std::ops::RangeInclusive<u8> = 72..=76;

/// Kind of an `m=` section.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Application,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Application => "application",
        };
        write!(f, "{s}")
    }
}

impl FromStr for MediaKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "audio" => Ok(MediaKind::Audio),
            "video" => Ok(MediaKind::Video),
            "application" => Ok(MediaKind::Application),
            _ => Err(Error::ErrMalformedMediaLine(s.to_string())),
        }
    }
}

/// One `m=` section with its connection line and attributes, in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub kind: MediaKind,
    pub port: u16,
    pub profile: String,
    pub formats: Vec<String>,
    /// Address of the `c=` line, e.g. `IN IP4 192.0.2.1`.
    pub connection: Option<String>,
    pub attributes: Vec<Attribute>,
}

impl MediaDescription {
    pub fn new(kind: MediaKind, port: u16, profile: &str, formats: Vec<String>) -> Self {
        Self {
            kind,
            port,
            profile: profile.to_string(),
            formats,
            connection: None,
            attributes: vec![],
        }
    }

    /// A rejected section is signaled by port zero, RFC 3264 section 6.
    pub fn is_rejected(&self) -> bool {
        self.port == 0
    }

    pub fn ice_ufrag(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::IceUfrag(v) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn ice_pwd(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::IcePwd(v) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn setup(&self) -> Option<SetupRole> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Setup(role) => Some(*role),
            _ => None,
        })
    }

    pub fn direction(&self) -> Option<Direction> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Direction(d) => Some(*d),
            _ => None,
        })
    }

    pub fn fingerprint(&self) -> Option<(&str, &str)> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Fingerprint { algorithm, value } => {
                Some((algorithm.as_str(), value.as_str()))
            }
            _ => None,
        })
    }

    pub fn candidates(&self) -> impl Iterator<Item = &CandidateAttribute> {
        self.attributes.iter().filter_map(|a| match a {
            Attribute::Candidate(c) => Some(c),
            _ => None,
        })
    }

    pub fn rtpmaps(&self) -> impl Iterator<Item = (u8, &str)> {
        self.attributes.iter().filter_map(|a| match a {
            Attribute::Rtpmap {
                payload_type,
                encoding,
            } => Some((*payload_type, encoding.as_str())),
            _ => None,
        })
    }

    pub fn ssrcs(&self) -> impl Iterator<Item = u32> + '_ {
        let mut seen = vec![];
        self.attributes.iter().filter_map(move |a| match a {
            Attribute::Ssrc { ssrc, .. } if !seen.contains(ssrc) => {
                seen.push(*ssrc);
                Some(*ssrc)
            }
            _ => None,
        })
    }
}

/// A parsed session description: session-level lines plus ordered media
/// sections. Immutable once produced; renegotiation supplies a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    /// The `o=` line payload.
    pub origin: String,
    /// The `s=` line payload.
    pub session_name: String,
    /// The `t=` line payload.
    pub timing: String,
    pub attributes: Vec<Attribute>,
    pub media: Vec<MediaDescription>,
}

impl Default for SessionDescription {
    fn default() -> Self {
        Self {
            origin: "- 0 0 IN IP4 0.0.0.0".to_string(),
            session_name: "-".to_string(),
            timing: "0 0".to_string(),
            attributes: vec![],
            media: vec![],
        }
    }
}

impl SessionDescription {
    pub fn parse(text: &str) -> Result<Self> {
        let mut session = SessionDescription {
            origin: String::new(),
            session_name: String::new(),
            timing: String::new(),
            attributes: vec![],
            media: vec![],
        };

        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let (typ, value) = line
                .split_once('=')
                .ok_or_else(|| Error::ErrMalformedSdpLine(line.to_string()))?;
            match typ {
                "v" => {
                    if value != "0" {
                        return Err(Error::ErrMalformedSdpLine(line.to_string()));
                    }
                }
                "o" => session.origin = value.to_string(),
                "s" => session.session_name = value.to_string(),
                "t" => session.timing = value.to_string(),
                "m" => session.media.push(Self::parse_media_line(value)?),
                "c" => {
                    if !value.starts_with("IN IP4 ") && !value.starts_with("IN IP6 ") {
                        return Err(Error::ErrMalformedConnectionLine(line.to_string()));
                    }
                    if let Some(media) = session.media.last_mut() {
                        media.connection = Some(value.to_string());
                    }
                }
                "a" => {
                    let attribute = Attribute::parse(value)?;
                    if let Some(media) = session.media.last_mut() {
                        media.attributes.push(attribute);
                    } else {
                        session.attributes.push(attribute);
                    }
                }
                // b=, k=, i=, ... carry nothing this stack negotiates on
                _ => log::trace!("ignoring sdp line {line}"),
            }
        }

        Ok(session)
    }

    fn parse_media_line(value: &str) -> Result<MediaDescription> {
        let malformed = || Error::ErrMalformedMediaLine(value.to_string());

        let mut it = value.split_whitespace();
        let kind: MediaKind = it.next().ok_or_else(malformed)?.parse()?;
        let port: u16 = it.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
        let profile = it.next().ok_or_else(malformed)?.to_string();
        let formats: Vec<String> = it.map(|s| s.to_string()).collect();
        if formats.is_empty() {
            return Err(malformed());
        }

        if matches!(kind, MediaKind::Audio | MediaKind::Video) {
            for fmt in &formats {
                let pt: u8 = fmt.parse().map_err(|_| malformed())?;
                if FORBIDDEN_PAYLOAD_TYPES.contains(&pt) {
                    return Err(Error::ErrForbiddenPayloadType(pt));
                }
            }
        }

        Ok(MediaDescription {
            kind,
            port,
            profile,
            formats,
            connection: None,
            attributes: vec![],
        })
    }

    /// Fingerprint for a media section, falling back to the session level.
    pub fn fingerprint_for<'a>(&'a self, media: &'a MediaDescription) -> Option<(&'a str, &'a str)> {
        media.fingerprint().or_else(|| {
            self.attributes.iter().find_map(|a| match a {
                Attribute::Fingerprint { algorithm, value } => {
                    Some((algorithm.as_str(), value.as_str()))
                }
                _ => None,
            })
        })
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=0\r\n")?;
        write!(f, "o={}\r\n", self.origin)?;
        write!(f, "s={}\r\n", self.session_name)?;
        write!(f, "t={}\r\n", self.timing)?;
        for attribute in &self.attributes {
            write!(f, "a={attribute}\r\n")?;
        }
        for media in &self.media {
            write!(
                f,
                "m={} {} {} {}\r\n",
                media.kind,
                media.port,
                media.profile,
                media.formats.join(" ")
            )?;
            if let Some(connection) = &media.connection {
                write!(f, "c={connection}\r\n")?;
            }
            for attribute in &media.attributes {
                write!(f, "a={attribute}\r\n")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const AUDIO_OFFER: &str = "v=0\r\n\
o=- 3720584997 3720584997 IN IP4 0.0.0.0\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 51172 UDP/TLS/RTP/SAVPF 96 0 8\r\n\
c=IN IP4 192.168.1.9\r\n\
a=rtcp:9 IN IP4 0.0.0.0\r\n\
a=rtcp-mux\r\n\
a=candidate:1912811708 1 udp 2130706431 192.168.1.9 51172 typ host\r\n\
a=ice-pwd:XfJNJsdBOuQecfNLdDpUjT\r\n\
a=ice-ufrag:vjJVmIvn\r\n\
a=fingerprint:sha-256 1C:F1:93:DF:17:73:67:8B:E5:67:87:4A:63:21:E9:C3:00:1C:8F:0F:77:B1:F1:76:52:3B:13:AF:E5:E1:8C:C1\r\n\
a=setup:actpass\r\n\
a=sendrecv\r\n\
a=ssrc:302036212 cname:{67244666-e1db-4c7e-b9b5-89b23a9a0f3f}\r\n\
a=rtpmap:96 opus/48000/2\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:8 PCMA/8000\r\n";

    #[test]
    fn test_parse_audio_offer() {
        let session = SessionDescription::parse(AUDIO_OFFER).unwrap();
        assert_eq!(session.media.len(), 1);

        let media = &session.media[0];
        assert_eq!(media.kind, MediaKind::Audio);
        assert_eq!(media.port, 51172);
        assert_eq!(media.profile, "UDP/TLS/RTP/SAVPF");
        assert_eq!(media.formats, vec!["96", "0", "8"]);
        assert_eq!(media.connection.as_deref(), Some("IN IP4 192.168.1.9"));
        assert_eq!(media.ice_ufrag(), Some("vjJVmIvn"));
        assert_eq!(media.ice_pwd(), Some("XfJNJsdBOuQecfNLdDpUjT"));
        assert_eq!(media.setup(), Some(SetupRole::Actpass));
        assert_eq!(media.direction(), Some(Direction::Sendrecv));
        assert_eq!(media.candidates().count(), 1);
        assert_eq!(media.rtpmaps().count(), 3);
        assert_eq!(media.ssrcs().collect::<Vec<_>>(), vec![302036212]);

        let (algorithm, _) = session.fingerprint_for(media).unwrap();
        assert_eq!(algorithm, "sha-256");
    }

    #[test]
    fn test_byte_stable_round_trip() {
        let session = SessionDescription::parse(AUDIO_OFFER).unwrap();
        assert_eq!(session.to_string(), AUDIO_OFFER);
    }

    #[test]
    fn test_structural_round_trip() {
        let session = SessionDescription::parse(AUDIO_OFFER).unwrap();
        let reparsed = SessionDescription::parse(&session.to_string()).unwrap();
        assert_eq!(session, reparsed);
    }

    #[test]
    fn test_session_level_fingerprint_inherited() {
        let text = "v=0\r\n\
o=- 1 1 IN IP4 0.0.0.0\r\n\
s=-\r\n\
t=0 0\r\n\
a=fingerprint:sha-256 AA:BB\r\n\
m=application 5000 DTLS/SCTP 5000\r\n\
c=IN IP4 10.0.0.1\r\n\
a=sctpmap:5000 webrtc-datachannel 256\r\n";
        let session = SessionDescription::parse(text).unwrap();
        let media = &session.media[0];
        assert_eq!(media.fingerprint(), None);
        assert_eq!(session.fingerprint_for(media), Some(("sha-256", "AA:BB")));
        assert_eq!(session.to_string(), text);
    }

    #[test]
    fn test_rejects_forbidden_payload_type() {
        let text = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 72\r\n";
        assert_eq!(
            SessionDescription::parse(text),
            Err(Error::ErrForbiddenPayloadType(72))
        );
    }

    #[test]
    fn test_rejects_malformed_media_line() {
        assert!(SessionDescription::parse("v=0\r\nm=audio\r\n").is_err());
        assert!(SessionDescription::parse("v=0\r\nm=audio 9\r\n").is_err());
        assert!(SessionDescription::parse("v=0\r\nm=smell 9 X 0\r\n").is_err());
    }

    #[test]
    fn test_attribute_order_tolerated() {
        // same attributes, shuffled: still parses, accessors unaffected
        let text = "v=0\r\n\
o=- 1 1 IN IP4 0.0.0.0\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 0\r\n\
c=IN IP4 1.2.3.4\r\n\
a=setup:active\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=ice-ufrag:abcdefgh\r\n\
a=ice-pwd:0123456789abcdefghijkl\r\n";
        let session = SessionDescription::parse(text).unwrap();
        let media = &session.media[0];
        assert_eq!(media.setup(), Some(SetupRole::Active));
        assert_eq!(media.ice_ufrag(), Some("abcdefgh"));
    }
}

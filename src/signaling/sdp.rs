//! SDP offer parsing and answer generation

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::IpAddr;
use uuid::Uuid;

use crate::config::{CodecConfig, MediaKind, SignalingConfig};
use crate::error::{Error, Result};
use crate::signaling::IceCandidate;

const SCTP_PORT: u16 = 5000;

#[derive(Debug, Clone, PartialEq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub name: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaSection {
    /// `video`, `audio`, `application`, ...
    pub kind: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<String>,
    pub mid: Option<String>,
    pub rtpmaps: Vec<RtpMap>,
    pub fmtps: HashMap<u8, String>,
    pub setup: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOffer {
    pub media: Vec<MediaSection>,
    /// Session-level `a=setup`, applies to sections without their own
    pub setup: Option<String>,
}

pub fn parse_offer(sdp: &str) -> Result<ParsedOffer> {
    let mut lines = sdp
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty());

    match lines.next() {
        Some("v=0") => {}
        Some(other) => {
            return Err(Error::InvalidOffer(format!(
                "expected v=0 as first line, found '{}'",
                other
            )))
        }
        None => return Err(Error::InvalidOffer("empty SDP".to_string())),
    }

    let mut offer = ParsedOffer {
        media: Vec::new(),
        setup: None,
    };

    for line in lines {
        let (key, value) = line
            .split_once('=')
            .filter(|(k, _)| k.len() == 1)
            .ok_or_else(|| Error::InvalidOffer(format!("malformed line '{}'", line)))?;

        match key {
            "m" => offer.media.push(parse_media_line(value)?),
            "a" => {
                let (attribute, argument) = match value.split_once(':') {
                    Some((a, v)) => (a, Some(v)),
                    None => (value, None),
                };
                match offer.media.last_mut() {
                    Some(section) => apply_media_attribute(section, attribute, argument)?,
                    None if attribute == "setup" => {
                        offer.setup = argument.map(str::to_string);
                    }
                    None => {}
                }
            }
            _ => {}
        }
    }

    if offer.media.is_empty() {
        return Err(Error::InvalidOffer("no media sections".to_string()));
    }

    Ok(offer)
}

fn parse_media_line(value: &str) -> Result<MediaSection> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() < 4 {
        return Err(Error::InvalidOffer(format!("malformed media line 'm={}'", value)));
    }

    let port = parts[1]
        .split('/')
        .next()
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or_else(|| Error::InvalidOffer(format!("invalid media port '{}'", parts[1])))?;

    Ok(MediaSection {
        kind: parts[0].to_string(),
        port,
        protocol: parts[2].to_string(),
        formats: parts[3..].iter().map(|f| f.to_string()).collect(),
        mid: None,
        rtpmaps: Vec::new(),
        fmtps: HashMap::new(),
        setup: None,
    })
}

fn apply_media_attribute(
    section: &mut MediaSection,
    attribute: &str,
    argument: Option<&str>,
) -> Result<()> {
    match (attribute, argument) {
        ("mid", Some(mid)) => section.mid = Some(mid.trim().to_string()),
        ("setup", Some(setup)) => section.setup = Some(setup.trim().to_string()),
        ("rtpmap", Some(arg)) => section.rtpmaps.push(parse_rtpmap(arg)?),
        ("fmtp", Some(arg)) => {
            if let Some((pt, params)) = arg.split_once(' ') {
                if let Ok(pt) = pt.parse::<u8>() {
                    section.fmtps.insert(pt, params.trim().to_string());
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// `96 VP8/90000` or `111 opus/48000/2`
fn parse_rtpmap(arg: &str) -> Result<RtpMap> {
    let invalid = || Error::InvalidOffer(format!("malformed rtpmap '{}'", arg));

    let (pt, encoding) = arg.split_once(' ').ok_or_else(invalid)?;
    let payload_type = pt.parse::<u8>().map_err(|_| invalid())?;
    let mut fields = encoding.trim().split('/');
    let name = fields.next().filter(|n| !n.is_empty()).ok_or_else(invalid)?;
    let clock_rate = fields
        .next()
        .and_then(|c| c.parse::<u32>().ok())
        .ok_or_else(invalid)?;
    let channels = fields.next().and_then(|c| c.parse::<u8>().ok());

    Ok(RtpMap {
        payload_type,
        name: name.to_string(),
        clock_rate,
        channels,
    })
}

/// Codec picked for one answered section
#[derive(Debug, Clone)]
struct Negotiated {
    payload_type: u8,
    codec: CodecConfig,
    fmtp: Option<String>,
}

/// Produces answers from the configured codec set
#[derive(Debug, Clone)]
pub struct SdpAnswerer {
    codecs: Vec<CodecConfig>,
    fingerprint: String,
    address: IpAddr,
}

impl SdpAnswerer {
    pub fn new(config: &SignalingConfig) -> Self {
        let fingerprint = config
            .dtls_fingerprint
            .clone()
            .unwrap_or_else(generated_fingerprint);
        let address = local_ip_address::local_ip().unwrap_or_else(|e| {
            tracing::warn!("Could not determine local IP address: {}", e);
            IpAddr::from([0, 0, 0, 0])
        });

        Self {
            codecs: config.codecs.clone(),
            fingerprint,
            address,
        }
    }

    pub fn answer(&self, offer: &ParsedOffer) -> Result<String> {
        let negotiated: Vec<Option<Vec<Negotiated>>> = offer
            .media
            .iter()
            .map(|section| self.negotiate_section(section))
            .collect();

        let has_media = offer.media.iter().zip(&negotiated).any(|(section, codecs)| {
            section.kind != "application" && codecs.as_ref().is_some_and(|c| !c.is_empty())
        });
        if !has_media {
            return Err(Error::InvalidOffer(
                "no codec in common with the camera side".to_string(),
            ));
        }

        let ufrag: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let pwd: String = Uuid::new_v4().simple().to_string().chars().take(24).collect();
        let (net, ip) = match self.address {
            IpAddr::V4(v4) => ("IP4", v4.to_string()),
            IpAddr::V6(v6) => ("IP6", v6.to_string()),
        };
        let session_version = (Uuid::new_v4().as_u128() as u64) >> 1;

        let mut sdp = vec![
            "v=0".to_string(),
            format!("o=- {} 2 IN {} {}", session_version, net, ip),
            "s=-".to_string(),
            "t=0 0".to_string(),
            format!("c=IN {} {}", net, ip),
        ];

        let bundle: Vec<&str> = offer
            .media
            .iter()
            .zip(&negotiated)
            .filter(|(_, codecs)| codecs.is_some())
            .filter_map(|(section, _)| section.mid.as_deref())
            .collect();
        if !bundle.is_empty() {
            sdp.push(format!("a=group:BUNDLE {}", bundle.join(" ")));
        }

        for (section, codecs) in offer.media.iter().zip(negotiated) {
            let Some(codecs) = codecs else {
                // Rejected section: port zero, echo the first offered format.
                sdp.push(format!(
                    "m={} 0 {} {}",
                    section.kind,
                    section.protocol,
                    section.formats.first().map(String::as_str).unwrap_or("0")
                ));
                if let Some(mid) = &section.mid {
                    sdp.push(format!("a=mid:{}", mid));
                }
                continue;
            };

            let formats = if section.kind == "application" {
                section.formats.join(" ")
            } else {
                codecs
                    .iter()
                    .map(|c| c.payload_type.to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            };
            sdp.push(format!("m={} 9 {} {}", section.kind, section.protocol, formats));
            if let Some(mid) = &section.mid {
                sdp.push(format!("a=mid:{}", mid));
            }
            sdp.push(format!("a=ice-ufrag:{}", ufrag));
            sdp.push(format!("a=ice-pwd:{}", pwd));
            sdp.push("a=ice-options:trickle".to_string());
            sdp.push(format!("a=fingerprint:{}", self.fingerprint));

            let remote_setup = section.setup.as_deref().or(offer.setup.as_deref());
            let setup = if remote_setup == Some("active") {
                "passive"
            } else {
                "active"
            };
            sdp.push(format!("a=setup:{}", setup));

            if section.kind == "application" {
                sdp.push(format!("a=sctp-port:{}", SCTP_PORT));
                continue;
            }

            sdp.push("a=sendrecv".to_string());
            sdp.push("a=rtcp-mux".to_string());
            for negotiated in &codecs {
                let codec = &negotiated.codec;
                match codec.channels {
                    Some(channels) => sdp.push(format!(
                        "a=rtpmap:{} {}/{}/{}",
                        negotiated.payload_type, codec.name, codec.clock_rate, channels
                    )),
                    None => sdp.push(format!(
                        "a=rtpmap:{} {}/{}",
                        negotiated.payload_type, codec.name, codec.clock_rate
                    )),
                }
                if let Some(fmtp) = &negotiated.fmtp {
                    sdp.push(format!("a=fmtp:{} {}", negotiated.payload_type, fmtp));
                }
            }
        }

        let mut answer = sdp.join("\r\n");
        answer.push_str("\r\n");
        Ok(answer)
    }

    /// `None` rejects the section.
    fn negotiate_section(&self, section: &MediaSection) -> Option<Vec<Negotiated>> {
        if section.port == 0 {
            return None;
        }
        let kind = match section.kind.as_str() {
            "video" => MediaKind::Video,
            "audio" => MediaKind::Audio,
            "application" => return Some(Vec::new()),
            _ => return None,
        };
        let supported: Vec<&CodecConfig> =
            self.codecs.iter().filter(|c| c.kind == kind).collect();

        let negotiated: Vec<Negotiated> = if section.rtpmaps.is_empty() {
            // No rtpmap: map the configured codecs onto the offered payload types.
            section
                .formats
                .iter()
                .filter_map(|f| f.parse::<u8>().ok())
                .zip(supported)
                .map(|(payload_type, codec)| Negotiated {
                    payload_type,
                    codec: codec.clone(),
                    fmtp: codec.fmtp.clone(),
                })
                .collect()
        } else {
            section
                .rtpmaps
                .iter()
                .filter_map(|rtpmap| {
                    supported
                        .iter()
                        .find(|c| {
                            c.name.eq_ignore_ascii_case(&rtpmap.name)
                                && c.clock_rate == rtpmap.clock_rate
                        })
                        .map(|codec| Negotiated {
                            payload_type: rtpmap.payload_type,
                            codec: (*codec).clone(),
                            fmtp: section
                                .fmtps
                                .get(&rtpmap.payload_type)
                                .cloned()
                                .or_else(|| codec.fmtp.clone()),
                        })
                })
                .collect()
        };

        (!negotiated.is_empty()).then_some(negotiated)
    }
}

fn generated_fingerprint() -> String {
    let digest = Sha256::digest(Uuid::new_v4().as_bytes());
    let hex: Vec<String> = digest.iter().map(|b| format!("{:02X}", b)).collect();
    format!("sha-256 {}", hex.join(":"))
}

/// Structural check of an ICE candidate line (RFC 8839 `candidate-attribute`).
pub fn validate_candidate(candidate: &IceCandidate) -> Result<()> {
    if candidate.is_end_of_candidates() {
        return Ok(());
    }

    let line = candidate.candidate.trim();
    let line = line.strip_prefix("a=").unwrap_or(line);
    let invalid = |reason: &str| Error::InvalidCandidate(format!("{}: '{}'", reason, line));

    let body = line
        .strip_prefix("candidate:")
        .ok_or_else(|| invalid("missing candidate: prefix"))?;
    let fields: Vec<&str> = body.split_whitespace().collect();
    if fields.len() < 8 {
        return Err(invalid("too few fields"));
    }

    if fields[0].is_empty() {
        return Err(invalid("empty foundation"));
    }
    match fields[1].parse::<u16>() {
        Ok(1..=256) => {}
        _ => return Err(invalid("invalid component id")),
    }
    if !matches!(fields[2].to_ascii_lowercase().as_str(), "udp" | "tcp") {
        return Err(invalid("unknown transport"));
    }
    fields[3]
        .parse::<u32>()
        .map_err(|_| invalid("invalid priority"))?;
    if fields[4].is_empty() {
        return Err(invalid("empty connection address"));
    }
    fields[5]
        .parse::<u16>()
        .map_err(|_| invalid("invalid port"))?;
    if fields[6] != "typ" {
        return Err(invalid("missing typ"));
    }
    if !matches!(fields[7], "host" | "srflx" | "prflx" | "relay") {
        return Err(invalid("unknown candidate type"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BROWSER_OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 102 45\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=setup:actpass\r\n\
a=recvonly\r\n\
a=rtcp-mux\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtpmap:102 H264/90000\r\n\
a=fmtp:102 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f\r\n\
a=rtpmap:45 AV1/90000\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=mid:1\r\n\
a=rtpmap:111 opus/48000/2\r\n";

    fn answerer() -> SdpAnswerer {
        SdpAnswerer::new(&SignalingConfig::default())
    }

    #[test]
    fn test_parse_browser_offer() {
        let offer = parse_offer(BROWSER_OFFER).unwrap();
        assert_eq!(offer.media.len(), 2);
        let video = &offer.media[0];
        assert_eq!(video.kind, "video");
        assert_eq!(video.mid.as_deref(), Some("0"));
        assert_eq!(video.setup.as_deref(), Some("actpass"));
        assert_eq!(video.rtpmaps.len(), 3);
        assert!(video.fmtps.contains_key(&102));
    }

    #[test]
    fn test_answer_contains_required_attributes() {
        let answer = answerer().answer(&parse_offer(BROWSER_OFFER).unwrap()).unwrap();

        assert!(answer.starts_with("v=0\r\n"));
        assert!(answer.contains("a=group:BUNDLE 0 1"));
        assert!(answer.contains("m=video 9 UDP/TLS/RTP/SAVPF 96 102\r\n"));
        assert!(answer.contains("a=setup:active"));
        assert!(answer.contains("a=sendrecv"));
        assert!(answer.contains("a=rtcp-mux"));
        assert!(answer.contains("a=rtpmap:96 VP8/90000"));
        assert!(answer.contains("a=fmtp:102 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f"));
        assert!(answer.contains("a=rtpmap:111 opus/48000/2"));
        assert!(!answer.contains("AV1"));
        assert!(answer.contains("a=fingerprint:sha-256 "));
    }

    #[test]
    fn test_minimal_offer() {
        let offer = parse_offer("v=0\r\nm=video 9 RTP/AVP 96\r\n").unwrap();
        let answer = answerer().answer(&offer).unwrap();
        assert!(answer.contains("m=video 9 RTP/AVP 96"));
        assert!(answer.contains("a=rtpmap:96 VP8/90000"));
        assert!(answer.contains("a=setup:active"));
    }

    #[test]
    fn test_active_offer_gets_passive_answer() {
        let offer = parse_offer(
            "v=0\r\na=setup:active\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=rtpmap:96 VP8/90000\r\n",
        )
        .unwrap();
        let answer = answerer().answer(&offer).unwrap();
        assert!(answer.contains("a=setup:passive"));
    }

    #[test]
    fn test_malformed_offers() {
        assert!(matches!(parse_offer(""), Err(Error::InvalidOffer(_))));
        assert!(matches!(parse_offer("hello"), Err(Error::InvalidOffer(_))));
        assert!(matches!(
            parse_offer("v=0\r\ns=-\r\n"),
            Err(Error::InvalidOffer(_))
        ));
        assert!(matches!(
            parse_offer("v=0\r\nm=video nine RTP/AVP 96\r\n"),
            Err(Error::InvalidOffer(_))
        ));
    }

    #[test]
    fn test_no_common_codec() {
        let offer =
            parse_offer("v=0\r\nm=video 9 RTP/AVP 45\r\na=rtpmap:45 AV1/90000\r\n").unwrap();
        assert!(matches!(answerer().answer(&offer), Err(Error::InvalidOffer(_))));
    }

    #[test]
    fn test_configured_fingerprint_is_used() {
        let config = SignalingConfig {
            dtls_fingerprint: Some("sha-256 AA:BB".to_string()),
            ..Default::default()
        };
        let answer = SdpAnswerer::new(&config)
            .answer(&parse_offer("v=0\r\nm=video 9 RTP/AVP 96\r\n").unwrap())
            .unwrap();
        assert!(answer.contains("a=fingerprint:sha-256 AA:BB\r\n"));
    }

    #[test]
    fn test_candidate_validation() {
        let host = IceCandidate {
            candidate: "candidate:842163049 1 udp 1677729535 192.168.1.30 54321 typ host generation 0".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };
        assert!(validate_candidate(&host).is_ok());

        let end = IceCandidate {
            candidate: String::new(),
            sdp_mid: None,
            sdp_m_line_index: None,
        };
        assert!(validate_candidate(&end).is_ok());

        for bad in [
            "candidate:1 1 udp 100 10.0.0.1",
            "candidate:1 0 udp 100 10.0.0.1 5000 typ host",
            "candidate:1 1 sctp 100 10.0.0.1 5000 typ host",
            "candidate:1 1 udp 100 10.0.0.1 5000 typ bogus",
            "1 1 udp 100 10.0.0.1 5000 typ host",
        ] {
            let candidate = IceCandidate {
                candidate: bad.to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: None,
            };
            assert!(
                matches!(validate_candidate(&candidate), Err(Error::InvalidCandidate(_))),
                "accepted {}",
                bad
            );
        }
    }
}

//! The SDP negotiation bridge.
//!
//! Couples the opaque JSEP exchange between browser and plugin to the ICE
//! transport underneath a handle. SDP crossing a trust boundary is
//! anonymized (ICE credentials, fingerprint, and candidates stripped);
//! outbound SDP gets the gateway's own credentials and candidates merged in.
//! Full SDP parsing lives behind the ICE seam; this module only does the
//! line-level work the bridge itself owns.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::handle::Handle;
use crate::ice::IceLink;

/// Whether a JSEP carries an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("offer") {
            Some(SdpKind::Offer)
        } else if s.eq_ignore_ascii_case("answer") {
            Some(SdpKind::Answer)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

/// A `{type, sdp}` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// Media section counts from a pre-parse pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdpPreview {
    pub audio: usize,
    pub video: usize,
}

/// Cheap structural validation: a version line up front, `x=value` shaped
/// lines throughout, and a count of audio/video media sections.
pub fn preparse(sdp: &str) -> Result<SdpPreview, ApiError> {
    let mut lines = sdp.lines().map(str::trim_end).filter(|l| !l.is_empty());
    match lines.next() {
        Some("v=0") => {}
        _ => return Err(ApiError::JsepInvalidSdp),
    }
    let mut preview = SdpPreview { audio: 0, video: 0 };
    for line in lines {
        let mut chars = line.chars();
        let (Some(_), Some('=')) = (chars.next(), chars.next()) else {
            return Err(ApiError::JsepInvalidSdp);
        };
        if line.starts_with("m=audio") {
            preview.audio += 1;
        } else if line.starts_with("m=video") {
            preview.video += 1;
        }
    }
    Ok(preview)
}

const STRIPPED_ATTRIBUTES: [&str; 5] = [
    "a=ice-ufrag:",
    "a=ice-pwd:",
    "a=ice-options:",
    "a=fingerprint:",
    "a=candidate:",
];

/// Strip ICE credentials, fingerprint, and candidate lines. Idempotent.
pub fn anonymize(sdp: &str) -> String {
    let mut out = String::with_capacity(sdp.len());
    for line in sdp.lines().map(str::trim_end) {
        if line.is_empty() || STRIPPED_ATTRIBUTES.iter().any(|p| line.starts_with(p)) {
            continue;
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

/// What the merge step injects into an outbound SDP.
pub struct MergeContext {
    pub ufrag: String,
    pub pwd: String,
    pub fingerprint: String,
    pub audio_candidates: Vec<String>,
    pub video_candidates: Vec<String>,
    pub public_ip: Option<IpAddr>,
}

/// Inject the gateway's ICE credentials, fingerprint, and candidates into an
/// (anonymized) SDP, rewriting connection lines to the public address when
/// one is configured.
pub fn merge(sdp: &str, ctx: &MergeContext) -> String {
    let mut out = String::with_capacity(sdp.len() + 256);
    for line in sdp.lines().map(str::trim_end) {
        if line.is_empty() {
            continue;
        }
        if let Some(ip) = ctx.public_ip {
            if line.starts_with("c=IN IP4 ") {
                out.push_str(&format!("c=IN IP4 {ip}\r\n"));
                continue;
            }
        }
        out.push_str(line);
        out.push_str("\r\n");
        let candidates = if line.starts_with("m=audio") {
            Some(&ctx.audio_candidates)
        } else if line.starts_with("m=video") {
            Some(&ctx.video_candidates)
        } else {
            None
        };
        if let Some(candidates) = candidates {
            out.push_str(&format!("a=ice-ufrag:{}\r\n", ctx.ufrag));
            out.push_str(&format!("a=ice-pwd:{}\r\n", ctx.pwd));
            out.push_str(&format!("a=fingerprint:sha-256 {}\r\n", ctx.fingerprint));
            for candidate in candidates {
                out.push_str(&format!("a={candidate}\r\n"));
            }
        }
    }
    out
}

/// Remote → local: the browser supplied an offer or answer alongside a
/// `message`. Sets up ICE on the offer direction, hands the description to
/// the transport, installs remote candidates on the answer direction, and
/// returns the anonymized SDP for the plugin.
pub fn process_incoming(handle: &Arc<Handle>, kind: SdpKind, sdp: &str) -> Result<String, ApiError> {
    let preview = preparse(sdp)?;
    if preview.audio > 1 || preview.video > 1 {
        warn!(
            handle = handle.id(),
            audio = preview.audio,
            video = preview.video,
            "multiple media lines of one kind; only negotiating one"
        );
    }
    let ice = handle.ice();
    if kind == SdpKind::Offer {
        ice.setup_local(preview.audio > 0, preview.video > 0);
    }
    ice.apply_remote_description(sdp);
    if kind == SdpKind::Answer {
        install_remote_candidates(ice.as_ref());
    }
    Ok(anonymize(sdp))
}

/// Local → remote: a plugin produced an offer or answer for `push_event`.
/// Sets up ICE on the offer direction, waits for candidate gathering to
/// finish, anonymizes and merges the SDP, and installs remote candidates on
/// the answer direction.
pub async fn process_outgoing(
    handle: &Arc<Handle>,
    jsep: &Jsep,
    gathering_timeout: Duration,
    public_ip: Option<IpAddr>,
) -> Result<Jsep, ApiError> {
    let preview = preparse(&jsep.sdp)?;
    let ice = handle.ice();
    if jsep.kind == SdpKind::Offer {
        ice.setup_local(preview.audio > 0, preview.video > 0);
    }
    if ice.streams() > 0 {
        ice.wait_gathering(gathering_timeout).await.map_err(|e| {
            warn!(handle = handle.id(), error = ?e, "candidate gathering did not complete");
            ApiError::JsepInvalidSdp
        })?;
    }
    let stripped = anonymize(&jsep.sdp);
    let credentials = ice.local_credentials();
    let ctx = MergeContext {
        ufrag: credentials.ufrag,
        pwd: credentials.pwd,
        fingerprint: credentials.fingerprint,
        audio_candidates: ice
            .audio_stream()
            .map(|s| ice.local_candidates(s))
            .unwrap_or_default(),
        video_candidates: ice
            .video_stream()
            .map(|s| ice.local_candidates(s))
            .unwrap_or_default(),
        public_ip,
    };
    let merged = merge(&stripped, &ctx);
    if jsep.kind == SdpKind::Answer {
        debug!(handle = handle.id(), "answer merged; installing remote candidates");
        install_remote_candidates(ice.as_ref());
    }
    Ok(Jsep {
        kind: jsep.kind,
        sdp: merged,
    })
}

/// Install remote candidates for components 1 and 2 of each present stream.
fn install_remote_candidates(ice: &dyn IceLink) {
    for stream in [ice.audio_stream(), ice.video_stream()].into_iter().flatten() {
        ice.add_remote_candidates(stream, 1);
        ice.add_remote_candidates(stream, 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=- 1 1 IN IP4 192.0.2.10\r\n\
        s=session\r\n\
        t=0 0\r\n\
        m=audio 5000 RTP/SAVPF 111\r\n\
        c=IN IP4 192.0.2.10\r\n\
        a=ice-ufrag:abcd\r\n\
        a=ice-pwd:secret\r\n\
        a=fingerprint:sha-256 AA:BB\r\n\
        a=candidate:1 1 udp 1 192.0.2.10 5000 typ host\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        m=video 5002 RTP/SAVPF 100\r\n\
        c=IN IP4 192.0.2.10\r\n\
        a=rtpmap:100 VP8/90000\r\n";

    #[test]
    fn preparse_counts_media_sections() {
        let preview = preparse(OFFER).unwrap();
        assert_eq!(preview, SdpPreview { audio: 1, video: 1 });
    }

    #[test]
    fn preparse_rejects_garbage() {
        assert_eq!(preparse(""), Err(ApiError::JsepInvalidSdp));
        assert_eq!(preparse("not sdp at all"), Err(ApiError::JsepInvalidSdp));
        assert_eq!(preparse("v=0\r\nbroken line\r\n"), Err(ApiError::JsepInvalidSdp));
    }

    #[test]
    fn anonymize_strips_trust_boundary_lines() {
        let stripped = anonymize(OFFER);
        assert!(!stripped.contains("ice-ufrag"));
        assert!(!stripped.contains("ice-pwd"));
        assert!(!stripped.contains("fingerprint"));
        assert!(!stripped.contains("candidate"));
        assert!(stripped.contains("m=audio 5000 RTP/SAVPF 111"));
        assert!(stripped.contains("a=rtpmap:111 opus/48000/2"));
    }

    #[test]
    fn anonymize_is_idempotent() {
        let once = anonymize(OFFER);
        let twice = anonymize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_injects_credentials_per_media_section() {
        let ctx = MergeContext {
            ufrag: "uf".into(),
            pwd: "pw".into(),
            fingerprint: "FP".into(),
            audio_candidates: vec!["candidate:a 1 udp 1 198.51.100.1 1111 typ host".into()],
            video_candidates: vec!["candidate:v 1 udp 1 198.51.100.1 2222 typ host".into()],
            public_ip: Some("198.51.100.1".parse().unwrap()),
        };
        let merged = merge(&anonymize(OFFER), &ctx);
        assert_eq!(merged.matches("a=ice-ufrag:uf").count(), 2);
        assert_eq!(merged.matches("a=fingerprint:sha-256 FP").count(), 2);
        assert!(merged.contains("a=candidate:a 1 udp 1 198.51.100.1 1111 typ host"));
        assert!(merged.contains("a=candidate:v 1 udp 1 198.51.100.1 2222 typ host"));
        assert!(merged.contains("c=IN IP4 198.51.100.1"));
        assert!(!merged.contains("c=IN IP4 192.0.2.10"));
    }

    #[test]
    fn jsep_serializes_with_lowercase_type() {
        let jsep = Jsep {
            kind: SdpKind::Offer,
            sdp: "v=0".into(),
        };
        let value = serde_json::to_value(&jsep).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["sdp"], "v=0");
    }
}

//! Session-description rewriting for conference media.
//!
//! Small line-wise transforms applied to offers and answers before they
//! reach the media stack: bandwidth ceilings, packet time and DTX in group
//! mode, constant-bitrate opus on request, a tool attribute identifying the
//! build, and a video-strip mode for audio-only re-negotiation.

use tracing::debug;

// Bandwidth ceilings in kbps (b=AS).
const AUDIO_ONEONE_BANDWIDTH: u32 = 50;
const AUDIO_GROUP_BANDWIDTH: u32 = 32;
const VIDEO_ONEONE_BANDWIDTH: u32 = 800;
const VIDEO_GROUP_BANDWIDTH: u32 = 300;

/// What `check` learned about a remote description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SdpInfo {
    /// The remote's opus fmtp asks for constant bitrate.
    pub remote_cbr: bool,
    /// Value of the remote `a=tool:` attribute, if present.
    pub tool: Option<String>,
    /// At least one relay ICE candidate is present.
    pub has_relay_candidate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Session,
    Audio,
    Video,
    Application,
    Other,
}

fn section_of(m_line: &str) -> Section {
    let name = m_line
        .strip_prefix("m=")
        .unwrap_or("")
        .split_whitespace()
        .next()
        .unwrap_or("");
    match name {
        "audio" => Section::Audio,
        "video" => Section::Video,
        "application" => Section::Application,
        _ => Section::Other,
    }
}

fn bandwidth_for(section: Section, group: bool) -> Option<u32> {
    match (section, group) {
        (Section::Audio, false) => Some(AUDIO_ONEONE_BANDWIDTH),
        (Section::Audio, true) => Some(AUDIO_GROUP_BANDWIDTH),
        (Section::Video, false) => Some(VIDEO_ONEONE_BANDWIDTH),
        (Section::Video, true) => Some(VIDEO_GROUP_BANDWIDTH),
        _ => None,
    }
}

/// Payload types mapped to opus in the given description.
fn opus_payload_types(sdp: &str) -> Vec<String> {
    sdp.lines()
        .filter_map(|line| {
            let rest = line.trim_end().strip_prefix("a=rtpmap:")?;
            let (pt, codec) = rest.split_once(' ')?;
            codec
                .to_ascii_lowercase()
                .starts_with("opus/")
                .then(|| pt.to_string())
        })
        .collect()
}

fn append_fmtp_param(line: &str, param: &str) -> String {
    let trimmed = line.trim_end();
    if trimmed.contains(param) {
        return trimmed.to_string();
    }
    format!("{trimmed};{param}")
}

struct Transform<'a> {
    group: bool,
    audio_cbr: bool,
    /// `usedtx=1` is appended only in group answers.
    answer: bool,
    tool: &'a str,
}

/// One pass over the description: replace bandwidth lines, adjust opus fmtp
/// params, and add ptime/tool attributes where the section calls for them.
fn apply(sdp: &str, t: &Transform<'_>) -> String {
    let opus_pts = opus_payload_types(sdp);
    let mut out: Vec<String> = Vec::new();
    let mut section = Section::Session;
    let mut bandwidth_done = false;
    let mut tool_done = false;

    for line in sdp.lines() {
        let trimmed = line.trim_end();

        if trimmed.starts_with("m=") {
            section = section_of(trimmed);
            out.push(trimmed.to_string());
            bandwidth_done = false;
            continue;
        }

        // session-level tool attribute, once, before the first m-line
        if section == Section::Session && !tool_done && trimmed.starts_with("t=") {
            out.push(trimmed.to_string());
            out.push(format!("a=tool:{}", t.tool));
            tool_done = true;
            continue;
        }

        if trimmed.starts_with("b=AS:") {
            if let Some(bw) = bandwidth_for(section, t.group) {
                if !bandwidth_done {
                    out.push(format!("b=AS:{bw}"));
                    bandwidth_done = true;
                }
                continue;
            }
        }

        if section == Section::Audio {
            if trimmed.starts_with("a=ptime:") && t.group {
                out.push("a=ptime:40".to_string());
                continue;
            }
            if let Some(rest) = trimmed.strip_prefix("a=fmtp:") {
                let pt = rest.split(' ').next().unwrap_or("");
                if opus_pts.iter().any(|p| p == pt) {
                    let mut fmtp = trimmed.to_string();
                    if t.audio_cbr {
                        fmtp = append_fmtp_param(&fmtp, "cbr=1");
                    }
                    if t.group && t.answer {
                        fmtp = append_fmtp_param(&fmtp, "usedtx=1");
                    }
                    out.push(fmtp);
                    continue;
                }
            }
        }

        // insert a bandwidth line after c= when the original had none
        if !bandwidth_done && trimmed.starts_with("c=") && section != Section::Session {
            out.push(trimmed.to_string());
            if let Some(bw) = bandwidth_for(section, t.group) {
                out.push(format!("b=AS:{bw}"));
                bandwidth_done = true;
            }
            continue;
        }

        out.push(trimmed.to_string());
    }

    let mut res = out.join("\r\n");
    res.push_str("\r\n");
    res
}

/// Rewrite a local offer before it is sent.
pub fn modify_offer(sdp: &str, group: bool, audio_cbr: bool, tool: &str) -> String {
    debug!(group, audio_cbr, "modifying sdp offer");
    apply(
        sdp,
        &Transform {
            group,
            audio_cbr,
            answer: false,
            tool,
        },
    )
}

/// Rewrite a local answer before it is sent.
pub fn modify_answer(sdp: &str, group: bool, audio_cbr: bool, tool: &str) -> String {
    debug!(group, audio_cbr, "modifying sdp answer");
    apply(
        sdp,
        &Transform {
            group,
            audio_cbr,
            answer: true,
            tool,
        },
    )
}

/// Flip video directionality for an audio-only renegotiation: a sending
/// video section goes inactive, a receiving one becomes send-only.
pub fn strip_video(sdp: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut section = Section::Session;

    for line in sdp.lines() {
        let trimmed = line.trim_end();
        if trimmed.starts_with("m=") {
            section = section_of(trimmed);
        }
        if section == Section::Video {
            match trimmed {
                "a=sendonly" => {
                    out.push("a=inactive".to_string());
                    continue;
                }
                "a=recvonly" => {
                    out.push("a=sendonly".to_string());
                    continue;
                }
                _ => {}
            }
        }
        out.push(trimmed.to_string());
    }

    let mut res = out.join("\r\n");
    res.push_str("\r\n");
    res
}

/// Inspect a remote description: CBR request, tool attribute, relay
/// candidates.
pub fn check(sdp: &str) -> SdpInfo {
    let opus_pts = opus_payload_types(sdp);
    let mut info = SdpInfo::default();

    for line in sdp.lines() {
        let trimmed = line.trim_end();
        if let Some(rest) = trimmed.strip_prefix("a=fmtp:") {
            let pt = rest.split(' ').next().unwrap_or("");
            if opus_pts.iter().any(|p| p == pt) && rest.contains("cbr=1") {
                info.remote_cbr = true;
            }
        } else if let Some(tool) = trimmed.strip_prefix("a=tool:") {
            info.tool = Some(tool.to_string());
        } else if trimmed.starts_with("a=candidate:") && trimmed.contains("relay") {
            info.has_relay_candidate = true;
        }
    }
    info
}

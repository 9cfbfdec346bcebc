use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide media state shared between the host, the controllers, and
/// the media layer: the local mute flag and the tool/environment identity
/// advertised to SFTs and in SDP.
///
/// Controllers hold a reference and read it; only the host mutates the mute
/// flag.
#[derive(Debug)]
pub struct MediaSystemContext {
    muted: AtomicBool,
    tool_name: String,
    tool_version: String,
    env: Option<String>,
}

impl MediaSystemContext {
    pub fn new(tool_name: &str, tool_version: &str, env: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            muted: AtomicBool::new(false),
            tool_name: tool_name.to_string(),
            tool_version: tool_version.to_string(),
            env: env.map(String::from),
        })
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    /// Full tool string, e.g. `"huddle 0.3.1"`.
    pub fn tool(&self) -> String {
        format!("{} {}", self.tool_name, self.tool_version)
    }

    pub fn tool_version(&self) -> &str {
        &self.tool_version
    }

    pub fn env(&self) -> Option<&str> {
        self.env.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mute_flag_round_trip() {
        let ctx = MediaSystemContext::new("huddle", "0.3.1", None);
        assert!(!ctx.is_muted());
        ctx.set_muted(true);
        assert!(ctx.is_muted());
    }

    #[test]
    fn tool_string() {
        let ctx = MediaSystemContext::new("huddle", "0.3.1", Some("staging"));
        assert_eq!(ctx.tool(), "huddle 0.3.1");
        assert_eq!(ctx.env(), Some("staging"));
    }
}

use serde::{Deserialize, Serialize};

// Wire-protocol constants shared by the controller and its collaborators.
pub const SESSION_KEY_LEN: usize = 32; // 256-bit media session keys
pub const MAX_VSTREAMS: u32 = 10; // video streams advertised in CONFCONN
pub const MAX_TURN_SERVERS: usize = 10;

/// A TURN/STUN server entry forwarded to the SFT in `CONFCONN`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// One SFT endpoint from the call configuration, with optional auth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SftServer {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Call configuration as delivered by the host.
///
/// `sft_servers` is the short list this client should join through;
/// `sft_servers_all` is the federation-wide allow list used to decide whether
/// an SFT advertised by a peer may be connected to at all. An empty allow
/// list means legacy behaviour: any SFT is acceptable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallConfig {
    #[serde(default)]
    pub sft_servers: Vec<SftServer>,
    #[serde(default)]
    pub sft_servers_all: Vec<SftServer>,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default)]
    pub is_federating: bool,
}

/// Normalise an SFT URL to carry exactly one trailing slash.
pub fn normalize_sft_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    format!("{trimmed}/")
}

/// URL equality ignoring the trailing slash.
pub fn sft_urls_equal(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

impl CallConfig {
    /// Look up an SFT entry (with credentials) in the federation allow list.
    pub fn sft_info(&self, url: &str) -> Option<&SftServer> {
        self.sft_servers_all
            .iter()
            .find(|s| sft_urls_equal(&s.url, url))
    }

    /// Whether this client is allowed to connect to the given SFT.
    pub fn can_connect_sft(&self, url: &str) -> bool {
        if self.sft_servers_all.is_empty() {
            // Legacy configs carry no allow list; any SFT is acceptable.
            return true;
        }
        self.sft_info(url).is_some()
    }
}

use serde_json::{Map, Value};

/// Localpart prefix distinguishing bridge-managed identities from human
/// ones; stripping it recovers the destination address.
pub const DEFAULT_USER_PREFIX: &str = "voip_";

#[derive(Clone, Debug, Default)]
pub struct BridgeConfig {
    pub verto_url: String,
    pub login: String,
    pub passwd: String,
    pub user_prefix: String,
    /// Base dialog parameters merged into every outbound invite/bye.
    pub dialog_params: Map<String, Value>,
}

impl BridgeConfig {
    /// Whether a localpart names one of the bridge's own identities.
    pub fn is_bridge_identity(&self, localpart: &str) -> bool {
        localpart.starts_with(&self.user_prefix)
    }

    /// Destination number/address behind a bridge identity.
    pub fn target_address<'a>(&self, identity: &'a str) -> &'a str {
        identity.strip_prefix(&self.user_prefix).unwrap_or(identity)
    }
}

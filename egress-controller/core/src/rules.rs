use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const ADDRESS_GROUP_PREFIX: &str = "ipgroup";

/// Address group names may be at most 80 characters long.
pub const MAX_ADDRESS_GROUP_NAME_LEN: usize = 80;

const DIGEST_SUFFIX_BYTES: usize = 8;

/// A named set of firewall rules applied to the addresses of the inventory objects selected by its
/// selectors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EgressRule {
    pub name: String,

    /// Each selector contributes one address group. Groups are OR'd: a rule applies to the
    /// addresses of every object matched by any of its selectors.
    pub selectors: Vec<Selector>,

    pub rules: Vec<RuleSpec>,
}

/// Matches inventory objects that carry the label `key=value`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Selector {
    pub kind: SelectorKind,
    pub key: String,
    pub value: String,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum SelectorKind {
    Node,
    Pod,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleSpec {
    pub collection: String,
    pub name: String,

    /// An explicit collection priority. When unset, the priority is derived from the action and
    /// the rule kind.
    pub priority: Option<i32>,

    pub action: Action,
    pub kind: RuleKind,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub enum Action {
    Allow,
    Deny,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuleKind {
    Network(NetworkRuleSpec),
    Application(ApplicationRuleSpec),
}

/// Matches traffic by destination address (or FQDN), port and IP protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkRuleSpec {
    pub destination: Destination,
    pub ports: Vec<String>,

    /// `TCP`, `UDP` or `ICMP`. Any other token matches any protocol.
    pub protocols: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    Addresses(Vec<String>),
    Fqdns(Vec<String>),
}

/// Matches HTTP(S) traffic by target FQDN or URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplicationRuleSpec {
    pub target_fqdns: Vec<String>,
    pub target_urls: Vec<String>,

    /// `SCHEME:PORT` pairs, e.g. `HTTP:80` or `HTTPS:443`.
    pub protocols: Vec<String>,
}

// === impl Selector ===

impl Selector {
    pub fn node(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: SelectorKind::Node,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn pod(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: SelectorKind::Pod,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, labels: &crate::inventory::Labels) -> bool {
        labels.get(&self.key) == Some(&self.value)
    }

    /// The name of the backend address group that holds this selector's addresses.
    ///
    /// Distinct selectors always get distinct names. Characters other than ASCII alphanumerics and
    /// `.` are escaped as `_xx` per byte, so the `-` separators are unambiguous. Names longer than
    /// the backend's limit are truncated and suffixed with a digest of the selector.
    pub fn address_group_name(&self) -> String {
        let kind = match self.kind {
            SelectorKind::Node => "node",
            SelectorKind::Pod => "pod",
        };
        let name = format!(
            "{}-{}-{}-{}",
            ADDRESS_GROUP_PREFIX,
            kind,
            escape(&self.key),
            escape(&self.value)
        );
        if name.len() <= MAX_ADDRESS_GROUP_NAME_LEN {
            return name;
        }

        let digest = Sha256::new()
            .chain_update(kind)
            .chain_update([0u8])
            .chain_update(&self.key)
            .chain_update([0u8])
            .chain_update(&self.value)
            .finalize();
        let suffix = hex::encode(&digest[..DIGEST_SUFFIX_BYTES]);
        // The escaped name is ASCII, so any byte offset is a char boundary.
        let keep = MAX_ADDRESS_GROUP_NAME_LEN - suffix.len() - 1;
        format!("{}-{}", &name[..keep], suffix)
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || b == b'.' {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("_{:02x}", b));
        }
    }
    out
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SelectorKind::Node => write!(f, "node:{}={}", self.key, self.value),
            SelectorKind::Pod => write!(f, "pod:{}={}", self.key, self.value),
        }
    }
}

// === impl RuleSpec ===

impl RuleSpec {
    /// Returns the explicit priority or the default for the rule's action and kind.
    ///
    /// The defaults order evaluation as Allow-Application, Deny-Application, Allow-Network,
    /// Deny-Network.
    pub fn priority(&self) -> i32 {
        self.priority.unwrap_or_else(|| self.default_priority())
    }

    pub fn default_priority(&self) -> i32 {
        match (self.action, &self.kind) {
            (Action::Allow, RuleKind::Application(_)) => 210,
            (Action::Allow, RuleKind::Network(_)) => 110,
            (Action::Deny, RuleKind::Application(_)) => 200,
            (Action::Deny, RuleKind::Network(_)) => 100,
        }
    }
}

// === impl ApplicationRuleSpec ===

impl ApplicationRuleSpec {
    #[inline]
    pub fn terminate_tls(&self) -> bool {
        !self.target_urls.is_empty()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => f.write_str("Allow"),
            Self::Deny => f.write_str("Deny"),
        }
    }
}

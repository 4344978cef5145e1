//! Topic naming.
//!
//! Stage-to-stage topics are fixed names. Bridge-facing and translation
//! topics embed the platform id, with every run of `:`, `/` or `#`
//! characters collapsed into a single `_` so the name is safe for any
//! broker.
//!
//! | Topic | Direction |
//! |---|---|
//! | `arm_prm` | client gateway → platform routing |
//! | `prm_ipsmrm` | platform routing → semantic routing |
//! | `ipsmrm_bridge_<pid>` | semantic routing → bridge |
//! | `bridge_ipsmrm_<pid>` | bridge → semantic routing |
//! | `ipsmrm_prm` | semantic routing → platform routing |
//! | `prm_arm` | platform routing → client gateway |
//! | `error` | diagnostics |

/// Fixed topics of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerTopic {
    Error,
    PrmArm,
    ArmPrm,
    IpsmrmPrm,
    PrmIpsmrm,
    IpsmrmBridge,
    BridgeIpsmrm,
}

impl BrokerTopic {
    pub fn name(self) -> &'static str {
        match self {
            BrokerTopic::Error => "error",
            BrokerTopic::PrmArm => "prm_arm",
            BrokerTopic::ArmPrm => "arm_prm",
            BrokerTopic::IpsmrmPrm => "ipsmrm_prm",
            BrokerTopic::PrmIpsmrm => "prm_ipsmrm",
            BrokerTopic::IpsmrmBridge => "ipsmrm_bridge",
            BrokerTopic::BridgeIpsmrm => "bridge_ipsmrm",
        }
    }

    /// Per-platform variant of this topic, e.g. `ipsmrm_bridge_http_p1`.
    pub fn for_platform(self, platform_id: &str) -> String {
        escape_topic_name(&format!("{}_{}", self.name(), platform_id))
    }
}

/// Collapse every run of `:`, `/`, `#` into a single `_`.
pub fn escape_topic_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_run = false;
    for c in raw.chars() {
        if matches!(c, ':' | '/' | '#') {
            if !in_run {
                out.push('_');
                in_run = true;
            }
        } else {
            out.push(c);
            in_run = false;
        }
    }
    out
}

/// Topic the semantic stage publishes to for downstream translation.
pub fn to_translation_downstream(platform_id: &str) -> String {
    escape_topic_name(&format!("mw-ipsm-downstream-{platform_id}"))
}

/// Topic the translation service answers on for downstream traffic.
pub fn from_translation_downstream(platform_id: &str) -> String {
    escape_topic_name(&format!("ipsm-mw-downstream-{platform_id}"))
}

/// Topic the semantic stage publishes to for upstream translation.
pub fn to_translation_upstream(platform_id: &str) -> String {
    escape_topic_name(&format!("mw-ipsm-upstream-{platform_id}"))
}

/// Topic the translation service answers on for upstream traffic.
pub fn from_translation_upstream(platform_id: &str) -> String {
    escape_topic_name(&format!("ipsm-mw-upstream-{platform_id}"))
}

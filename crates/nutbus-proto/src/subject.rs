//! NATS subject layout
//!
//! Streams carry fire-and-forget events; mailboxes are request/reply
//! subjects with a bounded receive timeout on the requester side.

/// Inbound asset lifecycle events (JSON [`AssetMessage`](crate::AssetMessage)).
pub const ASSET_EVENTS: &str = "assets.events";

/// Licensing metric stream; the relevant metric is
/// `monitoring.global@rackcontroller-0`.
pub const LICENSING_EVENTS: &str = "licensing.events";

/// Asset service mailbox: `GET <uuid> <subtype>…` -> `<uuid> OK <name>…`.
pub const ASSET_MAILBOX_ASSETS: &str = "asset.mailbox.assets";

/// Asset service mailbox: `GET <uuid> <name>` -> `<uuid> <json asset>`.
pub const ASSET_MAILBOX_DETAIL: &str = "asset.mailbox.detail";

/// Asset service mailbox for updates: `READWRITE <uuid> <json asset>` -> `OK`.
pub const ASSET_MAILBOX_MANIPULATION: &str = "asset.mailbox.manipulation";

/// Rule engine mailbox: `ADD <json>` -> `OK` | error (`ALREADY_EXISTS` is
/// treated as success).
pub const RULE_MAILBOX: &str = "alerts.rules";

/// Outbound power-device metrics.
pub const DEVICE_METRICS: &str = "metrics.device";

/// Outbound environmental sensor metrics.
pub const SENSOR_METRICS: &str = "metrics.sensor";

/// Outbound alert events, topic `<rule>/<severity>@<asset>`.
pub const ALERT_EVENTS: &str = "alerts.events";

/// Outbound inventory events, topic `inventory@<asset>`.
pub const INVENTORY_EVENTS: &str = "inventory.events";

/// Power command request mailbox.
pub const POWER_COMMANDS: &str = "power.commands";

/// Credential store mailbox: `GET <uuid> <usage>` -> `<uuid> <json documents>`.
pub const CREDENTIAL_MAILBOX: &str = "security.mailbox.documents";

/// Credential store change notifications.
pub const CREDENTIAL_EVENTS: &str = "security.events";

/// Metric topic in the `<quantity>@<asset>` convention. NATS subject
/// separators in the quantity are kept as-is; they form the hierarchy.
pub fn metric_topic(base: &str, quantity: &str, asset: &str) -> String {
    format!("{base}.{quantity}@{asset}")
}

/// Alert topic in the `<rule>/<severity>@<asset>` convention.
pub fn alert_topic(rule: &str, severity: &str, asset: &str) -> String {
    format!("{}.{}/{}@{}", ALERT_EVENTS, rule, severity, asset)
}

/// Inventory topic `inventory@<asset>`.
pub fn inventory_topic(asset: &str) -> String {
    format!("{}.inventory@{}", INVENTORY_EVENTS, asset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_the_at_convention() {
        assert_eq!(
            metric_topic(DEVICE_METRICS, "load.default", "epdu-7"),
            "metrics.device.load.default@epdu-7"
        );
        assert_eq!(
            alert_topic("ambient.temperature@ups-1", "WARNING", "ups-1"),
            "alerts.events.ambient.temperature@ups-1/WARNING@ups-1"
        );
        assert_eq!(inventory_topic("ups-1"), "inventory.events.inventory@ups-1");
    }
}

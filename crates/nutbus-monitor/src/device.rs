//! Polled device values
//!
//! Keeps the measurement and inventory state of one UPS/ePDU/ATS as NUT
//! presents it. Physical values are stored x100 as integers with a
//! changed flag and a normalization candidate; inventory entries carry
//! value + changed flag. State is created on first discovery and cleared
//! only when the device leaves the catalog.

use crate::mapping::Mapping;
use nutbus_state::Asset;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalValue {
    /// Value multiplied by 100.
    pub value: i64,
    pub changed: bool,
    pub candidate: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryValue {
    pub value: String,
    pub changed: bool,
}

/// Render an x100 integer back to its decimal string.
pub fn itof(value: i64) -> String {
    if value % 100 == 0 {
        (value / 100).to_string()
    } else {
        let text = format!("{:.2}", value as f64 / 100.0);
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// One monitored power device.
#[derive(Debug, Default)]
pub struct NutDevice {
    asset: Option<Arc<Asset>>,
    nut_name: String,
    physics: BTreeMap<String, PhysicalValue>,
    inventory: BTreeMap<String, InventoryValue>,
    last_update: i64,
}

impl NutDevice {
    pub fn new(asset: Arc<Asset>, nut_name: String) -> Self {
        Self {
            asset: Some(asset),
            nut_name,
            ..Self::default()
        }
    }

    pub fn asset_name(&self) -> &str {
        self.asset.as_ref().map(|a| a.name()).unwrap_or("")
    }

    pub fn nut_name(&self) -> &str {
        &self.nut_name
    }

    pub fn subtype(&self) -> &str {
        self.asset.as_ref().map(|a| a.subtype()).unwrap_or("")
    }

    pub fn daisy_chain(&self) -> u32 {
        self.asset.as_ref().map(|a| a.daisy_chain()).unwrap_or(0)
    }

    pub fn max_current(&self) -> Option<f64> {
        self.asset.as_ref().and_then(|a| a.max_current())
    }

    pub fn last_update(&self) -> i64 {
        self.last_update
    }

    /// `""` for standalone devices, `device.<chain>.` inside a chain.
    pub fn daisy_prefix(&self) -> String {
        match self.daisy_chain() {
            0 => String::new(),
            chain => format!("device.{chain}."),
        }
    }

    /// Fold a raw NUT variable map into the device state.
    ///
    /// Unforced updates debounce measurements: an insignificant drift is
    /// parked as a candidate and only committed when the next read still
    /// disagrees with the stored value. A forced update adopts every
    /// reading as-is.
    pub fn update(
        &mut self,
        vars: &BTreeMap<String, Vec<String>>,
        mapping: &Mapping,
        force: bool,
    ) {
        let mut scoped = self.scope_to_chain(vars);
        normalize_vars(&mut scoped);

        for (nut_name, values) in &scoped {
            let Some(first) = values.first() else {
                continue;
            };
            if let Some(canonical) = mapping.map_physics(nut_name) {
                match first.parse::<f64>() {
                    Ok(number) => self.update_physics(&canonical, (number * 100.0).round() as i64, force),
                    // non-numeric mapped values (status tokens, test
                    // results) live in the inventory map
                    Err(_) => self.update_inventory(&canonical, &values.join(", ")),
                }
            }
            if let Some(canonical) = mapping.map_inventory(nut_name) {
                self.update_inventory(&canonical, &values.join(", "));
            }
        }

        self.last_update = chrono::Utc::now().timestamp();
    }

    /// Keep only the variables of this device's chain position, prefix
    /// stripped. Standalone devices take the map as-is.
    fn scope_to_chain(&self, vars: &BTreeMap<String, Vec<String>>) -> BTreeMap<String, Vec<String>> {
        let prefix = self.daisy_prefix();
        if prefix.is_empty() {
            return vars.clone();
        }
        vars.iter()
            .filter_map(|(key, values)| {
                key.strip_prefix(&prefix)
                    .map(|stripped| (stripped.to_string(), values.clone()))
            })
            .collect()
    }

    fn update_physics(&mut self, name: &str, value: i64, force: bool) {
        match self.physics.get_mut(name) {
            None => {
                self.physics.insert(
                    name.to_string(),
                    PhysicalValue {
                        value,
                        changed: true,
                        candidate: None,
                    },
                );
            }
            Some(entry) if force => {
                if entry.value != value {
                    entry.value = value;
                    entry.changed = true;
                }
                entry.candidate = None;
            }
            Some(entry) => {
                if entry.value == value {
                    entry.candidate = None;
                } else if is_significant_change(entry.value, value) || entry.candidate.is_some() {
                    // a large move, or the second reading in a row that
                    // disagrees with the stored value
                    entry.value = value;
                    entry.changed = true;
                    entry.candidate = None;
                } else {
                    // park an insignificant drift until the next read
                    entry.candidate = Some(value);
                }
            }
        }
    }

    fn update_inventory(&mut self, name: &str, value: &str) {
        match self.inventory.get_mut(name) {
            None => {
                self.inventory.insert(
                    name.to_string(),
                    InventoryValue {
                        value: value.to_string(),
                        changed: true,
                    },
                );
            }
            Some(entry) => {
                if entry.value != value {
                    entry.value = value.to_string();
                    entry.changed = true;
                }
            }
        }
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.physics.contains_key(name) || self.inventory.contains_key(name)
    }

    /// Property value as a string, physics first.
    pub fn property(&self, name: &str) -> Option<String> {
        if let Some(entry) = self.physics.get(name) {
            return Some(itof(entry.value));
        }
        self.inventory.get(name).map(|entry| entry.value.clone())
    }

    /// Measurement values, optionally only the changed ones.
    pub fn physics(&self, only_changed: bool) -> BTreeMap<String, String> {
        self.physics
            .iter()
            .filter(|(_, entry)| !only_changed || entry.changed)
            .map(|(name, entry)| (name.clone(), itof(entry.value)))
            .collect()
    }

    /// Inventory values, optionally only the changed ones.
    pub fn inventory(&self, only_changed: bool) -> BTreeMap<String, String> {
        self.inventory
            .iter()
            .filter(|(_, entry)| !only_changed || entry.changed)
            .map(|(name, entry)| (name.clone(), entry.value.clone()))
            .collect()
    }

    pub fn set_changed(&mut self, name: &str, changed: bool) {
        if let Some(entry) = self.physics.get_mut(name) {
            entry.changed = changed;
        }
        if let Some(entry) = self.inventory.get_mut(name) {
            entry.changed = changed;
        }
    }

    /// Forget all polled state.
    pub fn clear(&mut self) {
        self.physics.clear();
        self.inventory.clear();
    }
}

/// A move of more than 5% of the stored magnitude is adopted without
/// waiting for a confirming read.
fn is_significant_change(old: i64, new: i64) -> bool {
    (new - old).abs() * 100 > old.abs() * 5
}

/// Normalize the raw variable map across driver families: synthesize
/// `ups.load` and `ups.realpower` when a per-phase breakdown exists but
/// the aggregate is missing.
fn normalize_vars(vars: &mut BTreeMap<String, Vec<String>>) {
    set_if_not_present(vars, "ups.load", "output.load");

    if !vars.contains_key("ups.realpower") {
        let mut sum = 0.0;
        let mut seen = false;
        for phase in 1..=3 {
            if let Some(values) = vars.get(&format!("output.L{phase}.realpower")) {
                if let Some(Ok(value)) = values.first().map(|v| v.parse::<f64>()) {
                    sum += value;
                    seen = true;
                }
            }
        }
        if seen {
            vars.insert(
                "ups.realpower".to_string(),
                vec![crate::engine::format_value(sum)],
            );
        }
    }
}

fn set_if_not_present(vars: &mut BTreeMap<String, Vec<String>>, dst: &str, src: &str) {
    if !vars.contains_key(dst) {
        if let Some(values) = vars.get(src) {
            vars.insert(dst.to_string(), values.clone());
        }
    }
}

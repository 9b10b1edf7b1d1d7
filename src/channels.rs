//! Channel registry: maps wire header nibbles to channel descriptors.
//!
//! The static [`ChannelTable`] lists every channel the device can stream and
//! the variants selectable for each (e.g. "1 CH" .. "3 CH" for the ADC). The
//! [`ChannelRegistry`] publishes the descriptors of the currently selected
//! variants as an immutable snapshot. Writers build a new snapshot and swap it
//! in, so the frame assembler never observes a half-updated mapping.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::codec::{is_supported_bit_width, DEFAULT_BIT_WIDTH};
use crate::errors::{DriverError, Result};

/// Number of distinct header nibbles on the wire.
const NIBBLE_SLOTS: usize = 16;

// ============================================================================
// Static configuration
// ============================================================================

/// One selectable configuration of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelVariant {
    pub name: String,
    /// Channel-type id sent in the high nibble of the packet type byte.
    pub nibble: u8,
    /// One label per streamed channel; the channel count is the label count.
    pub labels: Vec<String>,
    /// Nominal sample rate in Hz.
    pub rate: u16,
    /// Arguments appended to the module init command. Empty means the module
    /// is not initialised explicitly.
    #[serde(default)]
    pub init_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub variants: Vec<ChannelVariant>,
    pub default_variant: String,
    #[serde(default = "default_signed")]
    pub signed: bool,
    /// Modules that must be initialised before this one.
    #[serde(default)]
    pub requires: Vec<String>,
}

fn default_signed() -> bool {
    true
}

impl ChannelConfig {
    pub fn variant(&self, name: &str) -> Option<&ChannelVariant> {
        self.variants.iter().find(|v| v.name == name)
    }
}

/// Every channel the device knows about, in module init order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTable {
    pub channels: Vec<ChannelConfig>,
}

impl ChannelTable {
    /// The channel set shipped with the sensor firmware.
    pub fn builtin() -> Self {
        fn variant(name: &str, nibble: u8, labels: &[&str], rate: u16, args: &[&str]) -> ChannelVariant {
            ChannelVariant {
                name: name.to_string(),
                nibble,
                labels: labels.iter().map(|s| s.to_string()).collect(),
                rate,
                init_args: args.iter().map(|s| s.to_string()).collect(),
            }
        }

        let channels = vec![
            ChannelConfig {
                name: "PPG".into(),
                variants: vec![variant("PPG", 0xB, &["IR", "RED"], 250, &["1", "250", "1", "02", "-1"])],
                default_variant: "PPG".into(),
                signed: true,
                requires: Vec::new(),
            },
            ChannelConfig {
                name: "ECG".into(),
                variants: vec![variant(
                    "ECG",
                    0xC,
                    &["ECG"],
                    250,
                    &["1", "250", "3", "01", "1", "1", "0010", "-1"],
                )],
                default_variant: "ECG".into(),
                signed: true,
                requires: Vec::new(),
            },
            ChannelConfig {
                name: "ADC".into(),
                variants: vec![
                    variant("1 CH", 0xA, &["CH 1"], 250, &["1", "250", "1", "01"]),
                    variant("2 CH", 0xA, &["CH 1", "CH 2"], 250, &["1", "250", "1", "03"]),
                    variant(
                        "3 CH",
                        0xA,
                        &["CH 1", "CH 2", "CH 3"],
                        250,
                        &["1", "250", "1", "07", "-1"],
                    ),
                ],
                default_variant: "3 CH".into(),
                signed: true,
                requires: Vec::new(),
            },
            ChannelConfig {
                name: "TEMP".into(),
                variants: vec![variant("TEMP", 0x9, &["Temp"], 1, &[])],
                default_variant: "TEMP".into(),
                signed: true,
                requires: vec!["PPG".into()],
            },
        ];

        ChannelTable { channels }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let table: ChannelTable = serde_json::from_str(json)?;
        table.validate()?;
        Ok(table)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.name == name)
    }

    /// Check names, variants, nibbles and that dependencies precede dependents.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for config in &self.channels {
            if !seen.insert(config.name.as_str()) {
                return Err(DriverError::Config(format!("duplicate channel {}", config.name)));
            }
            if config.variant(&config.default_variant).is_none() {
                return Err(DriverError::UnknownVariant {
                    channel: config.name.clone(),
                    variant: config.default_variant.clone(),
                });
            }
            for v in &config.variants {
                if usize::from(v.nibble) >= NIBBLE_SLOTS {
                    return Err(DriverError::Config(format!(
                        "{}/{}: header nibble {:#X} out of range",
                        config.name, v.name, v.nibble
                    )));
                }
                if v.labels.is_empty() || v.rate == 0 {
                    return Err(DriverError::Config(format!(
                        "{}/{}: needs at least one label and a non-zero rate",
                        config.name, v.name
                    )));
                }
            }
            for dep in &config.requires {
                if !seen.contains(dep.as_str()) || dep == &config.name {
                    return Err(DriverError::Config(format!(
                        "{} requires {}, which must be declared before it",
                        config.name, dep
                    )));
                }
            }
        }
        Ok(())
    }

    /// Modules to initialise for `wanted`, dependencies included, in table order.
    pub fn init_order<S: AsRef<str>>(&self, wanted: &[S]) -> Result<Vec<String>> {
        let mut needed = BTreeSet::new();
        let mut stack: Vec<String> = wanted.iter().map(|s| s.as_ref().to_string()).collect();
        while let Some(name) = stack.pop() {
            let config = self
                .channel(&name)
                .ok_or_else(|| DriverError::UnknownChannel(name.clone()))?;
            if needed.insert(name) {
                stack.extend(config.requires.iter().cloned());
            }
        }

        Ok(self
            .channels
            .iter()
            .filter(|c| needed.contains(&c.name))
            .map(|c| c.name.clone())
            .collect())
    }
}

// ============================================================================
// Runtime registry
// ============================================================================

/// The resolved configuration of one channel, as the decoder needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub name: String,
    pub variant: String,
    pub nibble: u8,
    pub labels: Vec<String>,
    pub rate: u16,
    pub signed: bool,
    /// Configured sample width, one of 16, 20, 24, 32.
    pub bit_width: u8,
}

impl ChannelDescriptor {
    fn from_variant(config: &ChannelConfig, variant: &ChannelVariant, bit_width: u8) -> Self {
        Self {
            name: config.name.clone(),
            variant: variant.name.clone(),
            nibble: variant.nibble,
            labels: variant.labels.clone(),
            rate: variant.rate,
            signed: config.signed,
            bit_width,
        }
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.labels.len()
    }

    /// Duration of one sample in milliseconds.
    pub fn sample_period_ms(&self) -> f64 {
        1000.0 / f64::from(self.rate)
    }
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    by_nibble: [Option<Arc<ChannelDescriptor>>; NIBBLE_SLOTS],
    by_name: HashMap<String, Arc<ChannelDescriptor>>,
    selected: BTreeSet<String>,
}

impl Snapshot {
    fn insert(&mut self, descriptor: Arc<ChannelDescriptor>) -> Result<()> {
        let slot = usize::from(descriptor.nibble);
        if let Some(existing) = &self.by_nibble[slot] {
            if existing.name != descriptor.name {
                return Err(DriverError::HeaderConflict {
                    nibble: descriptor.nibble,
                    existing: existing.name.clone(),
                    incoming: descriptor.name.clone(),
                });
            }
        }

        if let Some(previous) = self.by_name.get(&descriptor.name) {
            self.by_nibble[usize::from(previous.nibble)] = None;
        }
        self.by_nibble[slot] = Some(descriptor.clone());
        self.by_name.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }
}

/// Runtime channel mapping shared by the data reader and the orchestrator.
pub struct ChannelRegistry {
    table: ChannelTable,
    current: ArcSwap<Snapshot>,
    // serialises writers; readers never take it
    writer: Mutex<()>,
}

impl ChannelRegistry {
    /// Build the registry with every channel on its default variant.
    pub fn new(table: ChannelTable) -> Result<Self> {
        table.validate()?;

        let mut snapshot = Snapshot::default();
        for config in &table.channels {
            let variant = config
                .variant(&config.default_variant)
                .ok_or_else(|| DriverError::UnknownVariant {
                    channel: config.name.clone(),
                    variant: config.default_variant.clone(),
                })?;
            snapshot.insert(Arc::new(ChannelDescriptor::from_variant(
                config,
                variant,
                DEFAULT_BIT_WIDTH,
            )))?;
        }

        Ok(Self {
            table,
            current: ArcSwap::from_pointee(snapshot),
            writer: Mutex::new(()),
        })
    }

    pub fn builtin() -> Result<Self> {
        Self::new(ChannelTable::builtin())
    }

    pub fn table(&self) -> &ChannelTable {
        &self.table
    }

    /// Descriptor currently registered under a header nibble.
    pub fn resolve(&self, nibble: u8) -> Option<Arc<ChannelDescriptor>> {
        self.current
            .load()
            .by_nibble
            .get(usize::from(nibble))
            .and_then(|slot| slot.clone())
    }

    pub fn descriptor(&self, name: &str) -> Option<Arc<ChannelDescriptor>> {
        self.current.load().by_name.get(name).cloned()
    }

    pub fn selected_variant(&self, name: &str) -> Option<String> {
        self.descriptor(name).map(|d| d.variant.clone())
    }

    pub fn variants(&self, name: &str) -> Option<Vec<String>> {
        self.table
            .channel(name)
            .map(|c| c.variants.iter().map(|v| v.name.clone()).collect())
    }

    /// Init command arguments for the channel's selected variant.
    pub fn init_args(&self, name: &str) -> Option<Vec<String>> {
        let descriptor = self.descriptor(name)?;
        self.table
            .channel(name)?
            .variant(&descriptor.variant)
            .map(|v| v.init_args.clone())
    }

    /// Switch `name` to `variant` and publish the new mapping.
    ///
    /// Rejected, leaving the previous mapping active, when the variant's
    /// nibble is held by another channel.
    pub fn update(&self, name: &str, variant: &str) -> Result<Arc<ChannelDescriptor>> {
        let config = self
            .table
            .channel(name)
            .ok_or_else(|| DriverError::UnknownChannel(name.to_string()))?;
        let selected = config
            .variant(variant)
            .ok_or_else(|| DriverError::UnknownVariant {
                channel: name.to_string(),
                variant: variant.to_string(),
            })?;

        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.current.load_full();
        let bit_width = current
            .by_name
            .get(name)
            .map_or(DEFAULT_BIT_WIDTH, |d| d.bit_width);
        let descriptor = Arc::new(ChannelDescriptor::from_variant(config, selected, bit_width));

        let mut next = (*current).clone();
        if let Err(e) = next.insert(descriptor.clone()) {
            warn!("variant update rejected: {e}");
            return Err(e);
        }
        self.current.store(Arc::new(next));

        info!(
            "variant update: {} -> {} | header={:#X} ch={} labels={:?}",
            name,
            variant,
            descriptor.nibble,
            descriptor.channels(),
            descriptor.labels
        );
        Ok(descriptor)
    }

    /// Set the configured sample width of a channel.
    ///
    /// Widths other than 16, 20, 24 and 32, and unknown channels, are ignored.
    /// Returns whether the setting was applied.
    pub fn set_bit_width(&self, name: &str, bits: u8) -> bool {
        if !is_supported_bit_width(bits) {
            debug!("ignoring unsupported bit width {bits} for {name}");
            return false;
        }

        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.current.load_full();
        let Some(existing) = current.by_name.get(name) else {
            debug!("ignoring bit width for unknown channel {name}");
            return false;
        };
        if existing.bit_width == bits {
            return true;
        }

        let descriptor = Arc::new(ChannelDescriptor {
            bit_width: bits,
            ..(**existing).clone()
        });
        let mut next = (*current).clone();
        next.by_nibble[usize::from(descriptor.nibble)] = Some(descriptor.clone());
        next.by_name.insert(name.to_string(), descriptor);
        self.current.store(Arc::new(next));
        debug!("{name}: bit width set to {bits}");
        true
    }

    pub fn bit_width(&self, name: &str) -> Option<u8> {
        self.descriptor(name).map(|d| d.bit_width)
    }

    // ------------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------------

    pub fn select(&self, name: &str) -> bool {
        self.set_selected(name, true)
    }

    pub fn unselect(&self, name: &str) -> bool {
        self.set_selected(name, false)
    }

    pub fn is_selected(&self, name: &str) -> bool {
        self.current.load().selected.contains(name)
    }

    /// Selected channels, in table order.
    pub fn selected_channels(&self) -> Vec<String> {
        let snapshot = self.current.load();
        self.table
            .channels
            .iter()
            .filter(|c| snapshot.selected.contains(&c.name))
            .map(|c| c.name.clone())
            .collect()
    }

    fn set_selected(&self, name: &str, selected: bool) -> bool {
        if self.table.channel(name).is_none() {
            return false;
        }
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (*self.current.load_full()).clone();
        if selected {
            next.selected.insert(name.to_string());
        } else {
            next.selected.remove(name);
        }
        self.current.store(Arc::new(next));
        true
    }
}

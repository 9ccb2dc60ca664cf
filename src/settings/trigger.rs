// src/settings/trigger.rs
//! Trigger sources, detection modes and the mask rules between them

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::RegisterWrite;
use crate::config::limits;
use crate::error::{CardError, CardResult, ConfigRule};
use crate::hal::registers::{self, trigger_mask, trigger_mode};
use crate::hal::HardwareProfile;

/// Where a trigger event can come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TriggerSource {
    /// Issued by the host
    Software,
    /// External trigger input line
    External(u8),
    /// Analog input channel crossing its trigger level
    Channel(u8),
}

/// Detection mode of an external line or channel trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TriggerDetection {
    /// Rising edge
    #[default]
    PositiveEdge,
    /// Falling edge
    NegativeEdge,
    /// Either edge
    BothEdges,
    /// Signal above level
    High,
    /// Signal below level
    Low,
}

impl TriggerDetection {
    /// Edge-type modes are only legal in the OR mask
    pub fn is_edge(self) -> bool {
        matches!(
            self,
            TriggerDetection::PositiveEdge | TriggerDetection::NegativeEdge | TriggerDetection::BothEdges
        )
    }

    /// Level-type modes are only legal in the AND mask
    pub fn is_level(self) -> bool {
        !self.is_edge()
    }

    /// Mode register value
    pub fn register_value(self) -> i64 {
        match self {
            TriggerDetection::PositiveEdge => trigger_mode::POSITIVE,
            TriggerDetection::NegativeEdge => trigger_mode::NEGATIVE,
            TriggerDetection::BothEdges => trigger_mode::BOTH,
            TriggerDetection::High => trigger_mode::HIGH,
            TriggerDetection::Low => trigger_mode::LOW,
        }
    }
}

/// Detection setup of one external trigger line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExternalTrigger {
    pub line: u8,
    pub mode: TriggerDetection,
    pub level_mv: i32,
    /// Minimum pulse width in samples, 0 disables the check
    #[serde(default)]
    pub pulse_width: u32,
}

/// Detection setup of one channel trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelTrigger {
    pub channel: u8,
    pub mode: TriggerDetection,
    pub level: i32,
}

/// Trigger configuration of one card
///
/// A source in `or_sources` fires the card on its own; sources in
/// `and_sources` must all be active together. Both sets empty means the card
/// never triggers by itself, which is how StarHub subordinates are set up.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TriggerSettings {
    #[serde(default)]
    pub or_sources: BTreeSet<TriggerSource>,
    #[serde(default)]
    pub and_sources: BTreeSet<TriggerSource>,
    /// Detection per external line; unlisted lines use a rising edge at 0 mV
    #[serde(default)]
    pub external: Vec<ExternalTrigger>,
    /// Detection per channel; unlisted channels use a rising edge at level 0
    #[serde(default)]
    pub channel_triggers: Vec<ChannelTrigger>,
}

impl TriggerSettings {
    /// No trigger source at all
    pub fn none() -> Self {
        Self::default()
    }

    /// Software trigger only
    pub fn software() -> Self {
        Self::none().with_or(TriggerSource::Software)
    }

    /// Single external line in the OR mask
    pub fn external(line: u8, mode: TriggerDetection, level_mv: i32) -> Self {
        Self::none()
            .with_or(TriggerSource::External(line))
            .with_external(ExternalTrigger { line, mode, level_mv, pulse_width: 0 })
    }

    /// Add a source to the OR mask
    pub fn with_or(mut self, source: TriggerSource) -> Self {
        self.or_sources.insert(source);
        self
    }

    /// Add a source to the AND mask
    pub fn with_and(mut self, source: TriggerSource) -> Self {
        self.and_sources.insert(source);
        self
    }

    /// Set detection of an external line
    pub fn with_external(mut self, trigger: ExternalTrigger) -> Self {
        self.external.retain(|t| t.line != trigger.line);
        self.external.push(trigger);
        self
    }

    /// Set detection of a channel
    pub fn with_channel_trigger(mut self, trigger: ChannelTrigger) -> Self {
        self.channel_triggers.retain(|t| t.channel != trigger.channel);
        self.channel_triggers.push(trigger);
        self
    }

    /// Detection of an external line
    pub fn external_trigger(&self, line: u8) -> ExternalTrigger {
        self.external
            .iter()
            .find(|t| t.line == line)
            .copied()
            .unwrap_or(ExternalTrigger { line, ..ExternalTrigger::default() })
    }

    /// Detection of a channel
    pub fn channel_trigger(&self, channel: u8) -> ChannelTrigger {
        self.channel_triggers
            .iter()
            .find(|t| t.channel == channel)
            .copied()
            .unwrap_or(ChannelTrigger { channel, ..ChannelTrigger::default() })
    }

    /// True when the host is the only source
    pub fn is_software_only(&self) -> bool {
        self.and_sources.is_empty()
            && self.or_sources.len() == 1
            && self.or_sources.contains(&TriggerSource::Software)
    }

    /// True when nothing can trigger the card
    pub fn is_empty(&self) -> bool {
        self.or_sources.is_empty() && self.and_sources.is_empty()
    }

    /// Software source present in the OR mask
    pub fn allows_software(&self) -> bool {
        self.or_sources.contains(&TriggerSource::Software)
    }

    fn detection(&self, source: TriggerSource) -> Option<TriggerDetection> {
        match source {
            TriggerSource::Software => None,
            TriggerSource::External(line) => Some(self.external_trigger(line).mode),
            TriggerSource::Channel(channel) => Some(self.channel_trigger(channel).mode),
        }
    }

    fn sources(&self) -> impl Iterator<Item = TriggerSource> + '_ {
        self.or_sources.iter().chain(self.and_sources.iter()).copied()
    }

    /// Check the mask rules against the card
    pub fn validate(&self, profile: &HardwareProfile) -> CardResult<()> {
        for source in self.sources() {
            match source {
                TriggerSource::External(line) if usize::from(line) >= limits::EXTERNAL_TRIGGER_LINES => {
                    return Err(CardError::config(
                        ConfigRule::ValueOutOfRange,
                        format!("external trigger line {} does not exist", line),
                    ));
                }
                TriggerSource::Channel(channel) if usize::from(channel) >= profile.num_channels() => {
                    return Err(CardError::config(
                        ConfigRule::ChannelNotPresent,
                        format!("trigger channel {} not on a {}-channel card", channel, profile.num_channels()),
                    ));
                }
                _ => {}
            }
        }

        if let Some(source) = self.or_sources.intersection(&self.and_sources).next() {
            return Err(CardError::config(
                ConfigRule::TriggerMaskOverlap,
                format!("{:?} is in both the AND and the OR mask", source),
            ));
        }
        if self.and_sources.contains(&TriggerSource::Software) {
            return Err(CardError::config(
                ConfigRule::ValueOutOfRange,
                "software trigger can only be used in the OR mask",
            ));
        }
        for &source in &self.and_sources {
            if let Some(mode) = self.detection(source) {
                if !mode.is_level() {
                    return Err(CardError::config(
                        ConfigRule::AndMaskRequiresLevel,
                        format!("{:?} uses {:?} in the AND mask", source, mode),
                    ));
                }
            }
        }
        for &source in &self.or_sources {
            if let Some(mode) = self.detection(source) {
                if !mode.is_edge() {
                    return Err(CardError::config(
                        ConfigRule::OrMaskRequiresEdge,
                        format!("{:?} uses {:?} in the OR mask", source, mode),
                    ));
                }
            }
        }

        let mut module_edges: BTreeMap<usize, (u8, TriggerDetection)> = BTreeMap::new();
        for source in self.sources() {
            let TriggerSource::Channel(channel) = source else {
                continue;
            };
            let Some(mode) = self.detection(source).filter(|m| m.is_edge()) else {
                continue;
            };
            let module = profile.module_of(usize::from(channel));
            match module_edges.get(&module) {
                Some(&(other, other_mode)) if other_mode != mode => {
                    return Err(CardError::config(
                        ConfigRule::ModuleEdgeMismatch,
                        format!(
                            "channels {} ({:?}) and {} ({:?}) share module {}",
                            other, other_mode, channel, mode, module
                        ),
                    ));
                }
                Some(_) => {}
                None => {
                    module_edges.insert(module, (channel, mode));
                }
            }
        }
        Ok(())
    }

    /// Derived register writes: masks, then line modes, then channel modes
    ///
    /// Only meaningful for settings that passed [`validate`](Self::validate).
    pub(crate) fn register_writes(&self) -> Vec<RegisterWrite> {
        let (or_mask, or_channels) = masks(&self.or_sources);
        let (and_mask, and_channels) = masks(&self.and_sources);
        let mut writes = vec![
            (registers::TRIG_OR_MASK, or_mask),
            (registers::TRIG_AND_MASK, and_mask),
            (registers::TRIG_CH_OR_MASK, or_channels),
            (registers::TRIG_CH_AND_MASK, and_channels),
        ];

        let used: BTreeSet<TriggerSource> = self.sources().collect();
        for source in &used {
            if let TriggerSource::External(line) = *source {
                let trigger = self.external_trigger(line);
                let line = usize::from(line);
                writes.push((registers::TRIG_EXT_MODE.at(line), trigger.mode.register_value()));
                writes.push((registers::TRIG_EXT_LEVEL.at(line), i64::from(trigger.level_mv)));
                writes.push((registers::TRIG_EXT_PULSE_WIDTH.at(line), i64::from(trigger.pulse_width)));
            }
        }
        for source in &used {
            if let TriggerSource::Channel(channel) = *source {
                let trigger = self.channel_trigger(channel);
                let channel = usize::from(channel);
                writes.push((registers::TRIG_CH_MODE.at(channel), trigger.mode.register_value()));
                writes.push((registers::TRIG_CH_LEVEL.at(channel), i64::from(trigger.level)));
            }
        }
        writes
    }
}

// (general mask, channel mask)
fn masks(sources: &BTreeSet<TriggerSource>) -> (i64, i64) {
    sources.iter().fold((trigger_mask::NONE, 0), |(general, channels), source| match *source {
        TriggerSource::Software => (general | trigger_mask::SOFTWARE, channels),
        TriggerSource::External(line) => (general | bit(trigger_mask::EXT0, line), channels),
        TriggerSource::Channel(channel) => (general, channels | bit(1, channel)),
    })
}

// Bits past the mask width are dropped
fn bit(base: i64, shift: u8) -> i64 {
    base.checked_shl(u32::from(shift)).unwrap_or(0)
}

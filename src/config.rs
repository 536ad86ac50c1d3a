use std::collections::BTreeMap;
use std::hash::Hasher;

use bitflags::bitflags;
use log::{debug, warn};
use rustc_hash::FxHasher;

use crate::geometry::Rect;
use crate::output::{Output, OutputId};
use crate::screen::Screen;

bitflags! {
    /// Features a backend can support. Queried through
    /// [`Config::supported_features`].
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        /// The backend knows about the concept of a primary display.
        const PRIMARY_DISPLAY = 1;
        /// The backend supports setting the config, it is not read-only.
        const WRITABLE = 1 << 1;
        /// The backend supports scaling each output individually.
        const PER_OUTPUT_SCALING = 1 << 2;
        /// The backend supports replication of outputs.
        const OUTPUT_REPLICATION = 1 << 3;
        /// The backend supports automatic rotation of outputs.
        const AUTO_ROTATION = 1 << 4;
        /// The backend supports querying if a device is in tablet mode.
        const TABLET_MODE = 1 << 5;
        /// The backend blocks until output setting changes are applied.
        const SYNCHRONOUS_OUTPUT_CHANGES = 1 << 6;
        /// The backend adapts Xwayland clients to a certain scale.
        const XWAYLAND_SCALES = 1 << 7;
    }
}

bitflags! {
    /// Optional checks for [`Config::can_be_applied`].
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct ValidityFlags: u32 {
        const REQUIRE_AT_LEAST_ONE_ENABLED_SCREEN = 1;
    }
}

/// A screen configuration: one [`Screen`] plus the set of known outputs.
///
/// This is the aggregate root of the data model. A config is either
/// synthesized empty and populated by a caller (to request changes), or
/// built by a backend from a live topology snapshot. It exclusively owns
/// its outputs; `clone()` deep-copies.
#[derive(Debug, Default, Clone)]
pub struct Config {
    pub screen: Screen,
    outputs: BTreeMap<OutputId, Output>,
    valid: bool,
    features: Features,
    tablet_mode_available: bool,
    tablet_mode_engaged: bool,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    pub fn supported_features(&self) -> Features {
        self.features
    }

    /// Set by the backend, not by consumers.
    pub fn set_supported_features(&mut self, features: Features) {
        self.features = features;
    }

    pub fn tablet_mode_available(&self) -> bool {
        self.tablet_mode_available
    }

    pub fn set_tablet_mode_available(&mut self, available: bool) {
        self.tablet_mode_available = available;
    }

    pub fn tablet_mode_engaged(&self) -> bool {
        self.tablet_mode_engaged
    }

    pub fn set_tablet_mode_engaged(&mut self, engaged: bool) {
        self.tablet_mode_engaged = engaged;
    }

    pub fn output(&self, id: OutputId) -> Option<&Output> {
        self.outputs.get(&id)
    }

    pub fn output_mut(&mut self, id: OutputId) -> Option<&mut Output> {
        self.outputs.get_mut(&id)
    }

    /// All outputs, iterated in id order.
    pub fn outputs(&self) -> impl Iterator<Item = &Output> {
        self.outputs.values()
    }

    pub fn output_ids(&self) -> Vec<OutputId> {
        self.outputs.keys().copied().collect()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn connected_outputs(&self) -> impl Iterator<Item = &Output> {
        self.outputs.values().filter(|o| o.connected)
    }

    /// The output with priority 1, if any.
    pub fn primary_output(&self) -> Option<&Output> {
        self.outputs.values().find(|o| o.is_primary())
    }

    /// Add an output without restoring priority invariants.
    ///
    /// Callers doing bulk rebuilds batch their additions and call
    /// [`adjust_priorities`](Self::adjust_priorities) once afterwards.
    pub fn add_output(&mut self, output: Output) {
        self.outputs.insert(output.id, output);
    }

    /// Remove an output without restoring priority invariants. See
    /// [`add_output`](Self::add_output).
    pub fn remove_output(&mut self, id: OutputId) -> Option<Output> {
        self.outputs.remove(&id)
    }

    /// Replace the whole output set and restore invariants immediately.
    pub fn set_outputs(&mut self, outputs: Vec<Output>) {
        self.outputs.clear();
        for output in outputs {
            self.outputs.insert(output.id, output);
        }
        self.adjust_priorities(None);
    }

    /// Set an output's priority, then restore invariants while trying to
    /// keep the output close to its requested rank. Priority 0 disables the
    /// output; any positive value enables it.
    pub fn set_output_priority(&mut self, id: OutputId, priority: u32) {
        let Some(output) = self.outputs.get_mut(&id) else {
            warn!("set_output_priority: unknown output {id}");
            return;
        };
        if priority == 0 {
            output.enabled = false;
            output.priority = 0;
            self.adjust_priorities(None);
        } else {
            output.enabled = true;
            output.priority = priority;
            self.adjust_priorities(Some(id));
        }
    }

    /// Making an output primary is equivalent to giving it priority 1.
    pub fn set_primary_output(&mut self, id: OutputId) {
        self.set_output_priority(id, 1);
    }

    /// Ensure consistency and continuity of priorities.
    ///
    /// Works in both directions of the zero/disabled equivalence: disabled
    /// outputs get priority 0, outputs with priority 0 get disabled. The
    /// remaining enabled outputs are renumbered strictly sequentially from 1
    /// in their current priority order, ties broken in favor of `keep` and
    /// then by id. Deterministic and idempotent.
    pub fn adjust_priorities(&mut self, keep: Option<OutputId>) {
        for output in self.outputs.values_mut() {
            if !output.enabled {
                output.priority = 0;
            } else if output.priority == 0 {
                output.enabled = false;
            }
        }
        let mut enabled: Vec<(u32, OutputId)> = self
            .outputs
            .values()
            .filter(|o| o.enabled)
            .map(|o| (o.priority, o.id))
            .collect();
        enabled.sort_by_key(|&(priority, id)| (priority, Some(id) != keep, id));
        for (index, &(_, id)) in enabled.iter().enumerate() {
            if let Some(output) = self.outputs.get_mut(&id) {
                output.priority = index as u32 + 1;
            }
        }
    }

    /// Identifying hash over the *set* of connected outputs.
    ///
    /// Individual output hashes are combined in sorted order, so the result
    /// is stable under any permutation of insertion order and changes only
    /// when a connected output's identity (EDID or name) changes.
    pub fn connected_outputs_hash(&self) -> String {
        let mut hashes: Vec<String> = self
            .connected_outputs()
            .map(|o| o.identity_hash())
            .collect();
        hashes.sort_unstable();
        let mut hasher = FxHasher::default();
        for hash in &hashes {
            hasher.write(hash.as_bytes());
        }
        format!("{:016x}", hasher.finish())
    }

    /// Merge another config's values into this one in place.
    ///
    /// Used when live state is re-imported but the identity of the target
    /// config object must survive.
    pub fn apply(&mut self, other: &Config) {
        self.screen = other.screen.clone();
        self.features = other.features;
        self.tablet_mode_available = other.tablet_mode_available;
        self.tablet_mode_engaged = other.tablet_mode_engaged;

        let stale: Vec<OutputId> = self
            .outputs
            .keys()
            .filter(|id| !other.outputs.contains_key(id))
            .copied()
            .collect();
        for id in stale {
            debug!("apply: dropping output {id}");
            self.outputs.remove(&id);
        }
        for (id, output) in &other.outputs {
            self.outputs.insert(*id, output.clone());
        }
        self.valid = other.valid;
    }

    /// Recompute the screen's current size as the bounding box of all
    /// enabled outputs.
    pub fn refresh_screen_size(&mut self) {
        let mut bounds = Rect::default();
        for output in self.outputs.values().filter(|o| o.enabled) {
            bounds = bounds.united(&output.geometry());
        }
        self.screen.current_size = crate::geometry::Size::new(bounds.width, bounds.height);
    }

    /// Check whether this config could be applied on the current system.
    pub fn can_be_applied(&self, flags: ValidityFlags) -> bool {
        let mut enabled_count = 0u32;
        for output in self.outputs.values() {
            if !output.connected {
                continue;
            }
            if !output.enabled {
                continue;
            }
            enabled_count += 1;
            let Some(mode_id) = output.current_mode_id.as_deref() else {
                warn!("output {} enabled but has no current mode", output.name);
                return false;
            };
            if output.mode(mode_id).is_none() {
                warn!(
                    "output {} refers to unknown mode {mode_id}",
                    output.name
                );
                return false;
            }
        }
        if enabled_count > self.screen.max_active_outputs_count {
            warn!(
                "{} enabled outputs exceed the limit of {}",
                enabled_count, self.screen.max_active_outputs_count
            );
            return false;
        }
        if flags.contains(ValidityFlags::REQUIRE_AT_LEAST_ONE_ENABLED_SCREEN) && enabled_count == 0
        {
            warn!("no enabled output in config");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Size;
    use crate::mode::Mode;

    fn output(id: OutputId, name: &str, enabled: bool, priority: u32) -> Output {
        let mut o = Output::new(id);
        o.name = name.into();
        o.connected = true;
        o.enabled = enabled;
        o.priority = priority;
        o
    }

    fn priorities(config: &Config) -> Vec<(OutputId, u32, bool)> {
        config.outputs().map(|o| (o.id, o.priority, o.enabled)).collect()
    }

    #[test]
    fn adjust_renumbers_densely() {
        let mut config = Config::new();
        config.add_output(output(1, "DP-1", true, 7));
        config.add_output(output(2, "DP-2", true, 3));
        config.add_output(output(3, "DP-3", false, 9));
        config.adjust_priorities(None);
        assert_eq!(priorities(&config), vec![(1, 2, true), (2, 1, true), (3, 0, false)]);
    }

    #[test]
    fn adjust_is_idempotent() {
        let mut config = Config::new();
        config.add_output(output(1, "DP-1", true, 5));
        config.add_output(output(2, "DP-2", true, 5));
        config.add_output(output(3, "DP-3", false, 2));
        config.adjust_priorities(Some(2));
        let first = priorities(&config);
        config.adjust_priorities(Some(2));
        assert_eq!(priorities(&config), first);
    }

    #[test]
    fn adjust_disables_priority_zero_outputs() {
        let mut config = Config::new();
        config.add_output(output(1, "DP-1", true, 0));
        config.add_output(output(2, "DP-2", true, 1));
        config.adjust_priorities(None);
        let o1 = config.output(1).unwrap();
        assert!(!o1.enabled);
        assert_eq!(o1.priority, 0);
        assert_eq!(config.output(2).unwrap().priority, 1);
    }

    #[test]
    fn single_enabled_output_becomes_primary() {
        let mut config = Config::new();
        config.add_output(output(1, "DP-1", true, 42));
        config.adjust_priorities(None);
        assert!(config.output(1).unwrap().is_primary());
        assert_eq!(config.primary_output().unwrap().id, 1);
    }

    #[test]
    fn disabling_the_primary_promotes_the_next() {
        // Outputs {A: priority 1 enabled, B: priority 2 enabled};
        // after setOutputPriority(A, 0): A disabled, B primary.
        let mut config = Config::new();
        config.add_output(output(1, "A", true, 1));
        config.add_output(output(2, "B", true, 2));
        config.set_output_priority(1, 0);
        let a = config.output(1).unwrap();
        let b = config.output(2).unwrap();
        assert!(!a.enabled);
        assert_eq!(a.priority, 0);
        assert!(b.enabled);
        assert_eq!(b.priority, 1);
    }

    #[test]
    fn set_primary_demotes_previous_primary() {
        let mut config = Config::new();
        config.add_output(output(1, "A", true, 1));
        config.add_output(output(2, "B", true, 2));
        config.set_primary_output(2);
        assert_eq!(config.output(2).unwrap().priority, 1);
        assert_eq!(config.output(1).unwrap().priority, 2);
    }

    #[test]
    fn setting_positive_priority_enables_output() {
        let mut config = Config::new();
        config.add_output(output(1, "A", true, 1));
        config.add_output(output(2, "B", false, 0));
        config.set_output_priority(2, 1);
        let b = config.output(2).unwrap();
        assert!(b.enabled);
        assert_eq!(b.priority, 1);
        assert_eq!(config.output(1).unwrap().priority, 2);
    }

    #[test]
    fn connected_hash_ignores_insertion_order() {
        let mut forward = Config::new();
        forward.add_output(output(1, "DP-1", true, 1));
        forward.add_output(output(2, "HDMI-1", true, 2));

        let mut reverse = Config::new();
        reverse.add_output(output(2, "HDMI-1", true, 2));
        reverse.add_output(output(1, "DP-1", true, 1));

        assert_eq!(forward.connected_outputs_hash(), reverse.connected_outputs_hash());
    }

    #[test]
    fn connected_hash_tracks_identity_changes() {
        let mut config = Config::new();
        config.add_output(output(1, "DP-1", true, 1));
        let before = config.connected_outputs_hash();
        config.output_mut(1).unwrap().edid = b"different panel".to_vec();
        assert_ne!(config.connected_outputs_hash(), before);
    }

    #[test]
    fn apply_merges_in_place() {
        let mut live = Config::new();
        live.add_output(output(1, "DP-1", true, 1));
        live.add_output(output(2, "DP-2", true, 2));

        let mut incoming = Config::new();
        incoming.add_output(output(2, "DP-2", true, 1));
        incoming.add_output(output(3, "DP-3", true, 2));
        incoming.set_valid(true);

        live.apply(&incoming);
        assert!(live.output(1).is_none());
        assert!(live.output(2).is_some());
        assert!(live.output(3).is_some());
        assert!(live.is_valid());
    }

    #[test]
    fn can_be_applied_requires_known_current_mode() {
        let mut config = Config::new();
        config.screen.max_active_outputs_count = 4;
        let mut o = output(1, "DP-1", true, 1);
        o.current_mode_id = Some("missing".into());
        config.add_output(o);
        assert!(!config.can_be_applied(ValidityFlags::empty()));

        let o = config.output_mut(1).unwrap();
        o.modes.insert(
            "missing".into(),
            Mode::new("missing", Size::new(1920, 1080), 60.0),
        );
        assert!(config.can_be_applied(ValidityFlags::empty()));
    }

    #[test]
    fn can_be_applied_checks_enabled_count() {
        let mut config = Config::new();
        config.screen.max_active_outputs_count = 1;
        for id in 1..=2 {
            let mut o = output(id, &format!("DP-{id}"), true, id);
            o.current_mode_id = Some("m".into());
            o.modes.insert("m".into(), Mode::new("m", Size::new(800, 600), 60.0));
            config.add_output(o);
        }
        assert!(!config.can_be_applied(ValidityFlags::empty()));
    }

    #[test]
    fn empty_config_fails_enabled_screen_check() {
        let config = Config::new();
        assert!(config.can_be_applied(ValidityFlags::empty()));
        assert!(!config.can_be_applied(ValidityFlags::REQUIRE_AT_LEAST_ONE_ENABLED_SCREEN));
    }
}

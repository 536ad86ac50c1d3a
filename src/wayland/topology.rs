use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};

use crate::config::{Config, Features};
use crate::output::OutputId;
use crate::wayland::device::{DeviceEvent, DeviceState};

/// Synchronization phases of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Waiting for the transport to connect.
    Connecting,
    /// Connected, waiting for the registry's sync marker.
    Enumerating,
    /// Registry enumerated, waiting for every announced output's burst.
    AwaitingOutputs,
    /// A consistent snapshot has been published at least once.
    Ready,
}

/// What a protocol event did to the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing to publish yet.
    Pending,
    /// First consistent snapshot; listeners get their initial notification.
    BecameReady,
    /// Snapshot rebuilt after the first ready state; listeners get the new
    /// snapshot.
    Updated,
}

const WAYLAND_FEATURES: Features = Features::WRITABLE
    .union(Features::PER_OUTPUT_SCALING)
    .union(Features::AUTO_ROTATION)
    .union(Features::SYNCHRONOUS_OUTPUT_CHANGES);

/// Tracks the set of outputs mid-update, decides overall readiness, and
/// rebuilds the canonical [`Config`] snapshot from completed aggregators.
///
/// Owns its device aggregators exclusively; the transport layer only feeds
/// decoded events in. Single-threaded, processes events in arrival order.
#[derive(Debug)]
pub struct Topology {
    state: SyncState,
    registry_done: bool,
    /// Outputs announced but whose burst has not completed yet.
    pending: BTreeSet<OutputId>,
    /// Set when an announcement arrives after Ready; suppresses premature
    /// notifications until the newcomer's burst completes.
    blocked: bool,
    devices: BTreeMap<OutputId, DeviceState>,
    next_id: OutputId,
    /// Desired display order by output name, from the ordering channel.
    output_order: Option<Vec<String>>,
    pending_order: Vec<String>,
    config: Config,
    initialized: bool,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    pub fn new() -> Self {
        Self {
            state: SyncState::Connecting,
            registry_done: false,
            pending: BTreeSet::new(),
            blocked: false,
            devices: BTreeMap::new(),
            next_id: 0,
            output_order: None,
            pending_order: Vec::new(),
            config: Config::new(),
            initialized: false,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// True once the first snapshot has been published.
    pub fn initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device(&self, id: OutputId) -> Option<&DeviceState> {
        self.devices.get(&id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceState> {
        self.devices.values()
    }

    /// Transport reported the connection established.
    pub fn connected(&mut self) {
        if self.state == SyncState::Connecting {
            self.state = SyncState::Enumerating;
        }
    }

    /// The registry's one-shot sync marker: all initial globals announced.
    /// Does not imply any output finished its own burst.
    pub fn registry_synced(&mut self) -> SyncOutcome {
        self.registry_done = true;
        if self.state == SyncState::Enumerating {
            self.state = SyncState::AwaitingOutputs;
        }
        self.check_ready()
    }

    /// A new output device was announced; binds it to a fresh aggregator
    /// and puts it in the pending set until its burst completes.
    pub fn announce_device(&mut self) -> OutputId {
        self.next_id += 1;
        let id = self.next_id;
        self.devices.insert(id, DeviceState::new(id));
        self.pending.insert(id);
        if self.state == SyncState::Ready {
            debug!("output {id} announced after ready, holding notifications");
            self.blocked = true;
        }
        id
    }

    /// Feed one decoded event to the output's aggregator.
    pub fn device_event(&mut self, id: OutputId, event: DeviceEvent) -> SyncOutcome {
        let Some(device) = self.devices.get_mut(&id) else {
            warn!("event for unknown output {id}, ignored");
            return SyncOutcome::Pending;
        };
        if device.handle_event(event) {
            self.pending.remove(&id);
            return self.check_ready();
        }
        SyncOutcome::Pending
    }

    /// The transport withdrew an output; drop its aggregator and shrink the
    /// snapshot.
    pub fn remove_device(&mut self, id: OutputId) -> SyncOutcome {
        if self.devices.remove(&id).is_none() {
            warn!("removal of unknown output {id}, ignored");
            return SyncOutcome::Pending;
        }
        self.pending.remove(&id);
        if self.initialized {
            self.rebuild();
            return SyncOutcome::Updated;
        }
        self.check_ready()
    }

    /// One entry of an ordering burst.
    pub fn order_output(&mut self, name: String) {
        self.pending_order.push(name);
    }

    /// Terminal marker of an ordering burst; swaps in the new order and
    /// republishes if already initialized.
    pub fn order_done(&mut self) -> SyncOutcome {
        self.output_order = Some(std::mem::take(&mut self.pending_order));
        if self.initialized && self.pending.is_empty() {
            self.rebuild();
            return SyncOutcome::Updated;
        }
        SyncOutcome::Pending
    }

    /// Ready holds when the registry is enumerated, no output is mid-burst,
    /// and at least one aggregator exists.
    fn check_ready(&mut self) -> SyncOutcome {
        if !self.registry_done || !self.pending.is_empty() || self.devices.is_empty() {
            return SyncOutcome::Pending;
        }
        self.blocked = false;
        self.rebuild();
        self.state = SyncState::Ready;
        if self.initialized {
            SyncOutcome::Updated
        } else {
            self.initialized = true;
            SyncOutcome::BecameReady
        }
    }

    /// Rebuild the canonical snapshot from all aggregators: stale outputs
    /// are dropped, new ones added, survivors updated in place preserving
    /// identity.
    fn rebuild(&mut self) {
        let stale: Vec<OutputId> = self
            .config
            .output_ids()
            .into_iter()
            .filter(|id| !self.devices.contains_key(id))
            .collect();
        for id in stale {
            debug!("dropping stale output {id} from snapshot");
            self.config.remove_output(id);
        }
        for (id, device) in &self.devices {
            match self.config.output_mut(*id) {
                Some(output) => device.update_output(output),
                None => self.config.add_output(device.to_output()),
            }
        }

        let mut features = WAYLAND_FEATURES;
        if let Some(order) = self.output_order.clone() {
            // The ordering channel is the authoritative primary signal.
            features |= Features::PRIMARY_DISPLAY;
            self.apply_output_order(&order);
        } else if self.devices.len() == 1 {
            // A lone output is always the primary.
            let id = *self.devices.keys().next().expect("one device");
            if let Some(output) = self.config.output_mut(id) {
                output.enabled = true;
                output.priority = 1;
            }
        } else if !self.devices.is_empty() {
            self.keep_previous_priorities();
        }
        self.config.adjust_priorities(None);

        self.config.set_supported_features(features);
        self.config.screen.max_active_outputs_count = self.devices.len().max(1) as u32;
        self.config.refresh_screen_size();
        self.config.set_valid(true);
    }

    fn apply_output_order(&mut self, order: &[String]) {
        let named: Vec<(String, OutputId)> = self
            .config
            .outputs()
            .map(|o| (o.name.clone(), o.id))
            .collect();
        let mut next = order.len() as u32;
        for (name, id) in named {
            let position = order.iter().position(|n| *n == name);
            let priority = match position {
                Some(index) => index as u32 + 1,
                None => {
                    // Not ordered yet, e.g. a fresh hot-plug; rank it last.
                    next += 1;
                    next
                }
            };
            if let Some(output) = self.config.output_mut(id) {
                if output.enabled {
                    output.priority = priority;
                }
            }
        }
    }

    /// No authoritative primary signal with several outputs: keep whatever
    /// assignment already exists instead of guessing, and rank newcomers
    /// after it.
    fn keep_previous_priorities(&mut self) {
        let max = self
            .config
            .outputs()
            .filter(|o| o.enabled)
            .map(|o| o.priority)
            .max()
            .unwrap_or(0);
        let unranked: Vec<OutputId> = self
            .config
            .outputs()
            .filter(|o| o.enabled && o.priority == 0)
            .map(|o| o.id)
            .collect();
        if !unranked.is_empty() {
            warn!(
                "multiple outputs but no authoritative primary order, keeping previous assignment"
            );
        }
        let mut next = max;
        for id in unranked {
            next += 1;
            if let Some(output) = self.config.output_mut(id) {
                output.priority = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Point, Size};

    fn full_burst(topology: &mut Topology, id: OutputId, name: &str, x: i32) -> SyncOutcome {
        topology.device_event(
            id,
            DeviceEvent::Geometry {
                pos: Point::new(x, 0),
                physical_size: Size::new(520, 290),
                subpixel: 0,
                make: "ACME".into(),
                model: "Panel".into(),
                transform: 0,
            },
        );
        topology.device_event(id, DeviceEvent::Name(name.into()));
        topology.device_event(id, DeviceEvent::ModeAnnounced(1));
        topology.device_event(
            id,
            DeviceEvent::ModeSize {
                mode: 1,
                size: Size::new(1920, 1080),
            },
        );
        topology.device_event(
            id,
            DeviceEvent::ModeRefresh {
                mode: 1,
                millihertz: 60_000,
            },
        );
        topology.device_event(id, DeviceEvent::CurrentMode(1));
        topology.device_event(id, DeviceEvent::Enabled(true));
        topology.device_event(id, DeviceEvent::Done)
    }

    fn ready_topology(names: &[&str]) -> Topology {
        let mut topology = Topology::new();
        topology.connected();
        let ids: Vec<OutputId> = names.iter().map(|_| topology.announce_device()).collect();
        topology.registry_synced();
        for (index, (id, name)) in ids.iter().zip(names).enumerate() {
            full_burst(&mut topology, *id, name, index as i32 * 1920);
        }
        topology
    }

    #[test]
    fn ready_needs_registry_and_all_bursts() {
        let mut topology = Topology::new();
        topology.connected();
        assert_eq!(topology.state(), SyncState::Enumerating);

        let a = topology.announce_device();
        let b = topology.announce_device();
        assert_eq!(topology.registry_synced(), SyncOutcome::Pending);
        assert_eq!(topology.state(), SyncState::AwaitingOutputs);

        assert_eq!(full_burst(&mut topology, a, "DP-1", 0), SyncOutcome::Pending);
        assert_eq!(
            full_burst(&mut topology, b, "DP-2", 1920),
            SyncOutcome::BecameReady
        );
        assert_eq!(topology.state(), SyncState::Ready);
        assert_eq!(topology.config().output_count(), 2);
    }

    #[test]
    fn ready_needs_at_least_one_output() {
        let mut topology = Topology::new();
        topology.connected();
        assert_eq!(topology.registry_synced(), SyncOutcome::Pending);
        assert_eq!(topology.state(), SyncState::AwaitingOutputs);
    }

    #[test]
    fn single_output_is_forced_primary() {
        let topology = ready_topology(&["DP-1"]);
        let primary = topology.config().primary_output().expect("primary");
        assert_eq!(primary.name, "DP-1");
        assert_eq!(primary.priority, 1);
    }

    #[test]
    fn hotplug_after_ready_blocks_until_burst_completes() {
        let mut topology = ready_topology(&["DP-1"]);
        let new = topology.announce_device();
        assert!(topology.is_blocked());

        // A refresh burst of the existing output must stay quiet while the
        // newcomer is still pending.
        let existing = topology.config().output_ids()[0];
        topology.device_event(existing, DeviceEvent::Enabled(true));
        assert_eq!(
            topology.device_event(existing, DeviceEvent::Done),
            SyncOutcome::Pending
        );

        assert_eq!(full_burst(&mut topology, new, "HDMI-1", 1920), SyncOutcome::Updated);
        assert!(!topology.is_blocked());
        assert_eq!(topology.config().output_count(), 2);
    }

    #[test]
    fn removal_shrinks_snapshot_preserving_others() {
        let mut topology = ready_topology(&["DP-1", "DP-2"]);
        let ids = topology.config().output_ids();
        assert_eq!(topology.remove_device(ids[0]), SyncOutcome::Updated);
        assert_eq!(topology.config().output_count(), 1);
        let survivor = topology.config().output(ids[1]).expect("survivor");
        assert_eq!(survivor.name, "DP-2");
        // The survivor is now alone and therefore primary.
        assert_eq!(survivor.priority, 1);
    }

    #[test]
    fn refresh_burst_updates_snapshot() {
        let mut topology = ready_topology(&["DP-1"]);
        let id = topology.config().output_ids()[0];
        topology.device_event(id, DeviceEvent::Scale(2.0));
        assert_eq!(topology.device_event(id, DeviceEvent::Done), SyncOutcome::Updated);
        assert_eq!(topology.config().output(id).unwrap().scale, 2.0);
    }

    #[test]
    fn ambiguous_primary_keeps_previous_assignment() {
        let mut topology = ready_topology(&["DP-1", "DP-2"]);
        let ids = topology.config().output_ids();
        let before: Vec<u32> = ids
            .iter()
            .map(|id| topology.config().output(*id).unwrap().priority)
            .collect();

        // Another burst with no ordering signal must not reshuffle.
        topology.device_event(ids[1], DeviceEvent::Scale(1.0));
        topology.device_event(ids[1], DeviceEvent::Done);
        let after: Vec<u32> = ids
            .iter()
            .map(|id| topology.config().output(*id).unwrap().priority)
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn order_channel_drives_priorities() {
        let mut topology = ready_topology(&["DP-1", "DP-2"]);
        topology.order_output("DP-2".into());
        topology.order_output("DP-1".into());
        assert_eq!(topology.order_done(), SyncOutcome::Updated);

        let config = topology.config();
        let by_name = |name: &str| config.outputs().find(|o| o.name == name).unwrap();
        assert_eq!(by_name("DP-2").priority, 1);
        assert_eq!(by_name("DP-1").priority, 2);
        assert!(config.supported_features().contains(Features::PRIMARY_DISPLAY));
    }

    #[test]
    fn screen_tracks_enabled_bounding_box() {
        let topology = ready_topology(&["DP-1", "DP-2"]);
        let screen = &topology.config().screen;
        assert_eq!(screen.current_size, Size::new(3840, 1080));
        assert_eq!(screen.max_active_outputs_count, 2);
    }
}

//! Robot profiles
//!
//! One static profile per supported product line. The registry is built once
//! at startup (built-in table plus settings overrides) and shared read-only.

use crate::domain::models::{Mode, Platform, Side};
use crate::domain::servo_map::{self, ServoSpec};
use crate::domain::settings::Settings;
use std::sync::Arc;
use std::time::Duration;

pub const SERVICE_UUID: &str = "0000ffe0-0000-1000-8000-00805f9b34fb";
/// Writes and notifications share this characteristic.
pub const CHARACTERISTIC_UUID: &str = "0000ffe1-0000-1000-8000-00805f9b34fb";

/// Default time a transform may take before a fallback status query is sent
pub const DEFAULT_TRANSFORM_GRACE_MS: u64 = 12_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub has_vehicle_mode: bool,
    pub weapon_slots: u8,
    pub speed_toggle: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattProfile {
    pub service_uuid: String,
    pub write_uuid: String,
    pub notify_uuid: String,
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE_UUID.to_string(),
            write_uuid: CHARACTERISTIC_UUID.to_string(),
            notify_uuid: CHARACTERISTIC_UUID.to_string(),
        }
    }
}

/// What goes on the wire when an action slot fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionPayload {
    /// Firmware-resident action selected by its argument bytes
    BuiltIn(&'static [u8]),
    /// Action file stored on the robot
    ExecuteFile(&'static str),
    /// Vehicle horn, sent on the step opcode of that side
    Horn(Side),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionMode {
    Any,
    Robot,
    Vehicle,
}

impl ActionMode {
    fn allows(self, mode: Mode) -> bool {
        match self {
            Self::Any => true,
            Self::Robot => mode == Mode::Robot,
            Self::Vehicle => mode == Mode::Vehicle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionDef {
    /// Unique within a profile; this is what `Command::Action` carries
    pub slot: u8,
    /// Controller button the slot is bound to
    pub button: u8,
    pub name: &'static str,
    pub mode: ActionMode,
    pub payload: ActionPayload,
    pub weapon: bool,
    /// How long the robot is considered busy when no completion arrives
    pub duration: Duration,
    pub cooldown: Option<Duration>,
}

/// Buttons the front ends bind to the first three action slots
pub mod button {
    pub const MELEE: u8 = 0;
    pub const SHOOT: u8 = 1;
    pub const RANDOM: u8 = 2;
}

const fn builtin(
    slot: u8,
    button: u8,
    name: &'static str,
    mode: ActionMode,
    args: &'static [u8],
    weapon: bool,
) -> ActionDef {
    ActionDef {
        slot,
        button,
        name,
        mode,
        payload: ActionPayload::BuiltIn(args),
        weapon,
        duration: Duration::from_secs(8),
        cooldown: None,
    }
}

const fn file(
    slot: u8,
    button: u8,
    name: &'static str,
    mode: ActionMode,
    path: &'static str,
    weapon: bool,
) -> ActionDef {
    ActionDef {
        slot,
        button,
        name,
        mode,
        payload: ActionPayload::ExecuteFile(path),
        weapon,
        duration: Duration::from_secs(10),
        cooldown: None,
    }
}

const fn horn(slot: u8, side: Side) -> ActionDef {
    ActionDef {
        slot,
        button: u8::MAX,
        name: match side {
            Side::Left => "horn 1",
            Side::Right => "horn 2",
        },
        mode: ActionMode::Vehicle,
        payload: ActionPayload::Horn(side),
        weapon: false,
        duration: Duration::from_millis(1500),
        cooldown: Some(Duration::from_secs(5)),
    }
}

const OPTIMUS_ACTIONS: &[ActionDef] = &[
    builtin(0, button::MELEE, "axe", ActionMode::Any, &[4], true),
    builtin(1, button::SHOOT, "blaster", ActionMode::Any, &[5], true),
    builtin(2, button::RANDOM, "autobots", ActionMode::Any, &[7], false),
    horn(3, Side::Left),
    horn(4, Side::Right),
];

const GRIMLOCK_ACTIONS: &[ActionDef] = &[
    file(0, button::MELEE, "sword", ActionMode::Robot, "SysAction/Sword", true),
    file(1, button::SHOOT, "shoot", ActionMode::Robot, "SysAction/Shoot", true),
    file(2, button::RANDOM, "autobots", ActionMode::Robot, "RobotAction/Autobots", false),
    file(3, button::MELEE, "flame", ActionMode::Vehicle, "SysAction/Flameout", true),
    file(4, button::SHOOT, "cute", ActionMode::Vehicle, "SysAction/Cute", false),
    file(5, button::RANDOM, "roar", ActionMode::Vehicle, "Action/Autobots", false),
];

const MEGATRON_ACTIONS: &[ActionDef] = &[
    file(0, button::MELEE, "sword", ActionMode::Robot, "SysAction/Sword", true),
    file(1, button::SHOOT, "shoot", ActionMode::Robot, "SysAction/Shoot", true),
    file(2, button::RANDOM, "hammer", ActionMode::Robot, "SysAction/Hammer", false),
    builtin(3, button::SHOOT, "cannon", ActionMode::Vehicle, &[3, 0], true),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub transform_grace: Duration,
    pub stop_repeats: u8,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            transform_grace: Duration::from_millis(DEFAULT_TRANSFORM_GRACE_MS),
            stop_repeats: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobotProfile {
    pub platform: Platform,
    /// Advertised-name prefix; empty for the unknown profile, which never matches
    pub name_prefix: &'static str,
    pub display_name: &'static str,
    pub capabilities: Capabilities,
    pub gatt: GattProfile,
    pub actions: &'static [ActionDef],
    pub timings: Timings,
}

impl RobotProfile {
    pub fn servos(&self) -> &'static [ServoSpec] {
        servo_map::servos(self.platform)
    }

    pub fn matches(&self, advertised_name: &str) -> bool {
        !self.name_prefix.is_empty() && advertised_name.starts_with(self.name_prefix)
    }

    /// Serial number embedded in the advertised name after the prefix
    pub fn serial_from_name<'a>(&self, advertised_name: &'a str) -> Option<&'a str> {
        if self.name_prefix.is_empty() {
            return None;
        }
        advertised_name.strip_prefix(self.name_prefix)
    }

    pub fn action(&self, slot: u8) -> Option<&ActionDef> {
        self.actions.iter().find(|a| a.slot == slot)
    }

    /// Action bound to `button` in the given mode
    pub fn action_for_button(&self, button: u8, mode: Mode) -> Option<&ActionDef> {
        self.actions
            .iter()
            .find(|a| a.button == button && a.mode.allows(mode))
    }

    pub fn horn(&self, side: Side) -> Option<&ActionDef> {
        self.actions
            .iter()
            .find(|a| a.payload == ActionPayload::Horn(side))
    }

    fn unknown() -> Self {
        Self {
            platform: Platform::Unknown,
            name_prefix: "",
            display_name: "Unknown Robosen robot",
            capabilities: Capabilities {
                has_vehicle_mode: false,
                weapon_slots: 0,
                speed_toggle: false,
            },
            gatt: GattProfile::default(),
            actions: &[],
            timings: Timings::default(),
        }
    }
}

fn builtin_profiles() -> Vec<RobotProfile> {
    vec![
        RobotProfile {
            platform: Platform::OptimusPrimeFlagship,
            name_prefix: "OP-M-",
            display_name: "Optimus Prime Flagship",
            capabilities: Capabilities {
                has_vehicle_mode: true,
                weapon_slots: 2,
                speed_toggle: false,
            },
            gatt: GattProfile::default(),
            actions: OPTIMUS_ACTIONS,
            timings: Timings::default(),
        },
        RobotProfile {
            platform: Platform::Grimlock,
            name_prefix: "GSEG-",
            display_name: "Grimlock",
            capabilities: Capabilities {
                has_vehicle_mode: true,
                weapon_slots: 3,
                speed_toggle: true,
            },
            gatt: GattProfile::default(),
            actions: GRIMLOCK_ACTIONS,
            timings: Timings::default(),
        },
        RobotProfile {
            platform: Platform::Megatron,
            name_prefix: "MEGAF-",
            display_name: "Megatron",
            capabilities: Capabilities {
                has_vehicle_mode: true,
                weapon_slots: 3,
                speed_toggle: false,
            },
            gatt: GattProfile::default(),
            actions: MEGATRON_ACTIONS,
            timings: Timings::default(),
        },
    ]
}

#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: Vec<Arc<RobotProfile>>,
    unknown: Arc<RobotProfile>,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProfileRegistry {
    pub fn builtin() -> Self {
        Self {
            profiles: builtin_profiles().into_iter().map(Arc::new).collect(),
            unknown: Arc::new(RobotProfile::unknown()),
        }
    }

    /// Built-in profiles with the GATT and timing overrides from settings applied
    pub fn from_settings(settings: &Settings) -> Self {
        let gatt = GattProfile {
            service_uuid: settings.ble_service_uuid.clone(),
            write_uuid: settings.ble_write_char_uuid.clone(),
            notify_uuid: settings.ble_notify_char_uuid.clone(),
        };
        let timings = Timings {
            transform_grace: Duration::from_millis(settings.transform_grace_ms),
            stop_repeats: settings.stop_repeats.max(1),
        };

        let profiles = builtin_profiles()
            .into_iter()
            .map(|mut profile| {
                profile.gatt = gatt.clone();
                profile.timings = timings;
                Arc::new(profile)
            })
            .collect();

        let mut unknown = RobotProfile::unknown();
        unknown.gatt = gatt;
        unknown.timings = timings;

        Self {
            profiles,
            unknown: Arc::new(unknown),
        }
    }

    pub fn get(&self, platform: Platform) -> Arc<RobotProfile> {
        self.profiles
            .iter()
            .find(|p| p.platform == platform)
            .cloned()
            .unwrap_or_else(|| self.unknown.clone())
    }

    pub fn match_name(&self, advertised_name: &str) -> Option<Arc<RobotProfile>> {
        self.profiles
            .iter()
            .find(|p| p.matches(advertised_name))
            .cloned()
    }

    pub fn name_prefixes(&self) -> Vec<String> {
        self.profiles
            .iter()
            .map(|p| p.name_prefix.to_string())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RobotProfile>> {
        self.profiles.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_name() {
        let registry = ProfileRegistry::builtin();
        assert_eq!(
            registry.match_name("OP-M-0042").map(|p| p.platform),
            Some(Platform::OptimusPrimeFlagship)
        );
        assert_eq!(
            registry.match_name("GSEG-77F0").map(|p| p.platform),
            Some(Platform::Grimlock)
        );
        assert_eq!(
            registry.match_name("MEGAF-1").map(|p| p.platform),
            Some(Platform::Megatron)
        );
        assert!(registry.match_name("Galaxy Buds").is_none());
        assert!(registry.match_name("").is_none());
    }

    #[test]
    fn test_serial_from_name() {
        let registry = ProfileRegistry::builtin();
        let optimus = registry.get(Platform::OptimusPrimeFlagship);
        assert_eq!(optimus.serial_from_name("OP-M-1234AB"), Some("1234AB"));
        assert_eq!(optimus.serial_from_name("GSEG-1"), None);
    }

    #[test]
    fn test_unknown_platform_profile() {
        let registry = ProfileRegistry::builtin();
        let unknown = registry.get(Platform::Unknown);
        assert_eq!(unknown.capabilities.weapon_slots, 0);
        assert!(unknown.actions.is_empty());
        assert!(!unknown.matches("anything"));
    }

    #[test]
    fn test_action_tables_are_consistent() {
        let registry = ProfileRegistry::builtin();
        for profile in registry.iter() {
            let mut slots = std::collections::HashSet::new();
            let mut weapons = 0;
            for action in profile.actions {
                assert!(slots.insert(action.slot), "{} reuses slot", profile.display_name);
                if action.weapon {
                    weapons += 1;
                }
            }
            assert_eq!(weapons, profile.capabilities.weapon_slots, "{}", profile.display_name);
        }
    }

    #[test]
    fn test_action_for_button_depends_on_mode() {
        let registry = ProfileRegistry::builtin();
        let grimlock = registry.get(Platform::Grimlock);
        assert_eq!(
            grimlock.action_for_button(button::MELEE, Mode::Robot).map(|a| a.name),
            Some("sword")
        );
        assert_eq!(
            grimlock.action_for_button(button::MELEE, Mode::Vehicle).map(|a| a.name),
            Some("flame")
        );
        assert!(grimlock.action_for_button(button::MELEE, Mode::Unknown).is_none());

        let optimus = registry.get(Platform::OptimusPrimeFlagship);
        assert_eq!(
            optimus.action_for_button(button::SHOOT, Mode::Vehicle).map(|a| a.slot),
            Some(1)
        );
        assert_eq!(optimus.horn(Side::Right).map(|a| a.slot), Some(4));
    }

    #[test]
    fn test_settings_overrides() {
        let mut settings = Settings::default();
        settings.transform_grace_ms = 3_000;
        settings.ble_service_uuid = "0000abcd-0000-1000-8000-00805f9b34fb".to_string();
        let registry = ProfileRegistry::from_settings(&settings);
        let megatron = registry.get(Platform::Megatron);
        assert_eq!(megatron.timings.transform_grace, Duration::from_millis(3_000));
        assert_eq!(megatron.gatt.service_uuid, settings.ble_service_uuid);
    }
}

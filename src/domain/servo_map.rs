//! Per-platform servo tables
//!
//! Every servo has a robot-mode limit and, where the vehicle form needs
//! different travel or a different rest pose, a vehicle-mode limit.
//!
//! ## Resolution rule
//!
//! - `Vehicle` uses the vehicle limit when present, otherwise the robot limit
//! - `TransformingToX` resolves as `X`
//! - `Unknown` resolves as `Robot`
//!
//! Values are signed device units relative to the calibration offset of each
//! position slot. Wheel slots carry a signed speed instead of an angle.

use crate::domain::error::ServoError;
use crate::domain::models::{Mode, Platform, ServoSnapshot};

/// Fallback gait speed range for platforms without wheel servos in the table
pub const DEFAULT_SPEED_LIMIT: i16 = 100;

pub const LEFT_WHEEL: &str = "leftWheelSpeed";
pub const RIGHT_WHEEL: &str = "rightWheelSpeed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServoLimit {
    pub min: i16,
    pub max: i16,
    pub neutral: i16,
}

impl ServoLimit {
    pub const fn new(min: i16, max: i16, neutral: i16) -> Self {
        Self { min, max, neutral }
    }

    pub fn clamp(&self, value: i16) -> i16 {
        value.clamp(self.min, self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServoSpec {
    pub label: &'static str,
    /// Slot in the 48-byte position payload
    pub index: usize,
    pub wheel: bool,
    pub robot: ServoLimit,
    pub vehicle: Option<ServoLimit>,
}

impl ServoSpec {
    const fn joint(label: &'static str, index: usize, min: i16, max: i16, neutral: i16) -> Self {
        Self {
            label,
            index,
            wheel: false,
            robot: ServoLimit::new(min, max, neutral),
            vehicle: None,
        }
    }

    const fn wheel(label: &'static str, index: usize) -> Self {
        Self {
            label,
            index,
            wheel: true,
            robot: ServoLimit::new(-DEFAULT_SPEED_LIMIT, DEFAULT_SPEED_LIMIT, 0),
            vehicle: None,
        }
    }

    /// Same travel as robot mode, different rest pose.
    const fn folds_to(self, neutral: i16) -> Self {
        self.vehicle_limit(self.robot.min, self.robot.max, neutral)
    }

    const fn vehicle_limit(mut self, min: i16, max: i16, neutral: i16) -> Self {
        self.vehicle = Some(ServoLimit::new(min, max, neutral));
        self
    }

    pub fn limit(&self, mode: Mode) -> ServoLimit {
        match resolution_mode(mode) {
            Mode::Vehicle => self.vehicle.unwrap_or(self.robot),
            _ => self.robot,
        }
    }

    /// Widest range across both modes, used when the mode is not known yet.
    pub fn envelope(&self) -> (i16, i16) {
        match self.vehicle {
            Some(v) => (self.robot.min.min(v.min), self.robot.max.max(v.max)),
            None => (self.robot.min, self.robot.max),
        }
    }
}

fn resolution_mode(mode: Mode) -> Mode {
    match mode {
        Mode::Vehicle | Mode::TransformingToVehicle => Mode::Vehicle,
        Mode::Robot | Mode::TransformingToRobot | Mode::Unknown => Mode::Robot,
    }
}

const OPTIMUS_SERVOS: &[ServoSpec] = &[
    // legs
    ServoSpec::joint("leftHip", 0, 0, 40, 0),
    ServoSpec::joint("leftThigh", 1, -95, 95, 0).folds_to(90),
    ServoSpec::joint("leftKnee", 2, -30, 95, 0).folds_to(90),
    ServoSpec::joint("leftAnkle", 3, -80, 95, 0),
    ServoSpec::joint("leftFoot", 4, -40, 20, 8),
    ServoSpec::joint("rightHip", 5, 0, 40, 8),
    ServoSpec::joint("rightThigh", 6, -95, 95, 0).folds_to(-90),
    ServoSpec::joint("rightKnee", 7, -95, 30, 0).folds_to(-90),
    ServoSpec::joint("rightAnkle", 8, -95, 80, 0),
    ServoSpec::joint("rightFoot", 9, -20, 40, -8),
    // arms
    ServoSpec::joint("leftScapula", 10, 0, 95, 0),
    ServoSpec::joint("leftShoulder", 11, 0, 90, 0),
    ServoSpec::joint("leftArm", 12, -185, 30, -15).folds_to(-180),
    ServoSpec::joint("leftUpperArm", 13, -95, 95, 0),
    ServoSpec::joint("leftElbow", 14, -60, 95, -30),
    ServoSpec::joint("leftWrist", 15, -30, 185, 0),
    ServoSpec::joint("rightScapula", 16, -95, 0, 0),
    ServoSpec::joint("rightShoulder", 17, -90, 0, 0),
    ServoSpec::joint("rightArm", 18, -30, 185, 15).folds_to(180),
    ServoSpec::joint("rightUpperArm", 19, -95, 95, 0),
    ServoSpec::joint("rightElbow", 20, -95, 60, 30),
    ServoSpec::joint("rightWrist", 21, -40, 185, 0),
    // torso
    ServoSpec::joint("waist", 22, -185, 40, 0).folds_to(-180),
    ServoSpec::joint("abdomen", 23, -15, 95, 0).folds_to(90),
    ServoSpec::joint("head", 24, 0, 105, 0).folds_to(100),
    ServoSpec::wheel(LEFT_WHEEL, 25),
    ServoSpec::wheel(RIGHT_WHEEL, 26),
];

// Grimlock has no scapula, waist or abdomen servos.
const GRIMLOCK_SERVOS: &[ServoSpec] = &[
    ServoSpec::joint("leftHip", 0, -5, 60, -5),
    ServoSpec::joint("leftThigh", 1, -60, 90, 0).vehicle_limit(-30, 90, 60),
    ServoSpec::joint("leftKnee", 2, 0, 80, 0).vehicle_limit(20, 80, 60),
    ServoSpec::joint("leftAnkle", 3, -30, 50, 0),
    ServoSpec::joint("leftFoot", 4, -60, 10, 8),
    ServoSpec::joint("rightHip", 5, -60, 5, 5),
    ServoSpec::joint("rightThigh", 6, -90, 60, 0).vehicle_limit(-90, 30, -60),
    ServoSpec::joint("rightKnee", 7, -80, 0, 0).vehicle_limit(-80, -20, -60),
    ServoSpec::joint("rightAnkle", 8, -50, 30, 0),
    ServoSpec::joint("rightFoot", 9, -10, 60, -8),
    ServoSpec::joint("leftShoulder", 11, -180, 40, -15).vehicle_limit(-180, 0, -150),
    ServoSpec::joint("leftArm", 12, -60, 5, -15),
    ServoSpec::joint("leftUpperArm", 13, -100, 100, 0),
    ServoSpec::joint("leftElbow", 14, -60, 60, -30),
    ServoSpec::joint("leftWrist", 15, 0, 160, 0),
    ServoSpec::joint("rightShoulder", 17, -40, 180, 15).vehicle_limit(0, 180, 150),
    ServoSpec::joint("rightArm", 18, -5, 60, 15),
    ServoSpec::joint("rightUpperArm", 19, -100, 100, 0),
    ServoSpec::joint("rightElbow", 20, -60, 60, 30),
    ServoSpec::joint("rightWrist", 21, -160, 0, 0),
    ServoSpec::joint("head", 24, 0, 105, 0).vehicle_limit(30, 105, 90),
    ServoSpec::wheel(LEFT_WHEEL, 25),
    ServoSpec::wheel(RIGHT_WHEEL, 26),
];

const MEGATRON_SERVOS: &[ServoSpec] = &[
    ServoSpec::joint("leftHip", 0, -40, 10, -8),
    ServoSpec::joint("leftThigh", 1, -95, 95, 0).folds_to(-90),
    ServoSpec::joint("leftCalf", 2, -95, 30, 0).folds_to(-90),
    ServoSpec::joint("leftAnkle", 3, -95, 50, 0),
    ServoSpec::joint("leftFoot", 4, -20, 60, 8),
    ServoSpec::joint("rightHip", 5, -10, 40, 8),
    ServoSpec::joint("rightThigh", 6, -95, 95, 0).folds_to(90),
    ServoSpec::joint("rightCalf", 7, -30, 95, 0).folds_to(90),
    ServoSpec::joint("rightAnkle", 8, -50, 95, 0),
    ServoSpec::joint("rightFoot", 9, -60, 20, -8),
    ServoSpec::joint("leftScapula", 10, -95, 0, 0),
    ServoSpec::joint("leftShoulder", 11, -95, 15, -15),
    ServoSpec::joint("leftRearArm", 12, -30, 185, -15).folds_to(180),
    ServoSpec::joint("leftElbow", 13, -95, 95, 0),
    ServoSpec::joint("leftForeArm", 14, -95, 60, -30),
    ServoSpec::joint("leftWrist", 15, -30, 185, 0),
    ServoSpec::joint("rightScapula", 16, 0, 95, 0),
    ServoSpec::joint("rightShoulder", 17, -15, 95, 15),
    ServoSpec::joint("rightUpperArm", 18, -185, 30, 15).folds_to(-180),
    ServoSpec::joint("rightElbow", 19, -95, 95, 0),
    ServoSpec::joint("rightForeArm", 20, -60, 95, 30),
    ServoSpec::joint("rightWrist", 21, -185, 30, 0),
    ServoSpec::joint("waist", 22, -185, 30, 0).folds_to(-180),
    ServoSpec::joint("abdomen", 23, -15, 95, 0),
    ServoSpec::joint("head", 24, 0, 105, 0).folds_to(100),
    ServoSpec::wheel(LEFT_WHEEL, 25),
    ServoSpec::wheel(RIGHT_WHEEL, 26),
];

pub fn servos(platform: Platform) -> &'static [ServoSpec] {
    match platform {
        Platform::OptimusPrimeFlagship => OPTIMUS_SERVOS,
        Platform::Grimlock => GRIMLOCK_SERVOS,
        Platform::Megatron => MEGATRON_SERVOS,
        Platform::Unknown => &[],
    }
}

/// Look up a servo by label, ignoring ASCII case.
pub fn find(platform: Platform, label: &str) -> Result<&'static ServoSpec, ServoError> {
    servos(platform)
        .iter()
        .find(|spec| spec.label.eq_ignore_ascii_case(label))
        .ok_or_else(|| ServoError::UnknownServo {
            platform,
            label: label.to_string(),
        })
}

pub fn limit(platform: Platform, mode: Mode, label: &str) -> Result<ServoLimit, ServoError> {
    find(platform, label).map(|spec| spec.limit(mode))
}

/// Clamp `value` into the servo's range for `mode`.
pub fn resolve(platform: Platform, mode: Mode, label: &str, value: i16) -> Result<i16, ServoError> {
    limit(platform, mode, label).map(|l| l.clamp(value))
}

/// Gait speed clamped to the wheel range, or the generic range when the
/// platform table has no wheels.
pub fn clamp_speed(platform: Platform, mode: Mode, speed: i16) -> i16 {
    match limit(platform, mode, LEFT_WHEEL) {
        Ok(l) => l.clamp(speed),
        Err(_) => speed.clamp(-DEFAULT_SPEED_LIMIT, DEFAULT_SPEED_LIMIT),
    }
}

pub fn default_neutral(platform: Platform, mode: Mode) -> ServoSnapshot {
    servos(platform)
        .iter()
        .map(|spec| (spec.label, spec.limit(mode).neutral))
        .collect()
}

/// Guess robot or vehicle mode from a position snapshot.
///
/// Only servos whose rest pose differs between the two modes take part. The
/// snapshot must cover at least half of them; the nearer rest pose wins and a
/// tie yields `None`.
pub fn infer_mode(platform: Platform, snapshot: &ServoSnapshot) -> Option<Mode> {
    let mut candidates = 0usize;
    let mut covered = 0usize;
    let mut robot_distance = 0i64;
    let mut vehicle_distance = 0i64;

    for spec in servos(platform) {
        let Some(vehicle) = spec.vehicle else {
            continue;
        };
        if vehicle.neutral == spec.robot.neutral {
            continue;
        }
        candidates += 1;

        if let Some(&value) = snapshot.get(spec.label) {
            covered += 1;
            robot_distance += (value as i64 - spec.robot.neutral as i64).abs();
            vehicle_distance += (value as i64 - vehicle.neutral as i64).abs();
        }
    }

    if candidates == 0 || covered * 2 < candidates {
        return None;
    }

    match robot_distance.cmp(&vehicle_distance) {
        std::cmp::Ordering::Less => Some(Mode::Robot),
        std::cmp::Ordering::Greater => Some(Mode::Vehicle),
        std::cmp::Ordering::Equal => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLATFORMS: [Platform; 3] = [
        Platform::OptimusPrimeFlagship,
        Platform::Grimlock,
        Platform::Megatron,
    ];

    #[test]
    fn test_neutral_within_limits() {
        for platform in PLATFORMS {
            for spec in servos(platform) {
                for limit in std::iter::once(spec.robot).chain(spec.vehicle) {
                    assert!(
                        limit.min <= limit.neutral && limit.neutral <= limit.max,
                        "{platform} {} neutral {} outside [{}, {}]",
                        spec.label,
                        limit.neutral,
                        limit.min,
                        limit.max
                    );
                }
            }
        }
    }

    #[test]
    fn test_indices_unique_and_in_payload() {
        for platform in PLATFORMS {
            let mut seen = std::collections::HashSet::new();
            for spec in servos(platform) {
                assert!(spec.index < 48);
                assert!(seen.insert(spec.index), "{platform} reuses slot {}", spec.index);
            }
        }
    }

    #[test]
    fn test_resolve_clamps_and_is_idempotent() {
        let platform = Platform::OptimusPrimeFlagship;
        for spec in servos(platform) {
            for mode in [Mode::Robot, Mode::Vehicle, Mode::Unknown] {
                for value in [i16::MIN, -500, -1, 0, 1, 37, 500, i16::MAX] {
                    let once = resolve(platform, mode, spec.label, value).unwrap();
                    let limit = spec.limit(mode);
                    assert!(limit.min <= once && once <= limit.max);
                    assert_eq!(resolve(platform, mode, spec.label, once).unwrap(), once);
                }
            }
        }
    }

    #[test]
    fn test_unknown_servo() {
        let err = resolve(Platform::Grimlock, Mode::Robot, "waist", 10).unwrap_err();
        assert_eq!(
            err,
            ServoError::UnknownServo {
                platform: Platform::Grimlock,
                label: "waist".to_string()
            }
        );
        assert!(find(Platform::Unknown, "head").is_err());
    }

    #[test]
    fn test_labels_map_to_payload_slots() {
        let expected: [(Platform, &[(&str, usize)]); 3] = [
            (
                Platform::OptimusPrimeFlagship,
                &[
                    ("leftThigh", 1),
                    ("leftKnee", 2),
                    ("rightKnee", 7),
                    ("leftArm", 12),
                    ("leftUpperArm", 13),
                    ("leftElbow", 14),
                    ("rightArm", 18),
                    ("rightUpperArm", 19),
                    ("rightElbow", 20),
                    ("waist", 22),
                    ("head", 24),
                    (LEFT_WHEEL, 25),
                ],
            ),
            (
                Platform::Grimlock,
                &[
                    ("leftKnee", 2),
                    ("rightKnee", 7),
                    ("leftShoulder", 11),
                    ("leftArm", 12),
                    ("leftUpperArm", 13),
                    ("leftElbow", 14),
                    ("rightArm", 18),
                    ("rightUpperArm", 19),
                    ("rightElbow", 20),
                    ("head", 24),
                ],
            ),
            (
                Platform::Megatron,
                &[
                    ("leftCalf", 2),
                    ("rightCalf", 7),
                    ("leftRearArm", 12),
                    ("leftElbow", 13),
                    ("leftForeArm", 14),
                    ("rightUpperArm", 18),
                    ("rightElbow", 19),
                    ("rightForeArm", 20),
                    (RIGHT_WHEEL, 26),
                ],
            ),
        ];
        for (platform, labels) in expected {
            for (label, index) in labels {
                assert_eq!(
                    find(platform, label).map(|spec| spec.index),
                    Ok(*index),
                    "{platform} {label}"
                );
            }
        }
        assert!(find(Platform::OptimusPrimeFlagship, "leftCalf").is_err());
        assert!(find(Platform::Grimlock, "leftLowerArm").is_err());
    }

    #[test]
    fn test_label_lookup_ignores_case() {
        assert_eq!(find(Platform::Megatron, "HEAD").unwrap().index, 24);
    }

    #[test]
    fn test_grimlock_vehicle_limits_differ() {
        let robot = limit(Platform::Grimlock, Mode::Robot, "head").unwrap();
        let vehicle = limit(Platform::Grimlock, Mode::Vehicle, "head").unwrap();
        assert_ne!(robot, vehicle);
        assert_eq!(resolve(Platform::Grimlock, Mode::Vehicle, "head", 0).unwrap(), 30);
        assert_eq!(resolve(Platform::Grimlock, Mode::Robot, "head", 0).unwrap(), 0);
    }

    #[test]
    fn test_fallback_to_robot_limit() {
        // no vehicle entry for the ankle
        let robot = limit(Platform::Grimlock, Mode::Robot, "leftAnkle").unwrap();
        assert_eq!(limit(Platform::Grimlock, Mode::Vehicle, "leftAnkle").unwrap(), robot);
        assert_eq!(
            limit(Platform::Grimlock, Mode::TransformingToVehicle, "head").unwrap(),
            limit(Platform::Grimlock, Mode::Vehicle, "head").unwrap()
        );
        assert_eq!(
            limit(Platform::Grimlock, Mode::Unknown, "head").unwrap(),
            limit(Platform::Grimlock, Mode::Robot, "head").unwrap()
        );
    }

    #[test]
    fn test_clamp_speed() {
        assert_eq!(clamp_speed(Platform::Megatron, Mode::Robot, 250), 100);
        assert_eq!(clamp_speed(Platform::Megatron, Mode::Robot, -250), -100);
        assert_eq!(clamp_speed(Platform::Unknown, Mode::Unknown, 40), 40);
        assert_eq!(clamp_speed(Platform::Unknown, Mode::Unknown, 400), 100);
    }

    #[test]
    fn test_infer_mode_from_neutral_poses() {
        for platform in PLATFORMS {
            let robot = default_neutral(platform, Mode::Robot);
            let vehicle = default_neutral(platform, Mode::Vehicle);
            assert_eq!(infer_mode(platform, &robot), Some(Mode::Robot));
            assert_eq!(infer_mode(platform, &vehicle), Some(Mode::Vehicle));
        }
    }

    #[test]
    fn test_infer_mode_needs_coverage() {
        let mut snapshot = ServoSnapshot::new();
        snapshot.insert("head", 100);
        assert_eq!(infer_mode(Platform::OptimusPrimeFlagship, &snapshot), None);
        assert_eq!(infer_mode(Platform::Unknown, &snapshot), None);
    }
}

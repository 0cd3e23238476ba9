// Kinematics systems for various machine types
//
// A kinematics maps a logical XYZ position onto positions along the three
// motion stepper channels (A, B, C). The planner scales those by
// steps-per-unit and rounds to absolute step targets. Extruders never go
// through a kinematics transform.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// Submodules for each kinematics system
pub mod cartesian;
pub mod corexy;
pub mod corexz;
pub mod coreyz;
pub mod delta;

pub use cartesian::CartesianKin;
pub use corexy::CoreXYKin;
pub use corexz::CoreXZKin;
pub use coreyz::CoreYZKin;
pub use delta::{DeltaGeometry, DeltaKin};

/// Logical axes, including the extruder.
pub const NUM_AXES: usize = 4;

/// Maximum number of extruder stepper channels.
pub const MAX_EXTRUDERS: usize = 2;

/// Motion channels plus one channel per extruder.
pub const NUM_CHANNELS: usize = 3 + MAX_EXTRUDERS;

/// A logical machine axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
    E,
}

impl Axis {
    pub const ALL: [Axis; NUM_AXES] = [Axis::X, Axis::Y, Axis::Z, Axis::E];

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// One stepper driver's step/dir pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    A,
    B,
    C,
    E(u8),
}

impl Channel {
    /// Channel driven by the given axis index of a block.
    pub const fn for_axis(axis: usize, extruder: u8) -> Self {
        match axis {
            0 => Channel::A,
            1 => Channel::B,
            2 => Channel::C,
            _ => Channel::E(extruder),
        }
    }

    /// Dense index in `0..NUM_CHANNELS`.
    pub const fn index(self) -> usize {
        match self {
            Channel::A => 0,
            Channel::B => 1,
            Channel::C => 2,
            Channel::E(n) => 3 + n as usize,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Coord {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Coord {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// A logical XYZE position in machine units
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub e: f32,
}

impl Position {
    pub const fn new(x: f32, y: f32, z: f32, e: f32) -> Self {
        Self { x, y, z, e }
    }

    pub const fn xyz(&self) -> Coord {
        Coord::new(self.x, self.y, self.z)
    }

    pub const fn get(&self, axis: Axis) -> f32 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
            Axis::E => self.e,
        }
    }

    pub fn to_array(self) -> [f32; NUM_AXES] {
        [self.x, self.y, self.z, self.e]
    }

    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum KinematicsError {
    #[error("target x={x} y={y} z={z} is outside the reachable envelope")]
    Unreachable { x: f32, y: f32, z: f32 },
}

impl KinematicsError {
    pub(crate) fn unreachable(c: Coord) -> Self {
        Self::Unreachable {
            x: c.x,
            y: c.y,
            z: c.z,
        }
    }
}

/// Inverse kinematics from logical space to stepper channel space.
pub trait Kinematics {
    /// Positions along the A, B and C channels, in length units.
    fn inverse(&self, logical: Coord) -> Result<Coord, KinematicsError>;
}

impl<K: Kinematics + ?Sized> Kinematics for &K {
    fn inverse(&self, logical: Coord) -> Result<Coord, KinematicsError> {
        (**self).inverse(logical)
    }
}

/// Kinematics selected at runtime, e.g. from a machine configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MachineKinematics {
    #[default]
    Cartesian,
    CoreXY,
    CoreXZ,
    CoreYZ,
    Delta(DeltaKin),
}

impl MachineKinematics {
    pub const fn name(&self) -> &'static str {
        match self {
            MachineKinematics::Cartesian => "cartesian",
            MachineKinematics::CoreXY => "corexy",
            MachineKinematics::CoreXZ => "corexz",
            MachineKinematics::CoreYZ => "coreyz",
            MachineKinematics::Delta(_) => "delta",
        }
    }
}

impl Kinematics for MachineKinematics {
    fn inverse(&self, logical: Coord) -> Result<Coord, KinematicsError> {
        match self {
            MachineKinematics::Cartesian => CartesianKin.inverse(logical),
            MachineKinematics::CoreXY => CoreXYKin.inverse(logical),
            MachineKinematics::CoreXZ => CoreXZKin.inverse(logical),
            MachineKinematics::CoreYZ => CoreYZKin.inverse(logical),
            MachineKinematics::Delta(delta) => delta.inverse(logical),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_indices_are_dense() {
        assert_eq!(Channel::for_axis(0, 0).index(), 0);
        assert_eq!(Channel::for_axis(2, 0).index(), 2);
        assert_eq!(Channel::for_axis(3, 0), Channel::E(0));
        assert_eq!(Channel::for_axis(3, 1).index(), NUM_CHANNELS - 1);
    }

    #[test]
    fn machine_kinematics_dispatches() {
        let target = Coord::new(10.0, 4.0, 2.0);
        let corexy = MachineKinematics::CoreXY.inverse(target).unwrap();
        assert_eq!(corexy, Coord::new(14.0, 6.0, 2.0));
        let cartesian = MachineKinematics::Cartesian.inverse(target).unwrap();
        assert_eq!(cartesian, target);
    }
}

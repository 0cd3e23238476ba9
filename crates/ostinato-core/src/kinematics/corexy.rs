// CoreXY kinematics

use crate::kinematics::{Coord, Kinematics, KinematicsError};

/// CoreXY kinematics - two motors control X and Y with belt arrangement
///
/// The A motor follows `X + Y` and the B motor follows `X - Y`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreXYKin;

impl Kinematics for CoreXYKin {
    fn inverse(&self, c: Coord) -> Result<Coord, KinematicsError> {
        Ok(Coord::new(c.x + c.y, c.x - c.y, c.z))
    }
}

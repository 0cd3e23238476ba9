// CoreYZ kinematics

use crate::kinematics::{Coord, Kinematics, KinematicsError};

/// CoreYZ kinematics - B follows `Y + Z`, C follows `Y - Z`, A drives X
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreYZKin;

impl Kinematics for CoreYZKin {
    fn inverse(&self, c: Coord) -> Result<Coord, KinematicsError> {
        Ok(Coord::new(c.x, c.y + c.z, c.y - c.z))
    }
}

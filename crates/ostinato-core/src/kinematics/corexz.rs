// CoreXZ kinematics

use crate::kinematics::{Coord, Kinematics, KinematicsError};

/// CoreXZ kinematics - A follows `X + Z`, C follows `X - Z`, B drives Y
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreXZKin;

impl Kinematics for CoreXZKin {
    fn inverse(&self, c: Coord) -> Result<Coord, KinematicsError> {
        Ok(Coord::new(c.x + c.z, c.y, c.x - c.z))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corexz_couples_x_and_z() {
        let pos = CoreXZKin.inverse(Coord::new(10.0, 20.0, 30.0)).unwrap();
        assert_eq!(pos, Coord::new(40.0, 20.0, -20.0));
    }
}

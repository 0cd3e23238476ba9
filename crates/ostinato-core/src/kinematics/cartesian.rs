// Cartesian kinematics - standard X/Y/Z motion

use crate::kinematics::{Coord, Kinematics, KinematicsError};

/// Cartesian kinematics - each stepper directly controls one axis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CartesianKin;

impl Kinematics for CartesianKin {
    fn inverse(&self, logical: Coord) -> Result<Coord, KinematicsError> {
        Ok(logical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cartesian_is_identity() {
        let target = Coord::new(10.0, 20.0, 30.0);
        assert_eq!(CartesianKin.inverse(target), Ok(target));
    }
}

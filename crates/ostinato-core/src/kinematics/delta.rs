// Delta kinematics

use crate::kinematics::{Coord, Kinematics, KinematicsError};
#[allow(unused_imports)]
use num_traits::float::Float;
use serde::{Deserialize, Serialize};

/// Tower angles in degrees, counter-clockwise from +X.
const TOWER_ANGLES: [f32; 3] = [210.0, 330.0, 90.0];

/// Physical dimensions of a linear delta machine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeltaGeometry {
    /// Length of the diagonal rods between carriage and effector.
    pub diagonal_rod: f32,
    /// Horizontal distance from the center to each tower's carriage joint.
    pub radius: f32,
    /// Radius of the printable circle; targets outside it are rejected.
    pub printable_radius: f32,
}

/// Delta kinematics - three vertical towers with arms to effector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "DeltaGeometry", into = "DeltaGeometry")]
pub struct DeltaKin {
    geometry: DeltaGeometry,
    rod2: f32,
    towers: [(f32, f32); 3],
}

impl DeltaKin {
    pub fn new(geometry: DeltaGeometry) -> Self {
        let towers = TOWER_ANGLES.map(|deg| {
            let rad = deg.to_radians();
            (geometry.radius * rad.cos(), geometry.radius * rad.sin())
        });
        Self {
            geometry,
            rod2: geometry.diagonal_rod * geometry.diagonal_rod,
            towers,
        }
    }

    pub fn geometry(&self) -> &DeltaGeometry {
        &self.geometry
    }

    fn tower_height(&self, tower: usize, c: Coord) -> Option<f32> {
        let (tx, ty) = self.towers[tower];
        let dx = tx - c.x;
        let dy = ty - c.y;
        let radicand = self.rod2 - dx * dx - dy * dy;
        if radicand < 0.0 {
            return None;
        }
        Some(c.z + radicand.sqrt())
    }
}

impl From<DeltaGeometry> for DeltaKin {
    fn from(geometry: DeltaGeometry) -> Self {
        Self::new(geometry)
    }
}

impl From<DeltaKin> for DeltaGeometry {
    fn from(kin: DeltaKin) -> Self {
        kin.geometry
    }
}

impl Kinematics for DeltaKin {
    fn inverse(&self, c: Coord) -> Result<Coord, KinematicsError> {
        let limit = self.geometry.printable_radius;
        if c.x * c.x + c.y * c.y > limit * limit {
            return Err(KinematicsError::unreachable(c));
        }
        let height = |tower| {
            self.tower_height(tower, c)
                .ok_or(KinematicsError::unreachable(c))
        };
        Ok(Coord::new(height(0)?, height(1)?, height(2)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kin() -> DeltaKin {
        DeltaKin::new(DeltaGeometry {
            diagonal_rod: 250.0,
            radius: 124.0,
            printable_radius: 140.0,
        })
    }

    #[test]
    fn center_raises_all_towers_equally() {
        let pos = kin().inverse(Coord::new(0.0, 0.0, 5.0)).unwrap();
        let expected = 5.0 + (250.0f32 * 250.0 - 124.0 * 124.0).sqrt();
        assert!((pos.x - expected).abs() < 1e-3);
        assert!((pos.y - expected).abs() < 1e-3);
        assert!((pos.z - expected).abs() < 1e-3);
    }

    #[test]
    fn moving_toward_a_tower_lowers_it_least() {
        // Tower C sits at 90 degrees, so +Y approaches it
        let pos = kin().inverse(Coord::new(0.0, 50.0, 0.0)).unwrap();
        assert!(pos.z > pos.x);
        assert!((pos.x - pos.y).abs() < 1e-3);
    }

    #[test]
    fn rejects_targets_outside_printable_radius() {
        let err = kin().inverse(Coord::new(150.0, 0.0, 0.0)).unwrap_err();
        assert!(matches!(err, KinematicsError::Unreachable { x, .. } if x == 150.0));
    }

    #[test]
    fn rejects_targets_beyond_rod_reach() {
        let short = DeltaKin::new(DeltaGeometry {
            diagonal_rod: 100.0,
            radius: 124.0,
            printable_radius: 500.0,
        });
        assert!(short.inverse(Coord::new(0.0, 0.0, 0.0)).is_err());
    }
}

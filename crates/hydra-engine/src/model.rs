//! The physical problem definition, as seen by the simulation loop.

use hydra_core::{IntegratorStep, ModelError};

/// Number of moving bodies a model declares.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BodyCounts {
    /// All moving bodies.
    pub bodies: usize,
    /// Bodies whose motion depends on fluid forces. These are the first
    /// `forces_bodies` entries of every per-body array.
    pub forces_bodies: usize,
}

/// Rigid-body state uploaded to the devices.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BodyKinematics {
    /// Centre of gravity.
    pub cg: [f64; 3],
    /// Translation over the last step.
    pub translation: [f64; 3],
    /// Rotation over the last step, row-major.
    pub rotation: [[f64; 3]; 3],
    /// Linear velocity.
    pub linear_vel: [f64; 3],
    /// Angular velocity.
    pub angular_vel: [f64; 3],
}

impl Default for BodyKinematics {
    fn default() -> Self {
        Self {
            cg: [0.0; 3],
            translation: [0.0; 3],
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            linear_vel: [0.0; 3],
            angular_vel: [0.0; 3],
        }
    }
}

/// The problem being simulated.
///
/// Only [`finished`](Model::finished) is required; every callback has
/// a neutral default.
pub trait Model: Send {
    /// One-time setup before partitioning.
    fn initialize(&mut self) -> Result<(), ModelError> {
        Ok(())
    }

    /// Whether the run is complete at time `t`.
    fn finished(&self, t: f64) -> bool;

    /// Whether the model wants an out-of-band save at time `t`.
    fn need_write(&self, _t: f64) -> bool {
        false
    }

    /// Whether [`gravity`](Model::gravity) varies over time.
    fn has_gravity_callback(&self) -> bool {
        false
    }

    /// Gravity at time `t`.
    fn gravity(&mut self, _t: f64) -> [f32; 3] {
        [0.0, 0.0, -9.81]
    }

    /// Declared moving bodies.
    fn bodies(&self) -> BodyCounts {
        BodyCounts::default()
    }

    /// Lets the model override the fluid forces applied to the forces
    /// bodies over `[t0, t1]`. Both slices start as the reduced totals.
    fn bodies_forces(
        &mut self,
        _t0: f64,
        _t1: f64,
        _step: IntegratorStep,
        _forces: &mut [[f32; 3]],
        _torques: &mut [[f32; 3]],
    ) -> Result<(), ModelError> {
        Ok(())
    }

    /// Advances every body over one integration stage.
    fn bodies_timestep(
        &mut self,
        _forces: &[[f32; 3]],
        _torques: &[[f32; 3]],
        _step: IntegratorStep,
        _dt: f64,
        _t: f64,
        _kinematics: &mut [BodyKinematics],
    ) -> Result<(), ModelError> {
        Ok(())
    }

    /// Called after the corrector stage of every iteration with bodies.
    fn post_timestep(&mut self, _t: f64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Until(f64);

    impl Model for Until {
        fn finished(&self, t: f64) -> bool {
            t >= self.0
        }
    }

    #[test]
    fn defaults_are_neutral() {
        let mut m = Until(1.0);
        assert!(m.initialize().is_ok());
        assert!(!m.finished(0.5));
        assert!(m.finished(1.0));
        assert!(!m.need_write(0.0));
        assert!(!m.has_gravity_callback());
        assert_eq!(m.bodies(), BodyCounts::default());
        let mut forces = [[1.0, 2.0, 3.0]];
        let mut torques = [[0.0; 3]];
        m.bodies_forces(0.0, 0.1, IntegratorStep::Predictor, &mut forces, &mut torques)
            .unwrap();
        assert_eq!(forces, [[1.0, 2.0, 3.0]]);
    }

    #[test]
    fn default_kinematics_is_identity() {
        let k = BodyKinematics::default();
        for (i, row) in k.rotation.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                assert_eq!(v, if i == j { 1.0 } else { 0.0 });
            }
        }
    }
}

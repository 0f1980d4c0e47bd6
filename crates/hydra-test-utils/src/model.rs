//! A configurable [`Model`] that records every callback.

use std::cell::Cell;

use hydra_core::{IntegratorStep, ModelError};
use hydra_engine::{BodyCounts, BodyKinematics, Model};

/// Callbacks observed by a [`ScriptedModel`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelCalls {
    pub initialized: bool,
    pub gravity: Vec<f64>,
    /// `(t0, t1, step, forces)` of every `bodies_forces` call.
    pub bodies_forces: Vec<(f64, f64, IntegratorStep, Vec<[f32; 3]>)>,
    /// `(step, dt, t)` of every `bodies_timestep` call.
    pub bodies_timestep: Vec<(IntegratorStep, f64, f64)>,
    pub post_timestep: Vec<f64>,
}

/// Model finishing at a fixed time, with optional gravity callback,
/// moving bodies and forced writes.
#[derive(Clone, Debug)]
pub struct ScriptedModel {
    end_time: f64,
    gravity: Option<fn(f64) -> [f32; 3]>,
    bodies: BodyCounts,
    write_at: Vec<f64>,
    next_write: Cell<usize>,
    fail_init: bool,
    calls: ModelCalls,
}

impl ScriptedModel {
    /// Finishes once `t >= end_time`.
    pub fn until(end_time: f64) -> Self {
        Self {
            end_time,
            gravity: None,
            bodies: BodyCounts::default(),
            write_at: Vec::new(),
            next_write: Cell::new(0),
            fail_init: false,
            calls: ModelCalls::default(),
        }
    }

    /// Never finishes on its own.
    pub fn endless() -> Self {
        Self::until(f64::INFINITY)
    }

    pub fn with_gravity(mut self, gravity: fn(f64) -> [f32; 3]) -> Self {
        self.gravity = Some(gravity);
        self
    }

    pub fn with_bodies(mut self, bodies: usize, forces_bodies: usize) -> Self {
        self.bodies = BodyCounts {
            bodies,
            forces_bodies,
        };
        self
    }

    /// Requests one write when `t` first reaches each of `times`.
    pub fn with_writes_at(mut self, mut times: Vec<f64>) -> Self {
        times.sort_by(f64::total_cmp);
        self.write_at = times;
        self
    }

    pub fn failing_initialization(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn calls(&self) -> &ModelCalls {
        &self.calls
    }
}

impl Model for ScriptedModel {
    fn initialize(&mut self) -> Result<(), ModelError> {
        if self.fail_init {
            return Err(ModelError::Initialization("scripted failure".into()));
        }
        self.calls.initialized = true;
        Ok(())
    }

    fn finished(&self, t: f64) -> bool {
        t >= self.end_time
    }

    fn need_write(&self, t: f64) -> bool {
        let mut next = self.next_write.get();
        let due = self.write_at.get(next).is_some_and(|&w| t >= w);
        while self.write_at.get(next).is_some_and(|&w| t >= w) {
            next += 1;
        }
        self.next_write.set(next);
        due
    }

    fn has_gravity_callback(&self) -> bool {
        self.gravity.is_some()
    }

    fn gravity(&mut self, t: f64) -> [f32; 3] {
        self.calls.gravity.push(t);
        self.gravity.map_or([0.0, 0.0, -9.81], |g| g(t))
    }

    fn bodies(&self) -> BodyCounts {
        self.bodies
    }

    fn bodies_forces(
        &mut self,
        t0: f64,
        t1: f64,
        step: IntegratorStep,
        forces: &mut [[f32; 3]],
        _torques: &mut [[f32; 3]],
    ) -> Result<(), ModelError> {
        self.calls
            .bodies_forces
            .push((t0, t1, step, forces.to_vec()));
        Ok(())
    }

    fn bodies_timestep(
        &mut self,
        forces: &[[f32; 3]],
        _torques: &[[f32; 3]],
        step: IntegratorStep,
        dt: f64,
        t: f64,
        kinematics: &mut [BodyKinematics],
    ) -> Result<(), ModelError> {
        self.calls.bodies_timestep.push((step, dt, t));
        let h = match step {
            IntegratorStep::Predictor => dt / 2.0,
            IntegratorStep::Corrector => dt,
        };
        for (i, body) in kinematics.iter_mut().enumerate() {
            let force = forces.get(i).copied().unwrap_or([0.0; 3]);
            for k in 0..3 {
                body.linear_vel[k] += f64::from(force[k]) * h;
                body.translation[k] = body.linear_vel[k] * h;
                body.cg[k] += body.translation[k];
            }
        }
        Ok(())
    }

    fn post_timestep(&mut self, t: f64) {
        self.calls.post_timestep.push(t);
    }
}

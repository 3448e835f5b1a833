//! The per-context listener.
//!
//! A thin proxy over backend listener state; each context has exactly one,
//! living and dying with it.

use crate::backend::{Extension, ListenerParamF, ListenerParamV};
use crate::context::Context;
use crate::error::{FernSonicError, Result};
use crate::math::{Orientation, Vec3};

/// The listening point of a context.
#[derive(Clone)]
pub struct Listener {
    pub(crate) ctx: Context,
}

impl Listener {
    /// Master gain for all context output.
    pub fn set_gain(&self, gain: f32) -> Result<()> {
        if !(gain >= 0.0) {
            return Err(FernSonicError::InvalidArgument("gain out of range".into()));
        }
        self.ctx.check_current()?;
        self.ctx
            .inner
            .backend
            .listener_set_f(ListenerParamF::Gain, gain);
        Ok(())
    }

    /// Position, velocity, and orientation in one call.
    pub fn set_3d_parameters(
        &self,
        position: Vec3,
        velocity: Vec3,
        orientation: Orientation,
    ) -> Result<()> {
        self.ctx.check_current()?;
        let backend = self.ctx.inner.backend.as_ref();
        backend.listener_set_v3(ListenerParamV::Position, position);
        backend.listener_set_v3(ListenerParamV::Velocity, velocity);
        backend.listener_set_orientation(orientation.at, orientation.up);
        Ok(())
    }

    pub fn set_position(&self, position: Vec3) -> Result<()> {
        self.ctx.check_current()?;
        self.ctx
            .inner
            .backend
            .listener_set_v3(ListenerParamV::Position, position);
        Ok(())
    }

    /// Velocity in units per second; only feeds the doppler calculation.
    pub fn set_velocity(&self, velocity: Vec3) -> Result<()> {
        self.ctx.check_current()?;
        self.ctx
            .inner
            .backend
            .listener_set_v3(ListenerParamV::Velocity, velocity);
        Ok(())
    }

    pub fn set_orientation(&self, orientation: Orientation) -> Result<()> {
        self.ctx.check_current()?;
        self.ctx
            .inner
            .backend
            .listener_set_orientation(orientation.at, orientation.up);
        Ok(())
    }

    /// Meters per world unit, used by distance-based effects. Requires EFX;
    /// adjust the speed of sound alongside to stay physically consistent.
    pub fn set_meters_per_unit(&self, meters: f32) -> Result<()> {
        if !(meters > 0.0) {
            return Err(FernSonicError::InvalidArgument(
                "meters per unit out of range".into(),
            ));
        }
        self.ctx.check_current()?;
        if self.ctx.inner.has_ext(Extension::Efx) {
            self.ctx
                .inner
                .backend
                .listener_set_f(ListenerParamF::MetersPerUnit, meters);
        }
        Ok(())
    }
}

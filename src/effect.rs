//! Effects and auxiliary effect slots.
//!
//! Effects hold DSP parameters (currently reverb); slots are routing nodes
//! that sources feed through their auxiliary sends. Applying an effect to a
//! slot copies the parameters — later edits to the effect do not reach the
//! slot until it is re-applied. A slot refuses release while any source
//! send still routes into it.

use crate::backend::{Extension, ReverbProperties, ReverbVariant};
use crate::context::Context;
use crate::error::{FernSonicError, Result};
use crate::handle::Handle;
use crate::source::{Source, SourceHandle};

pub(crate) type EffectHandle = Handle<EffectEntry>;
pub(crate) type SlotHandle = Handle<SlotEntry>;

pub(crate) struct EffectEntry {
    pub raw: crate::backend::RawEffect,
}

pub(crate) struct SlotEntry {
    pub raw: crate::backend::RawSlot,
    /// `(source, send)` pairs currently routed into this slot.
    pub registrations: Vec<(SourceHandle, u32)>,
}

impl Context {
    /// Creates an auxiliary effect slot. Requires EFX.
    pub fn create_auxiliary_effect_slot(&self) -> Result<AuxiliaryEffectSlot> {
        self.check_current()?;
        if !self.inner.has_ext(Extension::Efx) {
            return Err(FernSonicError::NotSupported(
                "auxiliary effect slots".into(),
            ));
        }
        let raw = self.inner.backend.gen_aux_slot()?;
        let mut state = self.lock_state();
        let handle = state.slots.insert(SlotEntry {
            raw,
            registrations: Vec::new(),
        });
        Ok(AuxiliaryEffectSlot {
            ctx: self.clone(),
            handle,
        })
    }

    /// Creates an effect object. Requires EFX.
    pub fn create_effect(&self) -> Result<Effect> {
        self.check_current()?;
        if !self.inner.has_ext(Extension::Efx) {
            return Err(FernSonicError::NotSupported("effects".into()));
        }
        let raw = self.inner.backend.gen_effect()?;
        let mut state = self.lock_state();
        let handle = state.effects.insert(EffectEntry { raw });
        Ok(Effect {
            ctx: self.clone(),
            handle,
        })
    }
}

/// A backend routing node applying a DSP effect to routed sends.
#[derive(Clone)]
pub struct AuxiliaryEffectSlot {
    pub(crate) ctx: Context,
    pub(crate) handle: SlotHandle,
}

impl PartialEq for AuxiliaryEffectSlot {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle && self.ctx == other.ctx
    }
}
impl Eq for AuxiliaryEffectSlot {}

fn stale_slot() -> FernSonicError {
    FernSonicError::StaleHandle("effect slot was released".into())
}

impl AuxiliaryEffectSlot {
    /// Output gain of the slot, `[0, 1]`.
    pub fn set_gain(&self, gain: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&gain) {
            return Err(FernSonicError::InvalidArgument("gain out of range".into()));
        }
        self.ctx.check_current()?;
        let state = self.ctx.lock_state();
        let entry = state.slots.get(self.handle).ok_or_else(stale_slot)?;
        self.ctx.inner.backend.aux_slot_set_gain(entry.raw, gain);
        Ok(())
    }

    /// Whether reverb auto-adjusts routed send gains from its parameters.
    pub fn set_send_auto(&self, send_auto: bool) -> Result<()> {
        self.ctx.check_current()?;
        let state = self.ctx.lock_state();
        let entry = state.slots.get(self.handle).ok_or_else(stale_slot)?;
        self.ctx
            .inner
            .backend
            .aux_slot_set_send_auto(entry.raw, send_auto);
        Ok(())
    }

    /// Loads the effect's current parameters into the slot. The effect may
    /// be changed or destroyed afterwards without affecting the slot.
    pub fn apply_effect(&self, effect: Option<&Effect>) -> Result<()> {
        self.ctx.check_current()?;
        let state = self.ctx.lock_state();
        let entry = state.slots.get(self.handle).ok_or_else(stale_slot)?;
        let raw_effect = match effect {
            Some(e) => {
                if e.ctx != self.ctx {
                    return Err(FernSonicError::InvalidArgument(
                        "effect belongs to a different context".into(),
                    ));
                }
                Some(
                    state
                        .effects
                        .get(e.handle)
                        .ok_or_else(|| {
                            FernSonicError::StaleHandle("effect was destroyed".into())
                        })?
                        .raw,
                )
            }
            None => None,
        };
        self.ctx
            .inner
            .backend
            .aux_slot_apply_effect(entry.raw, raw_effect)?;
        Ok(())
    }

    /// The `(source, send)` pairs currently feeding this slot. Clearing
    /// those sends allows release.
    pub fn source_sends(&self) -> Result<Vec<(Source, u32)>> {
        let state = self.ctx.lock_state();
        let entry = state.slots.get(self.handle).ok_or_else(stale_slot)?;
        Ok(entry
            .registrations
            .iter()
            .map(|&(h, send)| (Source::from_parts(self.ctx.clone(), h), send))
            .collect())
    }

    pub fn is_in_use(&self) -> Result<bool> {
        let state = self.ctx.lock_state();
        let entry = state.slots.get(self.handle).ok_or_else(stale_slot)?;
        Ok(!entry.registrations.is_empty())
    }

    /// Releases the slot. Fails while any source send routes into it.
    pub fn release(&self) -> Result<()> {
        self.ctx.check_current()?;
        let mut state = self.ctx.lock_state();
        let entry = state.slots.get(self.handle).ok_or_else(stale_slot)?;
        if !entry.registrations.is_empty() {
            return Err(FernSonicError::InUse(format!(
                "effect slot feeds {} source send(s)",
                entry.registrations.len()
            )));
        }
        let raw = entry.raw;
        self.ctx.inner.backend.delete_aux_slot(raw)?;
        state.slots.remove(self.handle);
        Ok(())
    }
}

impl std::fmt::Debug for AuxiliaryEffectSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuxiliaryEffectSlot")
            .field("handle", &self.handle)
            .finish()
    }
}

/// A backend DSP effect object.
#[derive(Clone)]
pub struct Effect {
    pub(crate) ctx: Context,
    pub(crate) handle: EffectHandle,
}

impl PartialEq for Effect {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle && self.ctx == other.ctx
    }
}
impl Eq for Effect {}

impl Effect {
    /// Programs the effect as a reverb. When the full EAX variant is not
    /// available the parameters are downgraded to standard reverb, dropping
    /// the EAX-only fields.
    pub fn set_reverb_properties(&self, props: &ReverbProperties) -> Result<()> {
        self.ctx.check_current()?;
        let state = self.ctx.lock_state();
        let entry = state
            .effects
            .get(self.handle)
            .ok_or_else(|| FernSonicError::StaleHandle("effect was destroyed".into()))?;
        let backend = self.ctx.inner.backend.as_ref();
        let variant = if backend.supports_reverb(ReverbVariant::Eax) {
            ReverbVariant::Eax
        } else if backend.supports_reverb(ReverbVariant::Standard) {
            log::debug!("EAX reverb unavailable, downgrading to standard reverb");
            ReverbVariant::Standard
        } else {
            return Err(FernSonicError::NotSupported("reverb".into()));
        };
        backend.effect_set_reverb(entry.raw, variant, props)?;
        Ok(())
    }

    /// Destroys the effect. Slots it was applied to keep their copied
    /// parameters.
    pub fn destroy(&self) -> Result<()> {
        self.ctx.check_current()?;
        let mut state = self.ctx.lock_state();
        let entry = state
            .effects
            .get(self.handle)
            .ok_or_else(|| FernSonicError::StaleHandle("effect was destroyed".into()))?;
        let raw = entry.raw;
        self.ctx.inner.backend.delete_effect(raw)?;
        state.effects.remove(self.handle);
        Ok(())
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect").field("handle", &self.handle).finish()
    }
}

use shared::{
    domain::{Handle, Uri},
    error::ClientError,
    protocol::RequestBody,
};

use crate::{convergent::Convergent, ReconcileCtx};

pub const DEFAULT_VOLUME: u32 = 50;

/// Per-user state within one channel session. Pure reconciliation leaf: the
/// owning channel passes its session handle into every call, nothing here
/// points back up the tree.
#[derive(Debug, Clone)]
pub struct Participant {
    uri: Uri,
    volume_for_me: Convergent<u32>,
    muted_for_me: Convergent<bool>,
    muted_for_all: Convergent<bool>,
    is_speaking: bool,
    energy: f32,
}

impl Participant {
    pub fn new(uri: Uri) -> Self {
        Self {
            uri,
            volume_for_me: Convergent::new(DEFAULT_VOLUME),
            muted_for_me: Convergent::new(false),
            muted_for_all: Convergent::new(false),
            is_speaking: false,
            energy: 0.0,
        }
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn volume_for_me(&self) -> u32 {
        *self.volume_for_me.current()
    }

    pub fn is_muted_for_me(&self) -> bool {
        *self.muted_for_me.current()
    }

    pub fn is_muted_for_all(&self) -> bool {
        *self.muted_for_all.current()
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking
    }

    pub fn energy(&self) -> f32 {
        self.energy
    }

    pub fn set_desired_volume_for_me(&mut self, volume: u32) {
        self.volume_for_me.set_desired(volume);
    }

    pub fn set_desired_mute_for_me(&mut self, mute: bool) {
        self.muted_for_me.set_desired(mute);
    }

    pub fn set_desired_mute_for_all(&mut self, mute: bool) {
        self.muted_for_all.set_desired(mute);
    }

    pub fn next_state(
        &mut self,
        ctx: &mut ReconcileCtx<'_>,
        session_handle: &Handle,
    ) -> Result<(), ClientError> {
        if let Some(volume) = self.volume_for_me.take_request() {
            ctx.issue(RequestBody::SetParticipantVolumeForMe {
                session_handle: session_handle.clone(),
                participant_uri: self.uri.clone(),
                volume,
            })?;
        }
        if let Some(mute) = self.muted_for_me.take_request() {
            ctx.issue(RequestBody::SetParticipantMuteForMe {
                session_handle: session_handle.clone(),
                participant_uri: self.uri.clone(),
                mute,
            })?;
        }
        if let Some(mute) = self.muted_for_all.take_request() {
            ctx.issue(RequestBody::SetParticipantMuteForAll {
                session_handle: session_handle.clone(),
                participant_uri: self.uri.clone(),
                mute,
            })?;
        }
        Ok(())
    }

    /// Response plumbing; returns the rejected value on failure so the
    /// caller can raise the matching failure callback.
    pub fn complete_volume_for_me(&mut self, success: bool, requested: u32) -> Option<u32> {
        self.volume_for_me.complete(success, &requested)
    }

    pub fn complete_mute_for_me(&mut self, success: bool, requested: bool) -> Option<bool> {
        self.muted_for_me.complete(success, &requested)
    }

    pub fn complete_mute_for_all(&mut self, success: bool, requested: bool) -> Option<bool> {
        self.muted_for_all.complete(success, &requested)
    }

    /// Event-driven setters return whether the value actually changed so the
    /// channel can skip redundant update callbacks.
    pub fn set_is_speaking(&mut self, speaking: bool) -> bool {
        let changed = self.is_speaking != speaking;
        self.is_speaking = speaking;
        changed
    }

    pub fn set_energy(&mut self, energy: f32) -> bool {
        let changed = (self.energy - energy).abs() > f32::EPSILON;
        self.energy = energy;
        changed
    }

    pub fn set_muted_for_all(&mut self, muted: bool) -> bool {
        let changed = self.is_muted_for_all() != muted;
        self.muted_for_all.observe(muted);
        changed
    }
}

//! Named source groups.
//!
//! A group scales the gain and pitch of every source under it, including
//! sources of sub-groups; factors multiply down the tree. Groups also offer
//! bulk pause/resume/stop over their subtree. The parent relation is kept
//! acyclic by refusing any reparenting that would close a loop.

use crate::context::{Context, ContextMessage, ContextState};
use crate::error::{FernSonicError, Result};
use crate::handle::Handle;
use crate::source::{self, Source, SourceHandle};

pub(crate) type GroupHandle = Handle<GroupEntry>;

pub(crate) struct GroupEntry {
    pub name: String,
    pub parent: Option<GroupHandle>,
    pub sources: Vec<SourceHandle>,
    pub children: Vec<GroupHandle>,
    pub gain: f32,
    pub pitch: f32,
}

/// True if `candidate` appears on the ancestor chain of `start` (inclusive).
fn is_ancestor_or_self(
    state: &ContextState,
    start: GroupHandle,
    candidate: GroupHandle,
) -> bool {
    let mut cursor = Some(start);
    while let Some(handle) = cursor {
        if handle == candidate {
            return true;
        }
        cursor = state.groups.get(handle).and_then(|e| e.parent);
    }
    false
}

/// Depth-first collection of every source under a group.
pub(crate) fn collect_sources(state: &ContextState, group: GroupHandle) -> Vec<SourceHandle> {
    let mut sources = Vec::new();
    let mut stack = vec![group];
    while let Some(handle) = stack.pop() {
        if let Some(entry) = state.groups.get(handle) {
            sources.extend(entry.sources.iter().copied());
            stack.extend(entry.children.iter().copied());
        }
    }
    sources
}

/// Marks every source under the group for a gain/pitch recommit.
fn mark_subtree_dirty(state: &mut ContextState, group: GroupHandle) {
    for handle in collect_sources(state, group) {
        if let Some(entry) = state.sources.get_mut(handle) {
            entry.dirty = true;
        }
    }
}

impl Context {
    /// Creates a source group with a unique name.
    pub fn create_source_group(&self, name: &str) -> Result<SourceGroup> {
        self.check_current()?;
        if name.is_empty() {
            return Err(FernSonicError::InvalidArgument(
                "group name is empty".into(),
            ));
        }
        let mut state = self.lock_state();
        if state.group_names.contains_key(name) {
            return Err(FernSonicError::Duplicate(format!("source group {name:?}")));
        }
        let handle = state.groups.insert(GroupEntry {
            name: name.to_string(),
            parent: None,
            sources: Vec::new(),
            children: Vec::new(),
            gain: 1.0,
            pitch: 1.0,
        });
        state.group_names.insert(name.to_string(), handle);
        Ok(SourceGroup::from_parts(self.clone(), handle))
    }

    /// Looks up a source group by name.
    pub fn source_group(&self, name: &str) -> Result<SourceGroup> {
        self.check_current()?;
        let state = self.lock_state();
        let handle = state
            .group_names
            .get(name)
            .copied()
            .ok_or_else(|| FernSonicError::NotFound(format!("source group {name:?}")))?;
        Ok(SourceGroup::from_parts(self.clone(), handle))
    }
}

/// A named node in the source-group tree.
#[derive(Clone)]
pub struct SourceGroup {
    pub(crate) ctx: Context,
    pub(crate) handle: GroupHandle,
}

impl PartialEq for SourceGroup {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle && self.ctx == other.ctx
    }
}
impl Eq for SourceGroup {}

impl std::fmt::Debug for SourceGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceGroup")
            .field("handle", &self.handle)
            .finish()
    }
}

fn stale_group() -> FernSonicError {
    FernSonicError::StaleHandle("source group was released".into())
}

impl SourceGroup {
    pub(crate) fn from_parts(ctx: Context, handle: GroupHandle) -> Self {
        Self { ctx, handle }
    }

    fn entry<R>(&self, f: impl FnOnce(&GroupEntry) -> R) -> Result<R> {
        let state = self.ctx.lock_state();
        let entry = state.groups.get(self.handle).ok_or_else(stale_group)?;
        Ok(f(entry))
    }

    pub fn name(&self) -> Result<String> {
        self.entry(|e| e.name.clone())
    }

    /// Reparents this group under `parent` (`None` makes it a root). Fails
    /// with a cycle error if `parent` lies in this group's own subtree.
    pub fn set_parent_group(&self, parent: Option<&SourceGroup>) -> Result<()> {
        self.ctx.check_current()?;
        let mut state = self.ctx.lock_state();
        let new_parent = match parent {
            Some(p) => {
                if p.ctx != self.ctx {
                    return Err(FernSonicError::InvalidArgument(
                        "group belongs to a different context".into(),
                    ));
                }
                if !state.groups.contains(p.handle) {
                    return Err(stale_group());
                }
                if is_ancestor_or_self(&state, p.handle, self.handle) {
                    return Err(FernSonicError::Cycle(format!(
                        "group {:?} is a descendant of the group being reparented",
                        state.groups.get(p.handle).map(|e| e.name.as_str()).unwrap_or("?")
                    )));
                }
                Some(p.handle)
            }
            None => None,
        };
        let old_parent = {
            let entry = state.groups.get_mut(self.handle).ok_or_else(stale_group)?;
            std::mem::replace(&mut entry.parent, new_parent)
        };
        if let Some(old) = old_parent {
            if let Some(entry) = state.groups.get_mut(old) {
                entry.children.retain(|&c| c != self.handle);
            }
        }
        if let Some(new) = new_parent {
            if let Some(entry) = state.groups.get_mut(new) {
                entry.children.push(self.handle);
            }
        }
        mark_subtree_dirty(&mut state, self.handle);
        Ok(())
    }

    pub fn parent_group(&self) -> Result<Option<SourceGroup>> {
        self.entry(|e| e.parent)
            .map(|p| p.map(|h| SourceGroup::from_parts(self.ctx.clone(), h)))
    }

    /// Snapshot of the sources directly in this group.
    pub fn sources(&self) -> Result<Vec<Source>> {
        let state = self.ctx.lock_state();
        let entry = state.groups.get(self.handle).ok_or_else(stale_group)?;
        Ok(entry
            .sources
            .iter()
            .map(|&h| Source::from_parts(self.ctx.clone(), h))
            .collect())
    }

    /// Snapshot of the direct sub-groups.
    pub fn sub_groups(&self) -> Result<Vec<SourceGroup>> {
        let state = self.ctx.lock_state();
        let entry = state.groups.get(self.handle).ok_or_else(stale_group)?;
        Ok(entry
            .children
            .iter()
            .map(|&h| SourceGroup::from_parts(self.ctx.clone(), h))
            .collect())
    }

    /// Gain factor multiplied into every source under this group.
    pub fn set_gain(&self, gain: f32) -> Result<()> {
        if !(gain >= 0.0) {
            return Err(FernSonicError::InvalidArgument("gain out of range".into()));
        }
        self.ctx.check_current()?;
        let mut state = self.ctx.lock_state();
        state
            .groups
            .get_mut(self.handle)
            .ok_or_else(stale_group)?
            .gain = gain;
        mark_subtree_dirty(&mut state, self.handle);
        Ok(())
    }

    pub fn gain(&self) -> Result<f32> {
        self.entry(|e| e.gain)
    }

    /// Pitch factor multiplied into every source under this group.
    pub fn set_pitch(&self, pitch: f32) -> Result<()> {
        if !(pitch > 0.0) {
            return Err(FernSonicError::InvalidArgument("pitch out of range".into()));
        }
        self.ctx.check_current()?;
        let mut state = self.ctx.lock_state();
        state
            .groups
            .get_mut(self.handle)
            .ok_or_else(stale_group)?
            .pitch = pitch;
        mark_subtree_dirty(&mut state, self.handle);
        Ok(())
    }

    pub fn pitch(&self) -> Result<f32> {
        self.entry(|e| e.pitch)
    }

    /// Pauses every playing source in the subtree.
    pub fn pause_all(&self) -> Result<()> {
        self.ctx.check_current()?;
        let mut state = self.ctx.lock_state();
        if !state.groups.contains(self.handle) {
            return Err(stale_group());
        }
        for handle in collect_sources(&state, self.handle) {
            let Some(entry) = state.sources.get_mut(handle) else {
                continue;
            };
            let paused = match entry.playback {
                crate::source::Playback::Buffer => crate::source::Playback::PausedBuffer,
                crate::source::Playback::Streaming => crate::source::Playback::PausedStreaming,
                _ => continue,
            };
            if let Some(voice) = entry.voice {
                let _ = self.ctx.inner.backend.voice_pause(voice);
            }
            entry.playback = paused;
        }
        Ok(())
    }

    /// Resumes every paused source in the subtree.
    pub fn resume_all(&self) -> Result<()> {
        self.ctx.check_current()?;
        let mut state = self.ctx.lock_state();
        if !state.groups.contains(self.handle) {
            return Err(stale_group());
        }
        for handle in collect_sources(&state, self.handle) {
            let Some(entry) = state.sources.get_mut(handle) else {
                continue;
            };
            let playing = match entry.playback {
                crate::source::Playback::PausedBuffer => crate::source::Playback::Buffer,
                crate::source::Playback::PausedStreaming => crate::source::Playback::Streaming,
                _ => continue,
            };
            if let Some(voice) = entry.voice {
                let _ = self.ctx.inner.backend.voice_play(voice);
            }
            entry.playback = playing;
        }
        Ok(())
    }

    /// Force-stops every source in the subtree, reporting each through the
    /// message handler.
    pub fn stop_all(&self) -> Result<()> {
        self.ctx.check_current()?;
        let mut messages = Vec::new();
        let handler = {
            let mut state = self.ctx.lock_state();
            if !state.groups.contains(self.handle) {
                return Err(stale_group());
            }
            for handle in collect_sources(&state, self.handle) {
                let active = state
                    .sources
                    .get(handle)
                    .map(|e| e.playback != crate::source::Playback::Detached)
                    .unwrap_or(false);
                if active {
                    source::stop_playback(&self.ctx.inner, &mut state, handle, true, true);
                    messages.push(ContextMessage::ForceStopped(handle));
                }
            }
            state.handler.clone()
        };
        self.ctx.dispatch(&handler, messages);
        Ok(())
    }

    /// Releases the group: members return to no group, sub-groups become
    /// roots, and the name is freed.
    pub fn release(&self) -> Result<()> {
        self.ctx.check_current()?;
        let mut state = self.ctx.lock_state();
        let entry = state.groups.remove(self.handle).ok_or_else(stale_group)?;
        state.group_names.remove(&entry.name);
        for handle in &entry.sources {
            if let Some(source) = state.sources.get_mut(*handle) {
                source.group = None;
                source.dirty = true;
            }
        }
        for child in &entry.children {
            if let Some(group) = state.groups.get_mut(*child) {
                group.parent = None;
            }
        }
        if let Some(parent) = entry.parent {
            if let Some(group) = state.groups.get_mut(parent) {
                group.children.retain(|&c| c != self.handle);
            }
        }
        Ok(())
    }
}

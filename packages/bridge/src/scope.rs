//! Scope frames tracking foreign handles for deterministic release.
//!
//! Foreign resources are invisible to host memory management, so every handle
//! the bridge hands out belongs to exactly one owner: a scope frame, or
//! nobody (detached). Ending a scope releases everything still attached to it.
//! A value that must outlive the scope it was created in has to be detached or
//! moved to the parent frame before the scope ends.

use tracing::trace;

use crate::error::{Error, Result};
use crate::sandbox::Sandbox;
use crate::value::Handle;

/// Stack of handle-tracking frames. Detached slots become `None`.
#[derive(Debug, Default)]
pub struct ScopeStack {
    frames: Vec<Vec<Option<Handle>>>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn begin(&mut self) {
        self.frames.push(Vec::new());
    }

    /// Pop the top frame and return the handles that still need releasing.
    pub fn end(&mut self) -> Result<Vec<Handle>> {
        let frame = self.frames.pop().ok_or(Error::NoOpenScope)?;
        Ok(frame
            .into_iter()
            .flatten()
            .filter(|h| !h.is_disposed())
            .collect())
    }

    /// Track a handle in the top frame.
    pub fn attach(&mut self, handle: &Handle) -> Result<()> {
        let frame = self.frames.last_mut().ok_or(Error::NoOpenScope)?;
        frame.push(Some(handle.clone()));
        Ok(())
    }

    /// Tombstone the single slot holding `handle` in the top frame.
    pub fn detach(&mut self, handle: &Handle) -> Result<()> {
        let frame = self.frames.last_mut().ok_or(Error::NoOpenScope)?;
        let mut found = None;
        for (i, slot) in frame.iter().enumerate() {
            if slot.as_ref().is_some_and(|h| h.same(handle)) {
                if found.is_some() {
                    return Err(Error::DuplicateAttachment);
                }
                found = Some(i);
            }
        }
        let index = found.ok_or(Error::NotFound)?;
        frame[index] = None;
        Ok(())
    }

    /// Detach from the top frame and attach to the one below it.
    pub fn move_to_parent(&mut self, handle: &Handle) -> Result<()> {
        if self.frames.len() < 2 {
            return Err(Error::NoParentScope);
        }
        self.detach(handle)?;
        let parent = self.frames.len() - 2;
        self.frames[parent].push(Some(handle.clone()));
        Ok(())
    }

    /// Attached, not yet disposed handles in the top frame.
    pub fn live_in_top(&self) -> usize {
        self.frames.last().map_or(0, |frame| {
            frame
                .iter()
                .flatten()
                .filter(|h| !h.is_disposed())
                .count()
        })
    }
}

/// Release one handle in the foreign module, at most once.
pub(crate) fn release<S: Sandbox + ?Sized>(sandbox: &mut S, handle: &Handle) -> Result<()> {
    if !handle.mark_disposed() {
        return Ok(());
    }
    trace!(handle = handle.addr(), "releasing foreign handle");
    let status = sandbox.object_free(handle.addr())?;
    if status != 0 {
        return Err(crate::calling::last_error(sandbox));
    }
    Ok(())
}

/// Release every handle, continuing past failures; reports the first one.
pub(crate) fn release_all<S: Sandbox + ?Sized>(sandbox: &mut S, handles: Vec<Handle>) -> Result<()> {
    let mut first_error = None;
    for handle in handles {
        if let Err(e) = release(sandbox, &handle) {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

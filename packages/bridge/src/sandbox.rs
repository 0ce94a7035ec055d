//! The seam between the bridge and a concrete sandboxed module.
//!
//! [`Sandbox`] is the foreign module's ABI as the bridge sees it: linear
//! memory, an allocator, the packed-call entry point, the global function
//! registry, the error channel and, optionally, the suspension exports.
//! Each sandbox also owns the [`BridgeState`] for its session, so several
//! sandboxes can coexist without sharing any registry.
//!
//! Every pointer argument is a sandbox address. Names and messages are
//! `u32`-length-prefixed strings.

use std::collections::HashMap;

use crate::arena::ArenaPool;
use crate::calling::CallbackTable;
use crate::error::{Error, Result};
use crate::scope::ScopeStack;
use crate::suspend::Suspension;
use crate::value::PackedFunc;

/// Where the module is in the unwind/rewind protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendState {
    /// Executing normally.
    Normal,
    /// Unwinding its stack after a suspend request.
    Unwinding,
    /// Replaying its stack back to the suspend point.
    Rewinding,
}

impl SuspendState {
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(SuspendState::Normal),
            1 => Ok(SuspendState::Unwinding),
            2 => Ok(SuspendState::Rewinding),
            other => Err(Error::Suspension(format!("unknown state code {other}"))),
        }
    }
}

/// Configuration for a bridge session.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Smallest sandbox region an arena buffer allocates.
    pub initial_arena_bytes: usize,
    /// Minimum factor an arena buffer grows by when a call outgrows it.
    pub arena_growth_factor: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            initial_arena_bytes: 1024,
            arena_growth_factor: 2,
        }
    }
}

/// Per-session bridge state, owned by the sandbox it drives.
pub struct BridgeState {
    pub(crate) arena: ArenaPool,
    pub(crate) scopes: ScopeStack,
    pub(crate) functions: HashMap<String, PackedFunc>,
    pub(crate) callbacks: CallbackTable,
    pub(crate) suspension: Suspension,
}

impl BridgeState {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            arena: ArenaPool::new(config.initial_arena_bytes)
                .with_growth_factor(config.arena_growth_factor),
            scopes: ScopeStack::new(),
            functions: HashMap::new(),
            callbacks: CallbackTable::default(),
            suspension: Suspension::default(),
        }
    }

    pub fn arena(&self) -> &ArenaPool {
        &self.arena
    }

    pub fn scopes(&self) -> &ScopeStack {
        &self.scopes
    }

    /// Host functions currently reachable from the foreign side.
    pub fn live_callbacks(&self) -> usize {
        self.callbacks.live()
    }
}

impl Default for BridgeState {
    fn default() -> Self {
        Self::new(BridgeConfig::default())
    }
}

impl std::fmt::Debug for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeState")
            .field("arena", &self.arena)
            .field("scope_depth", &self.scopes.depth())
            .field("cached_functions", &self.functions.len())
            .field("live_callbacks", &self.callbacks.live())
            .finish()
    }
}

/// A sandboxed foreign module.
///
/// Status-returning methods follow the foreign convention: zero for success,
/// non-zero means a `{kind, message}` pair is available from
/// [`last_error`](Sandbox::last_error). `Err` is reserved for engine-level
/// failures such as traps.
pub trait Sandbox {
    /// The bridge state of this session.
    fn state(&mut self) -> &mut BridgeState;

    fn memory(&self) -> &[u8];

    fn memory_mut(&mut self) -> &mut [u8];

    /// Allocate `nbytes` of sandbox memory, 16-byte aligned.
    fn alloc(&mut self, nbytes: u32) -> Result<u32>;

    fn free(&mut self, ptr: u32) -> Result<()>;

    /// Invoke a function handle on `nargs` records at `args`, writing the
    /// result record to `ret`.
    fn func_call(&mut self, func: u32, args: u32, nargs: u32, ret: u32) -> Result<i32>;

    /// Store the handle of the global function `name` at `out`, or zero if
    /// no such function exists.
    fn get_global_func(&mut self, name: u32, out: u32) -> Result<i32>;

    fn register_global_func(&mut self, name: u32, func: u32, override_existing: bool)
        -> Result<i32>;

    /// Create a function handle that calls back into host resource
    /// `resource`, storing it at `out`.
    fn func_create_from_host(&mut self, resource: u32, out: u32) -> Result<i32>;

    /// Copy the record at `value` into the return slot `ret` of a callback,
    /// taking a reference on any object it names.
    fn set_return(&mut self, ret: u32, value: u32) -> Result<i32>;

    fn set_last_error(&mut self, kind: u32, message: u32) -> Result<()>;

    /// Address of `{kind: u32 str ptr, message: u32 str ptr}`.
    fn last_error(&mut self) -> Result<u32>;

    /// Take one more reference on an object.
    fn object_retain(&mut self, handle: u32) -> Result<()>;

    /// Drop one reference on an object.
    fn object_free(&mut self, handle: u32) -> Result<i32>;

    fn suspend_state(&mut self) -> Result<SuspendState> {
        Ok(SuspendState::Normal)
    }

    fn start_unwind(&mut self) -> Result<()> {
        Err(Error::SuspensionUnsupported("start_unwind".to_string()))
    }

    fn stop_unwind(&mut self) -> Result<()> {
        Err(Error::SuspensionUnsupported("stop_unwind".to_string()))
    }

    fn start_rewind(&mut self) -> Result<()> {
        Err(Error::SuspensionUnsupported("start_rewind".to_string()))
    }

    fn stop_rewind(&mut self) -> Result<()> {
        Err(Error::SuspensionUnsupported("stop_rewind".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspend_state_codes() {
        assert_eq!(SuspendState::from_code(0).unwrap(), SuspendState::Normal);
        assert_eq!(SuspendState::from_code(1).unwrap(), SuspendState::Unwinding);
        assert_eq!(SuspendState::from_code(2).unwrap(), SuspendState::Rewinding);
        assert!(SuspendState::from_code(3).is_err());
    }

    #[test]
    fn bridge_config_default() {
        let config = BridgeConfig::default();
        assert_eq!(config.initial_arena_bytes, 1024);
        assert_eq!(config.arena_growth_factor, 2);
        let state = BridgeState::new(config);
        assert_eq!(state.scopes().depth(), 0);
        assert_eq!(state.arena().in_flight(), 0);
        assert_eq!(state.live_callbacks(), 0);
    }
}

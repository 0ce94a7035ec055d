//! Cooperative suspension of foreign calls.
//!
//! A foreign call may reach a host function that needs to await something.
//! The module cannot block, so the import side ([`wrap_async`]) parks the
//! host future in the session and asks the module to unwind its stack. The
//! export side ([`call_async`]) notices the unwound call, awaits the parked
//! future, stores its result and rewinds the module, which re-enters the same
//! import and receives the result as if the call had been synchronous.
//!
//! While rewinding, callback arguments are replayed from the module's saved
//! stack. Arguments that would need an ownership conversion (strings,
//! objects) are rejected instead of being read from stale memory.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tracing::{debug, warn};

use crate::arena::ArenaBuffer;
use crate::calling::{arg_count, check_status, layout_call};
use crate::codec::{self, DecodeMode};
use crate::error::{Error, Result};
use crate::sandbox::{Sandbox, SuspendState};
use crate::value::{PackedFunc, Value};

type PendingFuture = Pin<Box<dyn Future<Output = Result<Value>>>>;

/// The suspend point currently in flight, if any.
#[derive(Default)]
pub struct Suspension {
    pending: Option<PendingFuture>,
    resolved: Option<Result<Value>>,
}

impl Suspension {
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether a result is waiting for the rewound import to pick it up.
    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }
}

impl fmt::Debug for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspension")
            .field("pending", &self.pending.is_some())
            .field("resolved", &self.resolved.is_some())
            .finish()
    }
}

/// Turn an async host function into a host function the module can call
/// synchronously from inside [`call_async`].
pub fn wrap_async<F, Fut>(f: F) -> impl Fn(&mut dyn Sandbox, &[Value]) -> Result<Value> + 'static
where
    F: Fn(Vec<Value>) -> Fut + 'static,
    Fut: Future<Output = Result<Value>> + 'static,
{
    move |sandbox: &mut dyn Sandbox, args: &[Value]| match sandbox.suspend_state()? {
        SuspendState::Normal => {
            if sandbox.state().suspension.is_pending() {
                return Err(Error::Suspension("a suspend point is already pending".into()));
            }
            sandbox.state().suspension.pending = Some(Box::pin(f(args.to_vec())));
            if let Err(e) = sandbox.start_unwind() {
                sandbox.state().suspension.pending = None;
                return Err(e);
            }
            Ok(Value::None)
        }
        SuspendState::Rewinding => {
            sandbox.stop_rewind()?;
            sandbox
                .state()
                .suspension
                .resolved
                .take()
                .unwrap_or_else(|| Err(Error::Suspension("rewound without a result".into())))
        }
        SuspendState::Unwinding => Err(Error::Suspension(
            "async host function entered while unwinding".into(),
        )),
    }
}

/// Fail a synchronous call whose module started unwinding.
pub(crate) fn reject_suspension<S: Sandbox + ?Sized>(sandbox: &mut S) -> Result<()> {
    if sandbox.suspend_state()? != SuspendState::Unwinding {
        return Ok(());
    }
    sandbox.stop_unwind()?;
    sandbox.state().suspension.pending = None;
    warn!("foreign call suspended outside of call_async");
    Err(Error::SuspendedOutsideAsync)
}

/// Return the module to normal execution after a failed suspended call,
/// dropping any parked future or undelivered result.
pub(crate) fn reset<S: Sandbox + ?Sized>(sandbox: &mut S) -> Result<()> {
    sandbox.state().suspension = Suspension::default();
    match sandbox.suspend_state()? {
        SuspendState::Normal => Ok(()),
        SuspendState::Unwinding => sandbox.stop_unwind(),
        SuspendState::Rewinding => sandbox.stop_rewind(),
    }
}

/// Call a foreign function, resolving every suspend point it reaches.
///
/// The argument buffer stays checked out for the whole call so a rewound
/// module sees the same records it was first called with.
pub async fn call_async<S: Sandbox + ?Sized>(
    sandbox: &mut S,
    func: &PackedFunc,
    args: &[Value],
) -> Result<Value> {
    let addr = func.handle().live_addr()?;
    let nargs = arg_count(args)?;
    let mut buf = sandbox.state().arena.checkout();
    let result = drive(sandbox, &mut buf, addr, args, nargs).await;
    sandbox.state().arena.recycle(buf);
    if result.is_err() {
        if let Err(e) = reset(sandbox) {
            warn!(func = addr, error = %e, "could not reset suspension state");
        }
    }
    result
}

async fn drive<S: Sandbox + ?Sized>(
    sandbox: &mut S,
    buf: &mut ArenaBuffer,
    func: u32,
    args: &[Value],
    nargs: u32,
) -> Result<Value> {
    let (args_offset, ret_offset) = layout_call(buf, args)?;
    buf.commit(sandbox)?;

    let mut suspensions = 0_usize;
    loop {
        let status = sandbox.func_call(func, buf.addr(args_offset), nargs, buf.addr(ret_offset))?;
        if sandbox.suspend_state()? != SuspendState::Unwinding {
            check_status(sandbox, status)?;
            if suspensions > 0 {
                debug!(func, suspensions, "suspended call completed");
            }
            return codec::decode(sandbox, buf.addr(ret_offset), DecodeMode::Owned { track: true });
        }

        sandbox.stop_unwind()?;
        let pending = sandbox
            .state()
            .suspension
            .pending
            .take()
            .ok_or_else(|| Error::Suspension("module unwound without a pending future".into()))?;
        suspensions += 1;
        debug!(func, suspensions, "foreign call suspended");

        let resolved = pending.await;
        sandbox.state().suspension.resolved = Some(resolved);
        sandbox.start_rewind()?;
    }
}

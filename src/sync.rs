//! Synchronization primitives: attribute lists, reconciled signal objects and
//! fences.
//!
//! A `SyncObj` is a monotonically advancing sync point shared between one
//! signaler and any number of waiters. A `Fence` is a point-in-time token
//! generated from a `SyncObj`; waiting on it blocks until the signaler has
//! advanced past that point. Attribute lists describe what each side needs
//! (CPU access, permissions, hardware affinity) and must reconcile before an
//! object can be allocated.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{Result, StreamError};

/// Access permission requested by one endpoint on a sync object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncPerm {
    WaitOnly,
    SignalOnly,
    WaitSignal,
}

/// Hardware unit a sync object must be reachable from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncHw {
    Cpu,
    Capture,
    Gpu(u32),
    Encoder,
}

/// Unreconciled sync requirements published by one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncAttrs {
    pub need_cpu_access: bool,
    pub perm: Option<SyncPerm>,
    pub hw: BTreeSet<SyncHw>,
}

impl SyncAttrs {
    pub fn new() -> Self {
        SyncAttrs::default()
    }

    pub fn set_need_cpu_access(&mut self, need: bool) -> &mut Self {
        self.need_cpu_access = need;
        self
    }

    pub fn set_perm(&mut self, perm: SyncPerm) -> &mut Self {
        self.perm = merge_perm(self.perm, Some(perm));
        self
    }

    pub fn add_hw(&mut self, hw: SyncHw) -> &mut Self {
        self.hw.insert(hw);
        self
    }

    pub fn is_empty(&self) -> bool {
        !self.need_cpu_access && self.perm.is_none() && self.hw.is_empty()
    }

    /// Merge the requirements of several endpoints into one allocatable list.
    /// There must be exactly one signaler among the inputs.
    pub fn reconcile<'a>(lists: impl IntoIterator<Item = &'a SyncAttrs>) -> Result<SyncAttrs> {
        let mut out = SyncAttrs::new();
        let mut signalers = 0usize;
        let mut any = false;
        for l in lists {
            any = true;
            out.need_cpu_access |= l.need_cpu_access;
            if matches!(l.perm, Some(SyncPerm::SignalOnly) | Some(SyncPerm::WaitSignal)) {
                signalers += 1;
            }
            out.perm = merge_perm(out.perm, l.perm);
            out.hw.extend(l.hw.iter().copied());
        }
        if !any {
            return Err(StreamError::Reconcile("no sync attribute lists".into()));
        }
        if signalers != 1 {
            return Err(StreamError::Reconcile(format!(
                "expected exactly one signaler, found {signalers}"
            )));
        }
        Ok(out)
    }
}

fn merge_perm(a: Option<SyncPerm>, b: Option<SyncPerm>) -> Option<SyncPerm> {
    match (a, b) {
        (None, p) | (p, None) => p,
        (Some(x), Some(y)) if x == y => Some(x),
        _ => Some(SyncPerm::WaitSignal),
    }
}

/// Process-wide sync module handle. Tracks live objects so teardown can be
/// verified.
#[derive(Clone)]
pub struct SyncModule {
    live: Arc<AtomicUsize>,
}

impl SyncModule {
    pub fn open() -> Self {
        SyncModule {
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Allocate a sync object from reconciled attributes.
    pub fn alloc(&self, attrs: &SyncAttrs) -> Result<SyncObj> {
        if attrs.perm != Some(SyncPerm::WaitSignal) {
            return Err(StreamError::Reconcile(
                "sync attrs not reconciled for both wait and signal".into(),
            ));
        }
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(SyncObj {
            core: Arc::new(SyncCore {
                state: Mutex::new(SyncState::default()),
                cv: Condvar::new(),
                attrs: attrs.clone(),
                live: self.live.clone(),
            }),
        })
    }

    /// Allocate a CPU wait context. The returned context is required for any
    /// host-side fence wait.
    pub fn cpu_wait_context(&self) -> CpuWaitContext {
        CpuWaitContext { _priv: () }
    }

    /// Number of sync objects currently alive.
    pub fn live_objects(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct SyncState {
    reserved: u64,
    completed: u64,
}

struct SyncCore {
    state: Mutex<SyncState>,
    cv: Condvar,
    attrs: SyncAttrs,
    live: Arc<AtomicUsize>,
}

impl Drop for SyncCore {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A reconciled, allocated sync object. Cloning shares the same sync point.
#[derive(Clone)]
pub struct SyncObj {
    core: Arc<SyncCore>,
}

impl SyncObj {
    pub fn attrs(&self) -> &SyncAttrs {
        &self.core.attrs
    }

    /// Reserve the next sync point and return a fence for it. The signaler
    /// must later reach that point via [`SyncObj::signal`].
    pub fn generate_fence(&self) -> Fence {
        let mut st = self.core.state.lock().unwrap();
        st.reserved += 1;
        Fence {
            core: Arc::clone(&self.core),
            value: st.reserved,
        }
    }

    /// Advance completion by one point and wake waiters.
    pub fn signal(&self) {
        let mut st = self.core.state.lock().unwrap();
        st.completed += 1;
        if st.reserved < st.completed {
            st.reserved = st.completed;
        }
        self.core.cv.notify_all();
    }

    /// Advance completion to at least `value`.
    pub fn signal_to(&self, value: u64) {
        let mut st = self.core.state.lock().unwrap();
        if st.completed < value {
            st.completed = value;
        }
        if st.reserved < st.completed {
            st.reserved = st.completed;
        }
        self.core.cv.notify_all();
    }

    pub fn same_object(&self, other: &SyncObj) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

/// Point-in-time token derived from a [`SyncObj`].
#[derive(Clone)]
pub struct Fence {
    core: Arc<SyncCore>,
    value: u64,
}

impl Fence {
    pub fn value(&self) -> u64 {
        self.value
    }

    /// True once the signaler has reached this point.
    pub fn is_signaled(&self) -> bool {
        self.core.state.lock().unwrap().completed >= self.value
    }

    fn wait(&self, timeout: Duration) -> Result<()> {
        let st = self.core.state.lock().unwrap();
        let (st, res) = self
            .core
            .cv
            .wait_timeout_while(st, timeout, |s| s.completed < self.value)
            .map_err(|_| StreamError::Hardware("sync state poisoned".into()))?;
        drop(st);
        if res.timed_out() {
            Err(StreamError::FenceTimeout)
        } else {
            Ok(())
        }
    }
}

/// Host-side wait context; the only way to block a CPU thread on a fence.
pub struct CpuWaitContext {
    _priv: (),
}

impl CpuWaitContext {
    pub fn wait(&self, fence: &Fence, timeout: Duration) -> Result<()> {
        fence.wait(timeout)
    }
}

/// Device-side wait used by the compute/encode stand-ins. Identical blocking
/// semantics, separate entry point so host waits stay auditable.
pub(crate) fn device_wait(fence: &Fence, timeout: Duration) -> Result<()> {
    fence.wait(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn reconciled() -> SyncAttrs {
        let mut signaler = SyncAttrs::new();
        signaler.set_perm(SyncPerm::SignalOnly).add_hw(SyncHw::Gpu(0));
        let mut waiter = SyncAttrs::new();
        waiter.set_perm(SyncPerm::WaitOnly).set_need_cpu_access(true);
        SyncAttrs::reconcile([&signaler, &waiter]).unwrap()
    }

    #[test]
    fn reconcile_requires_a_signaler() {
        let mut a = SyncAttrs::new();
        a.set_perm(SyncPerm::WaitOnly);
        let b = a.clone();
        assert!(SyncAttrs::reconcile([&a, &b]).is_err());
    }

    #[test]
    fn reconcile_is_deterministic() {
        let r1 = reconciled();
        let r2 = reconciled();
        assert_eq!(r1, r2);
    }

    #[test]
    fn fence_blocks_until_signal() {
        let module = SyncModule::open();
        let obj = module.alloc(&reconciled()).unwrap();
        let ctx = module.cpu_wait_context();

        let fence = obj.generate_fence();
        assert!(!fence.is_signaled());
        assert_eq!(
            ctx.wait(&fence, Duration::from_millis(10)),
            Err(StreamError::FenceTimeout)
        );

        let signaler = obj.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaler.signal();
        });
        ctx.wait(&fence, Duration::from_secs(2)).unwrap();
        t.join().unwrap();
        assert!(fence.is_signaled());
    }

    #[test]
    fn module_counts_live_objects() {
        let module = SyncModule::open();
        let obj = module.alloc(&reconciled()).unwrap();
        let clone = obj.clone();
        assert_eq!(module.live_objects(), 1);
        drop(obj);
        assert_eq!(module.live_objects(), 1);
        drop(clone);
        assert_eq!(module.live_objects(), 0);
    }
}

use std::any::Any;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::channel::SelectableChannel;
use crate::error::{MuxError, Result};
use crate::event::Ops;
use crate::selector::SelectorInner;

/// Binding between one channel and one selector.
///
/// A key stays valid until it is cancelled, its channel is closed, or its
/// selector is closed; it is physically removed from the selector's sets at
/// the start of the next select cycle. The key holds weak links in both
/// directions — the selector's registered set and the channel's key list
/// hold the owning references.
pub struct SelectionKey {
    pub(crate) selector: Weak<SelectorInner>,
    pub(crate) channel: Weak<dyn SelectableChannel>,
    pub(crate) fd: RawFd,
    interest: AtomicU32,
    ready: AtomicU32,
    valid: AtomicBool,
    /// Implementation-private slot index; `-1` once deregistered.
    pub(crate) index: AtomicI32,
    attachment: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl SelectionKey {
    pub(crate) fn new(
        selector: Weak<SelectorInner>,
        channel: Weak<dyn SelectableChannel>,
        fd: RawFd,
    ) -> SelectionKey {
        SelectionKey {
            selector,
            channel,
            fd,
            interest: AtomicU32::new(0),
            ready: AtomicU32::new(0),
            valid: AtomicBool::new(true),
            index: AtomicI32::new(0),
            attachment: Mutex::new(None),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The channel this key binds, if it is still alive.
    pub fn channel(&self) -> Option<Arc<dyn SelectableChannel>> {
        self.channel.upgrade()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    /// Current interest set.
    pub fn interest_ops(&self) -> Result<Ops> {
        if !self.is_valid() {
            return Err(MuxError::CancelledKey);
        }
        Ok(self.interest())
    }

    /// Replace the interest set and stage the change with the selector; the
    /// kernel observes it on the next select cycle.
    pub fn set_interest_ops(&self, ops: Ops) -> Result<()> {
        if !self.is_valid() {
            return Err(MuxError::CancelledKey);
        }
        let channel = self.channel.upgrade().ok_or(MuxError::ClosedChannel)?;
        if !ops.difference(channel.valid_ops()).is_empty() {
            return Err(MuxError::UnsupportedOps);
        }
        let selector = self.selector.upgrade().ok_or(MuxError::ClosedSelector)?;
        selector.stage_interest(self.fd, channel.translate_interest(ops))?;
        self.interest.store(ops.bits(), Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn interest(&self) -> Ops {
        Ops::from_bits(self.interest.load(Ordering::SeqCst))
    }

    #[cfg(test)]
    pub(crate) fn set_interest_raw(&self, ops: Ops) {
        self.interest.store(ops.bits(), Ordering::SeqCst);
    }

    /// Ready set as of the last select cycle that touched this key.
    pub fn ready_ops(&self) -> Ops {
        Ops::from_bits(self.ready.load(Ordering::SeqCst))
    }

    pub(crate) fn set_ready(&self, ops: Ops) {
        self.ready.store(ops.bits(), Ordering::SeqCst);
    }

    /// Attach an arbitrary object to this key, returning the previous
    /// attachment.
    pub fn attach(
        &self,
        attachment: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        let mut slot = self.attachment.lock().unwrap();
        std::mem::replace(&mut *slot, attachment)
    }

    pub fn attachment(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.attachment.lock().unwrap().clone()
    }

    /// Invalidate this key and hand it to the selector's cancelled set. The
    /// registration is torn down at the start of the next select cycle.
    pub fn cancel(self: &Arc<Self>) {
        if self.valid.swap(false, Ordering::SeqCst) {
            if let Some(selector) = self.selector.upgrade() {
                selector.enqueue_cancelled(self);
            }
        }
    }
}

impl fmt::Debug for SelectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionKey")
            .field("fd", &self.fd)
            .field("interest", &self.interest())
            .field("ready", &self.ready_ops())
            .field("valid", &self.is_valid())
            .finish()
    }
}

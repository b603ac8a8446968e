//! Handle for the eventual result of an outgoing call.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::error::Error;
use crate::event_loop::WaitFor;
use crate::identity::Uid;
use crate::sharer::{Inner, Sharer};
use crate::value::Value;

/// Invoked once when a call resolves, successfully or not.
pub type ReplyCallback = Box<dyn FnOnce(&Result<Value, Error>)>;

/// Result of an asynchronous call. Clones share state; resolved exactly once by the
/// event loop (return received, timeout or disconnection).
#[derive(Clone)]
pub struct AsyncReply {
    state: Rc<ReplyState>,
}

struct ReplyState {
    call_id: u64,
    client: Uid,
    result: RefCell<Option<Result<Value, Error>>>,
    callback: RefCell<Option<ReplyCallback>>,
    sharer: Weak<Inner>,
}

impl AsyncReply {
    pub(crate) fn new(call_id: u64, client: Uid, sharer: Weak<Inner>) -> Self {
        Self {
            state: Rc::new(ReplyState {
                call_id,
                client,
                result: RefCell::new(None),
                callback: RefCell::new(None),
                sharer,
            }),
        }
    }

    pub fn call_id(&self) -> u64 {
        self.state.call_id
    }

    /// Client the call was sent to.
    pub fn client(&self) -> Uid {
        self.state.client
    }

    /// Whether a result (value or error) is available.
    pub fn is_valid(&self) -> bool {
        self.state.result.borrow().is_some()
    }

    pub fn try_get(&self) -> Option<Result<Value, Error>> {
        self.state.result.borrow().clone()
    }

    /// Run the event loop until the reply resolves or `timeout` passes. The call
    /// stays pending after a timeout here; `get` may be retried.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<Value, Error> {
        if let Some(result) = self.try_get() {
            return result;
        }
        let sharer = Sharer::upgrade(&self.state.sharer).ok_or(Error::Shutdown)?;
        sharer.run_until(&[self], timeout).await;
        self.try_get().unwrap_or(Err(Error::Timeout))
    }

    /// Set the completion callback. Runs immediately if already resolved.
    pub fn on_resolve(&self, callback: impl FnOnce(&Result<Value, Error>) + 'static) {
        if let Some(result) = self.try_get() {
            callback(&result);
            return;
        }
        *self.state.callback.borrow_mut() = Some(Box::new(callback));
    }

    /// Store the result and run the callback. Returns false if already resolved.
    pub(crate) fn resolve(&self, result: Result<Value, Error>) -> bool {
        {
            let mut slot = self.state.result.borrow_mut();
            if slot.is_some() {
                return false;
            }
            *slot = Some(result.clone());
        }
        let callback = self.state.callback.borrow_mut().take();
        if let Some(callback) = callback {
            callback(&result);
        }
        true
    }
}

impl WaitFor for AsyncReply {
    fn is_satisfied(&self) -> bool {
        self.is_valid()
    }
}

impl fmt::Debug for AsyncReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncReply")
            .field("call_id", &self.state.call_id)
            .field("client", &self.state.client)
            .field("result", &*self.state.result.borrow())
            .finish()
    }
}

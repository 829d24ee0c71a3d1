//! Per-key exactly-once execution for concurrent callers.
//!
//! N callers asking for the same key share one underlying computation: the
//! first becomes the leader and runs the closure, the rest block until the
//! leader publishes its result and then clone it. Callers for different keys
//! proceed independently. Used to guarantee at most one certificate issuance
//! per hostname under burst SNI load.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

struct Call<V> {
    slot: Mutex<Option<std::result::Result<V, Arc<Error>>>>,
    done: Condvar,
}

impl<V> Call<V> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            done: Condvar::new(),
        }
    }
}

pub struct Group<V> {
    inflight: Mutex<HashMap<String, Arc<Call<V>>>>,
}

impl<V> Default for Group<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Group<V> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone> Group<V> {
    /// Run `f` for `key`, or wait for an in-flight call and share its result.
    pub fn run(&self, key: &str, f: impl FnOnce() -> Result<V>) -> Result<V> {
        let (call, leader) = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let call = Arc::new(Call::new());
                    inflight.insert(key.to_owned(), call.clone());
                    (call, true)
                }
            }
        };

        if !leader {
            let mut slot = call.slot.lock();
            while slot.is_none() {
                call.done.wait(&mut slot);
            }
            return match slot.clone() {
                Some(Ok(value)) => Ok(value),
                Some(Err(shared)) => Err(Error::Shared(shared)),
                None => unreachable!("woken before result was published"),
            };
        }

        let outcome = f().map_err(Arc::new);

        {
            let mut slot = call.slot.lock();
            *slot = Some(outcome.clone());
        }
        call.done.notify_all();
        self.inflight.lock().remove(key);

        outcome.map_err(Error::Shared)
    }
}

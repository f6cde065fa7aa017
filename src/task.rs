//! Named, serializable callbacks.
//!
//! Closures cannot be sent to another process. A [`Task`] is the callback
//! as data: a serializable value plus a registered name. The parent sends
//! the encoded value once per worker; the worker program looks the name up
//! in its [`TaskRegistry`] and decodes the value into the same type.

use crate::error::Result;
use crate::outcome::Halt;
use crate::worker::ipc::{FrameReader, FrameWriter};
use crate::worker::protocol::Handshake;
use crate::worker::worker_main;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;

/// A callback that can run in a worker process.
///
/// ```no_run
/// use parx::{Halt, Task};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct AddOffset {
///     offset: i64,
/// }
///
/// impl Task for AddOffset {
///     const NAME: &'static str = "example.add_offset";
///     type Item = i64;
///     type Output = i64;
///
///     fn call(&self, item: &i64, _index: usize) -> Result<i64, Halt<i64>> {
///         Ok(item + self.offset)
///     }
/// }
/// ```
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name the worker program registers this task under.
    const NAME: &'static str;
    type Item: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn call(
        &self,
        item: &Self::Item,
        index: usize,
    ) -> std::result::Result<Self::Output, Halt<Self::Output>>;
}

/// Serves one handshaken worker connection for a concrete task type.
pub(crate) type ServeFn = fn(&Handshake, &mut FrameReader, &mut FrameWriter) -> Result<()>;

/// The tasks a worker program is able to serve.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    tasks: BTreeMap<&'static str, ServeFn>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `K` under `K::NAME`. Registering a name twice keeps the
    /// latest registration.
    pub fn register<K: Task>(mut self) -> Self {
        self.tasks.insert(K::NAME, worker_main::serve::<K>);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tasks.keys().copied()
    }

    pub(crate) fn get(&self, name: &str) -> Option<ServeFn> {
        self.tasks.get(name).copied()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tasks.keys()).finish()
    }
}

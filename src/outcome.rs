//! Per-item outcomes and the errors that travel with them.
//!
//! A callback answers with `Result<R, Halt<R>>`. The engine folds that
//! into a [`ControlSignal`], which is plain data: it is what crosses the
//! pipe from a worker process, and what the dispatcher inspects to decide
//! whether to keep dispatching. Only at the caller-facing boundary does a
//! captured [`UserError`] turn back into an `Err`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Kind reported for panics caught inside a callback.
pub const PANIC_KIND: &str = "panic";

/// Kind reported when a value or error could not be encoded for the wire.
pub const UNDUMPABLE_KIND: &str = "parx::Undumpable";

/// An error raised by user code (a callback or a lifecycle hook).
///
/// In-process it keeps the original error object, so `downcast_ref` works.
/// Across a process boundary only the serialized parts survive: the type
/// name, the message, the backtrace text and, for errors built with
/// [`UserError::dumpable`], a bincode payload of the original value.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserError {
    kind: String,
    message: String,
    backtrace: Option<String>,
    payload: Option<Vec<u8>>,
    #[serde(skip)]
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl UserError {
    /// Wrap any error. Wrapping a `UserError` returns it unchanged.
    pub fn new<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        if let Some(user) = (&err as &dyn Any).downcast_ref::<UserError>() {
            return user.clone();
        }

        Self {
            kind: std::any::type_name::<E>().to_string(),
            message: err.to_string(),
            backtrace: captured_backtrace(&Backtrace::capture()),
            payload: None,
            source: Some(Arc::new(err)),
        }
    }

    /// Wrap an error that can be serialized, so that it can be recovered with
    /// its exact type on the other side of a process boundary.
    ///
    /// If encoding fails the error is kept as an ordinary (undumpable) one.
    pub fn dumpable<E>(err: E) -> Self
    where
        E: StdError + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let payload = bincode::serialize(&err).ok();
        let mut wrapped = Self::new(err);
        wrapped.payload = payload;
        wrapped
    }

    /// Build an error from a type name and a message alone.
    pub fn from_message(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            backtrace: None,
            payload: None,
            source: None,
        }
    }

    /// Convert a hook failure.
    pub(crate) fn from_anyhow(err: anyhow::Error) -> Self {
        let err = match err.downcast::<UserError>() {
            Ok(user) => return user,
            Err(err) => err,
        };
        let backtrace = captured_backtrace(err.backtrace());
        let message = format!("{err:#}");
        let source: Box<dyn StdError + Send + Sync> = err.into();
        Self {
            kind: "anyhow::Error".to_string(),
            message,
            backtrace,
            payload: None,
            source: Some(Arc::from(source)),
        }
    }

    /// Convert a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(msg) = payload.downcast_ref::<&str>() {
            (*msg).to_string()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else {
            "callback panicked".to_string()
        };
        Self {
            kind: PANIC_KIND.to_string(),
            message,
            backtrace: captured_backtrace(&Backtrace::capture()),
            payload: None,
            source: None,
        }
    }

    /// Type name of the original error.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Display message of the original error.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Backtrace text captured where the error was wrapped, if backtraces
    /// were enabled (`RUST_BACKTRACE=1`).
    pub fn backtrace(&self) -> Option<&str> {
        self.backtrace.as_deref()
    }

    /// True when only the type name and message survived, i.e. the error
    /// crossed a process boundary without a serialized payload.
    pub fn is_downgraded(&self) -> bool {
        self.source.is_none() && self.payload.is_none()
    }

    /// Borrow the original error; only possible in the process that raised it.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.source.as_deref()?.downcast_ref::<E>()
    }

    /// Recover the original error by value, either from the in-process
    /// original or from the serialized payload.
    pub fn downcast<E>(&self) -> Option<E>
    where
        E: StdError + Clone + DeserializeOwned + 'static,
    {
        if let Some(original) = self.downcast_ref::<E>() {
            return Some(original.clone());
        }
        if self.kind != std::any::type_name::<E>() {
            return None;
        }
        let payload = self.payload.as_deref()?;
        bincode::deserialize(payload).ok()
    }
}

fn captured_backtrace(backtrace: &Backtrace) -> Option<String> {
    (backtrace.status() == BacktraceStatus::Captured).then(|| backtrace.to_string())
}

impl fmt::Debug for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserError")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("dumpable", &self.payload.is_some())
            .field("downgraded", &self.is_downgraded())
            .finish()
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl StdError for UserError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_deref()?.source()
    }
}

/// How a callback stops short of returning a value.
#[derive(Debug)]
pub enum Halt<R> {
    /// Stop dispatching new items; in-flight items finish. Optionally carries
    /// the value the whole run should return.
    Break(Option<R>),
    /// Stop dispatching and terminate every other worker.
    Kill,
    /// The callback failed.
    Error(UserError),
}

impl<R> Halt<R> {
    /// A plain break.
    pub fn stop() -> Self {
        Self::Break(None)
    }

    /// A break that makes the run return `value`.
    pub fn stop_with(value: R) -> Self {
        Self::Break(Some(value))
    }
}

impl<R, E> From<E> for Halt<R>
where
    E: StdError + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self::Error(UserError::new(err))
    }
}

/// Tagged outcome of executing one item.
#[derive(Debug, Serialize, Deserialize)]
pub enum ControlSignal<R> {
    Value(R),
    UserError(UserError),
    Break(Option<R>),
    Kill,
}

impl<R> From<Result<R, Halt<R>>> for ControlSignal<R> {
    fn from(result: Result<R, Halt<R>>) -> Self {
        match result {
            Ok(value) => Self::Value(value),
            Err(Halt::Break(value)) => Self::Break(value),
            Err(Halt::Kill) => Self::Kill,
            Err(Halt::Error(err)) => Self::UserError(err),
        }
    }
}

/// Run a callback, turning a panic into a `UserError`.
pub(crate) fn guarded<R>(call: impl FnOnce() -> Result<R, Halt<R>>) -> ControlSignal<R> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result.into(),
        Err(payload) => ControlSignal::UserError(UserError::from_panic(payload)),
    }
}

/// What a whole run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<R> {
    /// Every item ran; results are in input order (empty when results were
    /// not preserved).
    Completed(Vec<R>),
    /// A callback raised `Break`.
    Broken(Option<R>),
    /// A callback raised `Kill`.
    Killed,
}

impl<R> Outcome<R> {
    /// The ordered results, or `None` when the run stopped early.
    pub fn results(self) -> Option<Vec<R>> {
        match self {
            Self::Completed(results) => Some(results),
            Self::Broken(_) | Self::Killed => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

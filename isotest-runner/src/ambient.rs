// Copyright (c) The isotest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Process-wide and thread-default ambient settings, and the guard that saves and restores them
//! around each test case.
//!
//! Test code (and session hooks) may freely change the current culture or install a
//! synchronization context. [`AmbientGuard`] makes sure none of those changes outlive the case
//! that made them: it captures the current settings, installs a fixed neutral baseline, and puts
//! the captured settings back when dropped, including during a panic unwind.

use std::{
    cell::RefCell,
    fmt,
    marker::PhantomData,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::debug;

/// A culture (locale) name such as `fr-FR`.
///
/// The invariant culture has an empty name.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Culture(String);

impl Culture {
    /// Creates a culture with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the invariant culture.
    pub fn invariant() -> Self {
        Self(String::new())
    }

    /// The culture's name. Empty for the invariant culture.
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Returns true if this is the invariant culture.
    pub fn is_invariant(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Culture {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_invariant() {
            f.write_str("(invariant)")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// A dispatch context that work can be posted to, such as a UI event loop.
///
/// At most one is current per thread. The isolation guard always runs test cases with no
/// synchronization context installed.
pub trait SyncContext: fmt::Debug + Send + Sync {
    /// Queues `work` to run on this context.
    fn post(&self, work: Box<dyn FnOnce() + Send>);
}

static DEFAULT_THREAD_CULTURE: RwLock<Option<Culture>> = RwLock::new(None);
static DEFAULT_THREAD_UI_CULTURE: RwLock<Option<Culture>> = RwLock::new(None);

thread_local! {
    static CURRENT_CULTURE: RefCell<Option<Culture>> = const { RefCell::new(None) };
    static CURRENT_UI_CULTURE: RefCell<Option<Culture>> = const { RefCell::new(None) };
    static SYNC_CONTEXT: RefCell<Option<Arc<dyn SyncContext>>> = const { RefCell::new(None) };
}

fn read_global(slot: &RwLock<Option<Culture>>) -> Option<Culture> {
    slot.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn write_global(slot: &RwLock<Option<Culture>>, value: Option<Culture>) {
    *slot.write().unwrap_or_else(PoisonError::into_inner) = value;
}

/// Returns the culture of the current thread.
///
/// Falls back to the default thread culture, then to the invariant culture.
pub fn current_culture() -> Culture {
    CURRENT_CULTURE
        .with_borrow(|c| c.clone())
        .or_else(default_thread_culture)
        .unwrap_or_default()
}

/// Sets the culture of the current thread.
pub fn set_current_culture(culture: Culture) {
    CURRENT_CULTURE.set(Some(culture));
}

/// Returns the UI culture of the current thread.
///
/// Falls back to the default thread UI culture, then to the invariant culture.
pub fn current_ui_culture() -> Culture {
    CURRENT_UI_CULTURE
        .with_borrow(|c| c.clone())
        .or_else(default_thread_ui_culture)
        .unwrap_or_default()
}

/// Sets the UI culture of the current thread.
pub fn set_current_ui_culture(culture: Culture) {
    CURRENT_UI_CULTURE.set(Some(culture));
}

/// Returns the process-wide culture new threads start with, if one was set.
pub fn default_thread_culture() -> Option<Culture> {
    read_global(&DEFAULT_THREAD_CULTURE)
}

/// Sets the process-wide culture new threads start with.
pub fn set_default_thread_culture(culture: Option<Culture>) {
    write_global(&DEFAULT_THREAD_CULTURE, culture);
}

/// Returns the process-wide UI culture new threads start with, if one was set.
pub fn default_thread_ui_culture() -> Option<Culture> {
    read_global(&DEFAULT_THREAD_UI_CULTURE)
}

/// Sets the process-wide UI culture new threads start with.
pub fn set_default_thread_ui_culture(culture: Option<Culture>) {
    write_global(&DEFAULT_THREAD_UI_CULTURE, culture);
}

/// Returns the synchronization context installed on the current thread.
pub fn current_sync_context() -> Option<Arc<dyn SyncContext>> {
    SYNC_CONTEXT.with_borrow(|c| c.clone())
}

/// Installs (or with `None`, removes) the synchronization context of the current thread.
pub fn set_sync_context(context: Option<Arc<dyn SyncContext>>) {
    SYNC_CONTEXT.set(context);
}

/// The fixed baseline every test case starts from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NeutralSettings {
    /// The culture installed for the current thread and as the default thread culture.
    pub culture: Culture,

    /// The locale applied to `LC_ALL` and `LANG` in isolated worker processes.
    pub locale: String,
}

impl NeutralSettings {
    /// Neutral settings with the invariant culture and the given worker locale.
    pub fn with_locale(locale: impl Into<String>) -> Self {
        Self {
            culture: Culture::invariant(),
            locale: locale.into(),
        }
    }
}

impl Default for NeutralSettings {
    fn default() -> Self {
        Self::with_locale("C")
    }
}

/// A point-in-time copy of the ambient settings.
#[derive(Clone, Debug)]
pub struct AmbientSnapshot {
    current_culture: Option<Culture>,
    current_ui_culture: Option<Culture>,
    default_thread_culture: Option<Culture>,
    default_thread_ui_culture: Option<Culture>,
    sync_context: Option<Arc<dyn SyncContext>>,
}

impl AmbientSnapshot {
    /// Captures the ambient settings of the current thread and process.
    pub fn capture() -> Self {
        Self {
            current_culture: CURRENT_CULTURE.with_borrow(|c| c.clone()),
            current_ui_culture: CURRENT_UI_CULTURE.with_borrow(|c| c.clone()),
            default_thread_culture: default_thread_culture(),
            default_thread_ui_culture: default_thread_ui_culture(),
            sync_context: current_sync_context(),
        }
    }

    /// Installs the neutral baseline on the current thread and process.
    pub fn apply(neutral: &NeutralSettings) {
        set_sync_context(None);
        set_current_culture(neutral.culture.clone());
        set_current_ui_culture(neutral.culture.clone());
        set_default_thread_culture(Some(neutral.culture.clone()));
        set_default_thread_ui_culture(Some(neutral.culture.clone()));
    }

    /// Puts the captured settings back.
    pub fn restore(self) {
        CURRENT_CULTURE.set(self.current_culture);
        CURRENT_UI_CULTURE.set(self.current_ui_culture);
        set_default_thread_culture(self.default_thread_culture);
        set_default_thread_ui_culture(self.default_thread_ui_culture);
        set_sync_context(self.sync_context);
    }
}

/// Scoped ambient isolation: captures on creation, applies the neutral baseline, restores on drop.
///
/// The guard is tied to the thread that created it, since most of the state it restores is
/// thread-local.
#[derive(Debug)]
#[must_use = "ambient settings are restored when the guard is dropped"]
pub struct AmbientGuard {
    snapshot: Option<AmbientSnapshot>,
    _not_send: PhantomData<*const ()>,
}

impl AmbientGuard {
    /// Captures the current settings and installs `neutral`.
    pub fn enter(neutral: &NeutralSettings) -> Self {
        let snapshot = AmbientSnapshot::capture();
        AmbientSnapshot::apply(neutral);
        Self {
            snapshot: Some(snapshot),
            _not_send: PhantomData,
        }
    }
}

impl Drop for AmbientGuard {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            snapshot.restore();
            debug!(
                culture = %current_culture(),
                panicking = std::thread::panicking(),
                "restored ambient settings"
            );
        }
    }
}

/// Serializes tests that touch the process-wide default thread cultures.
#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

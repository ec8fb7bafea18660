//! SourceManager: lifecycle tracking for opened Source state.
//!
//! Every Source opened through a manager gets a descriptor. Descriptors form
//! a forest in which a Source's children are the Sources whose opening
//! depended on it: when a derived Source opens its parent's Source while it
//! is itself being opened, the derived descriptor is moved underneath the
//! one it needed. Closing a descriptor closes its children first, so
//! teardown always runs from the most derived state back to the backend.

use super::source::{SourceKey, SourceRef};
use crate::backoff::BackoffParams;
use crate::error::{EngineError, Result};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// The value a Source hands back from `open`.
pub type CookieValue = Arc<dyn Any + Send + Sync>;

/// A piece of opened state with no process-local identity, such as the
/// path of a mount point. Only these survive [`SourceManager::share`].
#[derive(Clone)]
pub struct ShareableCookie(CookieValue);

impl ShareableCookie {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }
}

/// Opened state as seen by the manager.
#[derive(Clone)]
pub enum Cookie {
    Local(CookieValue),
    Shareable(ShareableCookie),
}

impl Cookie {
    pub fn local<T: Any + Send + Sync>(value: T) -> Self {
        Cookie::Local(Arc::new(value))
    }

    pub fn shareable<T: Any + Send + Sync>(value: T) -> Self {
        Cookie::Shareable(ShareableCookie::new(value))
    }

    /// Cookie for Sources that need no state at all.
    pub fn empty() -> Self {
        Cookie::shareable(())
    }

    pub fn is_shareable(&self) -> bool {
        matches!(self, Cookie::Shareable(_))
    }

    fn value(&self) -> CookieValue {
        match self {
            Cookie::Local(value) => Arc::clone(value),
            Cookie::Shareable(ShareableCookie(value)) => Arc::clone(value),
        }
    }
}

/// Opened state of one Source: a cookie for callers and the means to
/// release it.
pub trait SourceState: Send {
    fn cookie(&self) -> Cookie;

    /// Releases backend state. Errors are logged by the manager and do not
    /// stop sibling Sources from closing.
    fn close(self: Box<Self>) -> Result<()>;
}

type Closer = Box<dyn FnOnce() -> Result<()> + Send>;

/// General-purpose [`SourceState`]: a cookie, an optional close action, and
/// any number of guards (temporary directories, child processes) that are
/// dropped after the close action has run.
pub struct OpenState {
    cookie: Cookie,
    closer: Option<Closer>,
    guards: Vec<Box<dyn Any + Send>>,
}

impl OpenState {
    pub fn new(cookie: Cookie) -> Self {
        Self {
            cookie,
            closer: None,
            guards: Vec::new(),
        }
    }

    /// Keep `guard` alive until the Source is closed.
    pub fn with_guard<G: Any + Send>(mut self, guard: G) -> Self {
        self.guards.push(Box::new(guard));
        self
    }

    /// Run `closer` when the Source is closed.
    pub fn on_close<F>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.closer = Some(Box::new(closer));
        self
    }

    pub fn boxed(self) -> Box<dyn SourceState> {
        Box::new(self)
    }
}

impl SourceState for OpenState {
    fn cookie(&self) -> Cookie {
        self.cookie.clone()
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        let result = match self.closer.take() {
            Some(closer) => closer(),
            None => Ok(()),
        };
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
        result
    }
}

/// Unopened → Open → Closed. Closed descriptors are removed outright, so
/// only the first two (plus borrowed shared state) are stored.
enum Lifecycle {
    Unopened,
    Open(Box<dyn SourceState>),
    /// State owned by another manager, visible here through `share()`.
    Borrowed(ShareableCookie),
}

struct Descriptor {
    source: SourceRef,
    parent: Option<SourceKey>,
    children: Vec<SourceKey>,
    lifecycle: Lifecycle,
}

impl Descriptor {
    fn new(source: SourceRef) -> Self {
        Self {
            source,
            parent: None,
            children: Vec::new(),
            lifecycle: Lifecycle::Unopened,
        }
    }

    fn cookie(&self) -> Option<Cookie> {
        match &self.lifecycle {
            Lifecycle::Unopened => None,
            Lifecycle::Open(state) => Some(state.cookie()),
            Lifecycle::Borrowed(cookie) => Some(Cookie::Shareable(cookie.clone())),
        }
    }
}

/// Tracks and tears down all state opened while exploring a set of Sources.
///
/// Not safe to use from several workers at once; hand a worker the result
/// of [`SourceManager::share`] and let it layer its own manager on top with
/// [`SourceManager::layered`].
pub struct SourceManager {
    descriptors: HashMap<SourceKey, Descriptor>,
    roots: Vec<SourceKey>,
    /// Sources whose `open` is currently running, innermost last.
    opening: Vec<SourceKey>,
    read_only: bool,
    underlay: Option<Box<SourceManager>>,
    /// Retry policy handed to backends that retry busy servers.
    backoff: BackoffParams,
}

impl Default for SourceManager {
    fn default() -> Self {
        Self::with_options(false, None)
    }
}

impl SourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A writable manager that consults `shared` before opening anything.
    pub fn layered(shared: SourceManager) -> Self {
        let backoff = shared.backoff.clone();
        Self::with_options(false, Some(Box::new(shared))).with_backoff(backoff)
    }

    pub fn with_backoff(mut self, backoff: BackoffParams) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn backoff(&self) -> &BackoffParams {
        &self.backoff
    }

    fn with_options(read_only: bool, underlay: Option<Box<SourceManager>>) -> Self {
        Self {
            descriptors: HashMap::new(),
            roots: Vec::new(),
            opening: Vec::new(),
            read_only,
            underlay,
            backoff: BackoffParams::default(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Number of Sources currently tracked.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Opens `source` (once) and returns its cookie.
    ///
    /// A Source opened while another Source's `open` is running becomes
    /// that other Source's parent, whether or not it was already open.
    pub fn open(&mut self, source: &SourceRef) -> Result<CookieValue> {
        let key = source.key();
        let created = self.register(&key, source);

        if let Some(cookie) = self.descriptors.get(&key).and_then(Descriptor::cookie) {
            return Ok(cookie.value());
        }

        if let Some(cookie) = self.underlay.as_ref().and_then(|under| under.lookup(&key)) {
            if let Some(desc) = self.descriptors.get_mut(&key) {
                desc.lifecycle = Lifecycle::Borrowed(cookie.clone());
            }
            return Ok(Cookie::Shareable(cookie).value());
        }

        if self.opening.contains(&key) {
            return Err(EngineError::unavailable(source.as_ref(), "source depends on itself"));
        }

        if self.read_only {
            if created {
                self.discard(&key);
            }
            return Err(EngineError::ReadOnlyManager(source.to_string()));
        }

        debug!(source = %source, "Opening source");
        self.opening.push(key.clone());
        let result = source.open(self);
        self.opening.pop();

        match result {
            Ok(state) => {
                let cookie = state.cookie();
                match self.descriptors.get_mut(&key) {
                    Some(desc) => desc.lifecycle = Lifecycle::Open(state),
                    // Closed from inside its own open; nothing will own it.
                    None => close_state(source, state),
                }
                Ok(cookie.value())
            }
            Err(err) => {
                self.discard(&key);
                Err(err)
            }
        }
    }

    /// Opens `source` and downcasts its cookie.
    pub fn open_as<T: Any + Send + Sync>(&mut self, source: &SourceRef) -> Result<Arc<T>> {
        self.open(source)?.downcast::<T>().map_err(|_| {
            EngineError::unavailable(source.as_ref(), "opened state has an unexpected type")
        })
    }

    /// Closes `source` and, before it, everything that depends on it.
    pub fn close(&mut self, source: &SourceRef) {
        self.close_key(&source.key());
    }

    /// Closes every tracked Source.
    pub fn clear(&mut self) {
        while let Some(root) = self.roots.last().cloned() {
            self.close_key(&root);
        }
    }

    /// A read-only manager holding only the shareable branches of this one.
    ///
    /// State stays owned by `self`; the returned manager must not outlive
    /// its usefulness past `self` being closed.
    pub fn share(&self) -> SourceManager {
        let mut shared = SourceManager::with_options(true, None).with_backoff(self.backoff.clone());
        for root in &self.roots {
            self.copy_shareable(root, None, &mut shared);
        }
        shared
    }

    /// Keys of the tracked Sources in the order a full `clear()` would
    /// close them.
    pub fn teardown_order(&self) -> Vec<SourceKey> {
        let mut order = Vec::new();
        for root in self.roots.iter().rev() {
            self.collect_teardown(root, &mut order);
        }
        order
    }

    fn collect_teardown(&self, key: &SourceKey, order: &mut Vec<SourceKey>) {
        if let Some(desc) = self.descriptors.get(key) {
            for child in desc.children.iter().rev() {
                self.collect_teardown(child, order);
            }
            order.push(key.clone());
        }
    }

    fn lookup(&self, key: &SourceKey) -> Option<ShareableCookie> {
        let own = self.descriptors.get(key).and_then(|desc| match desc.cookie() {
            Some(Cookie::Shareable(cookie)) => Some(cookie),
            _ => None,
        });
        own.or_else(|| self.underlay.as_ref().and_then(|under| under.lookup(key)))
    }

    fn copy_shareable(&self, key: &SourceKey, parent: Option<&SourceKey>, into: &mut SourceManager) {
        let Some(desc) = self.descriptors.get(key) else {
            return;
        };
        let Some(Cookie::Shareable(cookie)) = desc.cookie() else {
            return;
        };
        into.descriptors.insert(
            key.clone(),
            Descriptor {
                source: Arc::clone(&desc.source),
                parent: parent.cloned(),
                children: Vec::new(),
                lifecycle: Lifecycle::Borrowed(cookie),
            },
        );
        match parent.and_then(|p| into.descriptors.get_mut(p)) {
            Some(parent_desc) => parent_desc.children.push(key.clone()),
            None => into.roots.push(key.clone()),
        }
        for child in &desc.children {
            self.copy_shareable(child, Some(key), into);
        }
    }

    /// Ensures a descriptor exists for `key` and records that the Source
    /// currently being opened (if any) depends on it. Returns whether the
    /// descriptor was created.
    fn register(&mut self, key: &SourceKey, source: &SourceRef) -> bool {
        let created = !self.descriptors.contains_key(key);
        if created {
            self.descriptors.insert(key.clone(), Descriptor::new(Arc::clone(source)));
            self.roots.push(key.clone());
        }
        if let Some(dependant) = self.opening.last().cloned() {
            if &dependant != key && !self.is_ancestor(&dependant, key) {
                self.reparent(&dependant, key);
            }
        }
        created
    }

    /// Whether `candidate` is `key` or one of its ancestors.
    fn is_ancestor(&self, candidate: &SourceKey, key: &SourceKey) -> bool {
        let mut cursor = Some(key.clone());
        while let Some(current) = cursor {
            if &current == candidate {
                return true;
            }
            cursor = self.descriptors.get(&current).and_then(|d| d.parent.clone());
        }
        false
    }

    fn reparent(&mut self, child: &SourceKey, new_parent: &SourceKey) {
        self.detach(child);
        if let Some(desc) = self.descriptors.get_mut(child) {
            desc.parent = Some(new_parent.clone());
        }
        if let Some(parent) = self.descriptors.get_mut(new_parent) {
            parent.children.push(child.clone());
        }
    }

    /// Removes `key` from its parent's children (or from the roots).
    fn detach(&mut self, key: &SourceKey) {
        let parent = self.descriptors.get(key).and_then(|d| d.parent.clone());
        match parent.and_then(|p| self.descriptors.get_mut(&p)) {
            Some(parent_desc) => parent_desc.children.retain(|c| c != key),
            None => self.roots.retain(|r| r != key),
        }
    }

    /// Drops a descriptor that never opened, handing its children to its
    /// parent.
    fn discard(&mut self, key: &SourceKey) {
        self.detach(key);
        let Some(desc) = self.descriptors.remove(key) else {
            return;
        };
        for child in desc.children {
            if let Some(child_desc) = self.descriptors.get_mut(&child) {
                child_desc.parent = desc.parent.clone();
            }
            match desc.parent.as_ref().and_then(|p| self.descriptors.get_mut(p)) {
                Some(parent_desc) => parent_desc.children.push(child),
                None => self.roots.push(child),
            }
        }
    }

    fn close_key(&mut self, key: &SourceKey) {
        let Some(children) = self.descriptors.get(key).map(|d| d.children.clone()) else {
            return;
        };
        for child in children.iter().rev() {
            self.close_key(child);
        }
        self.detach(key);
        if let Some(desc) = self.descriptors.remove(key) {
            if let Lifecycle::Open(state) = desc.lifecycle {
                close_state(&desc.source, state);
            }
        }
    }
}

fn close_state(source: &SourceRef, state: Box<dyn SourceState>) {
    debug!(source = %source, "Closing source");
    if let Err(err) = state.close() {
        warn!(source = %source, error = %err, "Error while closing source; continuing");
    }
}

impl Drop for SourceManager {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for SourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceManager")
            .field("sources", &self.descriptors.len())
            .field("read_only", &self.read_only)
            .field("layered", &self.underlay.is_some())
            .finish()
    }
}

//! # Sandbox
//!
//! A thread-private working copy of a monitored entity, published back with
//! optimistic compare-and-set.
//!
//! ```rust
//! use kestrel_sync::{Monitor, Sandbox};
//! use std::sync::Arc;
//!
//! let config = Monitor::new(Arc::new(vec![1, 2, 3]));
//!
//! let mut sandbox = Sandbox::from_monitor(&config)?;
//! sandbox.get_mut()?.push(4); // no lock held
//!
//! assert!(sandbox.cas_by_reference(&config)?);
//! assert_eq!(config.read(|v| v.len()), 4);
//! # Ok::<(), kestrel_sync::SyncError>(())
//! ```
//!
//! The monitor holds an `Arc<E>`; that `Arc` is the identity compared by
//! [`Sandbox::cas_by_reference`]. The sandbox remembers it only weakly, so a
//! superseded entity is freed as soon as the monitor lets go of it.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use crate::error::{BoxError, SyncError, SyncResult};
use crate::sync::lock::MonitorLock;
use crate::sync::monitor::Monitor;

/// Produces an independent copy of an entity.
pub type Duplicator<E> = fn(&E) -> Result<E, BoxError>;

/// Private copy of an entity plus publication back to its [`Monitor`].
///
/// One sandbox per thread: methods take `&mut self`, and nothing here locks
/// except the calls that touch a monitor.
pub struct Sandbox<E> {
    local: Option<Arc<E>>,
    last_seen: Option<Weak<E>>,
    duplicate: Duplicator<E>,
}

fn clone_entity<E: Clone>(entity: &E) -> Result<E, BoxError> {
    Ok(entity.clone())
}

impl<E: Clone> Sandbox<E> {
    /// Empty sandbox duplicating through `Clone`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_duplicator(clone_entity::<E>)
    }

    /// Sandbox holding `entity` as is.
    #[must_use]
    pub fn with_entity(entity: E) -> Self {
        Self::new().entity(entity)
    }

    /// Sandbox holding a copy of the monitor's current entity.
    ///
    /// # Errors
    ///
    /// As for [`pull`](Self::pull).
    pub fn from_monitor<L: MonitorLock>(monitor: &Monitor<Arc<E>, L>) -> SyncResult<Self> {
        let mut sandbox = Self::new();
        sandbox.pull(monitor)?;
        Ok(sandbox)
    }
}

impl<E: Clone> Default for Sandbox<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Sandbox<E> {
    /// Empty sandbox for entities that are not `Clone`, or whose copies need
    /// more than a clone.
    #[must_use]
    pub fn with_duplicator(duplicate: Duplicator<E>) -> Self {
        Self {
            local: None,
            last_seen: None,
            duplicate,
        }
    }

    /// Builder form of [`set`](Self::set).
    #[must_use]
    pub fn entity(mut self, entity: E) -> Self {
        self.set(entity);
        self
    }

    /// The local entity, if any.
    #[must_use]
    pub fn get(&self) -> Option<&E> {
        self.local.as_deref()
    }

    /// Mutable access to the local entity.
    ///
    /// If the local entity is shared (it was pushed, or the sandbox was
    /// cloned), it is duplicated first so published entities are never
    /// mutated outside their monitor's lock.
    ///
    /// # Errors
    ///
    /// [`SyncError::EmptySandbox`] if there is no local entity;
    /// [`SyncError::Duplication`] if the copy fails.
    pub fn get_mut(&mut self) -> SyncResult<&mut E> {
        let duplicate = self.duplicate;
        let local = self.local.as_mut().ok_or(SyncError::EmptySandbox)?;
        if Arc::get_mut(local).is_none() {
            *local = Arc::new(duplicate_entity(duplicate, local)?);
        }
        Ok(Arc::get_mut(local).expect("freshly duplicated entity is uniquely owned"))
    }

    /// Replaces the local entity. Never duplicates, and leaves the last-seen
    /// reference alone so a later compare-and-set still checks against the
    /// last pull.
    pub fn set(&mut self, entity: E) {
        self.local = Some(Arc::new(entity));
    }

    /// Copies the monitor's current entity into the sandbox and remembers
    /// which entity was observed.
    ///
    /// The copy is taken under the monitor's shared lock.
    ///
    /// # Errors
    ///
    /// [`SyncError::Duplication`] if the copy fails; the sandbox is unchanged.
    pub fn pull<L: MonitorLock>(&mut self, monitor: &Monitor<Arc<E>, L>) -> SyncResult<&E> {
        let duplicate = self.duplicate;
        let (copy, seen) = monitor.read(|observed| {
            (duplicate_entity(duplicate, observed), Arc::downgrade(observed))
        });
        let copy = copy?;

        self.last_seen = Some(seen);
        Ok(&**self.local.insert(Arc::new(copy)))
    }

    /// Publishes the local entity unconditionally.
    ///
    /// # Errors
    ///
    /// [`SyncError::EmptySandbox`] if there is no local entity.
    pub fn push<L: MonitorLock>(&mut self, monitor: &Monitor<Arc<E>, L>) -> SyncResult<()> {
        self.publish_if(monitor, |_| true).map(drop)
    }

    /// Publishes the local entity only if the monitor still holds the very
    /// entity last pulled or published by this sandbox.
    ///
    /// Returns `false`, leaving the monitor untouched, if anything replaced it
    /// in between, even with an equal value.
    ///
    /// # Errors
    ///
    /// [`SyncError::EmptySandbox`] if there is no local entity.
    pub fn cas_by_reference<L: MonitorLock>(
        &mut self,
        monitor: &Monitor<Arc<E>, L>,
    ) -> SyncResult<bool> {
        // Address comparison only; the allocation outlives its last strong
        // reference while the weak one exists, so it cannot be reused.
        let seen = self.last_seen.as_ref().map(Weak::as_ptr);
        self.publish_if(monitor, |current| {
            seen.is_some_and(|seen| std::ptr::eq(seen, Arc::as_ptr(current)))
        })
    }

    fn publish_if<L: MonitorLock>(
        &mut self,
        monitor: &Monitor<Arc<E>, L>,
        accept: impl FnOnce(&Arc<E>) -> bool,
    ) -> SyncResult<bool> {
        let local = self.local.as_ref().ok_or(SyncError::EmptySandbox)?;
        let published = monitor.write(|current| {
            if accept(current) {
                *current = Arc::clone(local);
                true
            } else {
                false
            }
        });

        if published {
            self.last_seen = Some(Arc::downgrade(local));
        } else {
            tracing::debug!(
                monitor = monitor.label(),
                "compare-and-set rejected, entity changed since last pull"
            );
        }
        Ok(published)
    }
}

impl<E: PartialEq> Sandbox<E> {
    /// Publishes the local entity only if the monitor's current entity equals
    /// the one last pulled or published by this sandbox.
    ///
    /// The comparison needs the last-seen entity itself. Once nothing else
    /// keeps it alive it is gone, and this returns `false`.
    ///
    /// # Errors
    ///
    /// [`SyncError::EmptySandbox`] if there is no local entity.
    pub fn cas_by_value<L: MonitorLock>(&mut self, monitor: &Monitor<Arc<E>, L>) -> SyncResult<bool> {
        let seen = self.last_seen.as_ref().and_then(Weak::upgrade);
        self.publish_if(monitor, |current| {
            seen.is_some_and(|seen| *seen == **current)
        })
    }
}

fn duplicate_entity<E>(duplicate: Duplicator<E>, entity: &E) -> SyncResult<E> {
    duplicate(entity).map_err(|source| SyncError::Duplication {
        type_name: std::any::type_name::<E>(),
        source,
    })
}

/// Shares the local entity copy-on-write and keeps the last-seen reference.
impl<E> Clone for Sandbox<E> {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            last_seen: self.last_seen.clone(),
            duplicate: self.duplicate,
        }
    }
}

impl<E: PartialEq> PartialEq for Sandbox<E> {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl<E: Eq> Eq for Sandbox<E> {}

impl<E: Hash> Hash for Sandbox<E> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        if let Some(entity) = self.get() {
            entity.hash(state);
        }
    }
}

impl<E: fmt::Display> fmt::Display for Sandbox<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(entity) => fmt::Display::fmt(entity, f),
            None => f.write_str("<empty>"),
        }
    }
}

impl<E: fmt::Debug> fmt::Debug for Sandbox<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(entity) => fmt::Debug::fmt(entity, f),
            None => f.write_str("<empty>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::hash_map::DefaultHasher;

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Label(String);

    impl Label {
        fn new(text: &str) -> Self {
            Self(text.to_string())
        }
    }

    impl fmt::Display for Label {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    thread_local! {
        static DUPLICATES: Cell<usize> = const { Cell::new(0) };
    }

    fn counted(entity: &Label) -> Result<Label, BoxError> {
        DUPLICATES.with(|n| n.set(n.get() + 1));
        Ok(entity.clone())
    }

    fn duplicates() -> usize {
        DUPLICATES.with(Cell::get)
    }

    fn refuse(_: &Label) -> Result<Label, BoxError> {
        Err("label is pinned".into())
    }

    fn monitor(text: &str) -> Monitor<Arc<Label>> {
        Monitor::new(Arc::new(Label::new(text)))
    }

    fn current(monitor: &Monitor<Arc<Label>>) -> Label {
        monitor.read(|entity| (**entity).clone())
    }

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_entity_is_kept_as_is() {
        let sandbox = Sandbox::with_duplicator(counted).entity(Label::new("string"));
        assert_eq!(sandbox.get(), Some(&Label::new("string")));
        assert_eq!(duplicates(), 0);
    }

    #[test]
    fn test_set_does_not_duplicate() {
        let mut sandbox = Sandbox::with_duplicator(counted);
        assert_eq!(sandbox.get(), None);

        sandbox.set(Label::new("string"));
        assert_eq!(sandbox.get(), Some(&Label::new("string")));
        assert_eq!(duplicates(), 0);
    }

    #[test]
    fn test_pull_returns_a_copy() {
        let monitor = monitor("string");
        let observed = monitor.read(Arc::clone);
        let mut sandbox = Sandbox::with_duplicator(counted);

        let pulled = sandbox.pull(&monitor).unwrap();

        assert_eq!(pulled, &*observed);
        assert!(!std::ptr::eq(pulled, Arc::as_ptr(&observed)));
        assert_eq!(duplicates(), 1);
        assert_eq!(sandbox.get(), Some(&*observed));
    }

    #[test]
    fn test_push_is_unconditional() {
        let monitor = monitor("original string");
        let mut pusher = Sandbox::new();

        pusher.pull(&monitor).unwrap();
        monitor.set(Arc::new(Label::new("other string")));
        pusher.set(Label::new("push string"));
        pusher.push(&monitor).unwrap();

        let checker = Sandbox::from_monitor(&monitor).unwrap();
        assert_eq!(checker.get(), Some(&Label::new("push string")));
    }

    #[test]
    fn test_cas_by_value() {
        let original = Arc::new(Label::new("original string"));
        let monitor = Monitor::new(Arc::clone(&original));
        let mut winner = Sandbox::new();
        let mut loser = Sandbox::new();

        winner.pull(&monitor).unwrap();
        winner.set(Label::new("successful push string"));
        loser.pull(&monitor).unwrap();
        loser.set(Label::new("unsuccessful push string"));

        // Equal value, different entity.
        monitor.set(Arc::new(Label::new("original string")));

        assert!(winner.cas_by_value(&monitor).unwrap());
        assert_eq!(current(&monitor), Label::new("successful push string"));

        assert!(!loser.cas_by_value(&monitor).unwrap());
        assert_eq!(current(&monitor), Label::new("successful push string"));
    }

    #[test]
    fn test_cas_by_reference() {
        let monitor = monitor("original string");
        let mut winner = Sandbox::new();
        let mut loser = Sandbox::new();

        winner.pull(&monitor).unwrap();
        winner.set(Label::new("successful push string"));
        loser.pull(&monitor).unwrap();
        loser.set(Label::new("unsuccessful push string"));

        assert!(winner.cas_by_reference(&monitor).unwrap());
        assert_eq!(current(&monitor), Label::new("successful push string"));

        monitor.set(Arc::new(Label::new("original string")));

        assert!(!loser.cas_by_reference(&monitor).unwrap());
        assert_eq!(current(&monitor), Label::new("original string"));
    }

    #[test]
    fn test_cas_by_reference_rejects_equal_replacement() {
        let monitor = monitor("x");
        let mut sandbox = Sandbox::from_monitor(&monitor).unwrap();
        monitor.set(Arc::new(Label::new("x")));

        sandbox.set(Label::new("mine"));
        assert!(!sandbox.cas_by_reference(&monitor).unwrap());
        assert_eq!(current(&monitor), Label::new("x"));
    }

    #[test]
    fn test_cas_succeeds_again_after_own_publication() {
        let monitor = monitor("v1");
        let mut sandbox = Sandbox::from_monitor(&monitor).unwrap();

        sandbox.set(Label::new("v2"));
        assert!(sandbox.cas_by_reference(&monitor).unwrap());

        sandbox.set(Label::new("v3"));
        assert!(sandbox.cas_by_reference(&monitor).unwrap());
        assert_eq!(current(&monitor), Label::new("v3"));
    }

    #[test]
    fn test_cas_by_value_fails_once_last_seen_is_freed() {
        let monitor = monitor("x");
        let mut sandbox = Sandbox::from_monitor(&monitor).unwrap();

        // Nothing else holds the pulled entity, so replacing it frees it.
        monitor.set(Arc::new(Label::new("x")));

        assert!(!sandbox.cas_by_value(&monitor).unwrap());
        assert_eq!(current(&monitor), Label::new("x"));
    }

    #[test]
    fn test_cas_without_pull_is_rejected() {
        let monitor = monitor("x");
        let mut sandbox = Sandbox::with_entity(Label::new("mine"));

        assert!(!sandbox.cas_by_reference(&monitor).unwrap());
        assert!(!sandbox.cas_by_value(&monitor).unwrap());
        assert_eq!(current(&monitor), Label::new("x"));
    }

    #[test]
    fn test_empty_sandbox_errors() {
        let monitor = monitor("x");
        let mut sandbox = Sandbox::<Label>::new();

        assert!(matches!(sandbox.push(&monitor), Err(SyncError::EmptySandbox)));
        assert!(matches!(sandbox.cas_by_reference(&monitor), Err(SyncError::EmptySandbox)));
        assert!(matches!(sandbox.get_mut(), Err(SyncError::EmptySandbox)));
    }

    #[test]
    fn test_duplication_failure_leaves_sandbox_unchanged() {
        let monitor = monitor("x");
        let mut sandbox = Sandbox::with_duplicator(refuse);

        match sandbox.pull(&monitor) {
            Err(SyncError::Duplication { type_name, source }) => {
                assert!(type_name.ends_with("Label"));
                assert_eq!(source.to_string(), "label is pinned");
            }
            other => panic!("expected duplication failure, got {other:?}"),
        }
        assert_eq!(sandbox.get(), None);
        assert!(!monitor.lock().is_write_locked());
        assert_eq!(monitor.lock().reader_count(), 0);
    }

    #[test]
    fn test_get_mut_after_pull_edits_in_place() {
        let monitor = monitor("draft");
        let mut sandbox = Sandbox::with_duplicator(counted);
        sandbox.pull(&monitor).unwrap();

        sandbox.get_mut().unwrap().0.push_str(" v2");

        assert_eq!(duplicates(), 1);
        assert_eq!(sandbox.get(), Some(&Label::new("draft v2")));
        assert_eq!(current(&monitor), Label::new("draft"));
    }

    #[test]
    fn test_get_mut_after_push_copies() {
        let monitor = monitor("x");
        let mut sandbox = Sandbox::with_duplicator(counted).entity(Label::new("published"));
        sandbox.push(&monitor).unwrap();

        sandbox.get_mut().unwrap().0.push_str(" locally");

        assert_eq!(duplicates(), 1);
        assert_eq!(current(&monitor), Label::new("published"));
        assert_eq!(sandbox.get(), Some(&Label::new("published locally")));
    }

    #[test]
    fn test_get_mut_reports_duplication_failure() {
        let monitor = monitor("x");
        let mut sandbox = Sandbox::with_duplicator(refuse).entity(Label::new("pinned"));
        sandbox.push(&monitor).unwrap();

        assert!(matches!(sandbox.get_mut(), Err(SyncError::Duplication { .. })));
        assert_eq!(sandbox.get(), Some(&Label::new("pinned")));
    }

    #[test]
    fn test_equality_follows_entity() {
        let one = Sandbox::from_monitor(&monitor("string")).unwrap();
        let mut two = Sandbox::from_monitor(&monitor("string one and a half")).unwrap();
        assert_ne!(one, two);

        two.set(Label::new("string"));
        assert_eq!(one, two);
    }

    #[test]
    fn test_hash_display_debug_follow_entity() {
        let label = Label::new("string");
        let sandbox = Sandbox::with_entity(label.clone());

        assert_eq!(hash_of(&sandbox), hash_of(&label));
        assert_eq!(sandbox.to_string(), "string");
        assert_eq!(format!("{sandbox:?}"), format!("{label:?}"));
        assert_eq!(Sandbox::<Label>::new().to_string(), "<empty>");
    }

    #[test]
    fn test_clone_is_equal_and_independent() {
        let monitor = monitor("string");
        let mut sandbox = Sandbox::from_monitor(&monitor).unwrap();
        let clone = sandbox.clone();
        assert_eq!(clone, sandbox);

        sandbox.get_mut().unwrap().0.push('!');
        assert_eq!(clone.get(), Some(&Label::new("string")));

        // The clone still remembers what its origin pulled.
        let mut clone = clone;
        clone.set(Label::new("from clone"));
        assert!(clone.cas_by_reference(&monitor).unwrap());
    }
}

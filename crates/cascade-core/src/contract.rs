#![forbid(unsafe_code)]

//! Source and target contracts.
//!
//! A [`Source`] is any value that can drive updates. A [`Target`] is a
//! default-constructible value held once per type by a broker, populated by
//! sources through its [`UpdateBy`] implementations.
//!
//! # Parent chain
//!
//! Rust has no subtype hierarchy, so a source that "is also" a more general
//! source exposes the embedded general value through [`Source::parent`].
//! Dispatch walks this chain upward: holders registered for every level see
//! the value of that level. The chain ends at the first level without a
//! parent.
//!
//! ```
//! use cascade_core::contract::{Source, SourceKind, lineage};
//!
//! struct Damage { amount: u32 }
//! impl Source for Damage {}
//!
//! struct Critical { base: Damage, multiplier: u32 }
//! impl Source for Critical {
//!     fn parent(&self) -> Option<&dyn Source> {
//!         Some(&self.base)
//!     }
//! }
//!
//! let hit = Critical { base: Damage { amount: 7 }, multiplier: 2 };
//! let kinds: Vec<SourceKind> = lineage(&hit).map(|level| level.source_kind()).collect();
//! assert_eq!(kinds, vec![SourceKind::of::<Critical>(), SourceKind::of::<Damage>()]);
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::coupling::{Couple, Coupling};
use crate::error::UpdateError;

// ─── SourceKind ──────────────────────────────────────────────────────────────

/// Runtime identity of a source type.
///
/// Equality and hashing use the [`TypeId`] only; the name is carried for
/// diagnostics.
#[derive(Clone, Copy)]
pub struct SourceKind {
    id: TypeId,
    name: &'static str,
}

impl SourceKind {
    /// Kind of the source type `S`.
    #[must_use]
    pub fn of<S: Any>() -> Self {
        Self {
            id: TypeId::of::<S>(),
            name: std::any::type_name::<S>(),
        }
    }

    /// Underlying type id.
    #[must_use]
    pub const fn id(self) -> TypeId {
        self.id
    }

    /// Fully-qualified type name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        self.name
    }
}

impl PartialEq for SourceKind {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SourceKind {}

impl Hash for SourceKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SourceKind").field(&self.name).finish()
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// ─── Source ──────────────────────────────────────────────────────────────────

/// Object-safe access to the concrete type behind a `dyn Source`.
///
/// Implemented for every `'static` type; never implement it by hand.
pub trait SourceAny: Any {
    /// The value as `&dyn Any`, for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Kind of the concrete type.
    fn source_kind(&self) -> SourceKind;
}

impl<T: Any> SourceAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::of::<T>()
    }
}

/// A value that can drive target updates.
pub trait Source: SourceAny {
    /// The embedded value of the next more general source type, if any.
    fn parent(&self) -> Option<&dyn Source> {
        None
    }
}

/// Iterate `source` and its parents, most specific first.
pub fn lineage<'a>(source: &'a dyn Source) -> impl Iterator<Item = &'a dyn Source> + 'a {
    std::iter::successors(Some(source), |level| level.parent())
}

/// Whether `kind` appears anywhere in the parent chain of `source`.
#[must_use]
pub fn descends_from(source: &dyn Source, kind: SourceKind) -> bool {
    lineage(source).any(|level| level.source_kind() == kind)
}

// ─── Target ──────────────────────────────────────────────────────────────────

/// A value held once per type by a broker.
///
/// `wire` is the explicit registration table: it runs once, when the holder
/// for `Self` is created, and lists every source the type accepts and every
/// capability it exposes to snapshot queries.
pub trait Target: Clone + Default + 'static {
    /// Declare accepted sources and exposed capabilities.
    fn wire(wiring: &mut Wiring<Self>);

    /// Source view of this target, for targets that drive further updates.
    ///
    /// Returning `Some` makes accepted changes cascade to holders interested
    /// in this target's own kind.
    fn as_source(&self) -> Option<&dyn Source> {
        None
    }
}

/// Update a target in place from a source of type `S`.
pub trait UpdateBy<S: Source>: Target {
    /// Apply `source` to `self`.
    ///
    /// Returns `Ok(true)` when observers should be notified. On `Err`, the
    /// holder restores the previous value and notifies nobody.
    fn update_by(&mut self, source: &S) -> Result<bool, UpdateError>;
}

// ─── Wiring ──────────────────────────────────────────────────────────────────

/// A source kind declared by a target, with the factory for its coupling.
pub struct Accepted<T: Target> {
    kind: SourceKind,
    make: fn() -> Rc<dyn Couple<T>>,
}

impl<T: Target> Accepted<T> {
    /// The accepted source kind.
    #[must_use]
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Build the coupling for this pair.
    #[must_use]
    pub fn make_coupling(&self) -> Rc<dyn Couple<T>> {
        (self.make)()
    }
}

impl<T: Target> fmt::Debug for Accepted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepted").field("kind", &self.kind).finish()
    }
}

/// Type-erased snapshot projection: pushes `Box<C>` into a `Vec<Box<C>>`
/// passed as `&mut dyn Any`.
pub type Projector<T> = Box<dyn Fn(&T, &mut dyn Any)>;

/// Declarative wiring table for one target type.
pub struct Wiring<T: Target> {
    accepted: Vec<Accepted<T>>,
    exposed: Vec<(TypeId, Projector<T>)>,
}

impl<T: Target> Wiring<T> {
    /// An empty table. The target's own concrete type is always exposed.
    #[must_use]
    pub fn new() -> Self {
        let mut wiring = Self {
            accepted: Vec::new(),
            exposed: Vec::new(),
        };
        wiring.exposes::<T>(|target| Box::new(target));
        wiring
    }

    /// Accept updates from sources of type `S`.
    ///
    /// Declaring the same source twice is a no-op.
    pub fn accepts<S: Source>(&mut self) -> &mut Self
    where
        T: UpdateBy<S>,
    {
        let kind = SourceKind::of::<S>();
        if !self.accepted.iter().any(|a| a.kind == kind) {
            self.accepted.push(Accepted {
                kind,
                make: Coupling::<S, T>::erased,
            });
        }
        self
    }

    /// Expose snapshots of this target as capability `C` to
    /// `Broker::query_all::<C>()`.
    pub fn exposes<C: ?Sized + 'static>(&mut self, project: fn(T) -> Box<C>) -> &mut Self {
        let id = TypeId::of::<C>();
        self.exposed.retain(|(existing, _)| *existing != id);
        let projector: Projector<T> = Box::new(move |target: &T, out: &mut dyn Any| {
            if let Some(out) = out.downcast_mut::<Vec<Box<C>>>() {
                out.push(project(target.clone()));
            }
        });
        self.exposed.push((id, projector));
        self
    }

    /// Declared source kinds, in declaration order.
    #[must_use]
    pub fn accepted(&self) -> &[Accepted<T>] {
        &self.accepted
    }

    /// Whether capability `C` is exposed.
    #[must_use]
    pub fn is_exposed<C: ?Sized + 'static>(&self) -> bool {
        let id = TypeId::of::<C>();
        self.exposed.iter().any(|(existing, _)| *existing == id)
    }

    /// Split into the accepted list and the projector table.
    #[must_use]
    pub fn into_parts(self) -> (Vec<Accepted<T>>, Vec<(TypeId, Projector<T>)>) {
        (self.accepted, self.exposed)
    }
}

impl<T: Target> Default for Wiring<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Target> fmt::Debug for Wiring<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wiring")
            .field("accepted", &self.accepted)
            .field("exposed", &self.exposed.len())
            .finish()
    }
}

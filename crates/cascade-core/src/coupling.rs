#![forbid(unsafe_code)]

//! Couplings: the wiring between one source type and one target type.
//!
//! A [`Coupling<S, T>`] is a zero-sized adapter that downcasts an erased
//! source to `S` and calls `<T as UpdateBy<S>>::update_by`. Holders store it
//! behind [`Couple<T>`] so that a target type needs no knowledge of every
//! possible source at compile time; the dispatch table only grows for pairs
//! that are actually wired.

use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::contract::{Source, SourceKind, Target, UpdateBy};
use crate::error::UpdateError;

/// Type-erased coupling into target `T`.
pub trait Couple<T: Target> {
    /// Source kind this coupling consumes.
    fn source_kind(&self) -> SourceKind;

    /// Apply an erased source to `target`.
    ///
    /// Returns whether the target reports a change.
    fn apply(&self, source: &dyn Source, target: &mut T) -> Result<bool, UpdateError>;
}

/// Stateless coupling of source `S` into target `T`.
pub struct Coupling<S, T> {
    _pair: PhantomData<fn(&S, &mut T)>,
}

impl<S, T> Coupling<S, T>
where
    S: Source,
    T: UpdateBy<S>,
{
    /// Create the coupling.
    #[must_use]
    pub const fn new() -> Self {
        Self { _pair: PhantomData }
    }

    /// Create the coupling behind a shared erased handle.
    #[must_use]
    pub fn erased() -> Rc<dyn Couple<T>> {
        Rc::new(Self::new())
    }

    /// Apply a statically-typed source.
    pub fn apply_typed(&self, source: &S, target: &mut T) -> Result<bool, UpdateError> {
        target.update_by(source)
    }
}

impl<S, T> Default for Coupling<S, T>
where
    S: Source,
    T: UpdateBy<S>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S, T> Couple<T> for Coupling<S, T>
where
    S: Source,
    T: UpdateBy<S>,
{
    fn source_kind(&self) -> SourceKind {
        SourceKind::of::<S>()
    }

    fn apply(&self, source: &dyn Source, target: &mut T) -> Result<bool, UpdateError> {
        match source.as_any().downcast_ref::<S>() {
            Some(source) => target.update_by(source),
            None => Err(UpdateError::SourceMismatch {
                expected: std::any::type_name::<S>(),
                found: source.source_kind().name(),
            }),
        }
    }
}

impl<S, T> fmt::Debug for Coupling<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coupling")
            .field("source", &std::any::type_name::<S>())
            .field("target", &std::any::type_name::<T>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::Wiring;

    struct Score {
        value: i64,
    }
    impl Source for Score {}

    struct Penalty;
    impl Source for Penalty {}

    #[derive(Clone, Default, Debug)]
    struct ScoreDisplay {
        text: String,
    }

    impl Target for ScoreDisplay {
        fn wire(wiring: &mut Wiring<Self>) {
            wiring.accepts::<Score>();
        }
    }

    impl UpdateBy<Score> for ScoreDisplay {
        fn update_by(&mut self, source: &Score) -> Result<bool, UpdateError> {
            if source.value < 0 {
                return Err(UpdateError::rejected("negative score"));
            }
            let text = source.value.to_string();
            let changed = text != self.text;
            self.text = text;
            Ok(changed)
        }
    }

    #[test]
    fn apply_updates_target_and_reports_change() {
        let coupling = Coupling::<Score, ScoreDisplay>::new();
        let mut display = ScoreDisplay::default();

        assert!(coupling.apply(&Score { value: 10 }, &mut display).unwrap());
        assert_eq!(display.text, "10");

        // Same value again: no change reported.
        assert!(!coupling.apply(&Score { value: 10 }, &mut display).unwrap());
    }

    #[test]
    fn apply_typed_matches_erased_apply() {
        let coupling = Coupling::<Score, ScoreDisplay>::new();
        let mut a = ScoreDisplay::default();
        let mut b = ScoreDisplay::default();
        let typed = coupling.apply_typed(&Score { value: 3 }, &mut a).unwrap();
        let erased = coupling.apply(&Score { value: 3 }, &mut b).unwrap();
        assert_eq!(typed, erased);
        assert_eq!(a.text, b.text);
    }

    #[test]
    fn apply_rejects_foreign_source() {
        let coupling = Coupling::<Score, ScoreDisplay>::erased();
        let mut display = ScoreDisplay::default();
        let err = coupling.apply(&Penalty, &mut display).unwrap_err();
        assert!(matches!(err, UpdateError::SourceMismatch { .. }));
        assert!(display.text.is_empty());
    }

    #[test]
    fn apply_propagates_update_errors() {
        let coupling = Coupling::<Score, ScoreDisplay>::new();
        let mut display = ScoreDisplay::default();
        let err = coupling.apply(&Score { value: -1 }, &mut display).unwrap_err();
        assert_eq!(err.to_string(), "update rejected: negative score");
    }

    #[test]
    fn erased_reports_source_kind() {
        let coupling = Coupling::<Score, ScoreDisplay>::erased();
        assert_eq!(coupling.source_kind(), SourceKind::of::<Score>());
        assert!(format!("{:?}", Coupling::<Score, ScoreDisplay>::new()).contains("Score"));
    }
}

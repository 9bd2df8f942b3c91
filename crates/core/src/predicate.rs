//! Named, composable filters over instances and provider nodes.

use std::{fmt, sync::Arc};

/// Filter over values of type `T`.
///
/// Implementors are named values rather than anonymous closures, so that the
/// filter can be logged and unit-tested on its own. Use [`Predicate::and`],
/// [`Predicate::or`] and [`Predicate::not`] to compose them.
pub trait Predicate<T: ?Sized>: fmt::Debug + Send + Sync {
    /// Returns `true` if the provided value satisfies this [`Predicate`].
    fn test(&self, value: &T) -> bool;

    fn and<P>(self, other: P) -> And<Self, P>
    where
        Self: Sized,
        P: Predicate<T>,
    {
        And(self, other)
    }

    fn or<P>(self, other: P) -> Or<Self, P>
    where
        Self: Sized,
        P: Predicate<T>,
    {
        Or(self, other)
    }

    fn not(self) -> Not<Self>
    where
        Self: Sized,
    {
        Not(self)
    }
}

/// Matches everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct Always;

impl<T: ?Sized> Predicate<T> for Always {
    fn test(&self, _: &T) -> bool {
        true
    }
}

/// Conjunction of two [`Predicate`]s.
#[derive(Clone, Copy, Debug)]
pub struct And<A, B>(pub A, pub B);

impl<T: ?Sized, A: Predicate<T>, B: Predicate<T>> Predicate<T> for And<A, B> {
    fn test(&self, value: &T) -> bool {
        self.0.test(value) && self.1.test(value)
    }
}

/// Disjunction of two [`Predicate`]s.
#[derive(Clone, Copy, Debug)]
pub struct Or<A, B>(pub A, pub B);

impl<T: ?Sized, A: Predicate<T>, B: Predicate<T>> Predicate<T> for Or<A, B> {
    fn test(&self, value: &T) -> bool {
        self.0.test(value) || self.1.test(value)
    }
}

/// Negation of a [`Predicate`].
#[derive(Clone, Copy, Debug)]
pub struct Not<P>(pub P);

impl<T: ?Sized, P: Predicate<T>> Predicate<T> for Not<P> {
    fn test(&self, value: &T) -> bool {
        !self.0.test(value)
    }
}

/// [`Predicate`] backed by a function, for ad hoc filters.
///
/// The name is what shows up in logs.
#[derive(Clone, Copy)]
pub struct FromFn<F> {
    name: &'static str,
    f: F,
}

/// Builds a [`Predicate`] out of a named function.
pub fn from_fn<T: ?Sized, F>(name: &'static str, f: F) -> FromFn<F>
where
    F: Fn(&T) -> bool + Send + Sync,
{
    FromFn { name, f }
}

impl<F> fmt::Debug for FromFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl<T: ?Sized, F> Predicate<T> for FromFn<F>
where
    F: Fn(&T) -> bool + Send + Sync,
{
    fn test(&self, value: &T) -> bool {
        (self.f)(value)
    }
}

impl<T: ?Sized, P: Predicate<T> + ?Sized> Predicate<T> for &P {
    fn test(&self, value: &T) -> bool {
        (**self).test(value)
    }
}

impl<T: ?Sized, P: Predicate<T> + ?Sized> Predicate<T> for Box<P> {
    fn test(&self, value: &T) -> bool {
        (**self).test(value)
    }
}

impl<T: ?Sized, P: Predicate<T> + ?Sized> Predicate<T> for Arc<P> {
    fn test(&self, value: &T) -> bool {
        (**self).test(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn even() -> impl Predicate<u32> {
        from_fn("even", |n: &u32| n % 2 == 0)
    }

    fn small() -> impl Predicate<u32> {
        from_fn("small", |n: &u32| *n < 10)
    }

    #[test]
    fn combinators() {
        assert!(even().and(small()).test(&4));
        assert!(!even().and(small()).test(&12));
        assert!(even().or(small()).test(&12));
        assert!(even().or(small()).test(&3));
        assert!(!even().or(small()).test(&13));
        assert!(even().not().test(&3));
        assert!(Predicate::<u32>::test(&Always, &7));
    }

    #[test]
    fn dyn_predicates_compose() {
        let boxed: Box<dyn Predicate<u32>> = Box::new(even());
        let combined = small().and(&*boxed);

        assert!(combined.test(&2));
        assert!(!combined.test(&3));
        assert_eq!(format!("{combined:?}"), "And(small, even)");
    }
}

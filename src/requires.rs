use crate::core::Dynamic;
use crate::definition::{AnyDefinition, Definition};

/// A trait that enables one or more [`Definition`]s to be used as the
/// dependency set of another definition.
///
/// This trait is implemented for a single [`Definition`], for `Vec`s of
/// definitions of one type, and for tuples of up to twelve definitions of
/// mixed types. It provides the logic the group needs to extract dependency
/// identity and to resolve type-erased outputs back into typed references
/// for the creation closure.
pub trait Requires<E: Send + Sync> {
    /// The resulting type when all dependencies are resolved.
    /// For a tuple of [`Definition`]s, this is a tuple of `&'a T`s.
    type Output<'a>;

    /// Returns the type-erased definition for each dependency, in
    /// declaration order. Duplicates are allowed; they resolve to the same
    /// task and the same created value.
    fn definitions(&self) -> Vec<AnyDefinition<E>>;

    /// Takes a slice of type-erased dependency outputs and resolves them
    /// into a concrete `Output` type.
    ///
    /// # Panics
    /// This method will panic if the type-erased outputs cannot be downcast
    /// to their expected concrete types, indicating a severe logic error in
    /// graph construction.
    fn resolve<'a>(&self, outputs: &'a [Dynamic]) -> Self::Output<'a>;
}

impl<E: Send + Sync> Requires<E> for () {
    type Output<'a> = ();

    fn definitions(&self) -> Vec<AnyDefinition<E>> {
        vec![]
    }

    fn resolve<'a>(&self, _: &'a [Dynamic]) -> Self::Output<'a> {}
}

impl<T, E> Requires<E> for Definition<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync,
{
    type Output<'a> = &'a T;

    fn definitions(&self) -> Vec<AnyDefinition<E>> {
        vec![self.erased()]
    }

    fn resolve<'a>(&self, outputs: &'a [Dynamic]) -> Self::Output<'a> {
        self.resolve_ref(&outputs[0])
    }
}

impl<T, E> Requires<E> for Vec<Definition<T, E>>
where
    T: Send + Sync + 'static,
    E: Send + Sync,
{
    type Output<'a> = Vec<&'a T>;

    fn definitions(&self) -> Vec<AnyDefinition<E>> {
        self.iter().map(|d| d.erased()).collect()
    }

    fn resolve<'a>(&self, outputs: &'a [Dynamic]) -> Self::Output<'a> {
        self.iter()
            .zip(outputs)
            .map(|(definition, output)| definition.resolve_ref(output))
            .collect()
    }
}

macro_rules! impl_requires {
    ($($T:ident),*) => {
        #[allow(non_snake_case)]
        impl<Env, $($T),*> Requires<Env> for ($(Definition<$T, Env>,)*)
        where
            Env: Send + Sync,
            $($T: Send + Sync + 'static),*
        {
            type Output<'a> = ($(&'a $T,)*);

            fn definitions(&self) -> Vec<AnyDefinition<Env>> {
                let ($($T,)*) = self;
                vec![$($T.erased(),)*]
            }

            fn resolve<'a>(&self, outputs: &'a [Dynamic]) -> Self::Output<'a> {
                let ($($T,)*) = self;
                let mut iter = outputs.iter();

                ($({
                    let out = iter.next().expect("Missing dependency output");
                    $T.resolve_ref(out)
                },)*)
            }
        }
    };
}

impl_requires!(A);
impl_requires!(A, B);
impl_requires!(A, B, C);
impl_requires!(A, B, C, D);
impl_requires!(A, B, C, D, E);
impl_requires!(A, B, C, D, E, F);
impl_requires!(A, B, C, D, E, F, G);
impl_requires!(A, B, C, D, E, F, G, H);
impl_requires!(A, B, C, D, E, F, G, H, I);
impl_requires!(A, B, C, D, E, F, G, H, I, J);
impl_requires!(A, B, C, D, E, F, G, H, I, J, K);
impl_requires!(A, B, C, D, E, F, G, H, I, J, K, L);

#![allow(clippy::needless_doctest_main)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Entry-point macros for spindle.

mod entry;
mod parse;

/// Marks an async function as the root task of a structured scope.
///
/// The function takes the root [`Scope`] as its only argument and must return
/// `spindle::Result<T>`. The macro builds a dispatcher, runs the body with
/// `Dispatcher::run_blocking`, shuts the dispatcher down and returns the outcome
/// of the whole task tree.
///
/// If the provided functionality is not sufficient, use `runtime::Builder`
/// directly.
///
/// # Dispatcher flavors
///
/// ## Pooled (default)
///
/// ```no_run
/// #[spindle::main(flavor = "pooled", pool_size = 4)]
/// async fn main(scope: spindle::Scope) -> spindle::Result<()> {
///     Ok(())
/// }
/// ```
///
/// The `pool_size` option configures the number of worker threads, and
/// defaults to the number of cpus on the system.
///
/// ## Pinned
///
/// Every continuation runs on one dedicated thread, named after `name` (or the
/// function when `name` is not given).
///
/// ```no_run
/// #[spindle::main(flavor = "pinned", name = "ui")]
/// async fn main(scope: spindle::Scope) -> spindle::Result<()> {
///     Ok(())
/// }
/// ```
///
/// ## Unconfined
///
/// ```no_run
/// #[spindle::main(flavor = "unconfined")]
/// async fn main(scope: spindle::Scope) -> spindle::Result<()> {
///     Ok(())
/// }
/// ```
///
/// # Usage
///
/// ```no_run
/// use std::time::Duration;
///
/// #[spindle::main]
/// async fn main(scope: spindle::Scope) -> spindle::Result<()> {
///     let job = scope.launch(|scope| async move {
///         scope.delay(Duration::from_millis(100)).await?;
///         println!("world");
///         Ok(())
///     })?;
///
///     println!("hello");
///     job.join(&scope).await
/// }
/// ```
///
/// Equivalent code not using `#[spindle::main]`
///
/// ```no_run
/// use std::time::Duration;
///
/// fn main() -> spindle::Result<()> {
///     let dispatcher = spindle::runtime::Builder::new_pooled()
///         .try_build()
///         .expect("Failed building the Dispatcher");
///
///     let res = dispatcher.run_blocking(|scope| async move {
///         let job = scope.launch(|scope| async move {
///             scope.delay(Duration::from_millis(100)).await?;
///             println!("world");
///             Ok(())
///         })?;
///
///         println!("hello");
///         job.join(&scope).await
///     });
///
///     dispatcher.shutdown();
///     res
/// }
/// ```
///
/// [`Scope`]: ../spindle/struct.Scope.html
#[proc_macro_attribute]
pub fn main(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::main(args.into(), item.into()).into()
}

/// Marks an async function as a test whose body is the root task of a
/// structured scope.
///
/// Each test gets its own dispatcher, which is shut down when the test returns.
/// The attribute accepts the same options as [`macro@main`].
///
/// ```no_run
/// #[spindle::test(pool_size = 2)]
/// async fn my_test(scope: spindle::Scope) -> spindle::Result<()> {
///     let answer = scope.deferred(|_| async { Ok(42) })?;
///     assert_eq!(answer.await_on(&scope).await?, 42);
///     Ok(())
/// }
/// ```
///
/// Equivalent code not using `#[spindle::test]`
///
/// ```no_run
/// #[test]
/// fn my_test() -> spindle::Result<()> {
///     let dispatcher = spindle::runtime::Builder::new_pooled()
///         .pool_size(2)
///         .try_build()
///         .expect("Failed building the Dispatcher");
///
///     let res = dispatcher.run_blocking(|scope| async move {
///         let answer = scope.deferred(|_| async { Ok(42) })?;
///         assert_eq!(answer.await_on(&scope).await?, 42);
///         Ok(())
///     });
///
///     dispatcher.shutdown();
///     res
/// }
/// ```
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}

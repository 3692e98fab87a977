//! Ordered strategy lists.
//!
//! A call that has more than one way to succeed lists its routes in
//! preference order. Each failure is classified: either the answer stands
//! (stop) or the next route is tried.

use std::future::Future;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Stop,
    TryNext,
}

/// Every attempt made before giving up, in order. The last entry is the
/// failure that ended the run.
pub(crate) type Attempts<R, E> = Vec<(R, E)>;

pub(crate) async fn run_in_order<R, T, E, F, Fut, C>(
    routes: &[R],
    mut attempt: F,
    classify: C,
) -> Result<T, Attempts<R, E>>
where
    R: Copy,
    F: FnMut(R) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(R, &E) -> Disposition,
{
    let mut failures = Vec::with_capacity(routes.len());
    for route in routes.iter().copied() {
        match attempt(route).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let disposition = classify(route, &err);
                failures.push((route, err));
                if disposition == Disposition::Stop {
                    break;
                }
            }
        }
    }
    Err(failures)
}

//! Concurrent fan-out over the targets of a connection set
//!
//! Every index runs to completion: a failure never short-circuits or cancels
//! its siblings. Results are reported in index order regardless of which
//! target finished first, and failures are folded with [`Error::aggregate`].

use futures::future::join_all;
use std::future::Future;

use crate::error::{Error, Result, TargetError};

/// Run `op(i)` for every `i in 0..n` concurrently and wait for all of them.
///
/// Returns `Ok(())` when every call succeeded, the failure itself when one
/// call failed, and [`Error::Multiple`] when several did.
pub async fn fan_out<F, Fut>(n: usize, op: F) -> Result<()>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let results = fan_out_collect(n, op).await;
    match Error::aggregate(failures(results)) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Run `op(i)` for every `i in 0..n` concurrently and return each outcome,
/// indexed by target.
pub async fn fan_out_collect<T, F, Fut>(n: usize, op: F) -> Vec<Result<T>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if n == 0 {
        return Vec::new();
    }
    join_all((0..n).map(op)).await
}

/// Split collected outcomes into the successful values (by index) and the
/// failures.
pub fn partition<T>(results: Vec<Result<T>>) -> (Vec<(usize, T)>, Vec<TargetError>) {
    let mut ok = Vec::with_capacity(results.len());
    let mut failed = Vec::new();
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(value) => ok.push((index, value)),
            Err(error) => failed.push(TargetError { index, error }),
        }
    }
    (ok, failed)
}

fn failures<T>(results: Vec<Result<T>>) -> Vec<TargetError> {
    partition(results).1
}

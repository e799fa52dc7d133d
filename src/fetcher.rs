//! Typed batch fetching with bounded concurrency.
//!
//! A [`Fetch`] value knows how to turn one input into a node command and how
//! to decode the response body. [`fetch_all`] drives a whole batch of inputs
//! through a gateway with at most `concurrency` calls in flight, preserving
//! input order in the output. Any single failure fails the batch with the
//! first error in input order.

use crate::error::Result;
use crate::rpc::NodeGateway;
use futures_util::stream::{self, StreamExt, TryStreamExt};

/// Translation between one input and one node round-trip.
pub trait Fetch: Send + Sync {
    type Input: Clone + Send + Sync;
    type Output: Send;

    fn command(&self, input: &Self::Input) -> String;
    fn decode(&self, input: &Self::Input, body: &str) -> Result<Self::Output>;
}

/// Issue one GET per input with bounded concurrency. Outputs are paired
/// with their inputs and returned in input order.
pub async fn fetch_all<F: Fetch>(
    gateway: &dyn NodeGateway,
    fetcher: &F,
    inputs: &[F::Input],
    concurrency: usize,
) -> Result<Vec<(F::Input, F::Output)>> {
    stream::iter(inputs.iter().cloned().map(|input| async move {
        let body = gateway.get(&fetcher.command(&input)).await?;
        let output = fetcher.decode(&input, &body)?;
        Ok((input, output))
    }))
    .buffered(concurrency.max(1))
    .try_collect()
    .await
}

/// Issue both fetchers' commands per input concurrently and combine their
/// outputs with `merge`. Concurrency bounds the number of in-flight inputs;
/// each input holds two calls while in flight.
pub async fn fetch_merged<A, B, C, M>(
    gateway: &dyn NodeGateway,
    first: &A,
    second: &B,
    merge: M,
    inputs: &[A::Input],
    concurrency: usize,
) -> Result<Vec<(A::Input, C)>>
where
    A: Fetch,
    B: Fetch<Input = A::Input>,
    C: Send,
    M: Fn(A::Output, B::Output) -> C + Send + Sync,
{
    let merge = &merge;
    stream::iter(inputs.iter().cloned().map(|input| async move {
        let (a, b) = tokio::try_join!(
            async {
                let body = gateway.get(&first.command(&input)).await?;
                first.decode(&input, &body)
            },
            async {
                let body = gateway.get(&second.command(&input)).await?;
                second.decode(&input, &body)
            }
        )?;
        Ok((input, merge(a, b)))
    }))
    .buffered(concurrency.max(1))
    .try_collect()
    .await
}

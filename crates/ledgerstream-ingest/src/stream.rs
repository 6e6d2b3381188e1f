//! The pull-based sequence abstraction every pipeline stage implements.

use async_trait::async_trait;

use ledgerstream_core::{Batch, IngestError};

/// A lazy, pull-based sequence of [`Batch`]es.
///
/// `next_batch` suspends only at network-call boundaries and explicit
/// pauses, so a consumer that stops pulling stalls the whole pipeline —
/// nothing buffers unboundedly. Dropping a source drops every nested
/// source it owns, cancelling their in-flight requests.
#[async_trait]
pub trait BatchSource: Send {
    /// Pull the next batch. `Ok(None)` means the sequence is exhausted.
    async fn next_batch(&mut self) -> Result<Option<Batch>, IngestError>;
}

/// Boxed batch source, the currency of the correction stack.
pub type BoxBatchSource = Box<dyn BatchSource>;

#[async_trait]
impl BatchSource for BoxBatchSource {
    async fn next_batch(&mut self) -> Result<Option<Batch>, IngestError> {
        (**self).next_batch().await
    }
}

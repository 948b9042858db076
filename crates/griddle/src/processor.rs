use crate::error::ProcessError;

/// # Vectorized
///
/// A computation that is cheaper to run over many items at once than over
/// each item individually: matrix multiplication, a neural network forward
/// pass, a bulk database lookup.
///
/// A worker lane drives the three stages in order for every batch it
/// receives: [`preprocess`](Self::preprocess), [`transform`](Self::transform),
/// [`postprocess`](Self::postprocess). Only `transform` is required.
///
/// ## Batch contract
///
/// `transform` and `postprocess` must return exactly one output per input,
/// in input order. The service pairs outputs with callers by position and
/// stops if the counts ever disagree.
///
/// ## Failures
///
/// Returning an error from any stage fails the **whole batch**: every
/// caller whose item travelled in that batch receives the same
/// [`ServiceError::Batch`](crate::ServiceError::Batch). Vectorized kernels
/// rarely know which element caused a failure, so callers must be ready for
/// a batch-wide error even when their own item was fine.
///
/// Panicking is treated as a crash of the worker and stops the service.
///
/// ## Threading
///
/// The processor is built and used on its own worker thread, so it does not
/// need to be `Send`. It is constructed there by the factory handed to
/// [`BatchService::new`](crate::BatchService::new).
///
/// # Example
///
/// ```rust
/// use griddle::{ProcessError, Vectorized};
///
/// struct Doubler;
///
/// impl Vectorized for Doubler {
///     type Input = i64;
///     type Output = i64;
///
///     fn transform(&mut self, batch: &[i64]) -> Result<Vec<i64>, ProcessError> {
///         Ok(batch.iter().map(|value| value * 2).collect())
///     }
/// }
///
/// let mut doubler = Doubler;
/// assert_eq!(doubler.transform(&[1, 2, 3]).unwrap(), vec![2, 4, 6]);
/// ```
pub trait Vectorized: 'static {
    /// A single submitted item
    type Input: Send + 'static;

    /// A single item's result
    type Output: Send + 'static;

    /// Prepares a batch for [`transform`](Self::transform). Defaults to identity.
    fn preprocess(&mut self, batch: Vec<Self::Input>) -> Result<Vec<Self::Input>, ProcessError> {
        Ok(batch)
    }

    /// Runs the batched computation.
    fn transform(&mut self, batch: &[Self::Input]) -> Result<Vec<Self::Output>, ProcessError>;

    /// Combines the prepared batch with the transform's outputs. Defaults to
    /// passing the outputs through.
    fn postprocess(
        &mut self,
        batch: Vec<Self::Input>,
        outputs: Vec<Self::Output>,
    ) -> Result<Vec<Self::Output>, ProcessError> {
        let _ = batch;
        Ok(outputs)
    }
}

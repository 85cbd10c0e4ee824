//! Join helper shared by the chunk and apply workers of one stage.

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ExecutorError;
use crate::models::StepType;

/// Wait for every worker of a stage. The first failure cancels `cancel` so
/// the remaining workers stop at their next chunk boundary; later failures
/// are logged and dropped.
pub(crate) async fn join_workers<R: Send + 'static>(
    step: StepType,
    mut workers: JoinSet<Result<R, ExecutorError>>,
    cancel: &CancellationToken,
) -> Result<Vec<R>, ExecutorError> {
    let mut reports = Vec::with_capacity(workers.len());
    let mut first_error: Option<ExecutorError> = None;

    while let Some(joined) = workers.join_next().await {
        let outcome = joined.unwrap_or_else(|err| {
            Err(ExecutorError::WorkerPanicked {
                step,
                message: err.to_string(),
            })
        });
        match outcome {
            Ok(report) => reports.push(report),
            Err(err) if first_error.is_none() => {
                cancel.cancel();
                first_error = Some(err);
            }
            Err(err) => {
                debug!(step = %step, error = %err, "dropping secondary worker error");
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(reports),
    }
}

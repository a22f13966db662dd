//! Failure boundary used around scheduler ticks and worker jobs.
//!
//! The guarded future runs on its own task so a panic unwinds that task only;
//! the join error is converted into [`PipelineError::PanicRecovered`] and the
//! enclosing loop keeps going.

use std::future::Future;

use crate::error::{PipelineError, Result};

pub async fn guarded<F, T>(context: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(res) => res,
        Err(join_err) if join_err.is_panic() => {
            let payload = join_err.into_panic();
            let message = panic_message(payload.as_ref());
            tracing::error!(target: "boundary", context, %message, "panic recovered");
            metrics::counter!("pipeline_panics_recovered_total").increment(1);
            Err(PipelineError::PanicRecovered {
                context: context.to_string(),
                message,
            })
        }
        Err(_) => Err(PipelineError::Cancelled),
    }
}

/// Best-effort extraction of the panic payload text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

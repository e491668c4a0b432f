use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::responder::Responder;
use crate::router::Handler;
use crate::update::Update;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerFailure {
    #[error("handler exceeded its {}ms deadline", .0.as_millis())]
    Timeout(Duration),
    #[error("handler fault: {0}")]
    Fault(String),
}

/// Run `handler` for one update within `deadline`.
///
/// Errors and panics are contained here and only logged by the caller's
/// context; a timeout drops the handler future. Either way the responder is
/// closed afterwards, while jobs it already queued still get delivered.
pub async fn execute(
    handler: &dyn Handler,
    update: &Update,
    responder: &Responder,
    deadline: Duration,
) -> Result<(), HandlerFailure> {
    let work = AssertUnwindSafe(handler.handle(update, responder)).catch_unwind();
    let outcome = tokio::time::timeout(deadline, work).await;
    responder.close();

    let result = match outcome {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(err))) => Err(HandlerFailure::Fault(format!("{:#}", err))),
        Ok(Err(panic)) => Err(HandlerFailure::Fault(panic_message(panic.as_ref()))),
        Err(_) => Err(HandlerFailure::Timeout(deadline)),
    };

    match &result {
        Ok(()) => debug!(
            handler = handler.name(),
            update_id = update.update_id,
            "Handler completed"
        ),
        Err(HandlerFailure::Timeout(_)) => warn!(
            handler = handler.name(),
            update_id = update.update_id,
            deadline_ms = deadline.as_millis() as u64,
            "Handler timed out"
        ),
        Err(HandlerFailure::Fault(reason)) => error!(
            handler = handler.name(),
            update_id = update.update_id,
            "Handler failed: {}",
            reason
        ),
    }

    result
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}

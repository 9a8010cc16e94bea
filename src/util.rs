use sentry_core::protocol::SpanStatus;
use std::any::Any;
use std::future::Future;

/// Run `callback` inside a sentry transaction named `transaction_name`.
pub async fn with_sentry_transaction<F, R, E>(
    transaction_name: &str,
    callback: impl FnOnce() -> F,
) -> Result<R, E>
where
    F: Future<Output = Result<R, E>>,
{
    let tx_ctx = sentry_core::TransactionContext::new(transaction_name, "previews.render");
    let tx = sentry_core::start_transaction(tx_ctx);

    let result = sentry_core::with_scope(|scope| scope.set_span(Some(tx.clone().into())), callback)
        .await;

    tx.set_status(match result.is_ok() {
        true => SpanStatus::Ok,
        false => SpanStatus::UnknownError,
    });
    tx.finish();

    result
}

/// Best effort message of a caught panic payload.
pub fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> String {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        format!("renderer panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        format!("renderer panicked: {message}")
    } else {
        "renderer panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(try_to_extract_panic_info(&*payload), "renderer panicked: boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(try_to_extract_panic_info(&*payload), "renderer panicked: bang");

        let payload: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(try_to_extract_panic_info(&*payload), "renderer panicked");
    }
}

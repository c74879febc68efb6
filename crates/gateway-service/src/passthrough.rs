//! Passthrough Forwarder (C5, `spec.md` §4.4). Opens a streaming request to
//! the LM backend and forwards bytes verbatim to the client, translated
//! through `StreamChunk`/`SSEEvent` only enough to stay framing-correct.

use futures::StreamExt;
use gateway_core::chat::SamplingParams;
use gateway_core::{BackendClient, ChatMessage, LLMError, Tool};
use tokio_util::sync::CancellationToken;

use crate::cancellation::drain_or_give_up;
use crate::sse::SSEEvent;

/// Streams the backend's response as a sequence of `SSEEvent`s via
/// `on_event`, stopping early (without error) if `cancel` fires.
///
/// Does not emit `SSEEvent::Terminator` itself; the caller (`run_mode`) is
/// the single place that decides the stream is done, so every mode ends
/// its wire framing the same way.
pub async fn forward(
    backend: &BackendClient,
    model: &str,
    messages: &[ChatMessage],
    tools: Option<&[Tool]>,
    sampling: &SamplingParams,
    cancel: &CancellationToken,
    mut on_event: impl FnMut(SSEEvent),
) -> Result<(), LLMError> {
    let Some(mut stream) =
        drain_or_give_up(cancel, backend.chat_stream(model, messages, tools, sampling)).await?
    else {
        return Ok(());
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            chunk = stream.next() => chunk,
        };
        match next {
            Some(Ok(chunk)) => {
                if let Some(event) = crate::sse::from_backend_chunk(chunk) {
                    if matches!(event, SSEEvent::Terminator) {
                        break;
                    }
                    on_event(event);
                }
            }
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_compiles_with_expected_signature() {
        // `forward`'s real behavior is exercised end-to-end in
        // `gateway-core`'s backend tests (SSE decoding) and the router's
        // mode-selection tests; this crate has no standalone HTTP backend
        // to mock against `BackendClient` without a live connection.
        let _ = forward;
    }
}

//! Admission Controller (C4, `spec.md` §4.3).
//!
//! `spec.md` §9 calls out per-process admission semaphores as legitimate
//! shared state to encapsulate, not eliminate. `tokio::sync::Semaphore`
//! already queues `acquire` calls fairly (FIFO), so the controller's job is
//! bookkeeping (queue-depth for the status message) and guaranteeing
//! exactly-once release via `Drop`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdmissionMode {
    StandardResearch,
    DeepResearch,
}

struct Gate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    waiting: AtomicUsize,
}

pub struct AdmissionController {
    standard: Gate,
    deep: Gate,
}

/// Emitted while a request waits for (or receives) a slot, for the SSE
/// emitter to render as `StatusUpdate`s.
#[derive(Debug, Clone)]
pub enum AdmissionStatus {
    QueueFull { in_use: usize, capacity: usize },
    SlotAvailable,
}

/// Held for the lifetime of a request's processing; releases its slot
/// exactly once on drop regardless of how the request ends.
pub struct AdmissionTicket {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("client disconnected while waiting for an admission slot")]
    Cancelled,
}

impl AdmissionController {
    pub fn new(max_standard_research: usize, max_deep_research: usize) -> Self {
        Self {
            standard: Gate {
                semaphore: Arc::new(Semaphore::new(max_standard_research)),
                capacity: max_standard_research,
                waiting: AtomicUsize::new(0),
            },
            deep: Gate {
                semaphore: Arc::new(Semaphore::new(max_deep_research)),
                capacity: max_deep_research,
                waiting: AtomicUsize::new(0),
            },
        }
    }

    /// Acquires a slot for `mode`, invoking `on_status` with `QueueFull`
    /// immediately if none is free, then again with `SlotAvailable` once
    /// admitted. Returns `Err(Cancelled)` without ever having acquired a
    /// permit if `cancel` fires first.
    pub async fn acquire(
        &self,
        mode: AdmissionMode,
        cancel: &CancellationToken,
        mut on_status: impl FnMut(AdmissionStatus),
    ) -> Result<AdmissionTicket, AdmissionError> {
        let gate = match mode {
            AdmissionMode::StandardResearch => &self.standard,
            AdmissionMode::DeepResearch => &self.deep,
        };

        if gate.semaphore.available_permits() == 0 {
            let in_use = gate.capacity;
            on_status(AdmissionStatus::QueueFull {
                in_use,
                capacity: gate.capacity,
            });
        }

        gate.waiting.fetch_add(1, Ordering::SeqCst);
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = gate.semaphore.clone().acquire_owned() => permit.ok(),
        };
        gate.waiting.fetch_sub(1, Ordering::SeqCst);

        match acquired {
            Some(permit) => {
                on_status(AdmissionStatus::SlotAvailable);
                Ok(AdmissionTicket { _permit: permit })
            }
            None => Err(AdmissionError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn second_request_is_queued_until_first_releases() {
        let controller = AdmissionController::new(1, 1);
        let cancel = CancellationToken::new();

        let statuses1 = Arc::new(Mutex::new(Vec::new()));
        let s1 = statuses1.clone();
        let ticket1 = controller
            .acquire(AdmissionMode::DeepResearch, &cancel, |s| {
                s1.lock().unwrap().push(format!("{s:?}"))
            })
            .await
            .unwrap();
        assert!(statuses1.lock().unwrap().iter().any(|s| s.contains("SlotAvailable")));

        let controller = Arc::new(controller);
        let cancel2 = cancel.clone();
        let statuses2 = Arc::new(Mutex::new(Vec::new()));
        let s2 = statuses2.clone();
        let c2 = controller.clone();
        let handle = tokio::spawn(async move {
            c2.acquire(AdmissionMode::DeepResearch, &cancel2, |s| {
                s2.lock().unwrap().push(format!("{s:?}"))
            })
            .await
        });

        tokio::task::yield_now().await;
        drop(ticket1);
        let ticket2 = handle.await.unwrap().unwrap();
        assert!(statuses2.lock().unwrap().iter().any(|s| s.contains("QueueFull")));
        drop(ticket2);
    }

    #[tokio::test]
    async fn cancellation_while_waiting_releases_nothing() {
        let controller = AdmissionController::new(1, 1);
        let cancel = CancellationToken::new();
        let _t1 = controller
            .acquire(AdmissionMode::StandardResearch, &cancel, |_| {})
            .await
            .unwrap();

        let cancel2 = CancellationToken::new();
        cancel2.cancel();
        let result = controller
            .acquire(AdmissionMode::StandardResearch, &cancel2, |_| {})
            .await;
        assert!(matches!(result, Err(AdmissionError::Cancelled)));
    }
}

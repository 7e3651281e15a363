//! Request/response correlation for id-carrying protocols (eth/66+).
//!
//! One dictionary per request kind per session. Issuing a request yields a
//! fresh nonzero id and a one-shot slot the response completes. Responses
//! with ids that were never issued, or that were already answered, are
//! dropped on the floor: they must never complete a different request.

use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::sync::oneshot;
use tracing::debug;

use super::error::RLPxError;

/// Outcome of a completed request: the response payload plus timing data
/// for the transfer-speed accounting.
#[derive(Debug)]
pub struct CompletedRequest<Res> {
    pub response: Res,
    pub elapsed: Duration,
    pub payload_size: usize,
}

impl<Res> CompletedRequest<Res> {
    /// Transfer speed in bytes per millisecond, the unit node stats track.
    pub fn bytes_per_ms(&self) -> u64 {
        let elapsed_ms = self.elapsed.as_millis().max(1) as u64;
        self.payload_size as u64 / elapsed_ms
    }
}

#[derive(Debug)]
struct PendingRequest<Res> {
    sent_at: Instant,
    responder: oneshot::Sender<Result<CompletedRequest<Res>, RLPxError>>,
}

/// Maps outstanding request ids to their completion slots.
#[derive(Debug)]
pub struct MessageDictionary<Res> {
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest<Res>>>,
}

impl<Res> Default for MessageDictionary<Res> {
    fn default() -> Self {
        Self {
            next_request_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl<Res> MessageDictionary<Res> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh request and returns its id along with the receiver
    /// the response will arrive on. Ids are monotonic per dictionary and
    /// never zero.
    pub fn open(
        &self,
    ) -> (
        u64,
        oneshot::Receiver<Result<CompletedRequest<Res>, RLPxError>>,
    ) {
        let mut request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        if request_id == 0 {
            // wrapped around
            request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        }
        let (responder, receiver) = oneshot::channel();
        self.lock_pending().insert(
            request_id,
            PendingRequest {
                sent_at: Instant::now(),
                responder,
            },
        );
        (request_id, receiver)
    }

    /// Matches a response to its request. Returns false when the id is
    /// unknown or already answered; the caller drops the message.
    pub fn complete(&self, request_id: u64, payload_size: usize, response: Res) -> bool {
        let Some(pending) = self.lock_pending().remove(&request_id) else {
            debug!("Dropping response with unknown request id {request_id}");
            return false;
        };
        let completed = CompletedRequest {
            response,
            elapsed: pending.sent_at.elapsed(),
            payload_size,
        };
        // the requester may have given up; that is its problem, not ours
        let _ = pending.responder.send(Ok(completed));
        true
    }

    /// FIFO variant for protocol versions without request ids: completes
    /// the oldest outstanding request (ids are monotonic, so smallest id =
    /// oldest). Returns false when nothing is outstanding.
    pub fn complete_oldest(&self, payload_size: usize, response: Res) -> bool {
        let oldest = self.lock_pending().keys().min().copied();
        match oldest {
            Some(request_id) => self.complete(request_id, payload_size, response),
            None => {
                debug!("Dropping unsolicited response (no outstanding request)");
                false
            }
        }
    }

    /// Fails a single request, e.g. on timeout. The entry is removed so a
    /// late response gets dropped as unknown.
    pub fn fail(&self, request_id: u64, error: RLPxError) {
        if let Some(pending) = self.lock_pending().remove(&request_id) {
            let _ = pending.responder.send(Err(error));
        }
    }

    /// Drains every outstanding request with a cancellation error. Called
    /// on session disposal.
    pub fn cancel_all(&self) {
        let pending = std::mem::take(&mut *self.lock_pending());
        for (_, request) in pending {
            let _ = request.responder.send(Err(RLPxError::RequestCancelled));
        }
    }

    pub fn outstanding(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest<Res>>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_are_monotonic_and_nonzero() {
        let dictionary: MessageDictionary<()> = MessageDictionary::new();
        let (first, _rx1) = dictionary.open();
        let (second, _rx2) = dictionary.open();
        assert!(first > 0);
        assert!(second > first);
    }

    #[tokio::test]
    async fn response_completes_the_matching_request() {
        let dictionary: MessageDictionary<&'static str> = MessageDictionary::new();
        let (id, receiver) = dictionary.open();

        assert!(dictionary.complete(id, 1024, "headers"));
        let completed = receiver.await.expect("slot completed").expect("no error");
        assert_eq!(completed.response, "headers");
        assert_eq!(completed.payload_size, 1024);
        assert_eq!(dictionary.outstanding(), 0);
    }

    #[tokio::test]
    async fn unknown_id_is_dropped() {
        let dictionary: MessageDictionary<()> = MessageDictionary::new();
        let (_id, _receiver) = dictionary.open();
        assert!(!dictionary.complete(9999, 0, ()));
        assert_eq!(dictionary.outstanding(), 1);
    }

    #[tokio::test]
    async fn duplicate_response_is_dropped() {
        let dictionary: MessageDictionary<u8> = MessageDictionary::new();
        let (id, receiver) = dictionary.open();
        assert!(dictionary.complete(id, 10, 1));
        // a second response with the same id must not match anything
        assert!(!dictionary.complete(id, 10, 2));
        let completed = receiver.await.expect("slot completed").expect("no error");
        assert_eq!(completed.response, 1);
    }

    #[tokio::test]
    async fn cancel_all_fails_outstanding_requests() {
        let dictionary: MessageDictionary<()> = MessageDictionary::new();
        let (_first, rx1) = dictionary.open();
        let (_second, rx2) = dictionary.open();
        dictionary.cancel_all();

        assert!(matches!(
            rx1.await.expect("slot completed"),
            Err(RLPxError::RequestCancelled)
        ));
        assert!(matches!(
            rx2.await.expect("slot completed"),
            Err(RLPxError::RequestCancelled)
        ));
    }

    #[tokio::test]
    async fn failed_request_drops_late_response() {
        let dictionary: MessageDictionary<()> = MessageDictionary::new();
        let (id, receiver) = dictionary.open();
        dictionary.fail(id, RLPxError::RequestTimeout);
        assert!(matches!(
            receiver.await.expect("slot completed"),
            Err(RLPxError::RequestTimeout)
        ));
        // the response arriving after the timeout is unknown now
        assert!(!dictionary.complete(id, 0, ()));
    }

    #[test]
    fn bytes_per_ms_is_inverted_size_over_time() {
        let completed = CompletedRequest {
            response: (),
            elapsed: Duration::from_millis(100),
            payload_size: 51_200,
        };
        assert_eq!(completed.bytes_per_ms(), 512);
    }
}

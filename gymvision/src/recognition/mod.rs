//! The recognition pipeline: image in, canonical exercise out, exactly one credit accounted for.
//!
//! ```text
//! load image ──► reserve 1 credit ──► classify (bounded) ──► normalize ──► commit
//!     │                 │                    │
//!     ▼                 ▼                    ▼
//! InvalidImage    QuotaExhausted      release ──► ClassifierFailed
//! ```
//!
//! Image problems are detected before the ledger is touched, and an exhausted quota is detected
//! before the classifier is called. Once a reservation exists it is always resolved before
//! [`RecognitionPipeline::recognize`] returns: committed if the classifier answered (even when the
//! answer matches nothing in the catalog), released if it did not.

pub mod image;

use crate::{
    catalog::{Catalog, Exercise, UNKNOWN_EXERCISE},
    classifier::{Classifier, ClassifierError},
    errors::Error,
    metrics,
    quota::{self, QuotaError, QuotaLedger},
    types::{UserId, abbrev_uuid},
};
use image::{ImageError, ImageInput, ImageLoader};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, instrument, warn};

/// How a recognition request ended. Every request resolves to exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionOutcome {
    /// The classifier's answer matched a catalog entry. Charged.
    Recognized { label: String, raw_classifier_text: String },
    /// The classifier answered, but nothing in the catalog matched. Charged: the classification
    /// work was done.
    Unrecognized { raw_classifier_text: String },
    /// The classifier timed out or failed. The reservation was released; not charged.
    ClassifierFailed { error: ClassifierError },
    /// Not enough credits this month. The classifier was not called.
    QuotaExhausted { credits_remaining: i32 },
    /// The payload was not a usable image. The ledger was not touched.
    InvalidImage(ImageError),
}

impl RecognitionOutcome {
    /// Whether this request consumed a credit
    pub fn charged(&self) -> bool {
        matches!(self, RecognitionOutcome::Recognized { .. } | RecognitionOutcome::Unrecognized { .. })
    }

    /// Canonical label to show the user, or the unknown sentinel
    pub fn exercise(&self) -> &str {
        match self {
            RecognitionOutcome::Recognized { label, .. } => label,
            _ => UNKNOWN_EXERCISE,
        }
    }

    /// What the classifier actually said, for logs. Never returned to clients.
    pub fn raw_classifier_text(&self) -> Option<&str> {
        match self {
            RecognitionOutcome::Recognized { raw_classifier_text, .. } | RecognitionOutcome::Unrecognized { raw_classifier_text } => {
                Some(raw_classifier_text)
            }
            _ => None,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            RecognitionOutcome::Recognized { .. } => "recognized",
            RecognitionOutcome::Unrecognized { .. } => "unrecognized",
            RecognitionOutcome::ClassifierFailed { .. } => "classifier_failed",
            RecognitionOutcome::QuotaExhausted { .. } => "quota_exhausted",
            RecognitionOutcome::InvalidImage(_) => "invalid_image",
        }
    }
}

/// Orchestrates image loading, the quota ledger, the classifier and the catalog.
///
/// Holds no per-request state; clones share the same ledger, classifier and catalog.
#[derive(Clone)]
pub struct RecognitionPipeline {
    ledger: QuotaLedger,
    classifier: Arc<dyn Classifier>,
    catalog: Arc<Catalog>,
    images: ImageLoader,
    classifier_timeout: Duration,
    /// Detached requests, so shutdown can wait for them
    in_flight: TaskTracker,
}

impl RecognitionPipeline {
    pub fn new(
        ledger: QuotaLedger,
        classifier: Arc<dyn Classifier>,
        catalog: Arc<Catalog>,
        images: ImageLoader,
        classifier_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            classifier,
            catalog,
            images,
            classifier_timeout,
            in_flight: TaskTracker::new(),
        }
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    /// Run one recognition request for `user_id`.
    ///
    /// Only storage failures are returned as errors; every other way a request can end is a
    /// [`RecognitionOutcome`].
    #[instrument(skip(self, input), fields(user = %abbrev_uuid(&user_id)), err)]
    pub async fn recognize(&self, user_id: UserId, input: ImageInput) -> quota::Result<RecognitionOutcome> {
        let outcome = self.run(user_id, input).await?;

        match &outcome {
            RecognitionOutcome::Recognized {
                label,
                raw_classifier_text,
            } => info!(exercise = %label, raw = %raw_classifier_text, "Exercise recognized"),
            RecognitionOutcome::Unrecognized { raw_classifier_text } => {
                info!(raw = %raw_classifier_text, "Classifier answer matched no exercise")
            }
            other => debug!(outcome = other.metric_label(), "Recognition finished without a classification"),
        }
        metrics::record_recognition_outcome(outcome.metric_label());

        Ok(outcome)
    }

    /// Like [`recognize`](Self::recognize), but on its own task.
    ///
    /// If the caller is dropped (e.g. the client disconnects), the request still runs to completion
    /// and its reservation is still committed or released.
    pub async fn recognize_detached(&self, user_id: UserId, input: ImageInput) -> crate::errors::Result<RecognitionOutcome> {
        let pipeline = self.clone();
        let task = self
            .in_flight
            .spawn(async move { pipeline.recognize(user_id, input).await }.in_current_span());

        let outcome = task.await.map_err(|e| Error::Internal {
            operation: format!("complete recognition task: {e}"),
        })??;
        Ok(outcome)
    }

    /// Wait for every detached request to resolve its reservation. Requests started after this is
    /// called still run and are waited for too.
    pub async fn wait_for_in_flight(&self) {
        self.in_flight.close();
        self.in_flight.wait().await;
    }

    async fn run(&self, user_id: UserId, input: ImageInput) -> quota::Result<RecognitionOutcome> {
        let image = match self.images.load(input).await {
            Ok(image) => image,
            Err(e) => {
                debug!(error = %e, "Rejected image");
                return Ok(RecognitionOutcome::InvalidImage(e));
            }
        };

        let token = match self.ledger.reserve(user_id, 1).await {
            Ok(token) => token,
            Err(QuotaError::Exhausted { credits_remaining }) => {
                return Ok(RecognitionOutcome::QuotaExhausted { credits_remaining });
            }
            Err(e) => return Err(e),
        };

        let started = Instant::now();
        let answer = match tokio::time::timeout(self.classifier_timeout, self.classifier.classify(&image)).await {
            Ok(answer) => answer,
            Err(_) => Err(ClassifierError::Timeout(self.classifier_timeout)),
        };
        metrics::observe_classifier_duration(started.elapsed());

        let raw_classifier_text = match answer {
            Ok(text) => text,
            Err(error) => {
                warn!(kind = error.kind(), error = %error, "Classifier failed, releasing reservation");
                resolved(self.ledger.release(token).await);
                return Ok(RecognitionOutcome::ClassifierFailed { error });
            }
        };

        let exercise = self.catalog.normalize(&raw_classifier_text);
        resolved(self.ledger.commit(token).await);

        Ok(match exercise {
            Exercise::Canonical(label) => RecognitionOutcome::Recognized {
                label,
                raw_classifier_text,
            },
            Exercise::Unknown => RecognitionOutcome::Unrecognized { raw_classifier_text },
        })
    }
}

/// A failed commit or release leaves the reservation `reserved`; the stale sweeper releases it
/// later. The user still gets their answer.
fn resolved(result: quota::Result<()>) {
    if let Err(e) = result {
        error!(error = %e, "Failed to resolve quota reservation; leaving it for the stale sweeper");
        metrics::record_quota_event("resolve_failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        quota::{BillingPeriod, QuotaStore, SystemClock, in_memory::InMemoryQuotaStore},
        test_utils::{FixedClock, StubClassifier, png_bytes},
    };
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use uuid::Uuid;

    struct Harness {
        store: Arc<InMemoryQuotaStore>,
        classifier: Arc<StubClassifier>,
        pipeline: RecognitionPipeline,
    }

    fn harness(classifier: StubClassifier, timeout: Duration) -> Harness {
        let clock = Arc::new(FixedClock::at_period(2025, 2));
        let store = Arc::new(InMemoryQuotaStore::with_clock(clock.clone()));
        let classifier = Arc::new(classifier);
        let pipeline = RecognitionPipeline::new(
            QuotaLedger::new(store.clone(), clock, 10),
            classifier.clone(),
            Arc::new(Catalog::builtin()),
            ImageLoader::new(1024 * 1024, Duration::from_secs(5), true).unwrap(),
            timeout,
        );
        Harness {
            store,
            classifier,
            pipeline,
        }
    }

    fn photo() -> ImageInput {
        ImageInput::Base64(STANDARD.encode(png_bytes()))
    }

    async fn balance(h: &Harness, user: UserId) -> i32 {
        h.pipeline.ledger().peek(user).await.unwrap().credits_remaining
    }

    #[tokio::test]
    async fn test_recognized_exercise_is_charged() {
        let h = harness(
            StubClassifier::answering("A person performing a bench press exercise"),
            Duration::from_secs(5),
        );
        let user = Uuid::new_v4();

        let outcome = h.pipeline.recognize(user, photo()).await.unwrap();

        assert_eq!(outcome.exercise(), "bench press");
        assert!(outcome.charged());
        assert_eq!(outcome.raw_classifier_text(), Some("A person performing a bench press exercise"));
        assert_eq!(balance(&h, user).await, 9);
        assert_eq!(h.classifier.calls(), 1);
    }

    #[tokio::test]
    async fn test_unrecognized_answer_is_still_charged() {
        let h = harness(StubClassifier::answering("a cat sleeping on a sofa"), Duration::from_secs(5));
        let user = Uuid::new_v4();

        let outcome = h.pipeline.recognize(user, photo()).await.unwrap();

        assert!(matches!(outcome, RecognitionOutcome::Unrecognized { .. }));
        assert_eq!(outcome.exercise(), UNKNOWN_EXERCISE);
        assert!(outcome.charged());
        assert_eq!(balance(&h, user).await, 9);
    }

    #[tokio::test]
    async fn test_classifier_timeout_releases_credit() {
        let h = harness(
            StubClassifier::answering("squat").with_delay(Duration::from_millis(200)),
            Duration::from_millis(20),
        );
        let user = Uuid::new_v4();
        h.store.insert_account(user, 4, BillingPeriod::new(2025, 2).unwrap());

        let outcome = h.pipeline.recognize(user, photo()).await.unwrap();

        assert_eq!(
            outcome,
            RecognitionOutcome::ClassifierFailed {
                error: ClassifierError::Timeout(Duration::from_millis(20))
            }
        );
        assert_eq!(outcome.exercise(), UNKNOWN_EXERCISE);
        assert!(!outcome.charged());
        assert_eq!(balance(&h, user).await, 4);
    }

    #[tokio::test]
    async fn test_classifier_error_releases_credit() {
        let h = harness(
            StubClassifier::failing(ClassifierError::Upstream { status: 502 }),
            Duration::from_secs(5),
        );
        let user = Uuid::new_v4();

        let outcome = h.pipeline.recognize(user, photo()).await.unwrap();

        assert!(matches!(outcome, RecognitionOutcome::ClassifierFailed { .. }));
        assert_eq!(balance(&h, user).await, 10);
        assert_eq!(h.classifier.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_image_touches_nothing() {
        let h = harness(StubClassifier::answering("squat"), Duration::from_secs(5));
        let user = Uuid::new_v4();

        let outcome = h.pipeline.recognize(user, ImageInput::Base64("@@@not base64@@@".into())).await.unwrap();

        assert_eq!(outcome, RecognitionOutcome::InvalidImage(ImageError::InvalidBase64));
        assert!(!outcome.charged());
        assert_eq!(h.classifier.calls(), 0);
        assert!(h.store.account(user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_exhausted_quota_skips_classifier() {
        let h = harness(StubClassifier::answering("squat"), Duration::from_secs(5));
        let user = Uuid::new_v4();
        h.store.insert_account(user, 0, BillingPeriod::new(2025, 2).unwrap());

        let outcome = h.pipeline.recognize(user, photo()).await.unwrap();

        assert_eq!(outcome, RecognitionOutcome::QuotaExhausted { credits_remaining: 0 });
        assert_eq!(outcome.exercise(), UNKNOWN_EXERCISE);
        assert_eq!(h.classifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_new_month_resets_before_reserving() {
        let h = harness(StubClassifier::answering("deadlift"), Duration::from_secs(5));
        let user = Uuid::new_v4();
        h.store.insert_account(user, 0, BillingPeriod::new(2025, 1).unwrap());

        let outcome = h.pipeline.recognize(user, photo()).await.unwrap();

        assert_eq!(outcome.exercise(), "deadlift");
        let account = h.store.account(user).await.unwrap().unwrap();
        assert_eq!(account.credits_remaining, 9);
        assert_eq!(account.last_reset_period.to_string(), "2025-02");
    }

    #[tokio::test]
    async fn test_last_credit_goes_to_exactly_one_concurrent_request() {
        let h = harness(
            StubClassifier::answering("lat pulldown").with_delay(Duration::from_millis(50)),
            Duration::from_secs(5),
        );
        let user = Uuid::new_v4();
        h.store.insert_account(user, 1, BillingPeriod::new(2025, 2).unwrap());

        let (a, b) = tokio::join!(h.pipeline.recognize(user, photo()), h.pipeline.recognize(user, photo()));
        let outcomes = [a.unwrap(), b.unwrap()];

        assert_eq!(outcomes.iter().filter(|o| o.charged()).count(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, RecognitionOutcome::QuotaExhausted { .. }))
                .count(),
            1
        );
        assert_eq!(h.classifier.calls(), 1);
        assert_eq!(balance(&h, user).await, 0);
    }

    #[tokio::test]
    async fn test_detached_request_resolves_after_caller_is_dropped() {
        let store = Arc::new(InMemoryQuotaStore::new());
        let classifier = Arc::new(StubClassifier::answering("squat").with_delay(Duration::from_millis(100)));
        let pipeline = RecognitionPipeline::new(
            QuotaLedger::new(store.clone(), Arc::new(SystemClock), 10),
            classifier.clone(),
            Arc::new(Catalog::builtin()),
            ImageLoader::new(1024 * 1024, Duration::from_secs(5), true).unwrap(),
            Duration::from_secs(5),
        );
        let user = Uuid::new_v4();

        let caller = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.recognize_detached(user, photo()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        caller.abort();

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(classifier.calls(), 1);
        assert_eq!(pipeline.ledger().peek(user).await.unwrap().credits_remaining, 9);
        let far_future = chrono::Utc::now() + chrono::Duration::hours(1);
        assert!(store.stale_reservations(far_future).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_in_flight_covers_abandoned_requests() {
        let store = Arc::new(InMemoryQuotaStore::new());
        let classifier = Arc::new(StubClassifier::answering("deadlift").with_delay(Duration::from_millis(150)));
        let pipeline = RecognitionPipeline::new(
            QuotaLedger::new(store.clone(), Arc::new(SystemClock), 10),
            classifier.clone(),
            Arc::new(Catalog::builtin()),
            ImageLoader::new(1024 * 1024, Duration::from_secs(5), true).unwrap(),
            Duration::from_secs(5),
        );
        let user = Uuid::new_v4();

        let caller = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.recognize_detached(user, photo()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        caller.abort();

        // No sleeping past the classifier delay: the wait itself must cover the request
        pipeline.wait_for_in_flight().await;

        assert_eq!(classifier.calls(), 1);
        assert_eq!(store.account(user).await.unwrap().unwrap().credits_remaining, 9);
        let far_future = chrono::Utc::now() + chrono::Duration::hours(1);
        assert!(store.stale_reservations(far_future).await.unwrap().is_empty());
    }

    #[test]
    fn test_metric_labels() {
        let labels: Vec<_> = [
            RecognitionOutcome::Recognized {
                label: "squat".into(),
                raw_classifier_text: "Squat".into(),
            },
            RecognitionOutcome::Unrecognized {
                raw_classifier_text: "?".into(),
            },
            RecognitionOutcome::ClassifierFailed {
                error: ClassifierError::EmptyResponse,
            },
            RecognitionOutcome::QuotaExhausted { credits_remaining: 0 },
            RecognitionOutcome::InvalidImage(ImageError::Empty),
        ]
        .iter()
        .map(RecognitionOutcome::metric_label)
        .collect();

        assert_eq!(
            labels,
            ["recognized", "unrecognized", "classifier_failed", "quota_exhausted", "invalid_image"]
        );
    }
}

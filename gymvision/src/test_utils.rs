//! Test doubles and constructors shared by unit and HTTP tests.

use crate::{
    catalog::Catalog,
    classifier::{Classifier, ClassifierError},
    config::{Config, DatabaseConfig},
    quota::{BillingPeriod, Clock, QuotaLedger, in_memory::InMemoryQuotaStore},
    recognition::image::ValidatedImage,
};
use async_trait::async_trait;
use axum_test::TestServer;
use chrono::{DateTime, TimeZone, Utc};
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

/// Start of a baseline JPEG (SOI, APP0 JFIF marker)
pub const JPEG_HEADER: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01];

/// Bytes that sniff as PNG. Not a decodable image; nothing here decodes pixels.
pub fn png_bytes() -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(&[0u8; 56]);
    bytes
}

/// A clock that only moves when told to
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    /// Midday on the 15th of the given month
    pub fn at_period(year: i32, month: u32) -> Self {
        Self::at(mid_month(year, month))
    }

    pub fn set_period(&self, year: i32, month: u32) {
        *self.now.lock().unwrap() = mid_month(year, month);
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

fn mid_month(year: i32, month: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, 15, 12, 0, 0).unwrap()
}

/// Classifier that replays scripted answers, then falls back to a default
pub struct StubClassifier {
    scripted: Mutex<VecDeque<Result<String, ClassifierError>>>,
    default: Result<String, ClassifierError>,
    delay: Duration,
    calls: AtomicUsize,
}

impl StubClassifier {
    pub fn answering(text: &str) -> Self {
        Self::with_default(Ok(text.to_string()))
    }

    pub fn failing(error: ClassifierError) -> Self {
        Self::with_default(Err(error))
    }

    fn with_default(default: Result<String, ClassifierError>) -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            default,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Answer `reply` once, before falling back to the default
    pub fn then(self, reply: Result<String, ClassifierError>) -> Self {
        self.scripted.lock().unwrap().push_back(reply);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for StubClassifier {
    async fn classify(&self, _image: &ValidatedImage) -> Result<String, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.scripted.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.default.clone())
    }
}

pub fn create_test_config() -> Config {
    let mut config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        database: DatabaseConfig::InMemory,
        enable_metrics: false,
        ..Default::default()
    };
    config.classifier.api_key = Some("sk-test".to_string());
    config.recognition.max_image_bytes = 64 * 1024;
    config.recognition.classifier_timeout = Duration::from_millis(200);
    // wiremock listens on loopback
    config.recognition.allow_private_image_hosts = true;
    config
}

/// Everything an HTTP test needs to arrange and inspect state
pub struct TestApp {
    pub server: TestServer,
    pub store: Arc<InMemoryQuotaStore>,
    pub classifier: Arc<StubClassifier>,
}

impl TestApp {
    /// Seed `user_id` with a balance in the test clock's current period (February 2025)
    pub fn seed_account(&self, user_id: uuid::Uuid, credits_remaining: i32) {
        self.store
            .insert_account(user_id, credits_remaining, BillingPeriod::new(2025, 2).unwrap());
    }
}

/// Router over in-memory storage, a stub classifier, and a clock fixed in February 2025
pub fn create_test_app(config: Config, classifier: StubClassifier) -> TestApp {
    let clock = Arc::new(FixedClock::at_period(2025, 2));
    let store = Arc::new(InMemoryQuotaStore::with_clock(clock.clone()));
    let classifier = Arc::new(classifier);
    let ledger = QuotaLedger::new(store.clone(), clock, config.quota.monthly_allowance);

    let state = crate::AppState::from_parts(config, ledger, classifier.clone(), Arc::new(Catalog::builtin()))
        .expect("Failed to build app state");
    let router = crate::build_router(&state).expect("Failed to build router");
    let server = TestServer::new(router).expect("Failed to create test server");

    TestApp {
        server,
        store,
        classifier,
    }
}

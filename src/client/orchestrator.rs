//! Turns a stream of user inputs into at most one live search request and
//! publishes the outcome as [`SearchState`].
//!
//! - text input is debounced; a repeat of the pending query is ignored
//! - every request carries a sequence id and only the latest may publish
//! - superseded requests are aborted, not awaited
//! - results are cached per [`CacheKey`]; a hit publishes immediately
//! - image searches skip the debounce and carry no taxonomy

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::cache::{CacheKey, ResultCache, DEFAULT_CAPACITY};
use super::transport::SearchTransport;
use super::{ClientError, SearchResults};

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub debounce: Duration,
    pub limit: usize,
    pub cache_capacity: usize,
    /// Re-fetch in the background after serving a cache hit
    pub refresh_on_hit: bool,
    pub max_retries: u32,
    pub retry_base: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(180),
            limit: 20,
            cache_capacity: DEFAULT_CAPACITY,
            refresh_on_hit: false,
            max_retries: 2,
            retry_base: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Idle,
    Loading,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchState {
    pub status: Status,
    pub results: SearchResults,
    pub error: Option<ClientError>,
    /// Sequence id of the request this state belongs to
    pub seq: u64,
}

#[derive(Debug, Clone)]
enum Request {
    Text(String),
    Image { bytes: Vec<u8>, mime: Option<String> },
}

struct Current {
    key: CacheKey,
    handle: JoinHandle<()>,
}

struct Shared {
    seq: u64,
    cache: ResultCache,
    current: Option<Current>,
}

struct Inner<T> {
    transport: T,
    options: OrchestratorOptions,
    state: watch::Sender<SearchState>,
    shared: Mutex<Shared>,
}

pub struct QueryOrchestrator<T: SearchTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: SearchTransport> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        // the guarded data stays consistent even if a holder panicked
        self.shared.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Publish `next` only if `seq` is still the latest request.
    fn publish_if_latest(&self, seq: u64, next: SearchState) -> bool {
        let shared = self.lock();
        if shared.seq != seq {
            log::debug!("dropping stale response {seq}, latest is {}", shared.seq);
            return false;
        }
        self.state.send_replace(next);
        true
    }

    async fn send(&self, request: &Request) -> Result<SearchResults, ClientError> {
        let limit = self.options.limit;
        match request {
            Request::Text(q) => self
                .transport
                .search_text(q.clone(), limit)
                .await
                .map(Into::into),
            Request::Image { bytes, mime } => self
                .transport
                .search_image(bytes.clone(), mime.clone(), limit)
                .await
                .map(Into::into),
        }
    }

    async fn send_with_retry(&self, request: &Request) -> Result<SearchResults, ClientError> {
        let mut attempt = 0u32;
        loop {
            match self.send(request).await {
                Err(err) if err.is_transient() && attempt < self.options.max_retries => {
                    let base = self.options.retry_base * 2u32.pow(attempt);
                    let jitter_ms = self.options.retry_base.as_millis() as u64 / 2;
                    let delay =
                        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms));
                    attempt += 1;
                    log::info!(
                        "search failed: {err}, retrying (attempt {attempt}/{}) in {delay:?}",
                        self.options.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    async fn run(self: Arc<Self>, seq: u64, key: CacheKey, request: Request, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match self.send_with_retry(&request).await {
            Ok(results) => {
                self.lock().cache.put(key, results.clone());
                self.publish_if_latest(
                    seq,
                    SearchState {
                        status: Status::Ready,
                        results,
                        error: None,
                        seq,
                    },
                );
            }
            Err(err) => {
                log::warn!("search {seq} failed: {err}");
                self.publish_if_latest(
                    seq,
                    SearchState {
                        status: Status::Failed,
                        results: SearchResults::default(),
                        error: Some(err),
                        seq,
                    },
                );
            }
        }
    }
}

impl<T: SearchTransport> QueryOrchestrator<T> {
    pub fn new(transport: T, options: OrchestratorOptions) -> Self {
        let (state, _) = watch::channel(SearchState::default());
        let shared = Shared {
            seq: 0,
            cache: ResultCache::new(options.cache_capacity),
            current: None,
        };
        Self {
            inner: Arc::new(Inner {
                transport,
                options,
                state,
                shared: Mutex::new(shared),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SearchState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> SearchState {
        self.inner.state.borrow().clone()
    }

    /// Abort whatever is running and claim the next sequence id.
    fn supersede(shared: &mut Shared) -> u64 {
        if let Some(current) = shared.current.take() {
            current.handle.abort();
        }
        shared.seq += 1;
        shared.seq
    }

    fn start(&self, shared: &mut Shared, seq: u64, key: CacheKey, request: Request, delay: Duration) {
        let previous = self.inner.state.borrow().results.clone();
        self.inner.state.send_replace(SearchState {
            status: Status::Loading,
            results: previous,
            error: None,
            seq,
        });

        let handle = tokio::spawn(self.inner.clone().run(seq, key.clone(), request, delay));
        shared.current = Some(Current { key, handle });
    }

    /// Serve `key` from cache if possible. Returns whether it was a hit.
    fn serve_cached(&self, shared: &mut Shared, seq: u64, key: &CacheKey, request: &Request) -> bool {
        let Some(results) = shared.cache.get(key) else {
            return false;
        };
        self.inner.state.send_replace(SearchState {
            status: Status::Ready,
            results,
            error: None,
            seq,
        });

        if self.inner.options.refresh_on_hit {
            let handle = tokio::spawn(self.inner.clone().run(
                seq,
                key.clone(),
                request.clone(),
                Duration::ZERO,
            ));
            shared.current = Some(Current {
                key: key.clone(),
                handle,
            });
        }
        true
    }

    /// Handle a change of the search box contents.
    pub fn search_text(&self, input: &str) {
        let key = CacheKey::text(input, self.inner.options.limit);
        let mut shared = self.inner.lock();

        if key.query.is_empty() {
            let seq = Self::supersede(&mut shared);
            self.inner.state.send_replace(SearchState {
                seq,
                ..Default::default()
            });
            return;
        }

        let repeat = shared
            .current
            .as_ref()
            .is_some_and(|c| c.key == key && !c.handle.is_finished());
        if repeat {
            return;
        }

        let seq = Self::supersede(&mut shared);
        let request = Request::Text(key.query.clone());
        if self.serve_cached(&mut shared, seq, &key, &request) {
            return;
        }
        self.start(
            &mut shared,
            seq,
            key,
            request,
            self.inner.options.debounce,
        );
    }

    /// Search by photo. Runs immediately and replaces any text search.
    pub fn search_image(&self, bytes: Vec<u8>, mime: Option<String>) {
        let key = CacheKey::image(&bytes, self.inner.options.limit);
        let mut shared = self.inner.lock();

        let seq = Self::supersede(&mut shared);
        let request = Request::Image { bytes, mime };
        if self.serve_cached(&mut shared, seq, &key, &request) {
            return;
        }
        self.start(&mut shared, seq, key, request, Duration::ZERO);
    }

    /// Drop any pending or running search and go back to idle.
    pub fn clear(&self) {
        let mut shared = self.inner.lock();
        let seq = Self::supersede(&mut shared);
        self.inner.state.send_replace(SearchState {
            seq,
            ..Default::default()
        });
    }

    #[cfg(test)]
    pub fn cached_entries(&self) -> usize {
        self.inner.lock().cache.len()
    }
}

impl<T: SearchTransport> Drop for QueryOrchestrator<T> {
    fn drop(&mut self) {
        if let Some(current) = self.inner.lock().current.take() {
            current.handle.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::ProductSummary;
    use crate::search::{
        ImageSearchMetadata, ImageSearchResponse, RankedResult, SearchError, TextSearchResponse,
    };
    use std::collections::{HashMap, VecDeque};

    /// Transport returning canned responses after a per-query delay.
    #[derive(Default)]
    pub(crate) struct FakeTransport {
        pub(crate) calls: Mutex<Vec<String>>,
        pub(crate) delays: Mutex<HashMap<String, Duration>>,
        pub(crate) failures: Mutex<VecDeque<ClientError>>,
    }

    impl FakeTransport {
        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    pub(crate) fn result_for(q: &str) -> RankedResult {
        RankedResult {
            product: ProductSummary {
                id: q.len() as u64,
                title: q.to_string(),
                handle: q.to_string(),
                thumbnail: None,
                price: 1.0,
                currency: "USD".to_string(),
            },
            relevance_score: 0.9,
        }
    }

    impl SearchTransport for Arc<FakeTransport> {
        async fn search_text(
            &self,
            query: String,
            _limit: usize,
        ) -> Result<TextSearchResponse, ClientError> {
            self.calls.lock().unwrap().push(query.clone());
            let delay = self.delays.lock().unwrap().get(&query).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(TextSearchResponse {
                products: vec![result_for(&query)],
                categories: vec![],
                collections: vec![],
                suggestions: vec![query],
            })
        }

        async fn search_image(
            &self,
            bytes: Vec<u8>,
            _mime: Option<String>,
            _limit: usize,
        ) -> Result<ImageSearchResponse, ClientError> {
            self.calls.lock().unwrap().push(format!("image:{}", bytes.len()));
            Ok(ImageSearchResponse {
                products: vec![result_for("image")],
                metadata: ImageSearchMetadata {
                    total: 1,
                    threshold: 0.55,
                    embedding_dimensions: 512,
                },
            })
        }
    }

    fn orchestrator(transport: Arc<FakeTransport>) -> QueryOrchestrator<Arc<FakeTransport>> {
        QueryOrchestrator::new(transport, OrchestratorOptions::default())
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_typing_sends_one_request() {
        let transport = Arc::new(FakeTransport::default());
        let orch = orchestrator(transport.clone());

        orch.search_text("to");
        tokio::time::sleep(Duration::from_millis(60)).await;
        orch.search_text("toy");
        assert_eq!(orch.state().status, Status::Loading);

        settle().await;
        assert_eq!(transport.calls(), vec!["toy"]);

        let state = orch.state();
        assert_eq!(state.status, Status::Ready);
        assert_eq!(state.results.suggestions, vec!["toy"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_within_debounce_does_not_reschedule() {
        let transport = Arc::new(FakeTransport::default());
        let orch = orchestrator(transport.clone());

        orch.search_text("toy");
        tokio::time::sleep(Duration::from_millis(100)).await;
        orch.search_text(" TOY ");
        settle().await;

        assert_eq!(transport.calls(), vec!["toy"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_renders_without_network() {
        let transport = Arc::new(FakeTransport::default());
        let orch = orchestrator(transport.clone());

        orch.search_text("robot");
        settle().await;
        orch.search_text("kite");
        settle().await;

        orch.search_text("Robot");
        let state = orch.state();
        assert_eq!(state.status, Status::Ready);
        assert_eq!(state.results.suggestions, vec!["robot"]);
        settle().await;
        assert_eq!(transport.calls(), vec!["robot", "kite"]);
        assert_eq!(orch.cached_entries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_on_hit_fetches_in_background() {
        let transport = Arc::new(FakeTransport::default());
        let orch = QueryOrchestrator::new(
            transport.clone(),
            OrchestratorOptions {
                refresh_on_hit: true,
                ..Default::default()
            },
        );

        orch.search_text("robot");
        settle().await;
        orch.search_text("kite");
        settle().await;
        orch.search_text("robot");
        assert_eq!(orch.state().status, Status::Ready);
        settle().await;

        assert_eq!(transport.calls(), vec!["robot", "kite", "robot"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_stale_response_never_renders() {
        let transport = Arc::new(FakeTransport::default());
        transport
            .delays
            .lock()
            .unwrap()
            .insert("slow".to_string(), Duration::from_millis(800));
        let orch = orchestrator(transport.clone());

        orch.search_text("slow");
        // past the debounce, so "slow" is in flight
        tokio::time::sleep(Duration::from_millis(300)).await;
        orch.search_text("fast");
        settle().await;

        assert_eq!(transport.calls(), vec!["slow", "fast"]);
        let state = orch.state();
        assert_eq!(state.results.suggestions, vec!["fast"]);
        // the aborted request never reached the cache either
        assert_eq!(orch.cached_entries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_sequence_is_discarded() {
        let transport = Arc::new(FakeTransport::default());
        let orch = orchestrator(transport.clone());

        let published = orch.inner.publish_if_latest(
            0,
            SearchState {
                status: Status::Ready,
                ..Default::default()
            },
        );
        assert!(published);

        orch.search_text("toy");
        let stale = orch.inner.publish_if_latest(
            0,
            SearchState {
                status: Status::Failed,
                ..Default::default()
            },
        );
        assert!(!stale);
        assert_eq!(orch.state().status, Status::Loading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_query_goes_idle_without_request() {
        let transport = Arc::new(FakeTransport::default());
        let orch = orchestrator(transport.clone());

        orch.search_text("toy");
        orch.search_text("   ");
        settle().await;

        assert!(transport.calls().is_empty());
        assert_eq!(orch.state().status, Status::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let transport = Arc::new(FakeTransport::default());
        transport.failures.lock().unwrap().extend([
            ClientError::Search(SearchError::EncodingTimeout),
            ClientError::Network("connection reset".to_string()),
        ]);
        let orch = orchestrator(transport.clone());

        orch.search_text("toy");
        settle().await;

        assert_eq!(transport.calls().len(), 3);
        assert_eq!(orch.state().status, Status::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let transport = Arc::new(FakeTransport::default());
        transport
            .failures
            .lock()
            .unwrap()
            .push_back(ClientError::Search(SearchError::InvalidInput(
                "Please enter a search term.".to_string(),
            )));
        let orch = orchestrator(transport.clone());

        orch.search_text("toy");
        settle().await;

        assert_eq!(transport.calls().len(), 1);
        let state = orch.state();
        assert_eq!(state.status, Status::Failed);
        assert!(state.results.products.is_empty());
        assert!(matches!(
            state.error,
            Some(ClientError::Search(SearchError::InvalidInput(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_search_skips_debounce_and_replaces_text() {
        let transport = Arc::new(FakeTransport::default());
        let orch = orchestrator(transport.clone());

        orch.search_text("robot");
        orch.search_image(vec![1, 2, 3], Some("image/png".to_string()));
        // no debounce: the request goes out right away
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.calls(), vec!["image:3"]);

        settle().await;
        let state = orch.state();
        assert_eq!(state.status, Status::Ready);
        assert_eq!(state.results.products[0].product.title, "image");
        assert!(state.results.categories.is_empty());
        assert!(state.results.suggestions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_see_final_state() {
        let transport = Arc::new(FakeTransport::default());
        let orch = orchestrator(transport.clone());
        let mut rx = orch.subscribe();

        orch.search_text("toy");
        let state = rx
            .wait_for(|s| s.status == Status::Ready)
            .await
            .unwrap()
            .clone();
        assert_eq!(state.results.suggestions, vec!["toy"]);
    }
}

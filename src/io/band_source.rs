use crate::types::{Band, BandName, BandSet, CloudError, CloudResult, Collection, GeoBox, Raster};
use chrono::NaiveDate;
use ndarray::ArrayView2;
use num_traits::ToPrimitive;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::Notify;

/// Digital numbers per unit reflectance
pub const QUANTIFICATION_VALUE: f64 = 10_000.0;

/// Radiometric offset applied to products from the 2022 processing baseline onward
pub const RADIOMETRIC_OFFSET: f64 = 1_000.0;

/// First acquisition date carrying the radiometric offset
pub fn calibration_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(2022, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// Convert raw digital numbers to reflectance fractions
///
/// Acquisitions on or after 2022-01-01 are `(raw - 1000) / 10000`, earlier
/// ones `raw / 10000`.
pub fn calibrate_digital_numbers<T>(raw: ArrayView2<T>, acquired: NaiveDate) -> Raster
where
    T: ToPrimitive + Copy,
{
    let offset = if acquired >= calibration_epoch() {
        RADIOMETRIC_OFFSET
    } else {
        0.0
    };
    raw.mapv(|dn| match dn.to_f64() {
        Some(v) => ((v - offset) / QUANTIFICATION_VALUE) as f32,
        None => f32::NAN,
    })
}

/// One band acquisition request
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub collection: Collection,
    pub date: NaiveDate,
    pub area: GeoBox,
    pub bands: Vec<BandName>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation shared between a caller and an in-flight fetch
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Source of calibrated band rasters
///
/// Implementations return reflectance, not digital numbers (see
/// [`calibrate_digital_numbers`]), and should check `cancel` between
/// expensive steps.
pub trait BandSource: Send + Sync {
    fn fetch(&self, request: &FetchRequest, cancel: &CancelHandle) -> CloudResult<BandSet>;
}

/// Run `source.fetch` on a blocking worker, bounded by `timeout` and `cancel`
///
/// The worker gets its own cancel handle, which is cancelled once the
/// deadline passes or the caller cancels, so an abandoned source can stop
/// early. From synchronous code a private runtime drives the wait; inside a
/// multi-threaded tokio runtime the current worker is handed over with
/// `block_in_place`. A current-thread runtime cannot block and is rejected
/// with `InvalidConfiguration`. An empty band set counts as `NotFound`.
pub fn fetch_with_deadline(
    source: Arc<dyn BandSource>,
    request: &FetchRequest,
    timeout: Duration,
    cancel: &CancelHandle,
) -> CloudResult<BandSet> {
    if cancel.is_cancelled() {
        return Err(CloudError::Cancelled);
    }

    log::info!(
        "Fetching {} bands from {} for {} (timeout {:?})",
        request.bands.len(),
        request.collection,
        request.date,
        timeout
    );

    let result = match Handle::try_current() {
        Ok(handle) => match handle.runtime_flavor() {
            RuntimeFlavor::MultiThread => tokio::task::block_in_place(|| {
                handle.block_on(race_fetch(source, request.clone(), timeout, cancel))
            }),
            flavor => {
                return Err(CloudError::InvalidConfiguration(format!(
                    "Band acquisition needs a multi-threaded runtime, called from {:?}",
                    flavor
                )))
            }
        },
        Err(_) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()?;
            let result = runtime.block_on(race_fetch(source, request.clone(), timeout, cancel));
            // An abandoned fetch keeps its worker thread; do not wait for it
            runtime.shutdown_background();
            result
        }
    };

    let bands = result?;
    if bands.is_empty() {
        return Err(CloudError::NotFound(format!(
            "No {} data for {} in {:?}",
            request.collection, request.date, request.area
        )));
    }
    log::debug!(
        "Fetched bands: {:?}",
        bands.names().map(|n| n.as_str()).collect::<Vec<_>>()
    );
    Ok(bands)
}

async fn race_fetch(
    source: Arc<dyn BandSource>,
    request: FetchRequest,
    timeout: Duration,
    cancel: &CancelHandle,
) -> CloudResult<BandSet> {
    let worker_cancel = CancelHandle::new();
    let task = {
        let worker_cancel = worker_cancel.clone();
        tokio::task::spawn_blocking(move || source.fetch(&request, &worker_cancel))
    };

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CloudError::Cancelled),
        joined = tokio::time::timeout(timeout, task) => match joined {
            Err(_) => Err(CloudError::Timeout(timeout)),
            Ok(Err(e)) => Err(CloudError::Transport(format!("Band source worker failed: {}", e))),
            Ok(Ok(fetched)) => fetched,
        },
    };
    if matches!(result, Err(CloudError::Cancelled) | Err(CloudError::Timeout(_))) {
        log::warn!("Abandoning in-flight band fetch");
        worker_cancel.cancel();
    }
    result
}

/// Band source backed by prepared band sets, keyed by collection and date
#[derive(Debug, Default)]
pub struct InMemoryBandSource {
    scenes: HashMap<(Collection, NaiveDate), BandSet>,
}

impl InMemoryBandSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, collection: Collection, date: NaiveDate, bands: BandSet) {
        self.scenes.insert((collection, date), bands);
    }
}

impl BandSource for InMemoryBandSource {
    fn fetch(&self, request: &FetchRequest, cancel: &CancelHandle) -> CloudResult<BandSet> {
        if cancel.is_cancelled() {
            return Err(CloudError::Cancelled);
        }
        let scene = self
            .scenes
            .get(&(request.collection, request.date))
            .ok_or_else(|| {
                CloudError::NotFound(format!(
                    "Collection can not be found for {} on {}",
                    request.collection, request.date
                ))
            })?;

        let mut bands = BandSet::new();
        for name in &request.bands {
            if let Some(band) = scene.get(name) {
                bands.insert(Band::new(band.name.clone(), band.data.clone()))?;
            }
        }
        Ok(bands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::band_names;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use std::time::Instant;

    fn request(date: NaiveDate) -> FetchRequest {
        FetchRequest {
            collection: Collection::L2A,
            date,
            area: GeoBox::new(14.55, 14.79, 55.99, 56.10).unwrap(),
            bands: band_names(&["B02", "B03"]).unwrap(),
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    struct SlowSource(Duration);

    impl BandSource for SlowSource {
        fn fetch(&self, _request: &FetchRequest, cancel: &CancelHandle) -> CloudResult<BandSet> {
            let start = Instant::now();
            while start.elapsed() < self.0 {
                if cancel.is_cancelled() {
                    return Err(CloudError::Cancelled);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(BandSet::new())
        }
    }

    struct FailingSource;

    impl BandSource for FailingSource {
        fn fetch(&self, _request: &FetchRequest, _cancel: &CancelHandle) -> CloudResult<BandSet> {
            Err(CloudError::Transport("connection reset".to_string()))
        }
    }

    #[test]
    fn test_calibration_epoch_rule() {
        let raw = Array2::from_elem((2, 2), 3000u16);
        let before = calibrate_digital_numbers(raw.view(), date(2021, 12, 31));
        let on = calibrate_digital_numbers(raw.view(), date(2022, 1, 1));
        assert_abs_diff_eq!(before[[0, 0]], 0.3, epsilon = 1e-6);
        assert_abs_diff_eq!(on[[0, 0]], 0.2, epsilon = 1e-6);

        // Dark pixels can go negative after the offset
        let dark = Array2::from_elem((1, 1), 500.0f64);
        let value = calibrate_digital_numbers(dark.view(), date(2024, 9, 4));
        assert_abs_diff_eq!(value[[0, 0]], -0.05, epsilon = 1e-6);
    }

    #[test]
    fn test_in_memory_source_serves_requested_bands() {
        let mut scene = BandSet::new();
        for name in ["B02", "B03", "B04"] {
            scene
                .insert(Band::new(BandName::parse(name).unwrap(), Array2::zeros((4, 4))))
                .unwrap();
        }
        let mut source = InMemoryBandSource::new();
        source.insert(Collection::L2A, date(2022, 6, 1), scene);

        let bands = source.fetch(&request(date(2022, 6, 1)), &CancelHandle::new()).unwrap();
        assert_eq!(bands.len(), 2);
        assert!(!bands.contains(&BandName::parse("B04").unwrap()));

        let missing = source.fetch(&request(date(2022, 6, 2)), &CancelHandle::new());
        assert!(matches!(missing, Err(CloudError::NotFound(_))));
    }

    #[test]
    fn test_empty_result_is_not_found() {
        let source: Arc<dyn BandSource> = Arc::new(SlowSource(Duration::ZERO));
        let result = fetch_with_deadline(
            source,
            &request(date(2022, 6, 1)),
            Duration::from_secs(5),
            &CancelHandle::new(),
        );
        assert!(matches!(result, Err(CloudError::NotFound(_))));
    }

    /// Polls its cancel handle for up to two seconds and records what it saw
    #[derive(Default)]
    struct WatchedSource {
        saw_cancel: Arc<AtomicBool>,
        done: Arc<AtomicBool>,
    }

    impl BandSource for WatchedSource {
        fn fetch(&self, _request: &FetchRequest, cancel: &CancelHandle) -> CloudResult<BandSet> {
            let start = Instant::now();
            let outcome = loop {
                if cancel.is_cancelled() {
                    self.saw_cancel.store(true, Ordering::SeqCst);
                    break Err(CloudError::Cancelled);
                }
                if start.elapsed() > Duration::from_secs(2) {
                    break Ok(BandSet::new());
                }
                std::thread::sleep(Duration::from_millis(5));
            };
            self.done.store(true, Ordering::SeqCst);
            outcome
        }
    }

    fn wait_for(flag: &AtomicBool, limit: Duration) -> bool {
        let start = Instant::now();
        while !flag.load(Ordering::SeqCst) && start.elapsed() < limit {
            std::thread::sleep(Duration::from_millis(5));
        }
        flag.load(Ordering::SeqCst)
    }

    #[test]
    fn test_timeout_stops_worker() {
        let source = Arc::new(WatchedSource::default());
        let saw_cancel = Arc::clone(&source.saw_cancel);
        let done = Arc::clone(&source.done);
        let cancel = CancelHandle::new();

        let start = Instant::now();
        let result = fetch_with_deadline(
            source,
            &request(date(2022, 6, 1)),
            Duration::from_millis(50),
            &cancel,
        );
        assert!(matches!(result, Err(CloudError::Timeout(_))));
        assert!(start.elapsed() < Duration::from_secs(2));

        // The worker is told to stop well before it would finish on its own
        assert!(wait_for(&done, Duration::from_millis(500)));
        assert!(saw_cancel.load(Ordering::SeqCst));
        // The caller's handle is left alone
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fetch_inside_multi_thread_runtime() {
        let mut scene = BandSet::new();
        for name in ["B02", "B03"] {
            scene
                .insert(Band::new(BandName::parse(name).unwrap(), Array2::zeros((2, 2))))
                .unwrap();
        }
        let mut source = InMemoryBandSource::new();
        source.insert(Collection::L2A, date(2022, 6, 1), scene);

        let bands = fetch_with_deadline(
            Arc::new(source),
            &request(date(2022, 6, 1)),
            Duration::from_secs(5),
            &CancelHandle::new(),
        )
        .unwrap();
        assert_eq!(bands.len(), 2);

        let slow: Arc<dyn BandSource> = Arc::new(SlowSource(Duration::from_secs(2)));
        let result = fetch_with_deadline(
            slow,
            &request(date(2022, 6, 1)),
            Duration::from_millis(50),
            &CancelHandle::new(),
        );
        assert!(matches!(result, Err(CloudError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_fetch_inside_current_thread_runtime_rejected() {
        let source: Arc<dyn BandSource> = Arc::new(SlowSource(Duration::ZERO));
        let result = fetch_with_deadline(
            source,
            &request(date(2022, 6, 1)),
            Duration::from_secs(1),
            &CancelHandle::new(),
        );
        assert!(matches!(result, Err(CloudError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_cancellation_aborts_fetch() {
        let source = Arc::new(WatchedSource::default());
        let saw_cancel = Arc::clone(&source.saw_cancel);
        let cancel = CancelHandle::new();
        let trigger = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            trigger.cancel();
        });

        let start = Instant::now();
        let result = fetch_with_deadline(
            source,
            &request(date(2022, 6, 1)),
            Duration::from_secs(30),
            &cancel,
        );
        canceller.join().unwrap();
        assert!(matches!(result, Err(CloudError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(wait_for(&saw_cancel, Duration::from_millis(500)));
    }

    #[test]
    fn test_already_cancelled() {
        let cancel = CancelHandle::new();
        cancel.cancel();
        let source: Arc<dyn BandSource> = Arc::new(SlowSource(Duration::ZERO));
        let result = fetch_with_deadline(source, &request(date(2022, 6, 1)), Duration::from_secs(1), &cancel);
        assert!(matches!(result, Err(CloudError::Cancelled)));
    }

    #[test]
    fn test_transport_error_propagates() {
        let source: Arc<dyn BandSource> = Arc::new(FailingSource);
        let result = fetch_with_deadline(
            source,
            &request(date(2022, 6, 1)),
            Duration::from_secs(1),
            &CancelHandle::new(),
        );
        assert!(matches!(result, Err(CloudError::Transport(_))));
    }
}

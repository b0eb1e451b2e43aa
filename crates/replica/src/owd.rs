use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Per-proxy one-way-delay estimation.
///
/// The receiver samples how much headroom each request arrived with; the
/// OWD worker folds samples into a sliding window per proxy and publishes
/// the window maximum once the window is full. The published figure rides
/// on replies so proxies can tune the deadlines they stamp. A maximum over
/// a full window is deliberately conservative: under-estimating pushes
/// requests onto the late path, over-estimating only costs latency.
pub struct OwdEstimator {
    window_len: usize,
    windows: Mutex<HashMap<u64, VecDeque<u32>>>,
    published: DashMap<u64, u32>,
    sample_counts: Mutex<HashMap<u64, u64>>,
}

impl OwdEstimator {
    pub fn new(window_len: usize) -> Self {
        Self {
            window_len,
            windows: Mutex::new(HashMap::new()),
            published: DashMap::new(),
            sample_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Fold one sample (microseconds) for `proxy_id` into its window.
    pub fn observe(&self, proxy_id: u64, sample_us: u32) {
        let mut windows = self.windows.lock();
        let window = windows.entry(proxy_id).or_default();
        window.push_back(sample_us);
        if window.len() > self.window_len {
            window.pop_front();
        }
        if window.len() == self.window_len {
            if let Some(max) = window.iter().copied().max() {
                self.published.insert(proxy_id, max);
            }
        }
        drop(windows);

        *self.sample_counts.lock().entry(proxy_id).or_insert(0) += 1;
    }

    /// The current estimate for `proxy_id`, if its window has ever filled.
    pub fn estimate(&self, proxy_id: u64) -> Option<u32> {
        self.published.get(&proxy_id).map(|v| *v)
    }

    pub fn samples_seen(&self, proxy_id: u64) -> u64 {
        self.sample_counts
            .lock()
            .get(&proxy_id)
            .copied()
            .unwrap_or(0)
    }
}

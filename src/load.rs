use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::cancel::CancelToken;
use crate::store::LoadStore;
use crate::system::SystemProbe;

/// The system load at one moment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadSample {
    /// Seconds since the Unix epoch.
    pub time: i64,
    /// 1, 5 and 15 minute load averages.
    pub load: [f64; 3],
}

impl LoadSample {
    /// A sample of `load` taken now.
    pub fn now(load: [f64; 3]) -> Self {
        LoadSample {
            time: chrono::Utc::now().timestamp(),
            load,
        }
    }
}

/// The most recent load samples, oldest first.
#[derive(Debug, Clone)]
pub struct LoadHistory {
    samples: VecDeque<LoadSample>,
    capacity: usize,
}

impl LoadHistory {
    /// A history that remembers at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        LoadHistory {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a sample, forgetting the oldest one if full.
    pub fn push(&mut self, sample: LoadSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// The newest sample.
    pub fn latest(&self) -> Option<&LoadSample> {
        self.samples.back()
    }

    /// Walk the samples from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &LoadSample> + '_ {
        self.samples.iter()
    }

    /// Number of samples held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of samples held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Extend<LoadSample> for LoadHistory {
    fn extend<T: IntoIterator<Item = LoadSample>>(&mut self, iter: T) {
        for s in iter {
            self.push(s);
        }
    }
}

/// Periodically samples system load into a shared [`LoadHistory`].
#[derive(Debug)]
pub struct LoadMonitor {
    history: Arc<RwLock<LoadHistory>>,
    probe: Arc<dyn SystemProbe>,
    store: Option<LoadStore>,
    sample_period: Duration,
    write_period: Duration,
}

impl LoadMonitor {
    /// Sample `probe` into `history` every `sample_period`.
    pub fn new(history: Arc<RwLock<LoadHistory>>, probe: Arc<dyn SystemProbe>, sample_period: Duration) -> Self {
        LoadMonitor {
            history,
            probe,
            store: None,
            sample_period,
            write_period: Duration::from_secs(600),
        }
    }

    /// Also append samples to `store` every `write_period`, and once more on exit.
    pub fn persist_to(mut self, store: LoadStore, write_period: Duration) -> Self {
        self.store = Some(store);
        self.write_period = write_period;
        self
    }

    /// Run on a thread of its own until `quit` is cancelled.
    pub fn spawn(self, quit: CancelToken) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("load-monitor".to_string())
            .spawn(move || self.run(&quit))
    }

    /// Sample until `quit` is cancelled.
    pub fn run(self, quit: &CancelToken) {
        let mut pending = Vec::new();
        let mut last_write = Instant::now();
        loop {
            let sample = LoadSample::now(self.probe.load_average());
            trace!(load1 = sample.load[0], load5 = sample.load[1], load15 = sample.load[2], "sampled load");
            self.history.write().push(sample);
            pending.push(sample);

            if last_write.elapsed() >= self.write_period {
                self.flush(&mut pending);
                last_write = Instant::now();
            }
            if quit.wait_timeout(self.sample_period) {
                break;
            }
        }
        self.flush(&mut pending);
        debug!("load monitor stopped");
    }

    fn flush(&self, pending: &mut Vec<LoadSample>) {
        let store = match self.store {
            Some(ref s) => s,
            None => {
                pending.clear();
                return;
            }
        };
        if pending.is_empty() {
            return;
        }
        match store.append(pending) {
            Ok(()) => {
                debug!(samples = pending.len(), path = %store.path().display(), "wrote load history");
                pending.clear();
            }
            // keep them around for the next attempt
            Err(e) => error!(error = %e, "failed to write load history"),
        }
    }
}

#[cfg(test)]
fn sample(t: i64) -> LoadSample {
    LoadSample {
        time: t,
        load: [t as f64, 0.0, 0.0],
    }
}

#[test]
fn history_is_circular() {
    let mut h = LoadHistory::new(3);
    h.extend((0..5).map(sample));
    assert_eq!(h.len(), 3);
    assert_eq!(h.iter().map(|s| s.time).collect::<Vec<_>>(), vec![2, 3, 4]);
    assert_eq!(h.latest().unwrap().time, 4);
    assert_eq!(h.capacity(), 3);
}

#[test]
fn zero_capacity_holds_one() {
    let mut h = LoadHistory::new(0);
    h.push(sample(1));
    h.push(sample(2));
    assert_eq!(h.len(), 1);
    assert_eq!(h.latest().unwrap().time, 2);
}

#[test]
fn monitor_samples_and_persists() {
    use crate::system::FixedProbe;

    let dir = tempfile::tempdir().unwrap();
    let store = LoadStore::new(dir.path().join("load.jsonl"));
    let history = Arc::new(RwLock::new(LoadHistory::new(1000)));
    let probe = Arc::new(FixedProbe {
        load: [0.5, 0.25, 0.125],
        users: None,
    });
    let quit = CancelToken::new();
    let monitor = LoadMonitor::new(Arc::clone(&history), probe, Duration::from_millis(5))
        .persist_to(store.clone(), Duration::from_secs(3600));
    let t = monitor.spawn(quit.clone()).unwrap();
    while history.read().len() < 3 {
        thread::sleep(Duration::from_millis(1));
    }
    quit.cancel();
    t.join().unwrap();

    let n = history.read().len();
    assert!(n >= 3);
    assert_eq!(history.read().latest().unwrap().load, [0.5, 0.25, 0.125]);
    // everything is flushed on the way out
    assert_eq!(store.read_all().unwrap().len(), n);
}

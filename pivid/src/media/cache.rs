//! Rolling per-media windows of decoded frames, keyed by presentation time.
//!
//! Each `(path, seek)` pair gets at most one decoder worker; requests for
//! coverage re-target the running worker instead of starting another. The
//! runner prunes every key below the oldest pts it still references, and a
//! byte budget evicts least-recently-requested keys' oldest frames. Because
//! frames are reference-counted, eviction only drops the cache's handle;
//! buffers still on screen or in flight survive until their consumers let go.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::foundation::clock::{Clock, Flag};
use crate::foundation::error::{ErrorKind, PividResult};
use crate::foundation::lock;
use crate::foundation::time::{MediaTime, SteadyTime};
use crate::media::{DecodedFrame, MediaInfo, MediaOpener};

/// One decode pipeline identity: the media path plus its seek phase.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MediaKey {
    pub path: String,
    pub seek: MediaTime,
}

impl MediaKey {
    pub fn new(path: impl Into<String>, seek: MediaTime) -> Self {
        Self {
            path: path.into(),
            seek,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Hard budget across all keys; exceeding it evicts LRU frames.
    pub max_bytes: Option<usize>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_bytes: Some(256 * 1024 * 1024),
        }
    }
}

/// Snapshot answer to a coverage request.
#[derive(Clone, Debug, Default)]
pub struct Coverage {
    /// Cached frames with pts inside the requested window, ascending.
    pub frames: Vec<DecodedFrame>,
    /// Highest pts the decoder has produced so far, if any.
    pub have_until: Option<MediaTime>,
    /// The stream is exhausted (or its decoder gave up).
    pub at_eof: bool,
}

impl Coverage {
    /// Newest frame with `pts <= wanted`, the one a vsync at `wanted` shows.
    pub fn best_at_or_before(&self, wanted: MediaTime) -> Option<&DecodedFrame> {
        let idx = self.frames.partition_point(|f| f.pts <= wanted);
        idx.checked_sub(1).map(|i| &self.frames[i])
    }
}

struct KeyState {
    frames: BTreeMap<MediaTime, DecodedFrame>,
    bytes: usize,
    have_until: Option<MediaTime>,
    eof: bool,
    want_until: MediaTime,
    last_used: SteadyTime,
    shutdown: bool,
}

struct KeyEntry {
    key: MediaKey,
    state: Mutex<KeyState>,
    demand: Flag,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct CacheShared {
    clock: Arc<dyn Clock>,
    opener: Arc<dyn MediaOpener>,
    opts: CacheOptions,
    // Lock order: `keys` before any entry's `state`, never the reverse.
    keys: Mutex<HashMap<MediaKey, Arc<KeyEntry>>>,
    infos: Mutex<HashMap<String, MediaInfo>>,
}

pub struct FrameCache {
    shared: Arc<CacheShared>,
}

impl FrameCache {
    pub fn new(
        clock: Arc<dyn Clock>,
        opener: Arc<dyn MediaOpener>,
        opts: CacheOptions,
    ) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                clock,
                opener,
                opts,
                keys: Mutex::new(HashMap::new()),
                infos: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Media metadata, probed once and remembered.
    pub fn media_info(&self, path: &str) -> PividResult<MediaInfo> {
        {
            let infos = lock(&self.shared.infos);
            if let Some(info) = infos.get(path) {
                return Ok(info.clone());
            }
        }
        let info = self.shared.opener.probe(path)?;
        lock(&self.shared.infos).insert(path.to_owned(), info.clone());
        Ok(info)
    }

    /// Cached frames with `lo <= pts <= hi`, plus horizon and EOF state.
    ///
    /// Ensures a decoder worker is pulling forward whenever the horizon is
    /// below `hi`.
    pub fn frames_in(&self, key: &MediaKey, lo: MediaTime, hi: MediaTime) -> Coverage {
        let entry = self.ensure_entry(key);
        let coverage;
        {
            let mut st = lock(&entry.state);
            st.last_used = self.shared.clock.steady_time();
            if hi > st.want_until {
                st.want_until = hi;
                entry.demand.set();
            }
            coverage = Coverage {
                frames: st.frames.range(lo..=hi).map(|(_, f)| f.clone()).collect(),
                have_until: st.have_until,
                at_eof: st.eof,
            };
        }
        CacheShared::enforce_budget(&self.shared);
        coverage
    }

    /// Drop cached frames below `keep_after` for one key.
    pub fn prune(&self, key: &MediaKey, keep_after: MediaTime) {
        let entry = {
            let keys = lock(&self.shared.keys);
            keys.get(key).cloned()
        };
        let Some(entry) = entry else { return };
        let mut st = lock(&entry.state);
        let keep = st.frames.split_off(&keep_after);
        let dropped: usize = st.frames.values().map(|f| f.buffer.size_bytes()).sum();
        st.bytes -= dropped;
        st.frames = keep;
    }

    /// Total cached bytes across all keys.
    pub fn cached_bytes(&self) -> usize {
        let keys = lock(&self.shared.keys);
        keys.values().map(|e| lock(&e.state).bytes).sum()
    }

    /// Cached frame count for one key.
    pub fn frame_count(&self, key: &MediaKey) -> usize {
        let keys = lock(&self.shared.keys);
        keys.get(key).map_or(0, |e| lock(&e.state).frames.len())
    }

    /// Every key with a live decode pipeline.
    pub fn keys(&self) -> Vec<MediaKey> {
        let keys = lock(&self.shared.keys);
        keys.keys().cloned().collect()
    }

    fn ensure_entry(&self, key: &MediaKey) -> Arc<KeyEntry> {
        let mut keys = lock(&self.shared.keys);
        if let Some(entry) = keys.get(key) {
            return Arc::clone(entry);
        }

        let entry = Arc::new(KeyEntry {
            key: key.clone(),
            state: Mutex::new(KeyState {
                frames: BTreeMap::new(),
                bytes: 0,
                have_until: None,
                eof: false,
                want_until: MediaTime::ZERO,
                last_used: self.shared.clock.steady_time(),
                shutdown: false,
            }),
            demand: Flag::new(Arc::clone(&self.shared.clock)),
            worker: Mutex::new(None),
        });
        keys.insert(key.clone(), Arc::clone(&entry));

        let worker_entry = Arc::clone(&entry);
        let shared = Arc::downgrade(&self.shared);
        let handle = std::thread::spawn(move || decoder_worker(worker_entry, shared));
        *lock(&entry.worker) = Some(handle);
        entry
    }
}

impl CacheShared {
    /// Evict least-recently-requested keys' oldest frames over budget.
    fn enforce_budget(shared: &Arc<CacheShared>) {
        let Some(max) = shared.opts.max_bytes else {
            return;
        };
        loop {
            let mut total = 0usize;
            let mut victim: Option<Arc<KeyEntry>> = None;
            let mut victim_used = SteadyTime::ZERO;
            {
                let keys = lock(&shared.keys);
                for entry in keys.values() {
                    let st = lock(&entry.state);
                    total += st.bytes;
                    if !st.frames.is_empty()
                        && (victim.is_none() || st.last_used < victim_used)
                    {
                        victim_used = st.last_used;
                        victim = Some(Arc::clone(entry));
                    }
                }
            }
            if total <= max {
                return;
            }
            let Some(victim) = victim else { return };
            let mut st = lock(&victim.state);
            if let Some((pts, frame)) = st.frames.pop_first() {
                st.bytes -= frame.buffer.size_bytes();
                tracing::debug!(
                    key = %victim.key.path,
                    pts = pts.as_secs_f64(),
                    "budget eviction"
                );
            } else {
                return;
            }
        }
    }

    /// Drop every cached frame nothing else references. Used when a decoder
    /// hits `OutOfMemory` and needs buffers returned right now.
    fn evict_for_oom(shared: &Arc<CacheShared>) {
        let entries: Vec<Arc<KeyEntry>> = {
            let keys = lock(&shared.keys);
            keys.values().cloned().collect()
        };
        for entry in entries {
            let mut st = lock(&entry.state);
            let before = st.frames.len();
            st.frames.retain(|_, f| f.buffer.handle_count() > 1);
            let kept: usize = st.frames.values().map(|f| f.buffer.size_bytes()).sum();
            st.bytes = kept;
            if st.frames.len() != before {
                tracing::warn!(
                    key = %entry.key.path,
                    dropped = before - st.frames.len(),
                    "emergency eviction"
                );
            }
        }
    }
}

impl Drop for FrameCache {
    fn drop(&mut self) {
        let entries: Vec<Arc<KeyEntry>> = {
            let mut keys = lock(&self.shared.keys);
            keys.drain().map(|(_, e)| e).collect()
        };
        for entry in &entries {
            lock(&entry.state).shutdown = true;
            entry.demand.set();
        }
        for entry in &entries {
            if let Some(handle) = lock(&entry.worker).take() {
                let _ = handle.join();
            }
        }
    }
}

/// Retry backoff when the decoder has no frame ready yet.
const DECODE_POLL_INTERVAL: Duration = Duration::from_millis(2);

fn decoder_worker(entry: Arc<KeyEntry>, shared: Weak<CacheShared>) {
    let (clock, opener) = match shared.upgrade() {
        Some(s) => (Arc::clone(&s.clock), Arc::clone(&s.opener)),
        None => return,
    };

    let mut decoder = match opener.open(&entry.key.path, entry.key.seek) {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(key = %entry.key.path, "media open failed: {e}");
            let mut st = lock(&entry.state);
            st.eof = true;
            return;
        }
    };
    tracing::debug!(
        key = %entry.key.path,
        seek = entry.key.seek.as_secs_f64(),
        "decoder worker running"
    );

    let mut oom_retried = false;
    loop {
        // Park until the horizon falls short of demand.
        loop {
            {
                let st = lock(&entry.state);
                if st.shutdown {
                    return;
                }
                let behind = st
                    .have_until
                    .map_or(true, |have| have < st.want_until);
                if !st.eof && behind {
                    break;
                }
            }
            entry.demand.wait();
        }

        match decoder.next_frame() {
            Ok(Some(frame)) => {
                let mut st = lock(&entry.state);
                st.bytes += frame.buffer.size_bytes();
                st.have_until = Some(st.have_until.map_or(frame.pts, |h| h.max(frame.pts)));
                st.frames.insert(frame.pts, frame);
                drop(st);
                oom_retried = false;
                if let Some(s) = shared.upgrade() {
                    CacheShared::enforce_budget(&s);
                }
            }
            Ok(None) => {
                if decoder.at_eof() {
                    lock(&entry.state).eof = true;
                } else {
                    entry
                        .demand
                        .wait_until(clock.steady_time() + DECODE_POLL_INTERVAL);
                }
            }
            Err(e) => match e.kind() {
                ErrorKind::Decode => {
                    tracing::warn!(key = %entry.key.path, "frame skipped: {e}");
                }
                ErrorKind::OutOfMemory if !oom_retried => {
                    oom_retried = true;
                    tracing::warn!(key = %entry.key.path, "decoder out of memory, evicting");
                    if let Some(s) = shared.upgrade() {
                        CacheShared::evict_for_oom(&s);
                    }
                }
                _ => {
                    // Includes the second OutOfMemory in a row, which the
                    // error design escalates to an i/o failure.
                    tracing::error!(key = %entry.key.path, "decoder gave up: {e}");
                    let mut st = lock(&entry.state);
                    st.eof = true;
                    return;
                }
            },
        }
    }
}

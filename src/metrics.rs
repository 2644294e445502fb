use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct Metrics {
    pub doc_reads_total: AtomicU64,
    pub doc_writes_total: AtomicU64,
    pub doc_conflicts_total: AtomicU64,
    pub session_cache_hits_total: AtomicU64,
    pub included_docs_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            doc_reads_total: AtomicU64::new(0),
            doc_writes_total: AtomicU64::new(0),
            doc_conflicts_total: AtomicU64::new(0),
            session_cache_hits_total: AtomicU64::new(0),
            included_docs_total: AtomicU64::new(0),
        }
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

pub(crate) fn record_doc_reads(count: u64) {
    metrics().doc_reads_total.fetch_add(count, Ordering::Relaxed);
}

pub(crate) fn record_doc_writes(count: u64) {
    metrics().doc_writes_total.fetch_add(count, Ordering::Relaxed);
}

pub(crate) fn record_doc_conflicts(count: u64) {
    metrics()
        .doc_conflicts_total
        .fetch_add(count, Ordering::Relaxed);
}

pub(crate) fn record_cache_hits(count: u64) {
    metrics()
        .session_cache_hits_total
        .fetch_add(count, Ordering::Relaxed);
}

pub(crate) fn record_included_docs(count: u64) {
    metrics()
        .included_docs_total
        .fetch_add(count, Ordering::Relaxed);
}

pub fn render_prometheus() -> String {
    let m = metrics();
    let mut s = String::new();
    let _ = writeln!(
        s,
        "# TYPE doc_reads_total counter\ndoc_reads_total {}",
        m.doc_reads_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE doc_writes_total counter\ndoc_writes_total {}",
        m.doc_writes_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE doc_conflicts_total counter\ndoc_conflicts_total {}",
        m.doc_conflicts_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE session_cache_hits_total counter\nsession_cache_hits_total {}",
        m.session_cache_hits_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE included_docs_total counter\nincluded_docs_total {}",
        m.included_docs_total.load(Ordering::Relaxed)
    );
    s
}

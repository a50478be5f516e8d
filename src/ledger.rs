use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

/// Output device classes the ledger attributes time to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    Speaker,
    Other,
    SpeakerAndOther,
}

pub const DEVICE_CLASSES: usize = 3;

impl DeviceClass {
    pub fn index(self) -> usize {
        match self {
            DeviceClass::Speaker => 0,
            DeviceClass::Other => 1,
            DeviceClass::SpeakerAndOther => 2,
        }
    }
}

/// One uid's accounting state as returned by [`UsageLedger::pull`].
#[derive(Clone, Debug)]
pub struct UsageSnapshot {
    pub uid: u32,
    pub ref_count: u32,
    /// Cumulative active time per device class, indexed by
    /// [`DeviceClass::index`].
    pub total: [Duration; DEVICE_CLASSES],
    pub video_ref_count: u32,
    pub video_total: Duration,
}

struct Record {
    ref_count: u32,
    active_class: DeviceClass,
    last_start: Option<Instant>,
    total: [Duration; DEVICE_CLASSES],
    video_ref_count: u32,
    video_last: Option<Instant>,
    video_total: Duration,
}

impl Record {
    fn new() -> Self {
        Self {
            ref_count: 0,
            active_class: DeviceClass::Speaker,
            last_start: None,
            total: [Duration::ZERO; DEVICE_CLASSES],
            video_ref_count: 0,
            video_last: None,
            video_total: Duration::ZERO,
        }
    }

    fn settle(&mut self, now: Instant) {
        if let Some(start) = self.last_start.take() {
            self.total[self.active_class.index()] += now - start;
        }
    }

    fn settle_video(&mut self, now: Instant) {
        if let Some(start) = self.video_last.take() {
            self.video_total += now - start;
        }
    }
}

/// Per-uid usage accounting for power attribution.
///
/// Cumulative totals only ever advance; a uid with zero active references
/// stops accumulating until reactivated. A reference-count underflow
/// corrupts billing data, so it is a fatal assertion rather than a clamp.
///
/// Every mutator has an `*_at` variant taking an explicit timestamp so
/// transition sequences can be replayed against a synthetic clock.
pub struct UsageLedger {
    inner: Mutex<HashMap<u32, Record>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn note_start(&self, uid: u32, class: DeviceClass) {
        self.note_start_at(uid, class, Instant::now());
    }

    pub fn note_start_at(&self, uid: u32, class: DeviceClass, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let rec = inner.entry(uid).or_insert_with(Record::new);
        if rec.ref_count == 0 {
            rec.last_start = Some(now);
            rec.active_class = class;
        } else if class != rec.active_class {
            // a second stream on a different device: both are now on
            rec.settle(now);
            rec.active_class = DeviceClass::SpeakerAndOther;
            rec.last_start = Some(now);
        }
        rec.ref_count += 1;
        debug!(uid, refs = rec.ref_count, "usage start");
    }

    pub fn note_stop(&self, uid: u32) {
        self.note_stop_at(uid, Instant::now());
    }

    pub fn note_stop_at(&self, uid: u32, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let rec = inner.get_mut(&uid);
        let rec = match rec {
            Some(rec) if rec.ref_count > 0 => rec,
            _ => panic!("usage ledger ref count underflow for uid {}", uid),
        };
        rec.ref_count -= 1;
        if rec.ref_count == 0 {
            rec.settle(now);
        }
        debug!(uid, refs = rec.ref_count, "usage stop");
    }

    /// Device-class change while streams are active: settle the elapsed time
    /// against the old class before accumulating against the new one.
    pub fn note_device_change(&self, uid: u32, class: DeviceClass) {
        self.note_device_change_at(uid, class, Instant::now());
    }

    pub fn note_device_change_at(&self, uid: u32, class: DeviceClass, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let rec = inner.entry(uid).or_insert_with(Record::new);
        if rec.ref_count > 0 && class != rec.active_class {
            rec.settle(now);
            rec.last_start = Some(now);
        }
        rec.active_class = class;
    }

    pub fn note_video_start(&self, uid: u32) {
        self.note_video_start_at(uid, Instant::now());
    }

    pub fn note_video_start_at(&self, uid: u32, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let rec = inner.entry(uid).or_insert_with(Record::new);
        if rec.video_ref_count == 0 {
            rec.video_last = Some(now);
        }
        rec.video_ref_count += 1;
    }

    pub fn note_video_stop(&self, uid: u32) {
        self.note_video_stop_at(uid, Instant::now());
    }

    pub fn note_video_stop_at(&self, uid: u32, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let rec = inner.get_mut(&uid);
        let rec = match rec {
            Some(rec) if rec.video_ref_count > 0 => rec,
            _ => panic!("usage ledger video ref count underflow for uid {}", uid),
        };
        rec.video_ref_count -= 1;
        if rec.video_ref_count == 0 {
            rec.settle_video(now);
        }
    }

    pub fn ref_count(&self, uid: u32) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .get(&uid)
            .map(|r| r.ref_count)
            .unwrap_or(0)
    }

    /// Settled total for one uid and class; in-flight spans are not
    /// included until a stop, device change, or pull settles them.
    pub fn total(&self, uid: u32, class: DeviceClass) -> Duration {
        self.inner
            .lock()
            .unwrap()
            .get(&uid)
            .map(|r| r.total[class.index()])
            .unwrap_or(Duration::ZERO)
    }

    pub fn pull(&self) -> Vec<UsageSnapshot> {
        self.pull_at(Instant::now())
    }

    /// Return the full snapshot and reset the cumulative totals. In-flight
    /// spans are settled up to `now` and restarted, so no time is lost or
    /// double-counted across two pulls. Reference counts and last-activity
    /// state are live and are not reset. A record with no references and
    /// nothing accumulated since the previous pull is dropped rather than
    /// re-reported, so the map stays bounded by live uids.
    pub fn pull_at(&self, now: Instant) -> Vec<UsageSnapshot> {
        let mut inner = self.inner.lock().unwrap();
        let mut out = Vec::with_capacity(inner.len());
        inner.retain(|&uid, rec| {
            if rec.ref_count > 0 {
                rec.settle(now);
                rec.last_start = Some(now);
            }
            if rec.video_ref_count > 0 {
                rec.settle_video(now);
                rec.video_last = Some(now);
            }
            let idle = rec.ref_count == 0
                && rec.video_ref_count == 0
                && rec.total.iter().all(|t| t.is_zero())
                && rec.video_total.is_zero();
            if idle {
                return false;
            }
            out.push(UsageSnapshot {
                uid,
                ref_count: rec.ref_count,
                total: rec.total,
                video_ref_count: rec.video_ref_count,
                video_total: rec.video_total,
            });
            rec.total = [Duration::ZERO; DEVICE_CLASSES];
            rec.video_total = Duration::ZERO;
            true
        });
        out.sort_by_key(|s| s.uid);
        out
    }
}

impl Default for UsageLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_change_settles_old_class_first() {
        let ledger = UsageLedger::new();
        let t0 = Instant::now();
        ledger.note_start_at(7, DeviceClass::Speaker, t0);
        ledger.note_device_change_at(7, DeviceClass::Other, t0 + Duration::from_millis(300));
        ledger.note_stop_at(7, t0 + Duration::from_millis(500));

        assert_eq!(
            ledger.total(7, DeviceClass::Speaker),
            Duration::from_millis(300)
        );
        assert_eq!(
            ledger.total(7, DeviceClass::Other),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn pull_resets_totals_but_not_refs() {
        let ledger = UsageLedger::new();
        let t0 = Instant::now();
        ledger.note_start_at(7, DeviceClass::Speaker, t0);
        let snap = ledger.pull_at(t0 + Duration::from_millis(100));
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].ref_count, 1);
        assert_eq!(
            snap[0].total[DeviceClass::Speaker.index()],
            Duration::from_millis(100)
        );

        // second pull only sees time since the first
        let snap = ledger.pull_at(t0 + Duration::from_millis(150));
        assert_eq!(
            snap[0].total[DeviceClass::Speaker.index()],
            Duration::from_millis(50)
        );
        assert_eq!(snap[0].ref_count, 1);
    }

    #[test]
    fn mixed_classes_escalate() {
        let ledger = UsageLedger::new();
        let t0 = Instant::now();
        ledger.note_start_at(7, DeviceClass::Speaker, t0);
        ledger.note_start_at(7, DeviceClass::Other, t0 + Duration::from_millis(100));
        ledger.note_stop_at(7, t0 + Duration::from_millis(200));
        ledger.note_stop_at(7, t0 + Duration::from_millis(400));

        assert_eq!(
            ledger.total(7, DeviceClass::Speaker),
            Duration::from_millis(100)
        );
        assert_eq!(
            ledger.total(7, DeviceClass::SpeakerAndOther),
            Duration::from_millis(300)
        );
    }
}

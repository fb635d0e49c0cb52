// 진행률 보고 - 비디오 트랙 pts / 전체 길이
// 단조 증가, [0, 1] 범위

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

pub struct ProgressReporter {
    duration_ms: i64,
    last: Arc<ProgressCell>,
    callback: Option<ProgressCallback>,
}

impl ProgressReporter {
    /// 새 세션: 공유 값은 0으로 초기화
    pub fn new(
        duration_ms: i64,
        last: Arc<ProgressCell>,
        callback: Option<ProgressCallback>,
    ) -> Self {
        last.set(0.0);
        Self {
            duration_ms,
            last,
            callback,
        }
    }

    pub fn current(&self) -> f64 {
        self.last.get()
    }

    /// 샘플 pts 기준 보고. 길이를 모르면(0 이하) 무시
    pub fn report_pts(&self, pts_ms: i64) {
        if self.duration_ms <= 0 {
            return;
        }
        let fraction = (pts_ms as f64 / self.duration_ms as f64).clamp(0.0, 1.0);
        self.report(fraction);
    }

    /// 정상 완료 시 마지막 1.0
    pub fn complete(&self) {
        self.report(1.0);
    }

    /// 이전 값보다 작으면 버림
    fn report(&self, fraction: f64) {
        let updated = self
            .last
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                (fraction >= f64::from_bits(bits)).then_some(fraction.to_bits())
            })
            .is_ok();

        if updated {
            if let Some(callback) = &self.callback {
                callback(fraction);
            }
        }
    }
}

/// 공유 진행률 값 (폴링용, f64 bits)
#[derive(Debug, Default)]
pub struct ProgressCell(AtomicU64);

impl ProgressCell {
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording() -> (ProgressCallback, Arc<Mutex<Vec<f64>>>) {
        let values = Arc::new(Mutex::new(Vec::new()));
        let v = values.clone();
        let callback: ProgressCallback = Arc::new(move |p| v.lock().unwrap().push(p));
        (callback, values)
    }

    #[test]
    fn test_fraction_of_duration() {
        let (callback, values) = recording();
        let reporter = ProgressReporter::new(10_000, Arc::default(), Some(callback));
        reporter.report_pts(2_500);
        reporter.report_pts(5_000);
        assert_eq!(*values.lock().unwrap(), vec![0.25, 0.5]);
        assert_eq!(reporter.current(), 0.5);
    }

    #[test]
    fn test_never_decreases() {
        let (callback, values) = recording();
        let reporter = ProgressReporter::new(1_000, Arc::default(), Some(callback));
        reporter.report_pts(600);
        reporter.report_pts(300);
        reporter.report_pts(700);
        assert_eq!(*values.lock().unwrap(), vec![0.6, 0.7]);
    }

    #[test]
    fn test_clamped() {
        let (callback, values) = recording();
        let reporter = ProgressReporter::new(1_000, Arc::default(), Some(callback));
        reporter.report_pts(-50);
        reporter.report_pts(5_000);
        assert_eq!(*values.lock().unwrap(), vec![0.0, 1.0]);
    }

    #[test]
    fn test_zero_duration_reports_only_completion() {
        let (callback, values) = recording();
        let reporter = ProgressReporter::new(0, Arc::default(), Some(callback));
        reporter.report_pts(100);
        reporter.report_pts(200);
        assert!(values.lock().unwrap().is_empty());

        reporter.complete();
        assert_eq!(*values.lock().unwrap(), vec![1.0]);
    }

    #[test]
    fn test_new_session_resets_shared_value() {
        let cell = Arc::new(ProgressCell::default());
        cell.set(0.75);
        let reporter = ProgressReporter::new(1_000, cell.clone(), None);
        assert_eq!(cell.get(), 0.0);
        reporter.report_pts(400);
        assert_eq!(cell.get(), 0.4);
    }
}

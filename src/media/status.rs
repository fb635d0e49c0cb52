// 리더/라이터 공통 상태 보드
// 트랙 출력/입력은 드레인 스레드에서, status 조회는 조정 스레드에서 일어나므로 Mutex로 공유

use super::{ReaderStatus, WriterStatus};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 리더 상태: 모든 트랙 출력이 소진되면 Completed
pub struct ReaderState {
    status: Mutex<ReaderStatus>,
    error: Mutex<Option<String>>,
    open_outputs: AtomicUsize,
}

impl ReaderState {
    pub fn new(outputs: usize) -> Self {
        Self {
            status: Mutex::new(ReaderStatus::Unknown),
            error: Mutex::new(None),
            open_outputs: AtomicUsize::new(outputs),
        }
    }

    pub fn status(&self) -> ReaderStatus {
        *lock(&self.status)
    }

    pub fn error(&self) -> Option<String> {
        lock(&self.error).clone()
    }

    pub fn start(&self) -> Result<(), String> {
        let mut status = lock(&self.status);
        match *status {
            ReaderStatus::Unknown => {
                *status = ReaderStatus::Reading;
                Ok(())
            }
            other => Err(format!("reader cannot start from {:?}", other)),
        }
    }

    /// 출력 하나가 정상적으로 끝까지 읽힘
    pub fn output_exhausted(&self) {
        let previous = self.open_outputs.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            let mut status = lock(&self.status);
            if *status == ReaderStatus::Reading {
                *status = ReaderStatus::Completed;
            }
        }
    }

    /// 읽기 실패 (첫 에러만 보관)
    pub fn fail(&self, message: String) {
        let mut status = lock(&self.status);
        if matches!(*status, ReaderStatus::Reading | ReaderStatus::Unknown) {
            *status = ReaderStatus::Failed;
            lock(&self.error).get_or_insert(message);
        }
    }

    pub fn cancel(&self) {
        let mut status = lock(&self.status);
        if *status == ReaderStatus::Reading {
            *status = ReaderStatus::Cancelled;
        }
    }

    /// 읽기 계속 가능 여부 (취소/실패 후에는 출력이 None 반환)
    pub fn is_reading(&self) -> bool {
        self.status() == ReaderStatus::Reading
    }
}

/// 라이터 상태
pub struct WriterState {
    status: Mutex<WriterStatus>,
    error: Mutex<Option<String>>,
}

impl WriterState {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(WriterStatus::Unknown),
            error: Mutex::new(None),
        }
    }

    pub fn status(&self) -> WriterStatus {
        *lock(&self.status)
    }

    pub fn error(&self) -> Option<String> {
        lock(&self.error).clone()
    }

    pub fn start(&self) -> Result<(), String> {
        let mut status = lock(&self.status);
        match *status {
            WriterStatus::Unknown => {
                *status = WriterStatus::Writing;
                Ok(())
            }
            other => Err(format!("writer cannot start from {:?}", other)),
        }
    }

    pub fn is_writing(&self) -> bool {
        self.status() == WriterStatus::Writing
    }

    pub fn fail(&self, message: String) {
        let mut status = lock(&self.status);
        if matches!(*status, WriterStatus::Writing | WriterStatus::Unknown) {
            *status = WriterStatus::Failed;
            lock(&self.error).get_or_insert(message);
        }
    }

    /// finalize 성공
    pub fn complete(&self) -> Result<(), String> {
        let mut status = lock(&self.status);
        match *status {
            WriterStatus::Writing => {
                *status = WriterStatus::Completed;
                Ok(())
            }
            other => Err(format!("writer cannot finish from {:?}", other)),
        }
    }

    /// Writing 상태에서만 Cancelled로 전이, 전이했으면 true
    pub fn cancel(&self) -> bool {
        let mut status = lock(&self.status);
        if matches!(*status, WriterStatus::Writing | WriterStatus::Failed) {
            *status = WriterStatus::Cancelled;
            true
        } else {
            false
        }
    }
}

impl Default for WriterState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_completes_after_all_outputs() {
        let state = ReaderState::new(2);
        state.start().unwrap();
        state.output_exhausted();
        assert_eq!(state.status(), ReaderStatus::Reading);
        state.output_exhausted();
        assert_eq!(state.status(), ReaderStatus::Completed);
    }

    #[test]
    fn test_reader_failure_is_sticky() {
        let state = ReaderState::new(1);
        state.start().unwrap();
        state.fail("decode error".to_string());
        state.output_exhausted();
        state.fail("second error".to_string());
        assert_eq!(state.status(), ReaderStatus::Failed);
        assert_eq!(state.error().as_deref(), Some("decode error"));
    }

    #[test]
    fn test_reader_cannot_start_twice() {
        let state = ReaderState::new(1);
        assert!(state.start().is_ok());
        assert!(state.start().is_err());
    }

    #[test]
    fn test_writer_lifecycle() {
        let state = WriterState::new();
        assert!(state.complete().is_err());
        state.start().unwrap();
        assert!(state.is_writing());
        state.complete().unwrap();
        assert_eq!(state.status(), WriterStatus::Completed);
        assert!(!state.cancel());
    }
}

// Export 세션 상태 + 동시 실행 제한
// 세션 id, 종료 결과, limiter(백엔드별) / scope 레지스트리(프로세스 전역)

use crate::error::ExportError;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// 백엔드 라이브러리가 허용하는 기본 동시 세션 수
pub const DEFAULT_SESSION_LIMIT: usize = 3;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// 실행 중인 scope 이름들
static ACTIVE_SCOPES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

pub(crate) fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// 세션 종료 결과 (콜백으로 정확히 한 번 전달)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
    Cancelled,
}

/// Exporter 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 아직 export 호출 전
    Idle,
    /// 리더/라이터 구성 중
    Preparing,
    ReadingAndWriting,
    /// cancel 요청됨, 종료 대기 중
    Cancelling,
    /// 드레인 종료 후 finalize 중
    Finalizing,
    Finished(Outcome),
}

impl SessionState {
    /// 새 export를 받을 수 있는 상태
    pub fn accepts_start(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Finished(_))
    }
}

/// 세션 하나의 공유 플래그
#[derive(Debug, Default)]
pub(crate) struct SessionFlags {
    cancelled: AtomicBool,
}

impl SessionFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 처음 취소했으면 true
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// 동시 세션 수 제한 (미디어 라이브러리 자원 한도)
#[derive(Debug)]
pub struct SessionLimiter {
    max: usize,
    active: AtomicUsize,
}

impl SessionLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            active: AtomicUsize::new(0),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn try_acquire(&self) -> bool {
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

impl Default for SessionLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_LIMIT)
    }
}

/// 세션 슬롯 + scope 점유 (Drop 시 해제)
#[derive(Debug)]
pub(crate) struct SessionPermit {
    limiter: Option<Arc<SessionLimiter>>,
    scope: Option<String>,
}

impl SessionPermit {
    /// scope 먼저 점유 후 limiter 슬롯 획득, 실패하면 점유한 것 모두 반환
    pub fn acquire(
        limiter: Option<Arc<SessionLimiter>>,
        scope: Option<&str>,
    ) -> Result<Self, ExportError> {
        if let Some(scope) = scope {
            let mut scopes = ACTIVE_SCOPES.lock().unwrap_or_else(PoisonError::into_inner);
            if !scopes.insert(scope.to_string()) {
                return Err(ExportError::ScopeBusy(scope.to_string()));
            }
        }

        // 여기부터는 실패해도 Drop이 scope를 정리
        let mut permit = SessionPermit {
            limiter: None,
            scope: scope.map(str::to_string),
        };

        if let Some(limiter) = limiter {
            if !limiter.try_acquire() {
                return Err(ExportError::TooManySessions(limiter.max()));
            }
            permit.limiter = Some(limiter);
        }

        Ok(permit)
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        if let Some(limiter) = self.limiter.take() {
            limiter.release();
        }
        if let Some(scope) = self.scope.take() {
            ACTIVE_SCOPES
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&scope);
        }
    }
}

// Join Barrier - 활성 트랙 드레인이 모두 끝나면 조정 스레드에 한 번 알림

use crate::media::TrackKind;
use log::{debug, error};
use std::sync::{Mutex, PoisonError};

struct BarrierState {
    armed: [bool; 2],
    fired: bool,
}

/// 트랙별 enter/leave 카운터
/// 마지막 leave에서만 on_drained 호출 (세션당 한 번)
pub struct JoinBarrier {
    state: Mutex<BarrierState>,
    on_drained: Box<dyn Fn() + Send + Sync>,
}

impl JoinBarrier {
    pub fn new(on_drained: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::new(BarrierState {
                armed: [false; 2],
                fired: false,
            }),
            on_drained: Box::new(on_drained),
        }
    }

    /// 드레인 스레드 시작 전에 호출
    pub fn enter(&self, kind: TrackKind) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.fired {
            error!("Join barrier: {} entered after drain completed", kind);
            return;
        }
        if state.armed[kind.index()] {
            error!("Join barrier: {} entered twice", kind);
            return;
        }
        state.armed[kind.index()] = true;
    }

    /// 트랙 종료. enter하지 않은 트랙의 leave는 무시
    pub fn leave(&self, kind: TrackKind) {
        let fire = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.armed[kind.index()] {
                error!("Join barrier: unbalanced leave for {}", kind);
                return;
            }
            state.armed[kind.index()] = false;
            let drained = !state.armed.iter().any(|armed| *armed);
            if drained {
                state.fired = true;
            }
            drained
        };

        // 콜백은 잠금 밖에서
        if fire {
            debug!("Join barrier: all tracks drained");
            (self.on_drained)();
        }
    }

    pub fn is_drained(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_barrier() -> (JoinBarrier, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let barrier = JoinBarrier::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (barrier, count)
    }

    #[test]
    fn test_fires_after_last_leave() {
        let (barrier, count) = counting_barrier();
        barrier.enter(TrackKind::Video);
        barrier.enter(TrackKind::Audio);

        barrier.leave(TrackKind::Audio);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!barrier.is_drained());

        barrier.leave(TrackKind::Video);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(barrier.is_drained());
    }

    #[test]
    fn test_single_track() {
        let (barrier, count) = counting_barrier();
        barrier.enter(TrackKind::Video);
        barrier.leave(TrackKind::Video);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unbalanced_leave_is_ignored() {
        let (barrier, count) = counting_barrier();
        barrier.enter(TrackKind::Video);

        // audio는 enter하지 않았음
        barrier.leave(TrackKind::Audio);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        barrier.leave(TrackKind::Video);
        barrier.leave(TrackKind::Video);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_leaves_fire_once() {
        for _ in 0..50 {
            let (barrier, count) = counting_barrier();
            let barrier = Arc::new(barrier);
            barrier.enter(TrackKind::Video);
            barrier.enter(TrackKind::Audio);

            let handles: Vec<_> = TrackKind::ALL
                .iter()
                .map(|&kind| {
                    let barrier = barrier.clone();
                    std::thread::spawn(move || barrier.leave(kind))
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }
}

// 트랙 드레인 루프 - 리더 출력에서 샘플을 꺼내 라이터 입력으로 밀어넣기
// 트랙마다 전용 스레드, 라이터 readiness 신호가 올 때만 burst 실행

use super::barrier::JoinBarrier;
use super::progress::ProgressReporter;
use crate::media::{ReaderStatus, SampleReader, TrackInput, TrackKind, TrackOutput};
use crossbeam_channel::{select, Receiver};
use log::{debug, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

/// 한 번의 step 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    Appended { pts_ms: i64 },
    /// 라이터가 더 받을 수 없음 → 다음 readiness 대기
    NotReady,
    EndOfStream,
    Failed,
    /// 이미 종료된 트랙 (pull 하지 않음)
    AlreadyFinished,
}

struct LaneState {
    output: Box<dyn TrackOutput>,
    input: Box<dyn TrackInput>,
    finished: bool,
    appended: u64,
    failure: Option<String>,
}

/// 트랙 하나의 드레인 상태
/// finished 플래그 + 출력 + 입력을 한 잠금 아래 두고 step 단위로 잠금
/// (취소는 step 사이에만 끼어듦)
pub(crate) struct TrackLane {
    kind: TrackKind,
    state: Mutex<LaneState>,
    reader: Arc<dyn SampleReader>,
    barrier: Arc<JoinBarrier>,
}

impl TrackLane {
    pub fn new(
        kind: TrackKind,
        output: Box<dyn TrackOutput>,
        input: Box<dyn TrackInput>,
        reader: Arc<dyn SampleReader>,
        barrier: Arc<JoinBarrier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            state: Mutex::new(LaneState {
                output,
                input,
                finished: false,
                appended: 0,
                failure: None,
            }),
            reader,
            barrier,
        })
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    fn lock(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 샘플 하나 pull → push
    pub fn step(&self) -> Step {
        let mut state = self.lock();
        if state.finished {
            return Step::AlreadyFinished;
        }
        if !state.input.is_ready_for_more_data() {
            return Step::NotReady;
        }

        match state.output.copy_next_sample() {
            Some(sample) => {
                let pts_ms = sample.pts_ms;
                match state.input.append(sample) {
                    Ok(()) => {
                        state.appended += 1;
                        Step::Appended { pts_ms }
                    }
                    Err(message) => {
                        warn!(
                            "[EXPORT] {} 샘플 쓰기 실패 ({}ms): {}",
                            self.kind, pts_ms, message
                        );
                        state.failure = Some(message);
                        self.finish_locked(state);
                        Step::Failed
                    }
                }
            }
            None if self.reader.status() == ReaderStatus::Failed => {
                let message = self
                    .reader
                    .error()
                    .unwrap_or_else(|| "unknown read error".to_string());
                warn!(
                    "[EXPORT] {} 샘플 읽기 실패 ({}개 기록 후): {}",
                    self.kind, state.appended, message
                );
                state.failure = Some(message);
                self.finish_locked(state);
                Step::Failed
            }
            None => {
                debug!(
                    "[EXPORT] {} 트랙 끝 ({}개 샘플)",
                    self.kind, state.appended
                );
                self.finish_locked(state);
                Step::EndOfStream
            }
        }
    }

    /// false → true 전이를 한 경우에만 입력 종료 + barrier leave
    fn finish_locked(&self, mut state: MutexGuard<'_, LaneState>) -> bool {
        if state.finished {
            return false;
        }
        state.finished = true;
        state.input.mark_as_finished();
        drop(state);

        self.barrier.leave(self.kind);
        true
    }

    /// 강제 종료 (취소). 이미 끝났으면 false
    pub fn finish(&self) -> bool {
        let state = self.lock();
        self.finish_locked(state)
    }

    /// 실패로 강제 종료 (라이터 사라짐 등)
    pub fn abort(&self, message: String) -> bool {
        let mut state = self.lock();
        if state.finished {
            return false;
        }
        state.failure.get_or_insert(message);
        self.finish_locked(state)
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    #[cfg(test)]
    pub fn appended(&self) -> u64 {
        self.lock().appended
    }

    pub fn failure(&self) -> Option<String> {
        self.lock().failure.clone()
    }
}

/// readiness 신호 하나에 대한 burst. 트랙이 끝났으면 true
fn drain_burst(lane: &TrackLane, progress: Option<&ProgressReporter>) -> bool {
    let mut count = 0usize;
    loop {
        match lane.step() {
            Step::Appended { pts_ms } => {
                count += 1;
                // 잠금 밖에서 보고
                if let Some(progress) = progress {
                    progress.report_pts(pts_ms);
                }
            }
            Step::NotReady => {
                debug!("[EXPORT] {} burst: {}개", lane.kind(), count);
                return false;
            }
            Step::EndOfStream | Step::Failed | Step::AlreadyFinished => return true,
        }
    }
}

/// 드레인 스레드 본체
/// stop 채널은 메시지 없이 송신측 drop(취소/세션 종료)으로만 깨어남
pub(crate) fn run_drain(
    lane: &TrackLane,
    readiness: Receiver<()>,
    stop: Receiver<()>,
    progress: Option<&ProgressReporter>,
) {
    loop {
        select! {
            recv(readiness) -> signal => {
                if signal.is_err() {
                    if lane.abort("writer input closed its readiness channel".to_string()) {
                        warn!("[EXPORT] {} readiness 채널 끊김", lane.kind());
                    }
                    return;
                }
                if drain_burst(lane, progress) {
                    return;
                }
            }
            recv(stop) -> _ => {
                debug!("[EXPORT] {} 드레인 중단", lane.kind());
                return;
            }
        }
    }
}

/// 트랙 드레인 스레드 시작
pub(crate) fn spawn_drain(
    name: String,
    lane: Arc<TrackLane>,
    readiness: Receiver<()>,
    stop: Receiver<()>,
    progress: Option<Arc<ProgressReporter>>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name)
        .spawn(move || run_drain(&lane, readiness, stop, progress.as_deref()))
}

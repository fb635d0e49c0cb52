// 라이터 입력 readiness 신호
// append가 burst 개수에 도달하면 한 번 not-ready를 보고하고 다음 신호를 큐에 넣음

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::cell::Cell;

pub struct ReadinessGate {
    tx: Sender<()>,
    rx: Receiver<()>,
    burst: usize,
    in_burst: usize,
    paused: Cell<bool>,
}

impl ReadinessGate {
    pub fn new(burst: usize) -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            burst: burst.max(1),
            in_burst: 0,
            paused: Cell::new(false),
        }
    }

    pub fn receiver(&self) -> Receiver<()> {
        self.rx.clone()
    }

    /// 라이터 시작 시 첫 신호용
    pub fn primer(&self) -> Sender<()> {
        self.tx.clone()
    }

    /// 멈춤은 한 번만 보고 (재신호는 이미 큐에 있음)
    pub fn is_ready(&self) -> bool {
        !self.paused.replace(false)
    }

    pub fn record_append(&mut self) {
        self.in_burst += 1;
        if self.in_burst >= self.burst {
            self.in_burst = 0;
            self.paused.set(true);
            let _ = self.tx.send(());
        }
    }
}

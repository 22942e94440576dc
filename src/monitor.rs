//! 라우트 모니터
//!
//! 활성 세션의 라우트를 주기적으로 측정한다. 현재 지연이 기준값의
//! `degradation_factor`배를 넘으면 다음 주기를 기다리지 않고 해당 대상만 재최적화한다.
//! 직접 경로가 응답하지 않은 대상은 중계 노드 적용 직후 지연이 기준이다.

use std::sync::Arc;

use tracing::{debug, info};

use crate::session::Shared;

/// 세션 하나의 모니터 루프
pub(crate) struct RouteMonitor {
    shared: Arc<Shared>,
}

impl RouteMonitor {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// 세션이 비활성화될 때까지 실행
    pub(crate) async fn run(self) {
        let interval = self.shared.config.monitor_interval;
        info!("라우트 모니터 시작 (주기 {:?})", interval);

        while self.shared.is_active() {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shared.wake.notified() => {}
            }
            if !self.shared.is_active() {
                break;
            }
            self.poll().await;
        }

        info!("라우트 모니터 종료");
    }

    /// 모든 라우트 1회 측정. 예약한 재최적화 수 반환
    pub(crate) async fn poll(&self) -> usize {
        let cfg = &self.shared.config;
        let mut triggered = 0;

        for route in self.shared.routes() {
            if !self.shared.is_active() {
                break;
            }
            // 재최적화 중인 대상은 임시 라우트가 걸려 있을 수 있음
            if self.shared.reoptimizing.contains(&route.target) {
                continue;
            }

            let current = self
                .shared
                .probe
                .measure(route.target, cfg.monitor_samples, cfg.monitor_timeout, 0)
                .await;
            if self.shared.reoptimizing.contains(&route.target) {
                continue;
            }
            self.shared.record_latency(route.target, current);

            let reference = route.reference();
            if cfg.is_degraded(current, reference) {
                info!(
                    "지연 증가 감지: {} ({}, 기준 {}), 재최적화",
                    route.target, current, reference
                );
                if self.shared.spawn_reoptimize(route.target) {
                    triggered += 1;
                }
            } else {
                debug!("라우트 정상: {} {}", route.target, current);
            }
        }

        triggered
    }
}

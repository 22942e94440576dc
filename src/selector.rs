//! 최적 중계 노드 선택
//!
//! 1. 대상 현재 경로 지연 측정 (기준값)
//! 2. 모든 후보를 동시에 평가 (노드 지연, 임시 라우트 경유 대상 지연)
//! 3. 모든 평가 완료 후 점수 순위 계산
//! 4. 기준값보다 엄격히 빠른 최상위 후보만 선택

use std::net::Ipv4Addr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::catalog::Candidate;
use crate::probe::{Latency, LatencyProbe};
use crate::route_table::{install_route, RouteTable};
use crate::scorer::{NodeScore, NodeScorer};
use crate::stats::SampleSet;
use crate::{Config, Error};

/// 선택 결과
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SelectionOutcome {
    /// 기준값보다 빠른 노드 발견
    Optimized { relay: Ipv4Addr, latency_ms: f64 },
    /// 개선 없음, 현재 경로 유지
    NoImprovement,
}

/// 대상 하나에 대한 선택 실행 결과
#[derive(Debug, Clone)]
pub struct Selection {
    pub target: Ipv4Addr,
    pub outcome: SelectionOutcome,
    /// 선택 시점의 현재 경로 지연
    pub baseline: Latency,
    /// 순위순 후보 점수 (제외된 후보는 포함하지 않음)
    pub ranked: Vec<NodeScore>,
}

impl Selection {
    pub fn relay(&self) -> Option<Ipv4Addr> {
        match self.outcome {
            SelectionOutcome::Optimized { relay, .. } => Some(relay),
            SelectionOutcome::NoImprovement => None,
        }
    }

    pub fn baseline_ms(&self) -> f64 {
        self.baseline.as_millis()
    }

    /// 선택된 경로의 지연. 개선이 없으면 기준값
    pub fn achieved(&self) -> Latency {
        match self.outcome {
            SelectionOutcome::Optimized { latency_ms, .. } => Latency::Reachable(latency_ms),
            SelectionOutcome::NoImprovement => self.baseline,
        }
    }

    fn no_improvement(target: Ipv4Addr, baseline: Latency, ranked: Vec<NodeScore>) -> Self {
        Self {
            target,
            outcome: SelectionOutcome::NoImprovement,
            baseline,
            ranked,
        }
    }
}

/// 대상별 라우트 변경 직렬화 잠금
///
/// 같은 대상의 임시 라우트와 실제 적용이 서로 끼어들지 않도록 한다.
#[derive(Debug, Default)]
pub struct TargetLocks {
    locks: DashMap<Ipv4Addr, Arc<Mutex<()>>>,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, target: Ipv4Addr) -> OwnedMutexGuard<()> {
        let mutex = self.locks.entry(target).or_default().clone();
        mutex.lock_owned().await
    }
}

/// 경로 선택기
#[derive(Clone)]
pub struct RouteSelector {
    config: Config,
    probe: LatencyProbe,
    routes: Arc<dyn RouteTable>,
    scorer: NodeScorer,
    locks: Arc<TargetLocks>,
}

impl RouteSelector {
    pub fn new(
        config: Config,
        probe: LatencyProbe,
        routes: Arc<dyn RouteTable>,
        locks: Arc<TargetLocks>,
    ) -> Self {
        Self {
            config,
            probe,
            routes,
            scorer: NodeScorer::new(),
            locks,
        }
    }

    /// 최적 노드 선택
    ///
    /// 후보가 없거나 모두 실패해도 에러가 아니라 `NoImprovement`.
    pub async fn select_best(&self, target: Ipv4Addr, region: &str, candidates: &[Candidate]) -> Selection {
        let baseline = self
            .probe
            .measure(
                target,
                self.config.probe_samples,
                self.config.probe_timeout,
                self.config.max_retries,
            )
            .await;
        info!("기준 지연: {} -> {}", target, baseline);
        self.select_with_baseline(target, region, candidates, baseline).await
    }

    /// 이미 측정한 기준값으로 선택
    pub async fn select_with_baseline(
        &self,
        target: Ipv4Addr,
        region: &str,
        candidates: &[Candidate],
        baseline: Latency,
    ) -> Selection {
        if candidates.is_empty() {
            warn!("{}", Error::NoCandidatesAvailable { region: region.to_string() });
            return Selection::no_improvement(target, baseline, Vec::new());
        }

        let mut tasks = JoinSet::new();
        for candidate in candidates {
            if candidate.address == target {
                continue;
            }
            let this = self.clone();
            let candidate = candidate.clone();
            tasks.spawn(async move { this.evaluate(target, &candidate).await });
        }

        // 모든 평가가 끝난 뒤에만 순위 계산
        let mut ranked = Vec::with_capacity(tasks.len());
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Some(score)) => ranked.push(score),
                Ok(None) => {}
                Err(e) => warn!("후보 평가 태스크 실패: {}", e),
            }
        }
        ranked.sort_by(NodeScore::rank_cmp);

        let baseline_ms = baseline.as_millis();
        let chosen = ranked
            .iter()
            .find(|s| s.relay_to_target_ms < baseline_ms)
            .map(|s| (s.address, s.relay_to_target_ms, s.score));

        match chosen {
            Some((relay, latency_ms, score)) => {
                info!(
                    "최적 노드 선택: {} -> {} (점수 {:.1}, {:.1}ms, 개선 {:.1}ms)",
                    target,
                    relay,
                    score,
                    latency_ms,
                    baseline_ms - latency_ms
                );
                Selection {
                    target,
                    outcome: SelectionOutcome::Optimized { relay, latency_ms },
                    baseline,
                    ranked,
                }
            }
            None => {
                info!(
                    "더 빠른 경로 없음: {} ({}개 후보 중 {}개 유효)",
                    target,
                    candidates.len(),
                    ranked.len()
                );
                Selection::no_improvement(target, baseline, ranked)
            }
        }
    }

    /// 후보 하나 평가. 제외 대상이면 None
    async fn evaluate(&self, target: Ipv4Addr, candidate: &Candidate) -> Option<NodeScore> {
        let relay = self
            .probe
            .sample(candidate.address, self.config.stability_samples, self.config.probe_timeout)
            .await;

        let Some(relay_ms) = relay.mean() else {
            debug!("노드 연결 불가: {}", candidate.address);
            return None;
        };
        if !self.config.relay_acceptable(relay_ms) {
            debug!("노드 지연 과다: {} ({:.1}ms)", candidate.address, relay_ms);
            return None;
        }

        let mut via = SampleSet::new();
        for _ in 0..self.config.stability_samples.max(1) {
            via.merge(self.probe_via(target, candidate.address).await);
        }

        let score = self.scorer.score(candidate.address, &relay, &via);
        match &score {
            Some(s) => info!(
                "노드 평가 {} [{}]: 노드 {:.1}ms, 대상 {:.1}ms, 안정성 {:.1}, 점수 {:.1}",
                candidate.address, candidate.provider, s.relay_latency_ms, s.relay_to_target_ms, s.stability, s.score
            ),
            None => debug!("노드 경유 대상 연결 불가: {} via {}", target, candidate.address),
        }
        score
    }

    /// 임시 라우트를 적용한 상태에서 대상 1회 측정
    async fn probe_via(&self, target: Ipv4Addr, relay: Ipv4Addr) -> SampleSet {
        let _guard = self.locks.lock(target).await;

        if let Err(e) = install_route(self.routes.as_ref(), target, relay).await {
            debug!("임시 라우트 적용 실패: {}", e);
            let mut failed = SampleSet::new();
            failed.record_failure();
            return failed;
        }

        let samples = self.probe.sample(target, 1, self.config.probe_timeout).await;

        if let Err(e) = self.routes.remove_route(target).await {
            warn!("임시 라우트 삭제 실패: {} - {}", target, e);
        }
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeNetwork;
    use std::time::Duration;

    const T: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 10);
    const A: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 1);
    const B: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 2);
    const C: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 3);

    fn test_config() -> Config {
        Config {
            probe_timeout: Duration::from_millis(50),
            retry_backoff: Duration::from_millis(1),
            max_retries: 0,
            ..Config::default()
        }
    }

    fn selector(net: &Arc<FakeNetwork>, config: Config) -> RouteSelector {
        let probe = LatencyProbe::new(net.clone(), config.parallel_tests, config.retry_backoff);
        RouteSelector::new(config, probe, net.clone(), Arc::new(TargetLocks::new()))
    }

    fn candidates(addrs: &[Ipv4Addr]) -> Vec<Candidate> {
        addrs.iter().map(|a| Candidate::new(*a, "isp")).collect()
    }

    #[tokio::test]
    async fn test_scenario_better_relay_chosen() {
        let net = Arc::new(FakeNetwork::new());
        net.set_direct(T, 80.0);
        net.set_direct(A, 10.0);
        net.set_via(T, A, 40.0);
        net.set_direct(B, 5.0);
        net.set_via(T, B, 90.0);

        let sel = selector(&net, test_config())
            .select_best(T, "SEA", &candidates(&[A, B]))
            .await;

        assert_eq!(sel.outcome, SelectionOutcome::Optimized { relay: A, latency_ms: 40.0 });
        assert_eq!(sel.baseline_ms(), 80.0);
        assert_eq!(sel.ranked.len(), 2);
        assert_eq!(sel.ranked[0].address, A);
        // 선택 후 임시 라우트는 남지 않음
        assert_eq!(net.live_routes(), 0);
        assert_eq!(net.overlapping_adds(), 0);
    }

    #[tokio::test]
    async fn test_scenario_no_improvement() {
        let net = Arc::new(FakeNetwork::new());
        net.set_direct(T, 30.0);
        net.set_direct(A, 10.0);
        net.set_via(T, A, 50.0);

        let sel = selector(&net, test_config())
            .select_best(T, "SEA", &candidates(&[A]))
            .await;

        assert_eq!(sel.outcome, SelectionOutcome::NoImprovement);
        assert_eq!(sel.relay(), None);
        assert_eq!(sel.achieved(), Latency::Reachable(30.0));
        assert_eq!(net.gateway_of(T), None);
    }

    #[tokio::test]
    async fn test_lower_ranked_relay_that_beats_baseline_is_chosen() {
        let net = Arc::new(FakeNetwork::new());
        net.set_direct(T, 45.0);
        // A: 노드 지연이 매우 낮아 점수는 높지만 대상 지연은 기준보다 느림
        net.set_direct(A, 1.0);
        net.set_via(T, A, 50.0);
        // B: 점수는 낮지만 기준보다 빠름
        net.set_direct(B, 60.0);
        net.set_via(T, B, 44.0);

        let sel = selector(&net, test_config())
            .select_best(T, "SEA", &candidates(&[A, B]))
            .await;

        assert_eq!(sel.ranked[0].address, A);
        assert_eq!(sel.relay(), Some(B));
        assert!(sel.achieved().as_millis() < sel.baseline_ms());
    }

    #[tokio::test]
    async fn test_empty_pool_and_all_failures_are_no_improvement() {
        let net = Arc::new(FakeNetwork::new());
        net.set_direct(T, 30.0);
        let s = selector(&net, test_config());

        let empty = s.select_best(T, "SEA", &[]).await;
        assert_eq!(empty.outcome, SelectionOutcome::NoImprovement);

        // A: 노드 응답 없음, B: 경유 응답 없음
        net.set_direct(B, 10.0);
        let failed = s.select_best(T, "SEA", &candidates(&[A, B])).await;
        assert_eq!(failed.outcome, SelectionOutcome::NoImprovement);
        assert!(failed.ranked.is_empty());
    }

    #[tokio::test]
    async fn test_ceiling_and_fast_reject() {
        let net = Arc::new(FakeNetwork::new());
        net.set_direct(T, 500.0);
        net.set_direct(A, 150.0);
        net.set_via(T, A, 160.0);

        let mut config = test_config();
        let sel = selector(&net, config.clone())
            .select_best(T, "SEA", &candidates(&[A]))
            .await;
        assert_eq!(sel.outcome, SelectionOutcome::NoImprovement);
        // 빠른 제외 시 임시 라우트도 적용하지 않음
        assert_eq!(net.probe_calls(T), config.probe_samples);

        config.relay_fast_reject_ms = None;
        let sel = selector(&net, config)
            .select_best(T, "SEA", &candidates(&[A]))
            .await;
        assert_eq!(sel.relay(), Some(A));
    }

    #[tokio::test]
    async fn test_unreachable_baseline_any_reachable_relay_wins() {
        let net = Arc::new(FakeNetwork::new());
        net.set_direct(A, 20.0);
        net.set_via(T, A, 120.0);

        let sel = selector(&net, test_config())
            .select_best(T, "SEA", &candidates(&[A]))
            .await;
        assert_eq!(sel.baseline, Latency::Unreachable);
        assert_eq!(sel.relay(), Some(A));
    }

    #[tokio::test]
    async fn test_add_failure_for_every_candidate_leaves_direct_path() {
        let net = Arc::new(FakeNetwork::new());
        net.set_direct(T, 80.0);
        for (relay, ms) in [(A, 40.0), (B, 45.0), (C, 50.0)] {
            net.set_direct(relay, 10.0);
            net.set_via(T, relay, ms);
            net.fail_add(relay);
        }

        let sel = selector(&net, test_config())
            .select_best(T, "SEA", &candidates(&[A, B, C]))
            .await;
        assert_eq!(sel.outcome, SelectionOutcome::NoImprovement);
        assert_eq!(net.gateway_of(T), None);
        assert_eq!(net.live_routes(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_matches_sequential() {
        let setup = || {
            let net = Arc::new(FakeNetwork::with_delay(Duration::from_millis(2)));
            net.set_direct(T, 90.0);
            let pool = [(A, 12.0, 55.0), (B, 8.0, 60.0), (C, 30.0, 50.0)];
            for (relay, relay_ms, via_ms) in pool {
                net.set_direct(relay, relay_ms);
                net.set_via(T, relay, via_ms);
            }
            net
        };

        let seq_net = setup();
        let sequential = selector(&seq_net, Config { parallel_tests: 1, ..test_config() })
            .select_best(T, "SEA", &candidates(&[A, B, C]))
            .await;

        let par_net = setup();
        let concurrent = selector(&par_net, Config { parallel_tests: 5, ..test_config() })
            .select_best(T, "SEA", &candidates(&[C, A, B]))
            .await;

        assert_eq!(sequential.outcome, concurrent.outcome);
        assert_eq!(sequential.ranked, concurrent.ranked);
        // 같은 대상의 임시 라우트는 겹치지 않음
        assert_eq!(par_net.overlapping_adds(), 0);
    }

    #[tokio::test]
    async fn test_target_locks_serialize() {
        let locks = Arc::new(TargetLocks::new());
        let guard = locks.lock(T).await;

        let l2 = locks.clone();
        let other = tokio::spawn(async move {
            let _g = l2.lock(A).await;
        });
        // 다른 대상은 대기하지 않음
        tokio::time::timeout(Duration::from_millis(100), other)
            .await
            .unwrap()
            .unwrap();

        let l3 = locks.clone();
        let same = tokio::spawn(async move {
            let _g = l3.lock(T).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!same.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_millis(100), same)
            .await
            .unwrap()
            .unwrap();
    }
}

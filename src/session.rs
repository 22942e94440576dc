//! 가속 세션
//!
//! 대상 그룹/지역 하나에 대한 최적화 수명 주기를 관리한다.
//!
//! ```text
//! Idle → Optimizing → Active → Stopping → Idle
//! ```
//!
//! 세션이 설치한 모든 라우트는 대상별 매핑에 기록되고, 정지 시 전부 삭제된다.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashSet;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::catalog::{Candidate, Catalog};
use crate::monitor::RouteMonitor;
use crate::probe::{Latency, LatencyProbe, Probe};
use crate::route_table::{install_route, RouteTable};
use crate::selector::{RouteSelector, SelectionOutcome, TargetLocks};
use crate::{Config, Error, Result};

/// 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Optimizing,
    Active,
    Stopping,
}

/// 대상 하나의 라우트 상태
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Route {
    pub target: Ipv4Addr,
    /// 적용된 중계 노드. None이면 직접 경로
    pub relay: Option<Ipv4Addr>,
    /// 세션 시작 시 직접 경로 지연
    pub baseline: Latency,
    /// 최근 측정 지연
    pub current: Latency,
    /// 현재 중계 노드 적용 직후 지연
    pub applied_ms: Option<f64>,
}

impl Route {
    fn direct(target: Ipv4Addr, baseline: Latency) -> Self {
        Self {
            target,
            relay: None,
            baseline,
            current: baseline,
            applied_ms: None,
        }
    }

    pub fn is_optimized(&self) -> bool {
        self.relay.is_some()
    }

    /// 기준 대비 개선율 (%). 기준이나 현재 지연을 알 수 없으면 None
    pub fn improvement_pct(&self) -> Option<f64> {
        match (self.baseline, self.current) {
            (Latency::Reachable(baseline), Latency::Reachable(current)) if baseline > 0.0 => {
                Some((baseline - current) / baseline * 100.0)
            }
            _ => None,
        }
    }

    /// 악화 판정 기준
    ///
    /// 직접 경로가 응답하지 않았으면 중계 노드 적용 직후 지연을 쓴다.
    pub fn reference(&self) -> Latency {
        match (self.baseline, self.applied_ms) {
            (Latency::Reachable(_), _) => self.baseline,
            (Latency::Unreachable, Some(ms)) => Latency::Reachable(ms),
            (Latency::Unreachable, None) => Latency::Unreachable,
        }
    }
}

/// 세션 상태 스냅샷
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub active: bool,
    pub state: SessionState,
    pub group: Option<String>,
    pub region: Option<String>,
    pub routes: BTreeMap<Ipv4Addr, Route>,
}

impl SessionStatus {
    pub fn optimized_count(&self) -> usize {
        self.routes.values().filter(|r| r.is_optimized()).count()
    }

    /// 최적화된 라우트의 평균 개선율
    pub fn average_improvement_pct(&self) -> Option<f64> {
        let improved: Vec<f64> = self
            .routes
            .values()
            .filter(|r| r.is_optimized())
            .filter_map(Route::improvement_pct)
            .collect();
        if improved.is_empty() {
            return None;
        }
        Some(improved.iter().sum::<f64>() / improved.len() as f64)
    }
}

/// 대상별 최적화 결과
#[derive(Debug)]
pub enum TargetOutcome {
    /// 중계 노드 라우트 적용
    Optimized { relay: Ipv4Addr, latency_ms: f64 },
    /// 현재 경로 유지
    Unchanged,
    /// 라우트 적용 실패, 직접 경로 유지
    Failed(Error),
}

impl TargetOutcome {
    pub fn is_optimized(&self) -> bool {
        matches!(self, TargetOutcome::Optimized { .. })
    }
}

/// `start` 결과
#[derive(Debug, Default)]
pub struct StartReport {
    pub outcomes: BTreeMap<Ipv4Addr, TargetOutcome>,
}

impl StartReport {
    pub fn optimized(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_optimized()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = (&Ipv4Addr, &Error)> {
        self.outcomes.iter().filter_map(|(target, outcome)| match outcome {
            TargetOutcome::Failed(e) => Some((target, e)),
            _ => None,
        })
    }
}

/// 시작 시 고정되는 대상 범위
#[derive(Debug, Clone)]
struct Scope {
    group: String,
    region: String,
    candidates: Arc<[Candidate]>,
}

/// 세션과 모니터, 재최적화 태스크가 공유하는 상태
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) probe: LatencyProbe,
    selector: RouteSelector,
    route_table: Arc<dyn RouteTable>,
    locks: Arc<TargetLocks>,
    catalog: Arc<dyn Catalog>,
    state: Mutex<SessionState>,
    active: AtomicBool,
    scope: Mutex<Option<Scope>>,
    routes: Mutex<HashMap<Ipv4Addr, Route>>,
    /// 재최적화 진행 중인 대상
    pub(crate) reoptimizing: DashSet<Ipv4Addr>,
    reopt_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// 모니터 대기 해제
    pub(crate) wake: Notify,
}

impl Shared {
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    /// 라우트 매핑 스냅샷
    pub(crate) fn routes(&self) -> Vec<Route> {
        self.routes.lock().values().copied().collect()
    }

    /// 모니터 측정값 기록
    pub(crate) fn record_latency(&self, target: Ipv4Addr, current: Latency) {
        if let Some(route) = self.routes.lock().get_mut(&target) {
            route.current = current;
        }
    }

    /// 중계 노드 교체 기록
    fn set_route(&self, target: Ipv4Addr, relay: Option<Ipv4Addr>, current: Latency) {
        if let Some(route) = self.routes.lock().get_mut(&target) {
            if route.relay != relay {
                route.applied_ms = match (relay, current) {
                    (Some(_), Latency::Reachable(ms)) => Some(ms),
                    _ => None,
                };
            }
            route.relay = relay;
            route.current = current;
        }
    }

    /// 기준 측정 → 선택 → 적용 → 확인
    async fn optimize_target(&self, target: Ipv4Addr, scope: &Scope) -> TargetOutcome {
        let cfg = &self.config;
        let baseline = self
            .probe
            .measure(target, cfg.probe_samples, cfg.probe_timeout, cfg.max_retries)
            .await;
        info!("기준 지연: {} -> {}", target, baseline);
        self.routes.lock().insert(target, Route::direct(target, baseline));

        let selection = self
            .selector
            .select_with_baseline(target, &scope.region, &scope.candidates, baseline)
            .await;
        let SelectionOutcome::Optimized { relay, latency_ms } = selection.outcome else {
            return TargetOutcome::Unchanged;
        };

        let _guard = self.locks.lock(target).await;
        if let Err(e) = install_route(self.route_table.as_ref(), target, relay).await {
            warn!("{}", e);
            return TargetOutcome::Failed(e);
        }

        let Some(achieved_ms) = self.confirm(target, baseline, latency_ms).await else {
            if let Err(e) = self.route_table.remove_route(target).await {
                warn!("라우트 롤백 실패: {} - {}", target, e);
            }
            return TargetOutcome::Unchanged;
        };

        self.set_route(target, Some(relay), Latency::Reachable(achieved_ms));
        info!(
            "라우트 적용 완료: {} via {} ({} -> {:.1}ms)",
            target, relay, baseline, achieved_ms
        );
        TargetOutcome::Optimized {
            relay,
            latency_ms: achieved_ms,
        }
    }

    /// 적용 후 재측정. 기준보다 빠르지 않으면 None
    async fn confirm(&self, target: Ipv4Addr, baseline: Latency, selected_ms: f64) -> Option<f64> {
        let cfg = &self.config;
        if !cfg.confirm_after_apply {
            return Some(selected_ms);
        }

        let measured = self
            .probe
            .measure(target, cfg.probe_samples, cfg.probe_timeout, cfg.max_retries)
            .await;
        if let Latency::Reachable(ms) = measured {
            if ms < baseline.as_millis() {
                return Some(ms);
            }
        }
        warn!(
            "적용 후 개선 없음, 롤백: {} ({} >= {})",
            target, measured, baseline
        );
        None
    }

    /// 대상 하나 재최적화
    ///
    /// 기준값은 현재 적용된 경로. 더 나은 노드가 없으면 기존 노드를 다시 적용한다.
    pub(crate) async fn reoptimize(&self, target: Ipv4Addr) -> TargetOutcome {
        let previous = self.routes.lock().get(&target).map(|r| r.relay);
        let Some(previous) = previous else {
            return TargetOutcome::Unchanged;
        };
        let scope = self.scope.lock().clone();
        let Some(scope) = scope else {
            return TargetOutcome::Unchanged;
        };

        info!("재최적화 시작: {}", target);
        let selection = self
            .selector
            .select_best(target, &scope.region, &scope.candidates)
            .await;

        let _guard = self.locks.lock(target).await;
        if !self.is_active() {
            debug!("세션 정지 중, 재최적화 결과 폐기: {}", target);
            return TargetOutcome::Unchanged;
        }

        match selection.outcome {
            SelectionOutcome::Optimized { relay, latency_ms } if Some(relay) != previous => {
                match install_route(self.route_table.as_ref(), target, relay).await {
                    Ok(()) => {
                        self.set_route(target, Some(relay), Latency::Reachable(latency_ms));
                        info!("노드 교체: {} via {} ({:.1}ms)", target, relay, latency_ms);
                        TargetOutcome::Optimized { relay, latency_ms }
                    }
                    Err(e) => {
                        warn!("{}", e);
                        self.restore(target, previous, selection.baseline).await;
                        TargetOutcome::Failed(e)
                    }
                }
            }
            _ => {
                self.restore(target, previous, selection.achieved()).await;
                TargetOutcome::Unchanged
            }
        }
    }

    /// 임시 평가로 지워진 기존 라우트 복구
    async fn restore(&self, target: Ipv4Addr, previous: Option<Ipv4Addr>, current: Latency) {
        let relay = match previous {
            Some(gateway) => match install_route(self.route_table.as_ref(), target, gateway).await {
                Ok(()) => Some(gateway),
                Err(e) => {
                    warn!("기존 노드 복구 실패, 직접 경로 사용: {}", e);
                    None
                }
            },
            None => None,
        };
        self.set_route(target, relay, current);
    }

    /// 재최적화 예약. 이미 진행 중이면 false
    pub(crate) fn spawn_reoptimize(self: &Arc<Self>, target: Ipv4Addr) -> bool {
        if !self.reoptimizing.insert(target) {
            return false;
        }
        let shared = Arc::clone(self);
        let handle = tokio::spawn(async move {
            shared.reoptimize(target).await;
            shared.reoptimizing.remove(&target);
        });

        let mut tasks = self.reopt_tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
        true
    }

    /// 매핑된 모든 라우트 삭제 (실패해도 계속 진행)
    async fn remove_all_routes(&self) -> usize {
        let targets: Vec<Ipv4Addr> = self.routes.lock().keys().copied().collect();
        for &target in &targets {
            let _guard = self.locks.lock(target).await;
            if let Err(e) = self.route_table.remove_route(target).await {
                warn!("라우트 삭제 실패 (계속 진행): {} - {}", target, e);
            }
        }
        self.routes.lock().clear();
        targets.len()
    }
}

/// 경로 가속 세션
pub struct AccelerationSession {
    shared: Arc<Shared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl AccelerationSession {
    /// 새 세션 생성
    ///
    /// 선택기, 모니터, 재최적화가 하나의 워커 풀과 대상별 잠금을 공유한다.
    pub fn new(
        config: Config,
        probe: Arc<dyn Probe>,
        route_table: Arc<dyn RouteTable>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        let locks = Arc::new(TargetLocks::new());
        let probe = LatencyProbe::new(probe, config.parallel_tests, config.retry_backoff);
        let selector = RouteSelector::new(config.clone(), probe.clone(), route_table.clone(), locks.clone());

        Self {
            shared: Arc::new(Shared {
                config,
                probe,
                selector,
                route_table,
                locks,
                catalog,
                state: Mutex::new(SessionState::Idle),
                active: AtomicBool::new(false),
                scope: Mutex::new(None),
                routes: Mutex::new(HashMap::new()),
                reoptimizing: DashSet::new(),
                reopt_tasks: Mutex::new(Vec::new()),
                wake: Notify::new(),
            }),
            monitor: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// 가속 시작
    ///
    /// 모든 대상을 동시에 최적화한다. 대상별 적용 실패는 보고서에 담기고,
    /// 하나도 최적화되지 않으면 적용된 라우트를 모두 정리하고 `NothingOptimized`.
    pub async fn start(&self, group: &str, region: &str) -> Result<StartReport> {
        {
            let mut state = self.shared.state.lock();
            if *state != SessionState::Idle {
                warn!("세션이 이미 실행 중 ({:?})", *state);
                return Err(Error::SessionAlreadyActive);
            }
            *state = SessionState::Optimizing;
        }

        let started = Instant::now();
        let targets = self.shared.catalog.targets(group, region);
        if targets.is_empty() {
            self.shared.set_state(SessionState::Idle);
            return Err(Error::NoTargets {
                group: group.to_string(),
                region: region.to_string(),
            });
        }

        let candidates: Arc<[Candidate]> = self.shared.catalog.candidates(region).into();
        info!(
            "가속 시작: {} / {} (대상 {}개, 후보 노드 {}개)",
            group,
            region,
            targets.len(),
            candidates.len()
        );
        let scope = Scope {
            group: group.to_string(),
            region: region.to_string(),
            candidates,
        };
        *self.shared.scope.lock() = Some(scope.clone());

        let mut tasks = JoinSet::new();
        for target in &targets {
            let shared = Arc::clone(&self.shared);
            let scope = scope.clone();
            let address = target.address;
            tasks.spawn(async move {
                let outcome = shared.optimize_target(address, &scope).await;
                (address, outcome)
            });
        }

        let mut report = StartReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((target, outcome)) => {
                    report.outcomes.insert(target, outcome);
                }
                Err(e) => warn!("대상 최적화 태스크 실패: {}", e),
            }
        }

        if report.optimized() == 0 {
            warn!("최적화된 대상 없음, 라우트 정리: {} / {}", group, region);
            self.shared.remove_all_routes().await;
            *self.shared.scope.lock() = None;
            self.shared.set_state(SessionState::Idle);
            return Err(Error::NothingOptimized {
                group: group.to_string(),
                region: region.to_string(),
            });
        }

        self.shared.active.store(true, Ordering::SeqCst);
        self.shared.set_state(SessionState::Active);
        let monitor = RouteMonitor::new(Arc::clone(&self.shared));
        *self.monitor.lock() = Some(tokio::spawn(monitor.run()));

        info!(
            "가속 시작 완료: {}/{}개 대상 최적화 ({:.1}초)",
            report.optimized(),
            targets.len(),
            started.elapsed().as_secs_f64()
        );
        Ok(report)
    }

    /// 가속 정지
    ///
    /// 실행 중이 아니면 아무것도 하지 않는다. 라우트 삭제 실패는 경고만 남기고 계속 진행.
    pub async fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if *state != SessionState::Active {
                debug!("정지할 세션 없음 ({:?})", *state);
                return;
            }
            *state = SessionState::Stopping;
        }

        info!("가속 정지 중...");
        self.shared.active.store(false, Ordering::SeqCst);
        self.shared.wake.notify_one();

        let monitor = self.monitor.lock().take();
        if let Some(handle) = monitor {
            if let Err(e) = handle.await {
                warn!("모니터 종료 실패: {}", e);
            }
        }

        let pending = std::mem::take(&mut *self.shared.reopt_tasks.lock());
        for handle in pending {
            if let Err(e) = handle.await {
                warn!("재최적화 태스크 실패: {}", e);
            }
        }

        let removed = self.shared.remove_all_routes().await;
        self.shared.reoptimizing.clear();
        *self.shared.scope.lock() = None;
        self.shared.set_state(SessionState::Idle);
        info!("가속 정지 완료: 라우트 {}개 정리", removed);
    }

    /// 현재 상태 스냅샷 (I/O 없음)
    pub fn status(&self) -> SessionStatus {
        let state = *self.shared.state.lock();
        let scope = self.shared.scope.lock().clone();
        let routes = self
            .shared
            .routes()
            .into_iter()
            .map(|route| (route.target, route))
            .collect();

        SessionStatus {
            active: self.shared.is_active(),
            state,
            group: scope.as_ref().map(|s| s.group.clone()),
            region: scope.map(|s| s.region),
            routes,
        }
    }

    /// 대상 하나 즉시 재최적화
    ///
    /// 실행 중이 아니거나 같은 대상의 재최적화가 진행 중이면 `Unchanged`.
    pub async fn reoptimize(&self, target: Ipv4Addr) -> TargetOutcome {
        if !self.shared.is_active() {
            return TargetOutcome::Unchanged;
        }
        if !self.shared.reoptimizing.insert(target) {
            debug!("재최적화 이미 진행 중: {}", target);
            return TargetOutcome::Unchanged;
        }
        let outcome = self.shared.reoptimize(target).await;
        self.shared.reoptimizing.remove(&target);
        outcome
    }
}

impl Drop for AccelerationSession {
    fn drop(&mut self) {
        if self.shared.active.swap(false, Ordering::SeqCst) {
            warn!("정지하지 않은 세션 해제: 적용된 라우트가 남아 있을 수 있음");
            self.shared.wake.notify_one();
        }
    }
}

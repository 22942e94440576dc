//! 테스트용 가상 네트워크
//!
//! 프로브 결과가 현재 설치된 게이트웨이에 따라 달라지도록 `Probe`와 `RouteTable`을
//! 하나의 상태로 구현한다.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::probe::Probe;
use crate::route_table::RouteTable;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteEvent {
    Add(Ipv4Addr, Ipv4Addr),
    Remove(Ipv4Addr),
}

#[derive(Default)]
struct State {
    routes: HashMap<Ipv4Addr, Ipv4Addr>,
    direct: HashMap<Ipv4Addr, f64>,
    via: HashMap<(Ipv4Addr, Ipv4Addr), f64>,
    events: Vec<RouteEvent>,
    fail_add: HashSet<Ipv4Addr>,
    add_budget: HashMap<(Ipv4Addr, Ipv4Addr), usize>,
    via_after_adds: HashMap<(Ipv4Addr, Ipv4Addr), (usize, f64)>,
    fail_verify: HashSet<Ipv4Addr>,
    fail_remove: HashSet<Ipv4Addr>,
    overlapping_adds: usize,
    probe_calls: HashMap<Ipv4Addr, usize>,
}

#[derive(Default)]
pub(crate) struct FakeNetwork {
    state: Mutex<State>,
    delay: Duration,
}

impl FakeNetwork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 프로브마다 지연을 넣어 동시 실행이 겹치도록 함
    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// 직접 경로 지연 (후보 노드의 노드 지연도 여기로 설정)
    pub(crate) fn set_direct(&self, host: Ipv4Addr, ms: f64) {
        self.state.lock().direct.insert(host, ms);
    }

    /// 직접 경로 응답 없음
    pub(crate) fn clear_direct(&self, host: Ipv4Addr) {
        self.state.lock().direct.remove(&host);
    }

    /// `relay` 경유 시 `target` 지연
    pub(crate) fn set_via(&self, target: Ipv4Addr, relay: Ipv4Addr, ms: f64) {
        self.state.lock().via.insert((target, relay), ms);
    }

    /// `target` -> `relay` 추가가 `n`번 성공하면 경유 지연을 `ms`로 변경
    pub(crate) fn set_via_after_adds(&self, target: Ipv4Addr, relay: Ipv4Addr, n: usize, ms: f64) {
        self.state.lock().via_after_adds.insert((target, relay), (n, ms));
    }

    pub(crate) fn fail_add(&self, gateway: Ipv4Addr) {
        self.state.lock().fail_add.insert(gateway);
    }

    /// `target` -> `gateway` 추가가 `n`번 성공한 뒤부터 실패
    pub(crate) fn fail_add_after(&self, target: Ipv4Addr, gateway: Ipv4Addr, n: usize) {
        self.state.lock().add_budget.insert((target, gateway), n);
    }

    pub(crate) fn fail_verify(&self, gateway: Ipv4Addr) {
        self.state.lock().fail_verify.insert(gateway);
    }

    pub(crate) fn fail_remove(&self, target: Ipv4Addr) {
        self.state.lock().fail_remove.insert(target);
    }

    pub(crate) fn gateway_of(&self, target: Ipv4Addr) -> Option<Ipv4Addr> {
        self.state.lock().routes.get(&target).copied()
    }

    pub(crate) fn live_routes(&self) -> usize {
        self.state.lock().routes.len()
    }

    pub(crate) fn events(&self) -> Vec<RouteEvent> {
        self.state.lock().events.clone()
    }

    pub(crate) fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// 기존 매핑이 남아 있는 상태에서 추가된 횟수
    pub(crate) fn overlapping_adds(&self) -> usize {
        self.state.lock().overlapping_adds
    }

    pub(crate) fn probe_calls(&self, host: Ipv4Addr) -> usize {
        self.state.lock().probe_calls.get(&host).copied().unwrap_or(0)
    }

    fn current_latency(&self, addr: Ipv4Addr) -> Option<f64> {
        let mut state = self.state.lock();
        *state.probe_calls.entry(addr).or_default() += 1;
        match state.routes.get(&addr) {
            Some(gw) => state.via.get(&(addr, *gw)).copied(),
            None => state.direct.get(&addr).copied(),
        }
    }
}

#[async_trait]
impl Probe for FakeNetwork {
    async fn round_trip(&self, addr: Ipv4Addr, _timeout: Duration) -> io::Result<Option<Duration>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self
            .current_latency(addr)
            .map(|ms| Duration::from_nanos((ms * 1_000_000.0).round() as u64)))
    }
}

#[async_trait]
impl RouteTable for FakeNetwork {
    async fn add_route(&self, target: Ipv4Addr, gateway: Ipv4Addr) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_add.contains(&gateway) {
            return Err(Error::apply_failed(target, gateway, "scripted add failure"));
        }
        if let Some(left) = state.add_budget.get_mut(&(target, gateway)) {
            if *left == 0 {
                return Err(Error::apply_failed(target, gateway, "scripted add failure"));
            }
            *left -= 1;
        }
        if state.routes.contains_key(&target) {
            state.overlapping_adds += 1;
        }
        state.routes.insert(target, gateway);
        state.events.push(RouteEvent::Add(target, gateway));

        let switched = match state.via_after_adds.get_mut(&(target, gateway)) {
            Some((left, ms)) => {
                *left = left.saturating_sub(1);
                (*left == 0).then_some(*ms)
            }
            None => None,
        };
        if let Some(ms) = switched {
            state.via_after_adds.remove(&(target, gateway));
            state.via.insert((target, gateway), ms);
        }
        Ok(())
    }

    async fn remove_route(&self, target: Ipv4Addr) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(RouteEvent::Remove(target));
        if state.fail_remove.contains(&target) {
            return Err(Error::Io(io::Error::new(io::ErrorKind::Other, "scripted remove failure")));
        }
        state.routes.remove(&target);
        Ok(())
    }

    async fn route_exists(&self, target: Ipv4Addr, gateway: Ipv4Addr) -> Result<bool> {
        let state = self.state.lock();
        if state.fail_verify.contains(&gateway) {
            return Ok(false);
        }
        Ok(state.routes.get(&target) == Some(&gateway))
    }
}

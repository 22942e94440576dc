//! 후보 노드 품질 점수
//!
//! 가중치 (고정):
//! - 노드 지연: 40%
//! - 노드→대상 지연: 40%
//! - 안정성 (반복 샘플 분산의 역수): 20%
//!
//! 지연 점수는 `max(0, 100 - ms / 2)` (0ms = 100점, 200ms 이상 = 0점)

use std::cmp::Ordering;
use std::net::Ipv4Addr;

use crate::stats::SampleSet;

pub const RELAY_WEIGHT: f64 = 0.4;
pub const TARGET_WEIGHT: f64 = 0.4;
pub const STABILITY_WEIGHT: f64 = 0.2;

/// 후보 노드 점수 (최적화 실행마다 새로 계산)
#[derive(Debug, Clone, PartialEq)]
pub struct NodeScore {
    /// 후보 노드 주소
    pub address: Ipv4Addr,

    /// 평균 노드 지연 (밀리초)
    pub relay_latency_ms: f64,

    /// 노드 경유 평균 대상 지연 (밀리초)
    pub relay_to_target_ms: f64,

    /// 안정성 점수 (0 ~ 100)
    pub stability: f64,

    /// 노드→대상 측정 성공률 (0.0 ~ 1.0)
    pub connectivity: f64,

    /// 종합 점수 (0 ~ 100)
    pub score: f64,
}

impl NodeScore {
    /// 순위 비교: 점수 내림차순, 노드→대상 지연 오름차순, 주소 오름차순
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.relay_to_target_ms.total_cmp(&other.relay_to_target_ms))
            .then_with(|| self.address.cmp(&other.address))
    }
}

/// 지연(밀리초)을 0~100 점수로 변환
pub fn latency_score(ms: f64) -> f64 {
    (100.0 - ms / 2.0).clamp(0.0, 100.0)
}

/// 두 샘플 분산 평균으로부터 안정성 점수 계산
pub fn stability_score(relay_variance: f64, target_variance: f64) -> f64 {
    100.0 - ((relay_variance + target_variance) / 2.0).min(100.0)
}

/// 노드 점수 계산기 (상태 없음)
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeScorer;

impl NodeScorer {
    pub fn new() -> Self {
        Self
    }

    /// 점수 계산
    ///
    /// 노드 또는 노드→대상 샘플 중 성공한 것이 없으면 `None` (순위에서 제외)
    pub fn score(
        &self,
        address: Ipv4Addr,
        relay: &SampleSet,
        relay_to_target: &SampleSet,
    ) -> Option<NodeScore> {
        let relay_ms = relay.mean()?;
        let target_ms = relay_to_target.mean()?;
        let relay_var = relay.variance().unwrap_or(0.0);
        let target_var = relay_to_target.variance().unwrap_or(0.0);

        let stability = stability_score(relay_var, target_var);
        let score = (latency_score(relay_ms) * RELAY_WEIGHT
            + latency_score(target_ms) * TARGET_WEIGHT
            + stability * STABILITY_WEIGHT)
            .clamp(0.0, 100.0);

        Some(NodeScore {
            address,
            relay_latency_ms: relay_ms,
            relay_to_target_ms: target_ms,
            stability,
            connectivity: relay_to_target.connectivity(),
            score,
        })
    }
}

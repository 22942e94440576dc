//! 가속 엔진 설정

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::probe::Latency;
use crate::{DEFAULT_PARALLEL_TESTS, DEFAULT_RELAY_CEILING_MS};

/// 경로 가속 엔진 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 동시 프로브 워커 수 (공유 워커 풀 크기)
    pub parallel_tests: usize,

    /// 전체 측정 시 샘플 수
    pub probe_samples: usize,

    /// 샘플당 타임아웃
    pub probe_timeout: Duration,

    /// 전체 실패 시 재시도 횟수
    pub max_retries: usize,

    /// 재시도 간 고정 대기 시간
    pub retry_backoff: Duration,

    /// 안정성 평가용 반복 샘플 수 (노드 지연, 노드→대상 지연 각각)
    pub stability_samples: usize,

    /// 점수 계산 상한 (밀리초). 노드 지연이 이보다 크면 후보에서 제외
    pub relay_ceiling_ms: f64,

    /// 빠른 제외 임계값 (밀리초). None이면 사용 안 함
    pub relay_fast_reject_ms: Option<f64>,

    /// 모니터 폴링 주기
    pub monitor_interval: Duration,

    /// 모니터 측정 샘플 수
    pub monitor_samples: usize,

    /// 모니터 샘플당 타임아웃
    pub monitor_timeout: Duration,

    /// 재최적화 트리거 배수 (현재 지연 > baseline × factor)
    pub degradation_factor: f64,

    /// 라우트 적용 후 재측정하여 개선이 없으면 롤백
    pub confirm_after_apply: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            parallel_tests: DEFAULT_PARALLEL_TESTS,
            probe_samples: 4,
            probe_timeout: Duration::from_secs(1),
            max_retries: 2,
            retry_backoff: Duration::from_millis(300),
            stability_samples: 3,
            relay_ceiling_ms: DEFAULT_RELAY_CEILING_MS,
            relay_fast_reject_ms: Some(100.0),
            monitor_interval: Duration::from_secs(1),
            monitor_samples: 2,
            monitor_timeout: Duration::from_millis(500),
            degradation_factor: 1.5,
            confirm_after_apply: true,
        }
    }
}

/// `config.json`의 `settings` 블록
///
/// 모든 항목은 선택 사항이며 없는 값은 기존 설정을 유지한다.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    pub parallel_tests: Option<usize>,
    pub test_count: Option<usize>,
    /// 초 단위
    pub test_timeout: Option<f64>,
    pub max_retries: Option<usize>,
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// `settings` 블록 값을 덮어쓴 설정 반환
    pub fn with_settings(mut self, settings: &Settings) -> Self {
        if let Some(n) = settings.parallel_tests.filter(|n| *n > 0) {
            self.parallel_tests = n;
        }
        if let Some(n) = settings.test_count.filter(|n| *n > 0) {
            self.probe_samples = n;
        }
        if let Some(secs) = settings.test_timeout.filter(|s| *s > 0.0) {
            match Duration::try_from_secs_f64(secs) {
                Ok(timeout) => self.probe_timeout = timeout,
                Err(e) => warn!("test_timeout {} 무시: {}", secs, e),
            }
        }
        if let Some(n) = settings.max_retries {
            self.max_retries = n;
        }
        self
    }

    /// 재최적화가 필요한 지연인지 판단
    ///
    /// 기준을 알 수 없으면 판단하지 않는다. 기준이 있는데 응답이 없으면 악화로 본다.
    pub fn is_degraded(&self, current: Latency, reference: Latency) -> bool {
        match (current, reference) {
            (_, Latency::Unreachable) => false,
            (Latency::Unreachable, Latency::Reachable(_)) => true,
            (Latency::Reachable(current_ms), Latency::Reachable(reference_ms)) => {
                current_ms > reference_ms * self.degradation_factor
            }
        }
    }

    /// 노드 지연이 후보로 쓸 수 있는 범위인지 판단
    pub fn relay_acceptable(&self, relay_ms: f64) -> bool {
        if relay_ms > self.relay_ceiling_ms {
            return false;
        }
        match self.relay_fast_reject_ms {
            Some(limit) => relay_ms <= limit,
            None => true,
        }
    }

    /// 빠른 측정용 설정 (샘플과 타임아웃 축소)
    pub fn quick() -> Self {
        Self {
            probe_samples: 2,
            probe_timeout: Duration::from_millis(500),
            max_retries: 1,
            retry_backoff: Duration::from_millis(200),
            stability_samples: 2,
            monitor_samples: 1,
            ..Self::default()
        }
    }

    /// 정밀 측정용 설정
    pub fn thorough() -> Self {
        Self {
            probe_samples: 8,
            probe_timeout: Duration::from_secs(2),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            stability_samples: 5,
            relay_fast_reject_ms: None,
            monitor_samples: 3,
            monitor_timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }
}

//! # Route Accel
//!
//! 중계 노드 경유 호스트 라우트 기반 경로 가속 엔진
//!
//! ## 핵심 특징
//! - **지연 측정**: 공유 워커 풀에서 재시도 포함 반복 측정
//! - **노드 점수**: 노드 지연, 노드 경유 대상 지연, 안정성 가중 합산
//! - **경로 선택**: 임시 라우트로 후보를 동시에 평가, 기준보다 빠를 때만 적용
//! - **세션**: 대상 그룹 단위 시작/정지, 중단 시 모든 라우트 원복
//! - **모니터**: 지연 악화 감지 시 즉시 재최적화

pub mod catalog;
pub mod config;
pub mod error;
pub mod monitor;
pub mod probe;
pub mod route_table;
pub mod scorer;
pub mod selector;
pub mod session;
pub mod stats;

#[cfg(test)]
mod fake;

pub use catalog::{Candidate, Catalog, JsonCatalog, StaticCatalog, Target};
pub use config::{Config, Settings};
pub use error::{parse_address, Error, Result};
pub use probe::{Latency, LatencyProbe, PingProbe, Probe, TcpConnectProbe};
pub use route_table::{install_route, Platform, RouteTable, SystemRouteTable};
pub use scorer::{NodeScore, NodeScorer};
pub use selector::{RouteSelector, Selection, SelectionOutcome, TargetLocks};
pub use session::{AccelerationSession, Route, SessionState, SessionStatus, StartReport, TargetOutcome};
pub use stats::SampleSet;

/// 도달 불가 지연 값 (밀리초)
pub const UNREACHABLE_LATENCY_MS: f64 = 999.0;

/// 기본 동시 프로브 수
pub const DEFAULT_PARALLEL_TESTS: usize = 5;

/// 노드 지연 상한 (밀리초)
pub const DEFAULT_RELAY_CEILING_MS: f64 = 200.0;

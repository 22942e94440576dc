//! 대상 서버 / 후보 노드 카탈로그
//!
//! `config.json` 형식:
//!
//! ```json
//! {
//!   "game_servers": { "DotA2": { "SEA": { "valve": ["103.28.54.1"] } } },
//!   "nodes": {
//!     "SEA": [ { "ip": "119.81.135.50", "name": "HK-1" } ],
//!     "CN": { "telecom": [ { "ip": "116.211.105.100" } ] }
//!   },
//!   "settings": { "parallel_tests": 5, "test_count": 4, "test_timeout": 2, "max_retries": 3 }
//! }
//! ```
//!
//! 잘못된 항목은 경고 후 건너뛰며, 찾을 수 없는 그룹/지역은 빈 목록을 반환한다.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::parse_address;
use crate::Result;

/// 설정 파일 경로 환경 변수
pub const CONFIG_ENV: &str = "ACCELERATOR_CONFIG";

/// 기본 설정 파일 경로
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// 최적화 대상 서버
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub address: Ipv4Addr,
    /// 서버 그룹 (클러스터/제공자) 이름
    pub group: String,
}

impl Target {
    pub fn new(address: Ipv4Addr, group: impl Into<String>) -> Self {
        Self {
            address,
            group: group.into(),
        }
    }
}

/// 후보 중계 노드
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub address: Ipv4Addr,
    /// 제공자 / ISP 이름
    pub provider: String,
    pub name: Option<String>,
}

impl Candidate {
    pub fn new(address: Ipv4Addr, provider: impl Into<String>) -> Self {
        Self {
            address,
            provider: provider.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// 설정 제공자
pub trait Catalog: Send + Sync {
    /// 대상 그룹/지역의 서버 목록
    fn targets(&self, group: &str, region: &str) -> Vec<Target>;

    /// 지역의 후보 노드 목록
    fn candidates(&self, region: &str) -> Vec<Candidate>;
}

/// 메모리 카탈로그 (코드에서 직접 구성)
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    targets: BTreeMap<(String, String), Vec<Target>>,
    candidates: BTreeMap<String, Vec<Candidate>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, group: &str, region: &str, target: Target) -> Self {
        push_unique_target(
            self.targets
                .entry((group.to_string(), region.to_string()))
                .or_default(),
            target,
        );
        self
    }

    pub fn with_candidate(mut self, region: &str, candidate: Candidate) -> Self {
        push_unique_candidate(self.candidates.entry(region.to_string()).or_default(), candidate);
        self
    }
}

impl Catalog for StaticCatalog {
    fn targets(&self, group: &str, region: &str) -> Vec<Target> {
        self.targets
            .get(&(group.to_string(), region.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn candidates(&self, region: &str) -> Vec<Candidate> {
        self.candidates.get(region).cloned().unwrap_or_default()
    }
}

/// `config.json` 기반 카탈로그
#[derive(Debug, Clone, Default)]
pub struct JsonCatalog {
    inner: StaticCatalog,
    settings: Settings,
}

impl JsonCatalog {
    /// JSON 문자열 파싱. 문법 오류만 에러이며 잘못된 항목은 건너뜀
    pub fn parse(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        Ok(Self::from_value(&value))
    }

    /// 파일 로드
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let catalog = Self::parse(&text)?;
        info!("설정 파일 로드: {}", path.as_ref().display());
        Ok(catalog)
    }

    /// 파일 로드, 실패 시 빈 카탈로그
    pub fn load_or_empty(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            warn!("설정 파일 없음, 빈 카탈로그 사용: {}", path.display());
            return Self::default();
        }
        match Self::load(path) {
            Ok(catalog) => catalog,
            Err(e) => {
                warn!("설정 파일 로드 실패, 빈 카탈로그 사용: {} - {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// `ACCELERATOR_CONFIG` (기본 `config.json`) 로드
    pub fn from_env() -> Self {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_or_empty(path)
    }

    pub fn from_value(value: &Value) -> Self {
        let mut inner = StaticCatalog::new();

        if let Some(groups) = value.get("game_servers").and_then(Value::as_object) {
            for (group, regions) in groups {
                let Some(regions) = regions.as_object() else {
                    warn!("잘못된 game_servers 항목: {}", group);
                    continue;
                };
                for (region, clusters) in regions {
                    for target in parse_targets(clusters) {
                        inner = inner.with_target(group, region, target);
                    }
                }
            }
        }

        if let Some(regions) = value.get("nodes").and_then(Value::as_object) {
            for (region, nodes) in regions {
                for candidate in parse_candidates(region, nodes) {
                    inner = inner.with_candidate(region, candidate);
                }
            }
        }

        let settings = match value.get("settings") {
            Some(v) => serde_json::from_value::<Settings>(v.clone()).unwrap_or_else(|e| {
                warn!("잘못된 settings 블록 무시: {}", e);
                Settings::default()
            }),
            None => Settings::default(),
        };

        Self { inner, settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// 등록된 대상 그룹 이름
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.inner.targets.keys().map(|(g, _)| g.clone()).collect();
        groups.dedup();
        groups
    }

    /// 그룹의 지역 이름
    pub fn regions(&self, group: &str) -> Vec<String> {
        self.inner
            .targets
            .keys()
            .filter(|(g, _)| g == group)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

impl Catalog for JsonCatalog {
    fn targets(&self, group: &str, region: &str) -> Vec<Target> {
        let targets = self.inner.targets(group, region);
        if targets.is_empty() {
            warn!("대상 서버 설정 없음: {} - {}", group, region);
        } else {
            debug!("대상 서버 {}개: {} - {}", targets.len(), group, region);
        }
        targets
    }

    fn candidates(&self, region: &str) -> Vec<Candidate> {
        let candidates = self.inner.candidates(region);
        if candidates.is_empty() {
            warn!("후보 노드 설정 없음: {}", region);
        } else {
            debug!("후보 노드 {}개: {}", candidates.len(), region);
        }
        candidates
    }
}

/// `{ cluster: [ip, ...] }` 또는 `[ip, ...]`
fn parse_targets(clusters: &Value) -> Vec<Target> {
    let mut targets = Vec::new();
    match clusters {
        Value::Object(map) => {
            for (cluster, list) in map {
                collect_target_list(cluster, list, &mut targets);
            }
        }
        Value::Array(_) => collect_target_list("default", clusters, &mut targets),
        other => warn!("잘못된 서버 목록 형식: {}", other),
    }
    targets
}

fn collect_target_list(cluster: &str, list: &Value, out: &mut Vec<Target>) {
    let Some(items) = list.as_array() else {
        warn!("잘못된 서버 목록: {}", cluster);
        return;
    };
    for item in items {
        match item.as_str().map(parse_address) {
            Some(Ok(address)) => push_unique_target(out, Target::new(address, cluster)),
            _ => warn!("잘못된 서버 주소 무시: {} ({})", item, cluster),
        }
    }
}

/// `[node, ...]` 또는 `{ isp: [node, ...] }`
fn parse_candidates(region: &str, nodes: &Value) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    match nodes {
        Value::Array(_) => collect_node_list(region, nodes, &mut candidates),
        Value::Object(map) => {
            for (isp, list) in map {
                collect_node_list(isp, list, &mut candidates);
            }
        }
        other => warn!("잘못된 노드 목록 형식: {} ({})", other, region),
    }
    candidates
}

fn collect_node_list(provider: &str, list: &Value, out: &mut Vec<Candidate>) {
    let Some(items) = list.as_array() else {
        warn!("잘못된 노드 목록: {}", provider);
        return;
    };
    for item in items {
        let (ip, name) = match item {
            Value::String(ip) => (Some(ip.as_str()), None),
            Value::Object(node) => (
                node.get("ip").and_then(Value::as_str),
                node.get("name").and_then(Value::as_str),
            ),
            _ => (None, None),
        };
        match ip.map(parse_address) {
            Some(Ok(address)) => {
                let provider = item
                    .get("provider")
                    .and_then(Value::as_str)
                    .unwrap_or(provider);
                let mut candidate = Candidate::new(address, provider);
                if let Some(name) = name {
                    candidate = candidate.with_name(name);
                }
                push_unique_candidate(out, candidate);
            }
            _ => warn!("잘못된 노드 항목 무시: {} ({})", item, provider),
        }
    }
}

fn push_unique_target(list: &mut Vec<Target>, target: Target) {
    if !list.iter().any(|t| t.address == target.address) {
        list.push(target);
    }
}

fn push_unique_candidate(list: &mut Vec<Candidate>, candidate: Candidate) {
    if !list.iter().any(|c| c.address == candidate.address) {
        list.push(candidate);
    }
}

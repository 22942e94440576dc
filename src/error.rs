//! 에러 타입 정의

use std::net::Ipv4Addr;

use thiserror::Error;

/// 경로 가속 에러 타입
///
/// 응답 없음(프로브 타임아웃)은 에러가 아니다. [`crate::Latency::Unreachable`]로 측정된다.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("카탈로그 파싱 에러: {0}")]
    Catalog(#[from] serde_json::Error),

    #[error("유효하지 않은 IPv4 주소: {0}")]
    InvalidAddress(String),

    #[error("라우트 적용 실패: {target} -> {gateway} ({reason})")]
    RouteApplyFailed {
        target: Ipv4Addr,
        gateway: Ipv4Addr,
        reason: String,
    },

    #[error("사용 가능한 후보 노드 없음: region={region}")]
    NoCandidatesAvailable { region: String },

    #[error("세션이 이미 실행 중")]
    SessionAlreadyActive,

    #[error("대상 서버 없음: {group} / {region}")]
    NoTargets { group: String, region: String },

    #[error("최적화된 대상 없음: {group} / {region}")]
    NothingOptimized { group: String, region: String },
}

impl Error {
    pub(crate) fn apply_failed(target: Ipv4Addr, gateway: Ipv4Addr, reason: impl Into<String>) -> Self {
        Error::RouteApplyFailed {
            target,
            gateway,
            reason: reason.into(),
        }
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

/// 문자열을 IPv4 주소로 파싱 (I/O 없이 즉시 실패)
pub fn parse_address(input: &str) -> Result<Ipv4Addr> {
    input
        .trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| Error::InvalidAddress(input.to_string()))
}

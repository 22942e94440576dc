//! 지연 측정
//!
//! - 단일 왕복 측정은 [`Probe`] 트레이트 (TCP connect 타이밍, 시스템 ping)
//! - [`LatencyProbe`]가 샘플링, 재시도, 평균 계산 및 워커 풀 제한을 담당
//! - 응답 없음은 에러가 아니라 [`Latency::Unreachable`]

use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::parse_address;
use crate::stats::SampleSet;
use crate::{Result, UNREACHABLE_LATENCY_MS};

/// 측정 결과
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Latency {
    /// 평균 왕복 지연 (밀리초)
    Reachable(f64),
    /// 성공한 샘플 없음
    Unreachable,
}

impl Latency {
    /// 밀리초 값. Unreachable은 센티널 값([`UNREACHABLE_LATENCY_MS`])
    pub fn as_millis(self) -> f64 {
        match self {
            Latency::Reachable(ms) => ms,
            Latency::Unreachable => UNREACHABLE_LATENCY_MS,
        }
    }

    pub fn is_reachable(self) -> bool {
        matches!(self, Latency::Reachable(_))
    }

    /// 샘플 평균으로 변환
    pub fn from_samples(samples: &SampleSet) -> Self {
        match samples.mean() {
            Some(ms) => Latency::Reachable(ms),
            None => Latency::Unreachable,
        }
    }
}

impl fmt::Display for Latency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Latency::Reachable(ms) => write!(f, "{:.1}ms", ms),
            Latency::Unreachable => write!(f, "timeout"),
        }
    }
}

/// 단일 왕복 측정
#[async_trait]
pub trait Probe: Send + Sync {
    /// `Ok(Some(rtt))`: 응답, `Ok(None)`: 타임아웃, `Err`: 일시적 실패 (거부, 도달 불가 등)
    async fn round_trip(&self, addr: Ipv4Addr, timeout: Duration) -> io::Result<Option<Duration>>;
}

/// TCP connect 소요 시간 측정
#[derive(Debug, Clone, Copy)]
pub struct TcpConnectProbe {
    port: u16,
}

impl TcpConnectProbe {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl Default for TcpConnectProbe {
    fn default() -> Self {
        Self::new(80)
    }
}

#[async_trait]
impl Probe for TcpConnectProbe {
    async fn round_trip(&self, addr: Ipv4Addr, timeout: Duration) -> io::Result<Option<Duration>> {
        let start = Instant::now();
        match tokio::time::timeout(timeout, TcpStream::connect((addr, self.port))).await {
            Ok(Ok(_stream)) => Ok(Some(start.elapsed())),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }
}

/// 시스템 `ping` 명령 (ICMP echo 1회)
#[derive(Debug, Clone, Copy, Default)]
pub struct PingProbe;

impl PingProbe {
    fn args(addr: Ipv4Addr, timeout: Duration) -> Vec<String> {
        let host = addr.to_string();
        if cfg!(target_os = "windows") {
            vec!["-n".into(), "1".into(), "-w".into(), timeout.as_millis().to_string(), host]
        } else if cfg!(target_os = "macos") {
            vec!["-c".into(), "1".into(), "-W".into(), timeout.as_millis().to_string(), host]
        } else {
            // Linux iputils: -W 는 초 단위
            let secs = timeout.as_secs_f64().ceil().max(1.0) as u64;
            vec!["-c".into(), "1".into(), "-W".into(), secs.to_string(), host]
        }
    }
}

#[async_trait]
impl Probe for PingProbe {
    async fn round_trip(&self, addr: Ipv4Addr, timeout: Duration) -> io::Result<Option<Duration>> {
        let mut cmd = Command::new("ping");
        cmd.args(Self::args(addr, timeout)).kill_on_drop(true);

        // ping 자체 대기 + 프로세스 기동 여유
        let output = match tokio::time::timeout(timeout + Duration::from_secs(1), cmd.output()).await {
            Ok(output) => output?,
            Err(_) => return Ok(None),
        };

        if !output.status.success() {
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_ping_output(&stdout) {
            Some(ms) => Ok(Some(Duration::from_secs_f64(ms / 1000.0))),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "ping 출력에서 지연 값을 찾을 수 없음",
            )),
        }
    }
}

/// ping 출력에서 지연(밀리초) 추출
///
/// 요약 평균(Windows `Average =`, `平均 =`, Unix `min/avg/max`)을 우선하고,
/// 없으면 첫 응답의 `time=` 값을 사용한다.
pub fn parse_ping_output(output: &str) -> Option<f64> {
    for marker in ["Average", "平均"] {
        if let Some(ms) = number_after(output, marker) {
            return Some(ms);
        }
    }

    if let Some(idx) = output.find("min/avg/max") {
        let rest = &output[idx..];
        let values = rest.split('=').nth(1)?;
        if let Some(avg) = values.trim().split('/').nth(1) {
            if let Ok(ms) = avg.trim().parse::<f64>() {
                return Some(ms);
            }
        }
    }

    for marker in ["time=", "time<", "时间=", "时间<"] {
        if let Some(ms) = number_after(output, marker) {
            return Some(ms);
        }
    }

    None
}

fn number_after(text: &str, marker: &str) -> Option<f64> {
    let start = text.find(marker)? + marker.len();
    let rest = text[start..].trim_start_matches(|c: char| c == ' ' || c == '=' || c == '<');
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// 워커 풀 기반 지연 측정기
///
/// 모든 프로브 호출은 공유 세마포어 permit을 획득한 뒤 실행된다.
#[derive(Clone)]
pub struct LatencyProbe {
    probe: Arc<dyn Probe>,
    pool: Arc<Semaphore>,
    retry_backoff: Duration,
}

impl fmt::Debug for LatencyProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatencyProbe")
            .field("available_workers", &self.pool.available_permits())
            .field("retry_backoff", &self.retry_backoff)
            .finish()
    }
}

impl LatencyProbe {
    /// 새 측정기 생성 (전용 워커 풀)
    pub fn new(probe: Arc<dyn Probe>, workers: usize, retry_backoff: Duration) -> Self {
        Self::with_pool(probe, Arc::new(Semaphore::new(workers.max(1))), retry_backoff)
    }

    /// 기존 워커 풀 공유
    pub fn with_pool(probe: Arc<dyn Probe>, pool: Arc<Semaphore>, retry_backoff: Duration) -> Self {
        Self {
            probe,
            pool,
            retry_backoff,
        }
    }

    /// `count`회 측정한 원시 샘플 (재시도 없음)
    pub async fn sample(&self, addr: Ipv4Addr, count: usize, timeout: Duration) -> SampleSet {
        let mut samples = SampleSet::new();

        for _ in 0..count.max(1) {
            let permit = match self.pool.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    samples.record_failure();
                    continue;
                }
            };
            let result = self.probe.round_trip(addr, timeout).await;
            drop(permit);

            match result {
                Ok(Some(rtt)) => samples.record(rtt),
                Ok(None) => samples.record_failure(),
                Err(e) => {
                    debug!("프로브 실패: {} - {}", addr, e);
                    samples.record_failure();
                }
            }
        }

        samples
    }

    /// 평균 지연 측정
    ///
    /// 성공 샘플이 하나도 없으면 `retry_backoff` 대기 후 최대 `max_retries`회 재시도하고,
    /// 끝내 실패하면 [`Latency::Unreachable`] 반환. 에러를 반환하지 않는다.
    pub async fn measure(
        &self,
        addr: Ipv4Addr,
        sample_count: usize,
        per_sample_timeout: Duration,
        max_retries: usize,
    ) -> Latency {
        for attempt in 0..=max_retries {
            let samples = self.sample(addr, sample_count, per_sample_timeout).await;
            if let Some(mean) = samples.mean() {
                debug!(
                    "지연 측정: {} -> {:.1}ms ({}/{} 성공)",
                    addr,
                    mean,
                    samples.successes(),
                    samples.attempts()
                );
                return Latency::Reachable(mean);
            }

            if attempt < max_retries {
                debug!("응답 없음, 재시도 ({}/{}): {}", attempt + 1, max_retries, addr);
                tokio::time::sleep(self.retry_backoff).await;
            }
        }

        debug!("도달 불가: {}", addr);
        Latency::Unreachable
    }

    /// 문자열 주소 측정. 주소가 잘못되면 I/O 없이 `InvalidAddress`
    pub async fn measure_host(
        &self,
        host: &str,
        sample_count: usize,
        per_sample_timeout: Duration,
        max_retries: usize,
    ) -> Result<Latency> {
        let addr = parse_address(host)?;
        Ok(self
            .measure(addr, sample_count, per_sample_timeout, max_retries)
            .await)
    }
}

//! 경로 가속기 - 중계 노드 경유 호스트 라우트 적용
//!
//! 대상 서버 그룹의 지연을 측정하고 더 빠른 중계 노드가 있으면 호스트 라우트를 적용한다.
//! Ctrl-C로 정지하면 적용한 라우트를 모두 삭제한다. 관리자 권한 필요.
//!
//! 사용법:
//!   cargo run --release --bin route-accel -- --group <GROUP> --region <REGION> [OPTIONS]
//!
//! 예시:
//!   # 기본 설정 파일(config.json)로 실행
//!   sudo route-accel --group valorant --region SEA
//!
//!   # TCP 프로브 + 빠른 측정
//!   sudo route-accel -g valorant -r SEA --probe tcp:443 --preset quick

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use route_accel::catalog::{CONFIG_ENV, DEFAULT_CONFIG_PATH};
use route_accel::{
    AccelerationSession, Config, JsonCatalog, PingProbe, Probe, SessionStatus, SystemRouteTable,
    TcpConnectProbe, TargetOutcome,
};

/// 실행 옵션
struct Options {
    config_path: PathBuf,
    group: Option<String>,
    region: Option<String>,
    preset: Preset,
    probe: ProbeKind,
    status_interval: Duration,
}

#[derive(Clone, Copy)]
enum Preset {
    Default,
    Quick,
    Thorough,
}

#[derive(Clone, Copy)]
enum ProbeKind {
    Ping,
    Tcp(u16),
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config_path: std::env::var(CONFIG_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
            group: None,
            region: None,
            preset: Preset::Default,
            probe: ProbeKind::Ping,
            status_interval: Duration::from_secs(10),
        }
    }
}

fn parse_probe(value: &str) -> Option<ProbeKind> {
    match value {
        "ping" | "icmp" => Some(ProbeKind::Ping),
        "tcp" => Some(ProbeKind::Tcp(80)),
        other => other
            .strip_prefix("tcp:")
            .and_then(|port| port.parse().ok())
            .map(ProbeKind::Tcp),
    }
}

fn print_help() {
    println!(
        r#"Route Accel - 중계 노드 경로 가속기

대상 서버 지연을 측정하고 더 빠른 중계 노드 경유 호스트 라우트를 적용합니다.
Ctrl-C로 정지하면 모든 라우트를 원래대로 되돌립니다. (관리자 권한 필요)

사용법:
  route-accel --group <GROUP> --region <REGION> [OPTIONS]

옵션:
  -c, --config <PATH>     설정 파일 (기본: ${CONFIG_ENV} 또는 {DEFAULT_CONFIG_PATH})
  -g, --group <GROUP>     대상 서버 그룹
  -r, --region <REGION>   지역
  -p, --preset <NAME>     측정 프리셋: default, quick, thorough
  --probe <KIND>          프로브 방식: ping, tcp, tcp:<PORT> (기본: ping)
  --status <SECS>         상태 출력 주기 (기본: 10)
  -h, --help              이 도움말 출력

로그 레벨은 RUST_LOG 환경 변수로 조정 (기본: info)
"#
    );
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options::default();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match args[i].as_str() {
            "--config" | "-c" => {
                let v = value.ok_or("--config 값 필요")?;
                options.config_path = PathBuf::from(v);
                i += 1;
            }
            "--group" | "-g" => {
                options.group = Some(value.ok_or("--group 값 필요")?.clone());
                i += 1;
            }
            "--region" | "-r" => {
                options.region = Some(value.ok_or("--region 값 필요")?.clone());
                i += 1;
            }
            "--preset" | "-p" => {
                options.preset = match value.map(String::as_str) {
                    Some("default") => Preset::Default,
                    Some("quick") => Preset::Quick,
                    Some("thorough") => Preset::Thorough,
                    other => return Err(format!("알 수 없는 프리셋: {}", other.unwrap_or(""))),
                };
                i += 1;
            }
            "--probe" => {
                let v = value.ok_or("--probe 값 필요")?;
                options.probe = parse_probe(v).ok_or_else(|| format!("알 수 없는 프로브: {v}"))?;
                i += 1;
            }
            "--status" => {
                let secs: u64 = value
                    .and_then(|v| v.parse().ok())
                    .ok_or("--status 값은 초 단위 숫자")?;
                options.status_interval = Duration::from_secs(secs.max(1));
                i += 1;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => warn!("알 수 없는 옵션 무시: {}", other),
        }
        i += 1;
    }

    Ok(options)
}

fn print_status(status: &SessionStatus) {
    info!(
        "상태: {:?}, 최적화 {}/{}개",
        status.state,
        status.optimized_count(),
        status.routes.len()
    );
    for route in status.routes.values() {
        match (route.relay, route.improvement_pct()) {
            (Some(relay), Some(pct)) => info!(
                "  {} via {}: {} -> {} ({:+.1}%)",
                route.target, relay, route.baseline, route.current, pct
            ),
            (Some(relay), None) => info!(
                "  {} via {}: {} -> {}",
                route.target, relay, route.baseline, route.current
            ),
            (None, _) => info!("  {} 직접 경로: {}", route.target, route.current),
        }
    }
    if let Some(avg) = status.average_improvement_pct() {
        info!("평균 개선율: {:.1}%", avg);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("로깅 초기화 실패: {e}");
    }

    let options = match parse_args() {
        Ok(options) => options,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let catalog = JsonCatalog::load_or_empty(&options.config_path);
    let (Some(group), Some(region)) = (options.group.clone(), options.region.clone()) else {
        error!("--group 과 --region 이 필요합니다 (--help 참고)");
        for group in catalog.groups() {
            info!("사용 가능한 그룹: {} ({})", group, catalog.regions(&group).join(", "));
        }
        return ExitCode::FAILURE;
    };

    let preset = match options.preset {
        Preset::Default => Config::default(),
        Preset::Quick => Config::quick(),
        Preset::Thorough => Config::thorough(),
    };
    let config = preset.with_settings(catalog.settings());
    info!(
        "설정: 워커 {}개, 샘플 {}회, 타임아웃 {:?}, 재시도 {}회",
        config.parallel_tests, config.probe_samples, config.probe_timeout, config.max_retries
    );

    let probe: Arc<dyn Probe> = match options.probe {
        ProbeKind::Ping => Arc::new(PingProbe),
        ProbeKind::Tcp(port) => Arc::new(TcpConnectProbe::new(port)),
    };
    let session = AccelerationSession::new(config, probe, Arc::new(SystemRouteTable::new()), Arc::new(catalog));

    let report = match session.start(&group, &region).await {
        Ok(report) => report,
        Err(e) => {
            error!("가속 시작 실패: {}", e);
            return ExitCode::FAILURE;
        }
    };
    for (target, outcome) in &report.outcomes {
        match outcome {
            TargetOutcome::Optimized { relay, latency_ms } => {
                info!("최적화: {} via {} ({:.1}ms)", target, relay, latency_ms)
            }
            TargetOutcome::Unchanged => info!("유지: {}", target),
            TargetOutcome::Failed(e) => warn!("실패: {} - {}", target, e),
        }
    }
    print_status(&session.status());
    info!("Ctrl-C로 정지");

    let mut ticker = tokio::time::interval(options.status_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => print_status(&session.status()),
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("시그널 대기 실패: {}", e);
                }
                break;
            }
        }
    }

    session.stop().await;
    ExitCode::SUCCESS
}

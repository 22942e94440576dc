//! 지연 측정 도구
//!
//! 라우트를 바꾸지 않고 대상 서버와 후보 노드의 직접 지연만 측정한다.
//!
//! 사용법:
//!   cargo run --release --bin route-latency -- [OPTIONS] [HOST...]
//!
//! 예시:
//!   # 설정 파일의 그룹/지역 측정
//!   route-latency --group valorant --region SEA
//!
//!   # 임의 호스트 측정
//!   route-latency 1.1.1.1 8.8.8.8

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use route_accel::catalog::{CONFIG_ENV, DEFAULT_CONFIG_PATH};
use route_accel::{Catalog, Config, JsonCatalog, Latency, LatencyProbe, PingProbe, Probe, TcpConnectProbe};

struct Options {
    config_path: PathBuf,
    group: Option<String>,
    region: Option<String>,
    hosts: Vec<String>,
    tcp_port: Option<u16>,
    quick: bool,
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options {
        config_path: std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
        group: None,
        region: None,
        hosts: Vec::new(),
        tcp_port: None,
        quick: false,
    };

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match args[i].as_str() {
            "--config" | "-c" => {
                options.config_path = PathBuf::from(value.ok_or("--config 값 필요")?);
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
            "--tcp" => {
                let port = value
                    .and_then(|v| v.parse().ok())
                    .ok_or("--tcp 값은 포트 번호")?;
                options.tcp_port = Some(port);
                i += 1;
            }
            "--quick" | "-q" => options.quick = true,
            "--help" | "-h" => {
                println!(
                    r#"Route Latency - 대상/후보 노드 지연 측정

사용법:
  route-latency [OPTIONS] [HOST...]

옵션:
  -c, --config <PATH>     설정 파일 (기본: ${CONFIG_ENV} 또는 {DEFAULT_CONFIG_PATH})
  -g, --group <GROUP>     대상 서버 그룹
  -r, --region <REGION>   지역 (후보 노드도 함께 측정)
  --tcp <PORT>            ping 대신 TCP connect 측정
  -q, --quick             빠른 측정
  -h, --help              이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            host => options.hosts.push(host.to_string()),
        }
        i += 1;
    }

    Ok(options)
}

/// 주소 목록 동시 측정, 입력 순서대로 반환
async fn survey(probe: &LatencyProbe, config: &Config, hosts: Vec<String>) -> Vec<(String, Latency)> {
    let mut tasks = JoinSet::new();
    for (index, host) in hosts.into_iter().enumerate() {
        let probe = probe.clone();
        let config = config.clone();
        tasks.spawn(async move {
            let result = probe
                .measure_host(&host, config.probe_samples, config.probe_timeout, config.max_retries)
                .await;
            (index, host, result)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, host, Ok(latency))) => results.push((index, host, latency)),
            Ok((_, _, Err(e))) => warn!("{}", e),
            Err(e) => warn!("측정 태스크 실패: {}", e),
        }
    }
    results.sort_by_key(|(index, _, _)| *index);
    results.into_iter().map(|(_, host, latency)| (host, latency)).collect()
}

fn print_table(title: &str, results: &[(String, Latency)]) {
    info!("── {} ──", title);
    for (host, latency) in results {
        info!("  {:<16} {}", host, latency);
    }
    let reachable: Vec<f64> = results
        .iter()
        .filter(|(_, l)| l.is_reachable())
        .map(|(_, l)| l.as_millis())
        .collect();
    if !reachable.is_empty() {
        let avg = reachable.iter().sum::<f64>() / reachable.len() as f64;
        info!("  응답 {}/{}개, 평균 {:.1}ms", reachable.len(), results.len(), avg);
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
    let base = if options.quick { Config::quick() } else { Config::default() };
    let config = base.with_settings(catalog.settings());

    let probe: Arc<dyn Probe> = match options.tcp_port {
        Some(port) => Arc::new(TcpConnectProbe::new(port)),
        None => Arc::new(PingProbe),
    };
    let probe = LatencyProbe::new(probe, config.parallel_tests, config.retry_backoff);

    let mut measured = false;
    if !options.hosts.is_empty() {
        let results = survey(&probe, &config, options.hosts.clone()).await;
        print_table("호스트", &results);
        measured = true;
    }

    if let Some(region) = options.region.as_deref() {
        if let Some(group) = options.group.as_deref() {
            let targets = catalog
                .targets(group, region)
                .into_iter()
                .map(|t| t.address.to_string())
                .collect();
            let results = survey(&probe, &config, targets).await;
            print_table(&format!("{group} / {region} 대상 서버"), &results);
        }

        let candidates = catalog
            .candidates(region)
            .into_iter()
            .map(|c| c.address.to_string())
            .collect();
        let results = survey(&probe, &config, candidates).await;
        print_table(&format!("{region} 후보 노드"), &results);
        measured = true;
    }

    if !measured {
        error!("측정할 호스트 또는 --region 이 필요합니다 (--help 참고)");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

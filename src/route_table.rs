//! OS 라우팅 테이블 경계
//!
//! 호스트(/32) 라우트 추가, 삭제, 검증만 다룬다. OS 쪽은 트랜잭션을 보장하지 않으므로
//! 같은 대상에 대한 변경의 직렬화는 호출 측 책임이다.

use std::io;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// OS 라우팅 기능
#[async_trait]
pub trait RouteTable: Send + Sync {
    /// `target` 호스트 라우트를 `gateway` 경유로 추가
    async fn add_route(&self, target: Ipv4Addr, gateway: Ipv4Addr) -> Result<()>;

    /// `target` 호스트 라우트 삭제. 존재하지 않으면 성공
    async fn remove_route(&self, target: Ipv4Addr) -> Result<()>;

    /// `target`이 `gateway` 경유로 라우팅되는지 확인
    async fn route_exists(&self, target: Ipv4Addr, gateway: Ipv4Addr) -> Result<bool>;
}

/// 라우트 설치: 기존 삭제 → 추가 → 검증
///
/// 추가 또는 검증이 실패하면 반쯤 적용된 라우트를 삭제하고 `RouteApplyFailed` 반환.
pub async fn install_route(table: &dyn RouteTable, target: Ipv4Addr, gateway: Ipv4Addr) -> Result<()> {
    table
        .remove_route(target)
        .await
        .map_err(|e| Error::apply_failed(target, gateway, format!("기존 라우트 삭제 실패: {e}")))?;

    if let Err(e) = table.add_route(target, gateway).await {
        rollback(table, target).await;
        return Err(match e {
            Error::RouteApplyFailed { .. } => e,
            other => Error::apply_failed(target, gateway, other.to_string()),
        });
    }

    match table.route_exists(target, gateway).await {
        Ok(true) => {
            debug!("라우트 적용: {} -> {}", target, gateway);
            Ok(())
        }
        Ok(false) => {
            rollback(table, target).await;
            Err(Error::apply_failed(target, gateway, "verification failed"))
        }
        Err(e) => {
            rollback(table, target).await;
            Err(Error::apply_failed(target, gateway, format!("verification error: {e}")))
        }
    }
}

async fn rollback(table: &dyn RouteTable, target: Ipv4Addr) {
    if let Err(e) = table.remove_route(target).await {
        warn!("라우트 롤백 실패: {} - {}", target, e);
    }
}

/// 라우트 명령 형식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// `route add/delete/print`
    Windows,
    /// iproute2 `ip route`
    Linux,
    /// BSD `route -n`
    MacOs,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }

    fn add_command(self, target: Ipv4Addr, gateway: Ipv4Addr) -> (&'static str, Vec<String>) {
        let (t, g) = (target.to_string(), gateway.to_string());
        match self {
            Platform::Windows => ("route", vec!["add".into(), t, "mask".into(), "255.255.255.255".into(), g]),
            Platform::Linux => ("ip", vec!["route".into(), "add".into(), format!("{t}/32"), "via".into(), g]),
            Platform::MacOs => ("route", vec!["-n".into(), "add".into(), "-host".into(), t, g]),
        }
    }

    fn remove_command(self, target: Ipv4Addr) -> (&'static str, Vec<String>) {
        let t = target.to_string();
        match self {
            Platform::Windows => ("route", vec!["delete".into(), t]),
            Platform::Linux => ("ip", vec!["route".into(), "del".into(), format!("{t}/32")]),
            Platform::MacOs => ("route", vec!["-n".into(), "delete".into(), "-host".into(), t]),
        }
    }

    fn show_command(self, target: Ipv4Addr) -> (&'static str, Vec<String>) {
        let t = target.to_string();
        match self {
            Platform::Windows => ("route", vec!["print".into(), t]),
            Platform::Linux => ("ip", vec!["route".into(), "show".into(), format!("{t}/32")]),
            Platform::MacOs => ("route", vec!["-n".into(), "get".into(), t]),
        }
    }
}

/// 삭제 대상이 없을 때 각 OS가 출력하는 메시지
const NOT_FOUND_MARKERS: &[&str] = &[
    "not found",
    "找不到",
    "No such process",
    "not in table",
    "Cannot find",
];

fn is_missing_route(output: &str) -> bool {
    NOT_FOUND_MARKERS.iter().any(|m| output.contains(m))
}

/// 출력에 게이트웨이 주소가 독립 토큰으로 나타나는지 확인
fn output_mentions_gateway(output: &str, gateway: Ipv4Addr) -> bool {
    let gw = gateway.to_string();
    output
        .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .any(|token| token == gw)
}

/// 시스템 라우트 명령 기반 라우팅 테이블 (관리자 권한 필요)
#[derive(Debug, Clone, Copy)]
pub struct SystemRouteTable {
    platform: Platform,
}

impl SystemRouteTable {
    pub fn new() -> Self {
        Self::with_platform(Platform::current())
    }

    pub fn with_platform(platform: Platform) -> Self {
        Self { platform }
    }

    async fn run(program: &str, args: &[String]) -> Result<(bool, String)> {
        let output = Command::new(program).args(args).output().await?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((output.status.success(), text))
    }
}

impl Default for SystemRouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouteTable for SystemRouteTable {
    async fn add_route(&self, target: Ipv4Addr, gateway: Ipv4Addr) -> Result<()> {
        let (program, args) = self.platform.add_command(target, gateway);
        let (ok, output) = Self::run(program, &args).await?;
        if !ok {
            return Err(Error::apply_failed(target, gateway, output.trim()));
        }
        info!("라우트 추가: {} -> {}", target, gateway);
        Ok(())
    }

    async fn remove_route(&self, target: Ipv4Addr) -> Result<()> {
        let (program, args) = self.platform.remove_command(target);
        let (ok, output) = Self::run(program, &args).await?;
        if ok || is_missing_route(&output) {
            debug!("라우트 삭제: {}", target);
            return Ok(());
        }
        Err(Error::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("route delete {target}: {}", output.trim()),
        )))
    }

    async fn route_exists(&self, target: Ipv4Addr, gateway: Ipv4Addr) -> Result<bool> {
        let (program, args) = self.platform.show_command(target);
        let (ok, output) = Self::run(program, &args).await?;
        Ok(ok && output_mentions_gateway(&output, gateway))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeNetwork, RouteEvent};

    const T: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 10);
    const G: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 1);

    #[test]
    fn test_platform_commands() {
        let (p, args) = Platform::Windows.add_command(T, G);
        assert_eq!(p, "route");
        assert_eq!(args, ["add", "203.0.113.10", "mask", "255.255.255.255", "198.51.100.1"]);

        let (p, args) = Platform::Linux.add_command(T, G);
        assert_eq!(p, "ip");
        assert_eq!(args, ["route", "add", "203.0.113.10/32", "via", "198.51.100.1"]);

        let (_, args) = Platform::Linux.remove_command(T);
        assert_eq!(args, ["route", "del", "203.0.113.10/32"]);

        let (_, args) = Platform::MacOs.show_command(T);
        assert_eq!(args, ["-n", "get", "203.0.113.10"]);

        let (_, args) = Platform::Windows.show_command(T);
        assert_eq!(args, ["print", "203.0.113.10"]);
    }

    #[test]
    fn test_gateway_token_match() {
        let linux = "203.0.113.10 via 198.51.100.1 dev eth0";
        assert!(output_mentions_gateway(linux, G));
        // 접두사가 같은 다른 주소는 매칭하지 않음
        assert!(!output_mentions_gateway("203.0.113.10 via 198.51.100.10 dev eth0", G));

        let windows = "  203.0.113.10  255.255.255.255    198.51.100.1   192.168.1.20     26";
        assert!(output_mentions_gateway(windows, G));
    }

    #[test]
    fn test_missing_route_markers() {
        assert!(is_missing_route("The route deletion failed: Element not found."));
        assert!(is_missing_route("RTNETLINK answers: No such process"));
        assert!(is_missing_route("route: writing to routing socket: not in table"));
        assert!(!is_missing_route("Operation not permitted"));
    }

    #[tokio::test]
    async fn test_install_route_remove_before_add() {
        let net = FakeNetwork::new();
        install_route(&net, T, G).await.unwrap();

        assert_eq!(net.gateway_of(T), Some(G));
        assert_eq!(
            net.events(),
            vec![RouteEvent::Remove(T), RouteEvent::Add(T, G)]
        );
    }

    #[tokio::test]
    async fn test_install_route_add_failure_rolls_back() {
        let net = FakeNetwork::new();
        net.fail_add(G);

        let err = install_route(&net, T, G).await.unwrap_err();
        assert!(matches!(err, Error::RouteApplyFailed { .. }));
        assert_eq!(net.gateway_of(T), None);
    }

    #[tokio::test]
    async fn test_install_route_verification_failure_rolls_back() {
        let net = FakeNetwork::new();
        net.fail_verify(G);

        let err = install_route(&net, T, G).await.unwrap_err();
        match err {
            Error::RouteApplyFailed { target, gateway, reason } => {
                assert_eq!(target, T);
                assert_eq!(gateway, G);
                assert!(reason.contains("verification"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // 검증 실패 후 반쯤 적용된 라우트 제거
        assert_eq!(net.gateway_of(T), None);
        assert_eq!(net.events().last(), Some(&RouteEvent::Remove(T)));
    }
}

// 代理地址解析

use anyhow::{anyhow, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// IPv6 主机需用方括号包裹，如 `socks5://[::1]:1080`
static PROXY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<scheme>[A-Za-z0-9]+)://(?:(?P<user>[^:@/]*)(?::(?P<pass>[^@/]*))?@)?(?:\[(?P<host6>[0-9A-Fa-f:.]+)\]|(?P<host>[^:/@\[\]]+)):(?P<port>\d+)/?$",
    )
    .expect("proxy regex is valid")
});

/// 代理协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    Socks5,
    Socks4,
    Http,
}

impl std::fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProxyScheme::Socks5 => "socks5",
            ProxyScheme::Socks4 => "socks4",
            ProxyScheme::Http => "http",
        };
        write!(f, "{}", name)
    }
}

/// 代理配置（交给平台客户端使用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ProxyConfig {
    /// 解析 `scheme://[user[:pass]@]host:port` 形式的代理地址
    ///
    /// 用户名和密码按 URL 编码解码
    pub fn parse(raw: &str) -> Result<Self> {
        let caps = PROXY_PATTERN
            .captures(raw.trim())
            .ok_or_else(|| anyhow!("无法识别的代理地址: {}", raw))?;

        let scheme = match caps["scheme"].to_ascii_lowercase().as_str() {
            "socks5" | "socks5h" => ProxyScheme::Socks5,
            "socks4" | "socks4a" => ProxyScheme::Socks4,
            "http" | "https" => ProxyScheme::Http,
            other => return Err(anyhow!("不支持的代理协议: {}", other)),
        };
        let port: u16 = caps["port"]
            .parse()
            .map_err(|_| anyhow!("代理端口无效: {}", &caps["port"]))?;

        let decode = |value: &str| -> Result<String> {
            Ok(urlencoding::decode(value)?.into_owned())
        };
        let username = match caps.name("user").map(|m| m.as_str()) {
            Some(user) if !user.is_empty() => Some(decode(user)?),
            _ => None,
        };
        let password = match caps.name("pass") {
            Some(pass) => Some(decode(pass.as_str())?),
            None => None,
        };

        Ok(Self {
            scheme,
            host: caps
                .name("host6")
                .or_else(|| caps.name("host"))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            port,
            username,
            password,
        })
    }
}

//! Trusted-subnet admission filter.

use crate::core::{Result, TallyError};
use ipnet::IpNet;
use std::net::IpAddr;

/// Header the HTTP entry point reads the peer address from.
pub const REAL_IP_HEADER: &str = "X-Real-IP";

/// Admission filter built from the `trusted_subnet` setting.
///
/// A configuration that fails to parse is kept as an error and reported on
/// every check, so the misconfiguration stays visible until fixed.
#[derive(Debug, Clone)]
pub struct TrustedSubnet {
    net: std::result::Result<Option<IpNet>, String>,
}

impl TrustedSubnet {
    /// Build the filter; `None` or an empty string disables it
    pub fn new(cidr: Option<&str>) -> Self {
        let net = match cidr.map(str::trim).filter(|c| !c.is_empty()) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<IpNet>()
                .map(Some)
                .map_err(|e| format!("invalid trusted subnet {raw:?}: {e}")),
        };
        if let Err(ref e) = net {
            tracing::error!("{}", e);
        }
        Self { net }
    }

    /// A filter that admits everyone
    pub fn disabled() -> Self {
        Self { net: Ok(None) }
    }

    /// Returns true when a subnet is configured (valid or not)
    pub fn is_enabled(&self) -> bool {
        !matches!(self.net, Ok(None))
    }

    /// Admit or reject a peer address.
    pub fn check(&self, peer: Option<IpAddr>) -> Result<()> {
        let net = match &self.net {
            Ok(None) => return Ok(()),
            Ok(Some(net)) => net,
            Err(e) => return Err(TallyError::internal(e.clone())),
        };
        match peer {
            Some(ip) if net.contains(&ip) => Ok(()),
            Some(ip) => Err(TallyError::Forbidden(format!("{ip} is outside {net}"))),
            None => Err(TallyError::Forbidden("peer address unknown".to_string())),
        }
    }

    /// Admit or reject a peer given the raw header value.
    pub fn check_header(&self, value: Option<&str>) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let peer = value.and_then(|v| v.trim().parse::<IpAddr>().ok());
        self.check(peer)
    }
}

impl Default for TrustedSubnet {
    fn default() -> Self {
        Self::disabled()
    }
}
